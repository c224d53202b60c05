//! Kernel Heap — guarded first-fit куча ядра
//!
//! Та же куча, что и `malloc` в userspace (`libescape::heap`), но страницы
//! берутся критичными кадрами и отображаются в окно `KHEAP_START..`.
//! Таблицы окна создаются один раз при старте; дальше `KAllocator`
//! гарантирует, что новых таблиц в области ядра не появится.
//! The same heap as userspace `malloc`, backed by critical frames mapped at
//! `KHEAP_START`. The window's tables are built once at startup.
//!
//! Порча guard-слов и двойное освобождение — паника.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use libescape::heap::{GuardedHeap, HeapError, HeapSpace};
use libescape::WORD_SIZE;
use spin::Mutex;

use super::paging::{KAllocator, MapFlags, NoAllocator, PageDir, PageTable};
use super::pmm::PhysMem;
use super::{Frame, VirtAddr};
use crate::config::{KHEAP_MAX_PAGES, KHEAP_START, PAGE_SIZE};
use crate::MmError;

/// Окно кучи: кадры по порядку страниц / Heap window, frames in page order.
pub struct KernelHeapSpace {
    phys:   Arc<PhysMem>,
    dir:    Arc<PageDir>,
    frames: Vec<Frame>,
    limit:  usize,
}

impl KernelHeapSpace {
    fn locate(&self, addr: usize) -> (Frame, usize) {
        let off = addr - KHEAP_START;
        (self.frames[off / PAGE_SIZE], off % PAGE_SIZE)
    }

    /// `[addr, addr + len)` лежит в отображённой части окна.
    fn covers(&self, addr: usize, len: usize) -> bool {
        let end = KHEAP_START + self.frames.len() * PAGE_SIZE;
        addr >= KHEAP_START && addr.checked_add(len).map_or(false, |e| e <= end)
    }

    fn read_bytes(&self, mut addr: usize, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let (frame, off) = self.locate(addr);
            let n = (PAGE_SIZE - off).min(buf.len() - done);
            self.phys.read(frame, off, &mut buf[done..done + n]);
            done += n;
            addr += n;
        }
    }

    fn write_bytes(&self, mut addr: usize, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let (frame, off) = self.locate(addr);
            let n = (PAGE_SIZE - off).min(data.len() - done);
            self.phys.write(frame, off, &data[done..done + n]);
            done += n;
            addr += n;
        }
    }
}

impl HeapSpace for KernelHeapSpace {
    fn grow(&mut self, pages: usize) -> Option<usize> {
        if self.frames.len() + pages > self.limit {
            log::warn!("kheap: window full ({} pages)", self.frames.len());
            return None;
        }
        let start = VirtAddr::from(KHEAP_START + self.frames.len() * PAGE_SIZE);
        let flags = MapFlags::PRESENT | MapFlags::WRITABLE | MapFlags::SUPERVISOR | MapFlags::GLOBAL;
        if let Err(e) = self.dir.map(start, pages, &mut KAllocator::new(&self.phys), flags) {
            log::warn!("kheap: cannot grow by {} pages: {}", pages, e);
            return None;
        }
        for i in 0..pages {
            self.frames.push(self.dir.translate(start.add_pages(i))?);
        }
        Some(start.as_usize())
    }

    fn read_word(&self, addr: usize) -> usize {
        let mut buf = [0u8; WORD_SIZE];
        self.read_bytes(addr, &mut buf);
        usize::from_ne_bytes(buf)
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        self.write_bytes(addr, &value.to_ne_bytes());
    }

    fn copy(&mut self, dst: usize, src: usize, len: usize) {
        let mut buf = vec![0u8; len];
        self.read_bytes(src, &mut buf);
        self.write_bytes(dst, &buf);
    }

    fn fill(&mut self, addr: usize, byte: u8, len: usize) {
        self.write_bytes(addr, &vec![byte; len]);
    }
}

/// Куча ядра / The kernel heap.
pub struct KHeap {
    heap: Mutex<GuardedHeap<KernelHeapSpace>>,
}

impl KHeap {
    pub fn new(phys: Arc<PhysMem>, dir: Arc<PageDir>) -> Result<Self, MmError> {
        Self::with_limit(phys, dir, KHEAP_MAX_PAGES)
    }

    /// Куча не больше `max_pages` страниц / Heap limited to `max_pages` pages.
    pub fn with_limit(phys: Arc<PhysMem>, dir: Arc<PageDir>, max_pages: usize) -> Result<Self, MmError> {
        // Статические таблицы окна: записи без EXISTS, только таблицы
        let flags = MapFlags::SUPERVISOR | MapFlags::GLOBAL | MapFlags::NOPAGES;
        dir.map(VirtAddr::from(KHEAP_START), max_pages, &mut NoAllocator::new(&phys), flags)?;
        log::debug!("kheap: window {:#x}, up to {} pages", KHEAP_START, max_pages);
        let space = KernelHeapSpace { phys, dir, frames: Vec::new(), limit: max_pages };
        Ok(Self { heap: Mutex::new(GuardedHeap::new(space)) })
    }

    pub fn alloc(&self, size: usize) -> Option<usize> {
        match self.heap.lock().alloc(size) {
            Ok(p) => Some(p),
            Err(e) => {
                log::warn!("kheap: alloc({}) failed: {}", size, e);
                None
            }
        }
    }

    pub fn calloc(&self, num: usize, size: usize) -> Option<usize> {
        self.heap.lock().calloc(num, size).ok()
    }

    pub fn realloc(&self, ptr: Option<usize>, size: usize) -> Option<usize> {
        match self.heap.lock().realloc(ptr, size) {
            Ok(p) => Some(p),
            Err(e @ (HeapError::DoubleFree | HeapError::Corruption(_))) => corrupted(e),
            Err(_) => None,
        }
    }

    /// Освободить; порча кучи или повторное освобождение — паника.
    pub fn free(&self, ptr: usize) {
        if let Err(e) = self.heap.lock().free(ptr) {
            corrupted(e);
        }
    }

    /// Прочитать байты кучи / Read heap bytes.
    ///
    /// Addresses outside the mapped part of the window are `InvalidArgument`.
    pub fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), MmError> {
        let heap = self.heap.lock();
        if !heap.space().covers(addr, buf.len()) {
            return Err(MmError::InvalidArgument);
        }
        heap.space().read_bytes(addr, buf);
        Ok(())
    }

    pub fn write(&self, addr: usize, data: &[u8]) -> Result<(), MmError> {
        let heap = self.heap.lock();
        if !heap.space().covers(addr, data.len()) {
            return Err(MmError::InvalidArgument);
        }
        heap.space().write_bytes(addr, data);
        Ok(())
    }

    pub fn used_mem(&self) -> usize {
        self.heap.lock().used_mem()
    }

    pub fn free_mem(&self) -> usize {
        self.heap.lock().free_mem()
    }

    pub fn pages(&self) -> usize {
        self.heap.lock().pages()
    }
}

impl fmt::Display for KHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self.heap.lock())
    }
}

#[cold]
fn corrupted(e: HeapError) -> ! {
    log::error!("kheap: {}", e);
    panic!("kernel heap: {}", e);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::FrameType;

    fn kheap(max_pages: usize) -> (Arc<PhysMem>, Arc<PageDir>, KHeap) {
        let phys = Arc::new(PhysMem::new(256, 0));
        let dir = Arc::new(PageDir::new(phys.clone()).unwrap());
        let heap = KHeap::with_limit(phys.clone(), dir.clone(), max_pages).unwrap();
        (phys, dir, heap)
    }

    #[test]
    fn pages_come_from_critical_frames() {
        let (phys, dir, heap) = kheap(8);
        let tables = dir.table_count();
        let a = heap.alloc(100).unwrap();
        assert_eq!(heap.pages(), 1);
        assert_eq!(phys.used_frames(FrameType::Crit), 1);
        assert!(dir.is_present(VirtAddr::from(a)));
        // таблицы окна уже были
        assert_eq!(dir.table_count(), tables);
        heap.free(a);
        assert_eq!(heap.used_mem(), 0);
    }

    #[test]
    fn contents_survive_realloc_across_pages() {
        let (_phys, _dir, heap) = kheap(8);
        let a = heap.alloc(16).unwrap();
        heap.write(a, b"kernel heap data").unwrap();
        let _blocker = heap.alloc(8).unwrap();
        let b = heap.realloc(Some(a), 2 * PAGE_SIZE).unwrap();
        assert_ne!(a, b);
        let mut buf = [0u8; 16];
        heap.read(b, &mut buf).unwrap();
        assert_eq!(&buf, b"kernel heap data");
        assert_eq!(heap.pages(), 4);
        let c = heap.calloc(16, 16).unwrap();
        let mut zero = [1u8; 256];
        heap.read(c, &mut zero).unwrap();
        assert!(zero.iter().all(|&x| x == 0));
    }

    #[test]
    fn access_outside_the_mapped_window_is_refused() {
        let (_phys, _dir, heap) = kheap(4);
        let mut buf = [0u8; 8];
        assert_eq!(heap.read(KHEAP_START, &mut buf), Err(MmError::InvalidArgument));
        let a = heap.alloc(8).unwrap();
        assert_eq!(heap.write(KHEAP_START - 4, &buf), Err(MmError::InvalidArgument));
        assert_eq!(heap.write(KHEAP_START + PAGE_SIZE - 4, &buf), Err(MmError::InvalidArgument));
        assert_eq!(heap.read(usize::MAX - 2, &mut buf), Err(MmError::InvalidArgument));
        assert!(heap.write(a, &buf).is_ok());
    }

    #[test]
    fn window_limit_is_out_of_memory() {
        let (_phys, _dir, heap) = kheap(2);
        assert!(heap.alloc(PAGE_SIZE).is_some());
        assert!(heap.alloc(2 * PAGE_SIZE).is_none());
    }

    #[test]
    #[should_panic(expected = "kernel heap")]
    fn overwritten_guard_is_fatal() {
        let (_phys, _dir, heap) = kheap(2);
        let a = heap.alloc(8).unwrap();
        heap.write(a + 8, &[0xFF; 8]).unwrap();
        heap.free(a);
    }

    #[test]
    #[should_panic(expected = "kernel heap")]
    fn double_free_is_fatal() {
        let (_phys, _dir, heap) = kheap(2);
        let a = heap.alloc(8).unwrap();
        heap.free(a);
        heap.free(a);
    }
}
