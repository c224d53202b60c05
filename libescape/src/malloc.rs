//! malloc/free для userspace поверх сегмента данных
//! Userspace malloc on top of the process data segment.
//!
//! Сегмент растёт системным вызовом chgsize (brk); здесь он — трейт,
//! чтобы куча не зависела от способа общения с ядром.

use spin::Mutex;

use crate::heap::{GuardedHeap, HeapError, HeapSpace};
use crate::{PAGE_SIZE, WORD_SIZE};

/// Сегмент данных процесса / The process data segment.
pub trait DataSegment {
    /// Увеличить сегмент на `pages` страниц; вернуть старый конец.
    /// Grow the segment by `pages` pages and return the old end address.
    fn change_size(&mut self, pages: usize) -> Option<usize>;

    /// Адрес начала сегмента / Start address of the segment.
    fn base(&self) -> usize;

    /// Current contents of the segment, starting at `base()`.
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// Адаптер сегмента к `HeapSpace` / Adapts a data segment to `HeapSpace`.
pub struct Brk<D>(D);

impl<D: DataSegment> Brk<D> {
    fn range(&self, addr: usize, len: usize) -> core::ops::Range<usize> {
        let off = addr - self.0.base();
        off..off + len
    }
}

impl<D: DataSegment> HeapSpace for Brk<D> {
    fn grow(&mut self, pages: usize) -> Option<usize> {
        self.0.change_size(pages)
    }

    fn read_word(&self, addr: usize) -> usize {
        let mut buf = [0u8; WORD_SIZE];
        buf.copy_from_slice(&self.0.bytes()[self.range(addr, WORD_SIZE)]);
        usize::from_ne_bytes(buf)
    }

    fn write_word(&mut self, addr: usize, value: usize) {
        let r = self.range(addr, WORD_SIZE);
        self.0.bytes_mut()[r].copy_from_slice(&value.to_ne_bytes());
    }

    fn copy(&mut self, dst: usize, src: usize, len: usize) {
        let s = self.range(src, len);
        let d = self.range(dst, len).start;
        self.0.bytes_mut().copy_within(s, d);
    }

    fn fill(&mut self, addr: usize, byte: u8, len: usize) {
        let r = self.range(addr, len);
        self.0.bytes_mut()[r].fill(byte);
    }
}

/// Потокобезопасная куча процесса / Thread-safe process heap.
pub struct UserHeap<D> {
    heap: Mutex<GuardedHeap<Brk<D>>>,
}

impl<D: DataSegment> UserHeap<D> {
    pub fn new(segment: D) -> Self {
        Self { heap: Mutex::new(GuardedHeap::new(Brk(segment))) }
    }

    /// NULL — `None`, как в libc / Returns `None` where libc returns NULL.
    pub fn malloc(&self, size: usize) -> Option<usize> {
        self.heap.lock().alloc(size).ok()
    }

    pub fn calloc(&self, num: usize, size: usize) -> Option<usize> {
        self.heap.lock().calloc(num, size).ok()
    }

    pub fn realloc(&self, ptr: Option<usize>, size: usize) -> Option<usize> {
        match self.heap.lock().realloc(ptr, size) {
            Ok(p) => Some(p),
            Err(e @ (HeapError::DoubleFree | HeapError::Corruption(_))) => heap_abort(e),
            Err(_) => None,
        }
    }

    /// Освободить блок; повреждение кучи — аварийный останов.
    /// Free a block; heap damage aborts the process.
    pub fn free(&self, ptr: Option<usize>) {
        let Some(ptr) = ptr else { return };
        if let Err(e) = self.heap.lock().free(ptr) {
            heap_abort(e);
        }
    }

    pub fn used_mem(&self) -> usize {
        self.heap.lock().used_mem()
    }

    pub fn free_mem(&self) -> usize {
        self.heap.lock().free_mem()
    }

    /// Страниц сегмента под кучей / Data segment pages owned by the heap.
    pub fn pages(&self) -> usize {
        self.heap.lock().pages()
    }

    /// Read back a word (for callers that only hold integer addresses).
    pub fn peek(&self, addr: usize) -> usize {
        self.heap.lock().space().read_word(addr)
    }

    pub fn poke(&self, addr: usize, value: usize) {
        self.heap.lock().space_mut().write_word(addr, value);
    }

    /// Total heap bytes the segment would need to hold `pages` pages.
    pub const fn bytes_for(pages: usize) -> usize {
        pages * PAGE_SIZE
    }
}

#[cold]
fn heap_abort(e: HeapError) -> ! {
    log::error!("malloc: {}", e);
    panic!("heap corrupted: {}", e);
}
