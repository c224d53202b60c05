//! Guarded heap — куча с контрольными словами
//!
//! Каждый блок обрамлён словами:
//!   [size][GUARD] payload... [GUARD]
//! Указатель пользователю — сразу после второго слова.
//! Every block is framed by guard words; the caller's pointer lands right
//! after the second word. Freeing checks both guards and refuses double frees.
//!
//! Память предоставляет `HeapSpace` — ядро отдаёт кадры, userspace — brk.
//! Backing memory comes from a `HeapSpace`: kernel frames or the data segment.

use core::fmt;

use thiserror::Error;

use crate::segment::SegmentAllocator;
use crate::{bytes_to_pages, round_up, PAGE_SIZE, WORD_SIZE};

/// Контрольное слово вокруг блока / Guard word around each block
pub const GUARD_MAGIC: usize = 0xCAFE_BABE;

/// Пишется вместо переднего guard после free / Written over the front guard by free
pub const FREED_MAGIC: usize = 0xDEAD_BEEF;

/// Служебных слов на блок: размер + 2 guard / Overhead words per block
pub const OVERHEAD_WORDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("invalid allocation size")]
    InvalidSize,
    #[error("double free or unknown block")]
    DoubleFree,
    #[error("guard word overwritten at {0:#x}")]
    Corruption(usize),
}

/// Источник памяти для кучи / Backing memory of a heap.
///
/// Addresses are whatever the space hands out from `grow`; words are
/// always `WORD_SIZE`-aligned.
pub trait HeapSpace {
    /// Добавить `pages` смежных страниц; вернуть адрес начала.
    /// Append `pages` contiguous pages and return their start address.
    fn grow(&mut self, pages: usize) -> Option<usize>;

    fn read_word(&self, addr: usize) -> usize;
    fn write_word(&mut self, addr: usize, value: usize);

    /// Скопировать `len` байт (области не пересекаются).
    fn copy(&mut self, dst: usize, src: usize, len: usize);
    fn fill(&mut self, addr: usize, byte: u8, len: usize);
}

/// First-fit heap with guard words and double-free detection.
pub struct GuardedHeap<S> {
    space: S,
    seg:   SegmentAllocator,
    pages: usize,
}

impl<S: HeapSpace> GuardedHeap<S> {
    pub fn new(space: S) -> Self {
        Self { space, seg: SegmentAllocator::new(), pages: 0 }
    }

    pub fn space(&self) -> &S {
        &self.space
    }

    pub fn space_mut(&mut self) -> &mut S {
        &mut self.space
    }

    /// Выделить `size` байт / Allocate `size` bytes.
    pub fn alloc(&mut self, size: usize) -> Result<usize, HeapError> {
        let total = Self::block_size(size)?;
        let begin = match self.seg.alloc(total) {
            Ok(addr) => addr,
            Err(HeapError::OutOfMemory) => {
                self.load_new_space(total)?;
                self.seg.alloc(total)?
            }
            Err(e) => return Err(e),
        };
        self.set_guards(begin, total);
        Ok(begin + 2 * WORD_SIZE)
    }

    /// Выделить `num * size` обнулённых байт / Allocate zeroed memory.
    pub fn calloc(&mut self, num: usize, size: usize) -> Result<usize, HeapError> {
        let bytes = num.checked_mul(size).ok_or(HeapError::InvalidSize)?;
        let ptr = self.alloc(bytes)?;
        self.space.fill(ptr, 0, bytes);
        Ok(ptr)
    }

    /// Освободить блок / Free a block.
    pub fn free(&mut self, ptr: usize) -> Result<(), HeapError> {
        let begin = ptr.checked_sub(2 * WORD_SIZE).ok_or(HeapError::DoubleFree)?;
        let total = self.seg.size_of(begin).ok_or(HeapError::DoubleFree)?;
        self.check_guards(begin, total)?;
        self.seg.release(begin)?;
        self.space.write_word(begin + WORD_SIZE, FREED_MAGIC);
        Ok(())
    }

    /// Изменить размер блока / Resize a block.
    ///
    /// Shrinking keeps the block as is. Growing first tries to extend into
    /// the following free area, otherwise moves the payload.
    pub fn realloc(&mut self, ptr: Option<usize>, size: usize) -> Result<usize, HeapError> {
        let Some(ptr) = ptr else {
            return self.alloc(size);
        };
        let begin = ptr.checked_sub(2 * WORD_SIZE).ok_or(HeapError::DoubleFree)?;
        let old = self.seg.size_of(begin).ok_or(HeapError::DoubleFree)?;
        self.check_guards(begin, old)?;

        let total = Self::block_size(size)?;
        if total <= old {
            return Ok(ptr);
        }
        if self.seg.grow_in_place(begin, total) {
            self.set_guards(begin, total);
            return Ok(ptr);
        }

        let new = self.alloc(size)?;
        self.space.copy(new, ptr, old - OVERHEAD_WORDS * WORD_SIZE);
        self.free(ptr)?;
        Ok(new)
    }

    /// Payload size of a live block, as stored in its header.
    pub fn payload_size(&self, ptr: usize) -> Option<usize> {
        let begin = ptr.checked_sub(2 * WORD_SIZE)?;
        self.seg.size_of(begin)?;
        Some(self.space.read_word(begin))
    }

    /// Байт выдано (с учётом служебных слов) / Bytes handed out, overhead included.
    pub fn used_mem(&self) -> usize {
        self.seg.used_bytes()
    }

    /// Байт свободно / Bytes on the usable list.
    pub fn free_mem(&self) -> usize {
        self.seg.free_bytes()
    }

    /// Страниц получено от `HeapSpace` / Pages obtained from the space.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Metadata nodes ever created.
    pub fn node_count(&self) -> usize {
        self.seg.node_count()
    }

    fn block_size(size: usize) -> Result<usize, HeapError> {
        if size == 0 || size > usize::MAX / 2 {
            return Err(HeapError::InvalidSize);
        }
        Ok(round_up(size, WORD_SIZE) + OVERHEAD_WORDS * WORD_SIZE)
    }

    fn load_new_space(&mut self, size: usize) -> Result<(), HeapError> {
        let pages = bytes_to_pages(size);
        // Узел для нового участка и для остатка после split
        self.seg.reserve_nodes(2)?;
        let addr = self.space.grow(pages).ok_or(HeapError::OutOfMemory)?;
        self.seg.add_extent(addr, pages * PAGE_SIZE)?;
        self.pages += pages;
        log::trace!("heap: +{} pages at {:#x} ({} total)", pages, addr, self.pages);
        Ok(())
    }

    fn set_guards(&mut self, begin: usize, total: usize) {
        self.space.write_word(begin, total - OVERHEAD_WORDS * WORD_SIZE);
        self.space.write_word(begin + WORD_SIZE, GUARD_MAGIC);
        self.space.write_word(begin + total - WORD_SIZE, GUARD_MAGIC);
    }

    fn check_guards(&self, begin: usize, total: usize) -> Result<(), HeapError> {
        match self.space.read_word(begin + WORD_SIZE) {
            GUARD_MAGIC => {}
            FREED_MAGIC => return Err(HeapError::DoubleFree),
            _ => return Err(HeapError::Corruption(begin + WORD_SIZE)),
        }
        let end = begin + total - WORD_SIZE;
        if self.space.read_word(begin) != total - OVERHEAD_WORDS * WORD_SIZE {
            return Err(HeapError::Corruption(begin));
        }
        if self.space.read_word(end) != GUARD_MAGIC {
            return Err(HeapError::Corruption(end));
        }
        Ok(())
    }
}

impl<S: HeapSpace> fmt::Display for GuardedHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Heap: {} pages, {} used, {} free",
            self.pages,
            self.used_mem(),
            self.free_mem()
        )?;
        write!(f, "{}", self.seg)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Память кучи в Vec / Heap space backed by a Vec
    pub struct VecSpace {
        pub base:  usize,
        pub mem:   Vec<u8>,
        pub limit: usize,
    }

    impl VecSpace {
        pub fn new(base: usize, limit_pages: usize) -> Self {
            Self { base, mem: Vec::new(), limit: limit_pages * PAGE_SIZE }
        }

        fn off(&self, addr: usize) -> usize {
            addr - self.base
        }
    }

    impl HeapSpace for VecSpace {
        fn grow(&mut self, pages: usize) -> Option<usize> {
            let add = pages * PAGE_SIZE;
            if self.mem.len() + add > self.limit {
                return None;
            }
            let start = self.base + self.mem.len();
            self.mem.resize(self.mem.len() + add, 0xAA);
            Some(start)
        }

        fn read_word(&self, addr: usize) -> usize {
            let o = self.off(addr);
            usize::from_ne_bytes(self.mem[o..o + WORD_SIZE].try_into().unwrap())
        }

        fn write_word(&mut self, addr: usize, value: usize) {
            let o = self.off(addr);
            self.mem[o..o + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
        }

        fn copy(&mut self, dst: usize, src: usize, len: usize) {
            let (d, s) = (self.off(dst), self.off(src));
            self.mem.copy_within(s..s + len, d);
        }

        fn fill(&mut self, addr: usize, byte: u8, len: usize) {
            let o = self.off(addr);
            self.mem[o..o + len].fill(byte);
        }
    }

    fn heap() -> GuardedHeap<VecSpace> {
        GuardedHeap::new(VecSpace::new(0x4000_0000, 64))
    }

    #[test]
    fn alloc_lays_out_guards() {
        let mut h = heap();
        let p = h.alloc(10).unwrap();
        assert_eq!(p, 0x4000_0000 + 2 * WORD_SIZE);
        assert_eq!(h.space().read_word(p - 2 * WORD_SIZE), 16);
        assert_eq!(h.space().read_word(p - WORD_SIZE), GUARD_MAGIC);
        assert_eq!(h.space().read_word(p + 16), GUARD_MAGIC);
        assert_eq!(h.payload_size(p), Some(16));
        assert_eq!(h.pages(), 1);
        assert_eq!(h.used_mem(), 16 + 3 * WORD_SIZE);
        assert_eq!(h.used_mem() + h.free_mem(), PAGE_SIZE);
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut h = heap();
        assert_eq!(h.alloc(0), Err(HeapError::InvalidSize));
        assert_eq!(h.calloc(usize::MAX, 2), Err(HeapError::InvalidSize));
        assert_eq!(h.pages(), 0);
    }

    #[test]
    fn free_restores_space_and_detects_double_free() {
        let mut h = heap();
        let a = h.alloc(100).unwrap();
        let b = h.alloc(200).unwrap();
        h.free(a).unwrap();
        h.free(b).unwrap();
        assert_eq!(h.used_mem(), 0);
        assert_eq!(h.free_mem(), PAGE_SIZE);
        assert_eq!(h.free(a), Err(HeapError::DoubleFree));
    }

    #[test]
    fn overflow_is_caught_on_free() {
        let mut h = heap();
        let a = h.alloc(16).unwrap();
        h.space_mut().write_word(a + 16, 0x4141_4141);
        assert_eq!(h.free(a), Err(HeapError::Corruption(a + 16)));
    }

    #[test]
    fn underflow_is_caught_on_free() {
        let mut h = heap();
        let a = h.alloc(16).unwrap();
        h.space_mut().write_word(a - WORD_SIZE, 0);
        assert_eq!(h.free(a), Err(HeapError::Corruption(a - WORD_SIZE)));
    }

    #[test]
    fn large_alloc_takes_enough_pages() {
        let mut h = heap();
        let p = h.alloc(3 * PAGE_SIZE).unwrap();
        assert_eq!(h.pages(), 4);
        h.free(p).unwrap();
        assert_eq!(h.free_mem(), 4 * PAGE_SIZE);
    }

    #[test]
    fn space_exhaustion_is_out_of_memory() {
        let mut h = GuardedHeap::new(VecSpace::new(0x1000, 1));
        assert!(h.alloc(PAGE_SIZE / 2).is_ok());
        assert_eq!(h.alloc(PAGE_SIZE), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn calloc_zeroes() {
        let mut h = heap();
        let p = h.calloc(4, 8).unwrap();
        for i in 0..4 {
            assert_eq!(h.space().read_word(p + i * 8), 0);
        }
    }

    #[test]
    fn realloc_grows_in_place_then_moves() {
        let mut h = heap();
        let a = h.alloc(16).unwrap();
        h.space_mut().write_word(a, 0x1234);
        // следующий участок свободен — растём на месте
        let a2 = h.realloc(Some(a), 64).unwrap();
        assert_eq!(a2, a);
        assert_eq!(h.payload_size(a), Some(64));
        assert_eq!(h.space().read_word(a + 64), GUARD_MAGIC);

        let _blocker = h.alloc(8).unwrap();
        let a3 = h.realloc(Some(a), 256).unwrap();
        assert_ne!(a3, a);
        assert_eq!(h.space().read_word(a3), 0x1234);
        assert_eq!(h.free(a), Err(HeapError::DoubleFree));

        // уменьшение ничего не делает
        assert_eq!(h.realloc(Some(a3), 8), Ok(a3));
        assert_eq!(h.payload_size(a3), Some(256));
        assert!(h.realloc(None, 8).is_ok());
    }

    #[test]
    fn freed_space_is_reused_before_growing() {
        let mut h = heap();
        let first = h.alloc(100).unwrap();
        let _second = h.alloc(50).unwrap();
        let pages = h.pages();
        h.free(first).unwrap();
        let third = h.alloc(80).unwrap();
        assert_eq!(third, first);
        assert_eq!(h.pages(), pages);
    }

    proptest! {
        #[test]
        fn random_alloc_free_keeps_accounting(ops in prop::collection::vec((1usize..600, any::<bool>()), 1..80)) {
            let mut h = heap();
            let mut live: Vec<usize> = Vec::new();
            for (size, free) in ops {
                if free && !live.is_empty() {
                    let p = live.swap_remove(size % live.len());
                    h.free(p).unwrap();
                } else {
                    live.push(h.alloc(size).unwrap());
                }
                prop_assert_eq!(h.used_mem() + h.free_mem(), h.pages() * PAGE_SIZE);
            }
            for p in live {
                h.free(p).unwrap();
            }
            prop_assert_eq!(h.used_mem(), 0);
        }
    }
}
