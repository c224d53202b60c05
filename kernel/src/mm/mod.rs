//! Memory Management subsystem
//!
//! Слои / Layers:
//!   pmm     — Physical Memory Manager (кадры / frames)
//!   paging  — Page Tables (radix walker, аллокаторы / allocators)
//!   heap    — Kernel Heap (guarded first-fit)
//!   cow     — Copy-on-write счётчики / share counts
//!   swapmap — Swap Map (блоки swap-устройства / swap blocks)
//!   region  — Region (общие диапазоны страниц / shared page ranges)
//!   vmm     — Virtual Memory Manager (адресные пространства / address spaces)

pub mod pmm;
pub mod paging;
pub mod heap;
pub mod cow;
pub mod swapmap;
pub mod region;
pub mod vmm;

use crate::config::{PAGE_BITS, PAGE_SIZE};

/// Физический адрес / Physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(pub u64);

/// Виртуальный адрес / Virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(pub u64);

/// Номер физического кадра / Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Frame(pub usize);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self { Self(addr) }
    pub const fn as_u64(self) -> u64   { self.0 }
    pub const fn frame(self) -> Frame  { Frame(self.0 as usize >> PAGE_BITS) }
}

impl VirtAddr {
    pub const fn new(addr: u64) -> Self   { Self(addr) }
    pub const fn as_u64(self) -> u64     { self.0 }
    pub const fn as_usize(self) -> usize { self.0 as usize }

    /// Начало страницы / Page-aligned base
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0 + (pages * PAGE_SIZE) as u64)
    }
}

impl From<usize> for VirtAddr {
    fn from(addr: usize) -> Self { Self(addr as u64) }
}

impl Frame {
    pub const fn addr(self) -> PhysAddr { PhysAddr((self.0 << PAGE_BITS) as u64) }
    pub const fn next(self, n: usize) -> Self { Self(self.0 + n) }
}

/// Страниц для `bytes` байт / Pages needed for `bytes` bytes
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    libescape::bytes_to_pages(bytes)
}

#[inline]
pub const fn round_page_up(bytes: usize) -> usize {
    libescape::round_up(bytes, PAGE_SIZE)
}
