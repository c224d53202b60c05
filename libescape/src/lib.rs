//! libescape — общая библиотека Escape / shared Escape library
//!
//! Код, который собирается и в ядро, и в userspace.
//! Code that is built into both the kernel and userspace.
//!
//! Модули / Modules:
//!   arena   — пул метаданных со стеком свободных индексов / node pool with a free-index stack
//!   segment — first-fit аллокатор сегментов / first-fit segment allocator
//!   heap    — куча с guard-словами поверх segment / guarded heap on top of segment
//!   malloc  — пользовательская куча (brk) / user heap on the data segment

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arena;
pub mod segment;
pub mod heap;
pub mod malloc;

/// Размер страницы / Page size
pub const PAGE_SIZE: usize = 4096;

/// Размер машинного слова / Machine word size
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Число корзин occupied-map (степень двойки).
/// Number of occupied-map buckets (power of two).
pub const OCC_MAP_SIZE: usize = 1024;

/// Округлить вверх до `align` (степень двойки).
/// Round up to `align` (power of two).
#[inline]
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Число страниц для `bytes` байт / Number of pages for `bytes` bytes
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}
