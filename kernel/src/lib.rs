//! Escape kernel — подсистема памяти / memory subsystem
//!
//! Слои снизу вверх / Layers, bottom up:
//!   mm::pmm     — физические кадры / physical frames
//!   mm::paging  — таблицы страниц / page tables
//!   mm::heap    — куча ядра / kernel heap
//!   mm::swapmap — раскладка swap-устройства / swap device layout
//!   mm::region  — регионы / regions
//!   mm::vmm     — адресные пространства процессов / process address spaces
//!
//! Планировщик, VFS и загрузчик ELF сюда не входят: они видны только
//! через `sched::Thread` и трейты `BinarySource` / `SwapDevice`.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// Подключить стандартный alloc крейт (Box, Vec, Arc, ...)
// Connect standard alloc crate (Box, Vec, Arc, ...)
extern crate alloc;

use thiserror::Error;

pub mod arch;
pub mod config;
pub mod mm;
pub mod sched;

/// Ошибки подсистемы памяти / Memory subsystem errors
///
/// Всё восстановимое — `Result`. Порча кучи, двойное освобождение и
/// неизвестная swap-область — `panic!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no free swap area")]
    NoFreeArea,
    #[error("segmentation fault at {0:#x}")]
    Segfault(usize),
    #[error("limit exceeded")]
    LimitExceeded,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no such process")]
    NoSuchProcess,
    #[error("I/O error")]
    Io,
}
