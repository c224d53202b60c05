//! Константы ядра / Kernel configuration constants
//!
//! Раскладка виртуального адресного пространства процесса:
//!
//!   TEXT_BEGIN ..            text, rodata, data (по порядку)
//!   FREE_AREA_BEGIN ..       shm, phys, tls, shared libs
//!   STACK_AREA_BEGIN ..      стеки потоков, слоты по MAX_STACK_PAGES
//!   KERNEL_AREA ..           ядро (общее для всех)

pub use libescape::{OCC_MAP_SIZE, PAGE_SIZE};

pub const PAGE_BITS: usize = 12;

/// Ёмкость пула swap-областей / Swap-map area pool capacity
pub const SWMAP_SIZE: usize = 8192;

/// Максимум страниц стека (включая guard) / Max stack pages, guard included
pub const MAX_STACK_PAGES: usize = 128;

pub const TEXT_BEGIN:       usize = 0x0000_1000;
pub const FREE_AREA_BEGIN:  usize = 0x0008_0000_0000;
pub const STACK_AREA_BEGIN: usize = 0x0030_0000_0000;
pub const STACK_AREA_END:   usize = 0x0038_0000_0000;

/// Начало области ядра / Start of the kernel area
pub const KERNEL_AREA: usize = 1 << 38;

/// Куча ядра / Kernel heap window
pub const KHEAP_START:     usize = KERNEL_AREA + 0x1000_0000;
pub const KHEAP_MAX_PAGES: usize = 16 * 1024;

const _: () = assert!(OCC_MAP_SIZE.is_power_of_two());
const _: () = assert!(TEXT_BEGIN < FREE_AREA_BEGIN && FREE_AREA_BEGIN < STACK_AREA_BEGIN);
const _: () = assert!(STACK_AREA_END <= KERNEL_AREA);
