//! HAL — Hardware Abstraction Layer
//!
//! Только то, что нужно подсистеме памяти: сброс TLB и загрузка корня
//! таблиц страниц. Выбираем реализацию по целевой архитектуре.
//! Only what the memory subsystem needs: TLB invalidation and loading the
//! page-table root. Implementation is picked by target architecture.
//!
//! На хосте (тесты) обе операции пустые.

use crate::mm::{Frame, VirtAddr};

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64 as current;

#[cfg(target_arch = "riscv64")]
pub mod riscv64;
#[cfg(target_arch = "riscv64")]
pub use riscv64 as current;

/// Сбросить запись TLB для страницы / Invalidate the TLB entry of a page.
#[inline]
pub fn flush_addr(virt: VirtAddr) {
    #[cfg(any(target_arch = "x86_64", target_arch = "riscv64"))]
    current::flush_addr(virt);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
    let _ = virt;
}

/// Загрузить корень таблиц (CR3 / SATP) / Load the page-table root.
#[inline]
pub fn set_root(root: Frame) {
    #[cfg(any(target_arch = "x86_64", target_arch = "riscv64"))]
    current::set_root(root);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "riscv64")))]
    let _ = root;
}
