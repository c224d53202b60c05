//! x86_64 — TLB и CR3
//!
//! Инструкции выполняются только на голом железе (target_os = "none");
//! в хостовых тестах это пустые функции.

use crate::mm::{Frame, VirtAddr};

/// invlpg
#[inline]
pub fn flush_addr(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: invlpg только сбрасывает запись TLB
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// mov cr3
#[inline]
pub fn set_root(root: Frame) {
    #[cfg(target_os = "none")]
    // SAFETY: корень — обнулённая или корректно заполненная PML4
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.addr().as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = root;
}
