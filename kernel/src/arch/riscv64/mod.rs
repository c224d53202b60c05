//! riscv64 — sfence.vma и satp (Sv39)

use crate::mm::{Frame, VirtAddr};

const SATP_MODE_SV39: u64 = 8 << 60;

#[inline]
pub fn flush_addr(virt: VirtAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: sfence.vma только сбрасывает трансляции для адреса
    unsafe {
        core::arch::asm!("sfence.vma {}, zero", in(reg) virt.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

#[inline]
pub fn set_root(root: Frame) {
    let satp = SATP_MODE_SV39 | root.0 as u64;
    #[cfg(target_os = "none")]
    // SAFETY: корень — корректная Sv39-таблица; затем полный сброс TLB
    unsafe {
        core::arch::asm!("csrw satp, {}", "sfence.vma", in(reg) satp, options(nostack, preserves_flags));
    }
    #[cfg(not(target_os = "none"))]
    let _ = satp;
}
