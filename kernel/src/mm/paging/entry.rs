//! Запись таблицы страниц / Page-table entry
//!
//! Переносимая программная кодировка (не формат конкретного CPU):
//!   биты 0..11  — флаги
//!   биты 12..51 — номер кадра
//!   бит 63      — NO_EXEC

use bitflags::bitflags;

use crate::config::PAGE_BITS;
use crate::mm::Frame;

bitflags! {
    /// Флаги PTE / PTE flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const NOTSUPER  = 1 << 2;
        const LARGE     = 1 << 7;
        const GLOBAL    = 1 << 8;
        /// Запись существует, даже если не present (demand load, swap)
        const EXISTS    = 1 << 9;
        const NO_EXEC   = 1 << 63;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
    pub const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    pub const EMPTY: Pte = Pte(0);

    pub const fn new(frame: Frame, flags: PteFlags) -> Self {
        Self(((frame.0 as u64) << PAGE_BITS) & Self::FRAME_MASK | flags.bits())
    }

    pub const fn frame(self) -> Frame {
        Frame(((self.0 & Self::FRAME_MASK) >> PAGE_BITS) as usize)
    }

    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub const fn exists(self) -> bool {
        self.0 & PteFlags::EXISTS.bits() != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & PteFlags::WRITABLE.bits() != 0
    }

    /// Те же флаги, другой кадр / Same flags, different frame
    pub const fn with_frame(self, frame: Frame) -> Self {
        Self::new(frame, self.flags())
    }
}
