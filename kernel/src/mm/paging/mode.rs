//! Режимы страничной адресации / Paging modes
//!
//! Формат выбирается при сборке фичей Cargo, а не `#ifdef` по коду:
//!   sv39   (по умолчанию) — 3 уровня по 9 бит
//!   x86_64               — 4 уровня по 9 бит

use crate::config::PAGE_BITS;

pub trait PagingMode: Send + Sync + 'static {
    const NAME: &'static str;
    const LEVELS: usize;
    const BITS_PER_LEVEL: usize = 9;
    const ENTRIES: usize = 1 << Self::BITS_PER_LEVEL;

    /// Индекс записи на уровне `level` (0 — корень).
    /// Entry index at `level`, where level 0 is the root table.
    #[inline]
    fn index(virt: usize, level: usize) -> usize {
        let shift = PAGE_BITS + Self::BITS_PER_LEVEL * (Self::LEVELS - 1 - level);
        (virt >> shift) & (Self::ENTRIES - 1)
    }

    /// Байт, покрываемых одной записью на уровне `level`.
    #[inline]
    fn entry_span(level: usize) -> usize {
        1 << (PAGE_BITS + Self::BITS_PER_LEVEL * (Self::LEVELS - 1 - level))
    }
}

/// RISC-V Sv39
pub struct Sv39;

impl PagingMode for Sv39 {
    const NAME: &'static str = "sv39";
    const LEVELS: usize = 3;
}

/// x86_64 4-level (PML4 → PDPT → PD → PT)
pub struct X86_64;

impl PagingMode for X86_64 {
    const NAME: &'static str = "x86_64";
    const LEVELS: usize = 4;
}

#[cfg(feature = "x86_64")]
pub type Active = X86_64;
#[cfg(not(feature = "x86_64"))]
pub type Active = Sv39;
