//! Paging — таблицы страниц и источники кадров
//!
//! Обход таблиц отделён от политики выдачи кадров: каждая операция
//! получает `Allocator`, который решает, откуда брать кадры страниц и
//! таблиц и куда их возвращать.
//! Table walking is decoupled from frame supply: every operation gets an
//! `Allocator` that decides where page and table frames come from.

mod entry;
mod mode;
mod tables;

pub use entry::{Pte, PteFlags};
pub use mode::{Active, PagingMode, Sv39, X86_64};
pub use tables::PageTables;

use bitflags::bitflags;

use super::pmm::{FrameType, PhysMem};
use super::{Frame, VirtAddr};
use crate::sched::Thread;
use crate::MmError;

/// Таблицы страниц процесса в режиме этой сборки.
/// A process page directory in this build's paging mode.
pub type PageDir = PageTables<Active>;

bitflags! {
    /// Флаги отображения / Mapping flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const PRESENT    = 1 << 0;
        const WRITABLE   = 1 << 1;
        const SUPERVISOR = 1 << 2;
        const GLOBAL     = 1 << 3;
        const EXECUTABLE = 1 << 4;
        /// Не создавать запись (EXISTS не ставится)
        const NOPAGES    = 1 << 5;
    }
}

/// Трейт таблиц страниц / Page-table capability.
///
/// One concrete implementation per paging mode, picked at build time.
/// All mutators return whether a present mapping was replaced or removed,
/// i.e. whether other cores need a TLB shootdown.
pub trait PageTable {
    fn map(&self, virt: VirtAddr, count: usize, alloc: &mut dyn Allocator, flags: MapFlags)
        -> Result<bool, MmError>;
    fn map_frames(&self, virt: VirtAddr, frames: &[Frame], alloc: &mut dyn Allocator, flags: MapFlags)
        -> Result<bool, MmError>;
    fn unmap(&self, virt: VirtAddr, count: usize, alloc: &mut dyn Allocator) -> bool;
    fn clone_to(&self, dst: &Self, src: VirtAddr, dst_virt: VirtAddr, count: usize, share: bool)
        -> Result<bool, MmError>
    where
        Self: Sized;
    fn translate(&self, virt: VirtAddr) -> Option<Frame>;
    /// Обойти все существующие листовые записи / Visit every existing leaf entry.
    fn walk(&self, f: &mut dyn FnMut(VirtAddr, Pte));
    /// Загрузить таблицу (CR3 / SATP) / Load the table (CR3 / SATP).
    fn activate(&self);
}

/// Источник кадров для операций с таблицами / Frame source for table operations.
pub trait Allocator {
    /// Кадр под страницу; `Ok(None)` — оставить текущий кадр записи.
    /// Frame for a page; `Ok(None)` keeps the entry's current frame.
    fn alloc_page(&mut self) -> Result<Option<Frame>, MmError>;
    fn free_page(&mut self, frame: Frame);
    fn alloc_pt(&mut self) -> Result<Frame, MmError>;
    fn free_pt(&mut self, frame: Frame);
    /// Сколько таблиц создано минус освобождено / Net page tables created.
    fn page_tables(&self) -> isize;
}

/// Таблицы страниц из `PhysMem` (Kern) со счётчиком.
struct PtSource<'a> {
    phys:  &'a PhysMem,
    count: isize,
}

impl<'a> PtSource<'a> {
    fn new(phys: &'a PhysMem) -> Self {
        Self { phys, count: 0 }
    }

    fn alloc(&mut self) -> Result<Frame, MmError> {
        let frame = self.phys.allocate(FrameType::Kern).ok_or(MmError::OutOfMemory)?;
        self.count += 1;
        Ok(frame)
    }

    fn free(&mut self, frame: Frame) {
        self.phys.free(frame, FrameType::Kern);
        self.count -= 1;
    }
}

/// Не выделяет и не освобождает страницы: кадры принадлежат кому-то ещё.
/// Allocates and frees no pages; the frames are owned elsewhere.
pub struct NoAllocator<'a> {
    pts: PtSource<'a>,
}

impl<'a> NoAllocator<'a> {
    pub fn new(phys: &'a PhysMem) -> Self {
        Self { pts: PtSource::new(phys) }
    }
}

impl Allocator for NoAllocator<'_> {
    fn alloc_page(&mut self) -> Result<Option<Frame>, MmError> { Ok(None) }
    fn free_page(&mut self, _frame: Frame) {}
    fn alloc_pt(&mut self) -> Result<Frame, MmError> { self.pts.alloc() }
    fn free_pt(&mut self, frame: Frame) { self.pts.free(frame) }
    fn page_tables(&self) -> isize { self.pts.count }
}

/// Последовательные кадры начиная с заданного (физические регионы, ранняя загрузка).
/// Hands out consecutive frames (physical regions, early identity maps).
pub struct RangeAllocator<'a> {
    next: Frame,
    pts:  PtSource<'a>,
}

impl<'a> RangeAllocator<'a> {
    pub fn new(phys: &'a PhysMem, first: Frame) -> Self {
        Self { next: first, pts: PtSource::new(phys) }
    }
}

impl Allocator for RangeAllocator<'_> {
    fn alloc_page(&mut self) -> Result<Option<Frame>, MmError> {
        let frame = self.next;
        self.next = frame.next(1);
        Ok(Some(frame))
    }

    fn free_page(&mut self, _frame: Frame) {
        panic!("RangeAllocator: freeing pages is not supported");
    }

    fn alloc_pt(&mut self) -> Result<Frame, MmError> { self.pts.alloc() }
    fn free_pt(&mut self, frame: Frame) { self.pts.free(frame) }
    fn page_tables(&self) -> isize { self.pts.count }
}

/// Кадры пользователя; сначала из резерва потока.
/// User frames, taken from the thread's reservation first.
pub struct UAllocator<'a> {
    phys:   &'a PhysMem,
    thread: Option<&'a Thread>,
    pts:    PtSource<'a>,
}

impl<'a> UAllocator<'a> {
    pub fn new(phys: &'a PhysMem, thread: Option<&'a Thread>) -> Self {
        Self { phys, thread, pts: PtSource::new(phys) }
    }
}

impl Allocator for UAllocator<'_> {
    fn alloc_page(&mut self) -> Result<Option<Frame>, MmError> {
        let frame = match self.thread {
            Some(t) => t.take_frame(self.phys),
            None    => self.phys.allocate(FrameType::Usr),
        };
        frame.map(Some).ok_or(MmError::OutOfMemory)
    }

    fn free_page(&mut self, frame: Frame) {
        self.phys.free(frame, FrameType::Usr);
    }

    fn alloc_pt(&mut self) -> Result<Frame, MmError> { self.pts.alloc() }
    fn free_pt(&mut self, frame: Frame) { self.pts.free(frame) }
    fn page_tables(&self) -> isize { self.pts.count }
}

/// Область ядра: таблицы статичны, их создание — ошибка логики.
/// Kernel area: its tables are static, so asking for one is a logic bug.
pub struct KAllocator<'a> {
    phys: &'a PhysMem,
}

impl<'a> KAllocator<'a> {
    pub fn new(phys: &'a PhysMem) -> Self {
        Self { phys }
    }
}

impl Allocator for KAllocator<'_> {
    fn alloc_page(&mut self) -> Result<Option<Frame>, MmError> {
        self.phys.allocate(FrameType::Crit).map(Some).ok_or(MmError::OutOfMemory)
    }

    fn free_page(&mut self, frame: Frame) {
        self.phys.free(frame, FrameType::Crit);
    }

    fn alloc_pt(&mut self) -> Result<Frame, MmError> {
        log::error!("paging: page table requested in kernel area");
        panic!("Trying to allocate a page-table in kernel-area");
    }

    fn free_pt(&mut self, _frame: Frame) {
        log::error!("paging: page table freed in kernel area");
        panic!("Trying to free a page-table in kernel-area");
    }

    fn page_tables(&self) -> isize { 0 }
}
