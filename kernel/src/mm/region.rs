//! Region — диапазон страниц с общей политикой
//!
//! Регион описывает, откуда берутся страницы (бинарник, анонимная память,
//! физический диапазон) и как с ними обращаться. Один регион может быть
//! отображён в несколько процессов (shm, общий text); каждая привязка —
//! `RegionUser` со своим адресом и каталогом страниц.
//! A region describes the backing and permissions of a page range. It may be
//! mapped into several processes; each binding is a `RegionUser`.
//!
//! Состояние страниц хранится здесь, а не в таблицах: DEMANDLOAD, SWAPPED,
//! COPYONWRITE и BUSY (идёт ввод-вывод).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicIsize, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use super::paging::PageDir;
use super::swapmap::ProcList;
use super::{bytes_to_pages, round_page_up};
use crate::config::PAGE_SIZE;
use crate::sched::Pid;
use crate::MmError;

bitflags! {
    /// Свойства региона / Region properties
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const WRITABLE   = 1 << 0;
        const EXECUTABLE = 1 << 1;
        const SHAREABLE  = 1 << 2;
        const GROWABLE   = 1 << 3;
        const GROWS_DOWN = 1 << 4;
        const STACK      = 1 << 5;
        /// Кадры не наши: не освобождать, не вытеснять
        const NOFREE     = 1 << 6;
        const TLS        = 1 << 7;
    }
}

bitflags! {
    /// Состояние страницы региона / Per-page state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u8 {
        const DEMANDLOAD  = 1 << 0;
        const SWAPPED     = 1 << 1;
        const COPYONWRITE = 1 << 2;
        const BUSY        = 1 << 3;
    }
}

/// Тип региона / Region type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionType {
    Text,
    Rodata,
    Data,
    Stack,
    StackUp,
    Shm,
    Device,
    Tls,
    ShlibText,
    ShlibData,
    DlData,
    Phys,
}

impl RegionType {
    pub const fn default_flags(self) -> RegionFlags {
        use RegionFlags as F;
        match self {
            RegionType::Text      => F::EXECUTABLE.union(F::SHAREABLE),
            RegionType::Rodata    => F::SHAREABLE,
            RegionType::Data      => F::WRITABLE.union(F::GROWABLE),
            RegionType::Stack     => F::WRITABLE.union(F::GROWABLE).union(F::GROWS_DOWN).union(F::STACK),
            RegionType::StackUp   => F::WRITABLE.union(F::GROWABLE).union(F::STACK),
            RegionType::Shm       => F::WRITABLE.union(F::SHAREABLE),
            RegionType::Device    => F::WRITABLE.union(F::SHAREABLE).union(F::NOFREE),
            RegionType::Tls       => F::WRITABLE.union(F::TLS),
            RegionType::ShlibText => F::EXECUTABLE.union(F::SHAREABLE),
            RegionType::ShlibData => F::WRITABLE,
            RegionType::DlData    => F::WRITABLE.union(F::GROWABLE),
            RegionType::Phys      => F::WRITABLE.union(F::NOFREE),
        }
    }

    /// text, rodata и data кладутся по порядку от `TEXT_BEGIN`.
    pub const fn is_program(self) -> bool {
        matches!(self, RegionType::Text | RegionType::Rodata | RegionType::Data)
    }
}

/// Файл, из которого грузятся страницы / Backing binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinDesc {
    pub ino:      u64,
    pub dev:      u32,
    /// время модификации: другой `modified` — другой бинарник
    pub modified: u64,
}

/// Счётчики страниц процесса / Per-process page counters.
#[derive(Debug, Default)]
pub struct MemStats {
    pub own:     AtomicIsize,
    pub shared:  AtomicIsize,
    pub swapped: AtomicIsize,
    pub tables:  AtomicIsize,
}

/// Номер блока и владелец swap-участка / Swap block and its area owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot {
    pub block: u32,
    pub pid:   Pid,
}

/// Привязка региона к процессу / A process using the region.
#[derive(Clone)]
pub struct RegionUser {
    pub pid:    Pid,
    pub virt:   usize,
    pub dir:    Arc<PageDir>,
    pub stats:  Arc<MemStats>,
    /// присоединился к чужому региону (join, общий text)
    pub shared: bool,
}

impl RegionUser {
    /// Адрес страницы `idx` у этого пользователя.
    pub fn page_addr(&self, idx: usize) -> usize {
        self.virt + idx * PAGE_SIZE
    }

    /// Учесть страницу в состоянии `pf` со знаком `delta`.
    /// Count one page in state `pf` towards this user's statistics.
    pub fn charge(&self, pf: PageFlags, delta: isize) {
        let counter = if pf.contains(PageFlags::SWAPPED) {
            &self.stats.swapped
        } else if pf.contains(PageFlags::DEMANDLOAD) {
            return;
        } else if self.shared || pf.contains(PageFlags::COPYONWRITE) {
            &self.stats.shared
        } else {
            &self.stats.own
        };
        counter.fetch_add(delta, Ordering::Relaxed);
    }
}

pub struct RegionState {
    pub flags:       RegionFlags,
    pub byte_count:  usize,
    pub page_flags:  Vec<PageFlags>,
    pub swap_blocks: Vec<Option<SwapSlot>>,
    /// последнее обращение (тики планировщика) / last use, scheduler ticks
    pub timestamp:   u64,
    pub procs:       ProcList,
    pub users:       Vec<RegionUser>,
}

impl RegionState {
    pub fn pages(&self) -> usize {
        bytes_to_pages(self.byte_count)
    }

    /// (присутствующих, вытесненных) / (present, swapped) pages.
    pub fn page_count(&self) -> (usize, usize) {
        self.page_flags.iter().fold((0, 0), |(present, swapped), pf| {
            if pf.contains(PageFlags::SWAPPED) {
                (present, swapped + 1)
            } else if pf.contains(PageFlags::DEMANDLOAD) {
                (present, swapped)
            } else {
                (present + 1, swapped)
            }
        })
    }

    /// Вырасти или ужаться на `amount` страниц.
    /// Grow (or shrink, if negative) by `amount` pages.
    ///
    /// Grows-down regions change at the front, others at the end. New pages
    /// carry no flags. Returns the swap slots of pages that were cut off.
    pub fn grow(&mut self, amount: isize) -> Result<Vec<SwapSlot>, MmError> {
        let pages = self.pages();
        let down = self.flags.contains(RegionFlags::GROWS_DOWN);
        let delta = amount.unsigned_abs();
        if amount < 0 && delta > pages {
            return Err(MmError::InvalidArgument);
        }
        self.byte_count = round_page_up(self.byte_count);

        let mut cut = Vec::new();
        if amount >= 0 {
            if down {
                self.page_flags.splice(0..0, vec![PageFlags::empty(); delta]);
                self.swap_blocks.splice(0..0, vec![None; delta]);
            } else {
                self.page_flags.resize(pages + delta, PageFlags::empty());
                self.swap_blocks.resize(pages + delta, None);
            }
            self.byte_count += delta * PAGE_SIZE;
        } else {
            let range = if down { 0..delta } else { pages - delta..pages };
            self.page_flags.drain(range.clone());
            cut.extend(self.swap_blocks.drain(range).flatten());
            self.byte_count -= delta * PAGE_SIZE;
        }
        Ok(cut)
    }

    pub fn add_user(&mut self, user: RegionUser) {
        self.procs.lock().push(user.pid);
        self.users.push(user);
    }

    pub fn remove_user(&mut self, pid: Pid) -> Option<RegionUser> {
        let pos = self.users.iter().position(|u| u.pid == pid)?;
        let mut procs = self.procs.lock();
        if let Some(p) = procs.iter().position(|&p| p == pid) {
            procs.swap_remove(p);
        }
        Some(self.users.remove(pos))
    }

    pub fn user(&self, pid: Pid) -> Option<&RegionUser> {
        self.users.iter().find(|u| u.pid == pid)
    }

    /// Первая страница, которую можно вытеснить / First page fit for swap-out.
    pub fn swappable_page(&self) -> Option<usize> {
        let skip = PageFlags::SWAPPED | PageFlags::COPYONWRITE | PageFlags::DEMANDLOAD | PageFlags::BUSY;
        self.page_flags.iter().position(|pf| !pf.intersects(skip))
    }

    pub fn has_cow(&self) -> bool {
        self.page_flags.iter().any(|pf| pf.contains(PageFlags::COPYONWRITE))
    }

    pub fn is_busy(&self) -> bool {
        self.page_flags.iter().any(|pf| pf.contains(PageFlags::BUSY))
    }
}

pub struct Region {
    pub kind:       RegionType,
    pub binary:     Option<BinDesc>,
    /// смещение в бинарнике / offset into the binary
    pub offset:     usize,
    /// байт из бинарника, остальное нули / bytes loaded, the rest is zeroed
    pub load_count: usize,
    state:          Mutex<RegionState>,
}

impl Region {
    pub fn new(kind: RegionType, flags: RegionFlags, binary: Option<BinDesc>, offset: usize,
               bytes: usize, load_count: usize) -> Result<Self, MmError> {
        if flags.contains(RegionFlags::SHAREABLE | RegionFlags::GROWABLE) {
            return Err(MmError::InvalidArgument);
        }
        let pages = bytes_to_pages(bytes);
        let initial = if binary.is_some() { PageFlags::DEMANDLOAD } else { PageFlags::empty() };
        Ok(Self {
            kind,
            binary,
            offset,
            load_count: load_count.min(bytes),
            state: Mutex::new(RegionState {
                flags,
                byte_count:  bytes,
                page_flags:  vec![initial; pages],
                swap_blocks: vec![None; pages],
                timestamp:   0,
                procs:       Arc::new(Mutex::new(Vec::new())),
                users:       Vec::new(),
            }),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, RegionState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, RegionState>> {
        self.state.try_lock()
    }

    /// Частная копия для fork: страницы те же, пользователей и swap-блоков нет.
    /// Private copy for fork; no users and no swap blocks yet.
    pub fn clone_private(&self, state: &RegionState) -> Region {
        Region {
            kind:       self.kind,
            binary:     self.binary,
            offset:     self.offset,
            load_count: self.load_count,
            state: Mutex::new(RegionState {
                flags:       state.flags,
                byte_count:  state.byte_count,
                page_flags:  state.page_flags.clone(),
                swap_blocks: vec![None; state.page_flags.len()],
                timestamp:   state.timestamp,
                procs:       Arc::new(Mutex::new(Vec::new())),
                users:       Vec::new(),
            }),
        }
    }

    /// Тот же бинарник и то же место в нём / Same binary at the same offset.
    pub fn is_same_binary(&self, kind: RegionType, bin: &BinDesc, offset: usize) -> bool {
        self.kind == kind && self.offset == offset && self.binary.as_ref() == Some(bin)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.lock();
        let (present, swapped) = st.page_count();
        write!(
            f,
            "{:?} {:#x} bytes [{:?}], {} present, {} swapped, {} users",
            self.kind, st.byte_count, st.flags, present, swapped, st.users.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::pmm::PhysMem;

    const BIN: BinDesc = BinDesc { ino: 7, dev: 1, modified: 100 };

    fn user(pid: Pid) -> RegionUser {
        let phys = Arc::new(PhysMem::new(8, 0));
        RegionUser {
            pid,
            virt:   0x1000,
            dir:    Arc::new(PageDir::new(phys).unwrap()),
            stats:  Arc::new(MemStats::default()),
            shared: false,
        }
    }

    #[test]
    fn shareable_regions_cannot_grow() {
        let flags = RegionFlags::SHAREABLE | RegionFlags::GROWABLE;
        assert!(matches!(
            Region::new(RegionType::Shm, flags, None, 0, PAGE_SIZE, 0),
            Err(MmError::InvalidArgument)
        ));
    }

    #[test]
    fn binary_pages_start_demand_loaded() {
        let r = Region::new(RegionType::Text, RegionType::Text.default_flags(), Some(BIN), 0, 3 * PAGE_SIZE, 5000).unwrap();
        let st = r.lock();
        assert!(st.page_flags.iter().all(|pf| *pf == PageFlags::DEMANDLOAD));
        assert_eq!(st.page_count(), (0, 0));
        assert_eq!(st.swappable_page(), None);
        drop(st);
        assert!(r.is_same_binary(RegionType::Text, &BIN, 0));
        assert!(!r.is_same_binary(RegionType::Rodata, &BIN, 0));
    }

    #[test]
    fn grows_down_at_the_front() {
        let r = Region::new(RegionType::Stack, RegionType::Stack.default_flags(), None, 0, 100, 0).unwrap();
        let mut st = r.lock();
        st.page_flags[0] = PageFlags::SWAPPED;
        st.swap_blocks[0] = Some(SwapSlot { block: 9, pid: 1 });
        st.grow(2).unwrap();
        assert_eq!(st.byte_count, 3 * PAGE_SIZE);
        assert_eq!(st.page_flags[2], PageFlags::SWAPPED);

        let cut = st.grow(-2).unwrap();
        assert!(cut.is_empty());
        assert_eq!(st.page_flags, vec![PageFlags::SWAPPED]);
        assert_eq!(st.grow(-1).unwrap(), vec![SwapSlot { block: 9, pid: 1 }]);
        assert_eq!(st.pages(), 0);
        assert_eq!(st.grow(-1), Err(MmError::InvalidArgument));
    }

    #[test]
    fn grows_up_at_the_end() {
        let r = Region::new(RegionType::Data, RegionType::Data.default_flags(), None, 0, PAGE_SIZE, 0).unwrap();
        let mut st = r.lock();
        st.page_flags[0] = PageFlags::COPYONWRITE;
        st.grow(1).unwrap();
        assert_eq!(st.page_flags, vec![PageFlags::COPYONWRITE, PageFlags::empty()]);
        assert!(st.has_cow());
        assert_eq!(st.swappable_page(), Some(1));
    }

    #[test]
    fn users_and_procs_stay_in_sync() {
        let r = Region::new(RegionType::Shm, RegionType::Shm.default_flags(), None, 0, PAGE_SIZE, 0).unwrap();
        let mut st = r.lock();
        st.add_user(user(1));
        st.add_user(user(2));
        assert_eq!(st.procs.lock().len(), 2);
        assert!(st.remove_user(1).is_some());
        assert!(st.remove_user(1).is_none());
        assert_eq!(*st.procs.lock(), vec![2]);
        assert_eq!(st.user(2).map(|u| u.page_addr(1)), Some(0x2000));
    }

    #[test]
    fn charge_follows_page_state() {
        let u = user(1);
        u.charge(PageFlags::empty(), 1);
        u.charge(PageFlags::COPYONWRITE, 1);
        u.charge(PageFlags::SWAPPED | PageFlags::BUSY, 1);
        u.charge(PageFlags::DEMANDLOAD, 1);
        assert_eq!(u.stats.own.load(Ordering::Relaxed), 1);
        assert_eq!(u.stats.shared.load(Ordering::Relaxed), 1);
        assert_eq!(u.stats.swapped.load(Ordering::Relaxed), 1);
    }
}
