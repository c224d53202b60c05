//! Virtual Memory Manager
//!
//! Управляет адресными пространствами процессов: регионы, fork с
//! copy-on-write, page fault, рост стека и вытеснение в swap.
//! Manages per-process address spaces: regions, fork with copy-on-write,
//! page faults, stack growth and swapping.
//!
//! Порядок блокировок / Lock order:
//!   procs → regions (RwLock процесса) → состояние региона → swmap / cow
//!
//! Ввод-вывод (бинарник, swap) идёт без блокировки региона; страница на это
//! время помечена BUSY, и все, кто на неё наткнулся, крутятся до снятия флага.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::Ordering;

use spin::{Mutex, MutexGuard, RwLock};

use super::cow::CopyOnWrite;
use super::paging::{MapFlags, NoAllocator, PageDir, PageTable, UAllocator};
use super::pmm::{FrameType, PhysMem};
use super::region::{BinDesc, MemStats, PageFlags, Region, RegionFlags, RegionState, RegionType, RegionUser, SwapSlot};
use super::swapmap::SwapMap;
use super::{bytes_to_pages, round_page_up, Frame, PhysAddr, VirtAddr};
use crate::config::{
    FREE_AREA_BEGIN, MAX_STACK_PAGES, PAGE_SIZE, STACK_AREA_BEGIN, STACK_AREA_END, SWMAP_SIZE, TEXT_BEGIN,
};
use crate::sched::{Pid, Thread};
use crate::MmError;

/// Откуда читаются страницы бинарников (ELF / VFS).
/// Source of binary pages for demand loading.
pub trait BinarySource: Send + Sync {
    /// Прочитать до `buf.len()` байт с `offset`; вернуть прочитанное.
    fn read(&self, bin: &BinDesc, offset: usize, buf: &mut [u8]) -> Result<usize, MmError>;
}

/// Блочный ввод-вывод swap-устройства / Swap device block I/O.
pub trait SwapDevice: Send + Sync {
    fn read_block(&self, block: u32, buf: &mut [u8]) -> Result<(), MmError>;
    fn write_block(&self, block: u32, data: &[u8]) -> Result<(), MmError>;
}

/// Снимок счётчиков процесса / Snapshot of a process's page counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemUsage {
    pub own:     usize,
    pub shared:  usize,
    pub swapped: usize,
    pub tables:  usize,
}

/// Регион в адресном пространстве процесса / A region bound into one process.
struct VmRegion {
    region: Arc<Region>,
    virt:   usize,
}

type RegionTable = BTreeMap<usize, VmRegion>;

pub struct AddressSpace {
    pid:     Pid,
    dir:     Arc<PageDir>,
    stats:   Arc<MemStats>,
    regions: RwLock<RegionTable>,
}

impl AddressSpace {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn dir(&self) -> &Arc<PageDir> {
        &self.dir
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Regions of pid {}:", self.pid)?;
        for vm in self.regions.read().values() {
            writeln!(f, "\t{:#012x}: {}", vm.virt, vm.region)?;
        }
        Ok(())
    }
}

pub struct Vmm {
    phys:     Arc<PhysMem>,
    swmap:    Mutex<SwapMap>,
    cow:      Mutex<CopyOnWrite>,
    binaries: Option<Arc<dyn BinarySource>>,
    swap:     Option<Arc<dyn SwapDevice>>,
    procs:    RwLock<BTreeMap<Pid, Arc<AddressSpace>>>,
}

impl Vmm {
    pub fn new(phys: Arc<PhysMem>) -> Self {
        Self {
            phys,
            swmap:    Mutex::new(SwapMap::new(SWMAP_SIZE)),
            cow:      Mutex::new(CopyOnWrite::new()),
            binaries: None,
            swap:     None,
            procs:    RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_binaries(mut self, source: Arc<dyn BinarySource>) -> Self {
        self.binaries = Some(source);
        self
    }

    /// Подключить swap-устройство на `swap_bytes` байт.
    pub fn with_swap(mut self, device: Arc<dyn SwapDevice>, swap_bytes: usize) -> Result<Self, MmError> {
        self.swmap.get_mut().init(swap_bytes)?;
        self.swap = Some(device);
        Ok(self)
    }

    pub fn phys(&self) -> &Arc<PhysMem> {
        &self.phys
    }

    /// Свободно на swap-устройстве, байт / Free swap space in bytes.
    pub fn swap_free_space(&self) -> usize {
        self.swmap.lock().free_space()
    }

    // ── Процессы / Processes ─────────────────────────────────────────────

    pub fn create_proc(&self, pid: Pid) -> Result<(), MmError> {
        let mut procs = self.procs.write();
        if procs.contains_key(&pid) {
            return Err(MmError::InvalidArgument);
        }
        let space = AddressSpace {
            pid,
            dir:     Arc::new(PageDir::new(self.phys.clone())?),
            stats:   Arc::new(MemStats::default()),
            regions: RwLock::new(BTreeMap::new()),
        };
        procs.insert(pid, Arc::new(space));
        log::debug!("vmm: created address space of pid {}", pid);
        Ok(())
    }

    pub fn destroy_proc(&self, pid: Pid) -> Result<(), MmError> {
        self.remove_all(pid, true)?;
        self.procs.write().remove(&pid);
        self.swmap.lock().rem_proc(pid, None);
        log::debug!("vmm: destroyed address space of pid {}", pid);
        Ok(())
    }

    pub fn address_space(&self, pid: Pid) -> Result<Arc<AddressSpace>, MmError> {
        self.procs.read().get(&pid).cloned().ok_or(MmError::NoSuchProcess)
    }

    /// Переключиться на таблицы процесса / Load the process's page directory.
    pub fn activate(&self, pid: Pid) -> Result<(), MmError> {
        self.address_space(pid)?.dir.activate();
        Ok(())
    }

    // ── Регионы / Regions ────────────────────────────────────────────────

    /// Добавить регион типа `kind` процессу потока `thread`.
    /// Add a region of `kind` to the thread's process; returns its address.
    ///
    /// Binary-backed regions are mapped not-present and loaded on demand.
    /// Anonymous ones get zeroed frames right away. A shareable region of a
    /// binary that another process already maps is joined instead.
    pub fn add(&self, thread: &Thread, bin: Option<BinDesc>, offset: usize, bytes: usize,
               load: usize, kind: RegionType) -> Result<usize, MmError>
    {
        if bytes == 0 {
            return Err(MmError::InvalidArgument);
        }
        let pid = thread.pid;
        let space = self.address_space(pid)?;
        let mut flags = kind.default_flags();
        // чужие кадры отображаются только через add_phys
        if flags.contains(RegionFlags::NOFREE) {
            return Err(MmError::InvalidArgument);
        }

        if let Some(b) = &bin {
            if flags.contains(RegionFlags::SHAREABLE) {
                if let Some((src, src_virt)) = self.find_binary(pid, kind, b, offset) {
                    log::debug!("vmm: pid {} shares {:?} of pid {}", pid, kind, src);
                    return self.join(src, src_virt, pid, None);
                }
            }
        }

        let mut regs = space.regions.write();
        // одна куча на процесс: остальные data-регионы не растут
        if matches!(kind, RegionType::Data | RegionType::DlData)
            && regs.values().any(|vm| is_heap(&vm.region.lock()))
        {
            flags.remove(RegionFlags::GROWABLE);
        }
        let virt = place(&regs, kind, bytes, flags)?;
        let region = Region::new(kind, flags, bin, offset, bytes, load)?;
        let pages = bytes_to_pages(bytes);
        let base = VirtAddr::from(virt);
        let tables = space.dir.table_count();

        if bin.is_none() {
            if !thread.reserve_frames(&self.phys, pages) {
                return Err(MmError::OutOfMemory);
            }
            let mut alloc = UAllocator::new(&self.phys, Some(thread));
            let res = space.dir.map(base, pages, &mut alloc, map_flags(flags, PageFlags::empty()));
            thread.discard_frames(&self.phys);
            res?;
            self.zero_pages(&space.dir, base, pages);
        } else {
            let mut alloc = NoAllocator::new(&self.phys);
            space.dir.map(base, pages, &mut alloc, map_flags(flags, PageFlags::DEMANDLOAD))?;
        }
        add_tables(&space, tables);

        let user = space.user(virt, false);
        {
            let mut st = region.lock();
            for pf in st.page_flags.iter() {
                user.charge(*pf, 1);
            }
            st.add_user(user);
        }
        if flags.contains(RegionFlags::STACK) {
            thread.add_stack_region(virt);
        } else if flags.contains(RegionFlags::TLS) {
            thread.set_tls_region(Some(virt));
        }
        regs.insert(virt, VmRegion { region: Arc::new(region), virt });
        log::debug!("vmm: pid {} +{:?} at {:#x}, {} pages", pid, kind, virt, pages);
        Ok(virt)
    }

    /// Отобразить физическую память / Map physical memory into `pid`.
    ///
    /// With `phys` the given range is mapped and never freed. Without it
    /// `bytes` worth of frames are allocated, contiguous and aligned to
    /// `align` frames when `align > 1`. Returns the address and the first
    /// physical address.
    pub fn add_phys(&self, pid: Pid, phys: Option<PhysAddr>, bytes: usize, align: usize,
                    writable: bool) -> Result<(usize, PhysAddr), MmError>
    {
        if bytes == 0 {
            return Err(MmError::InvalidArgument);
        }
        let space = self.address_space(pid)?;
        let pages = bytes_to_pages(bytes);
        let mut flags = RegionType::Phys.default_flags();
        flags.set(RegionFlags::WRITABLE, writable);

        let mut regs = space.regions.write();
        let virt = find_free_area(&regs, bytes)?;
        let base = VirtAddr::from(virt);
        let tables = space.dir.table_count();
        let mf = map_flags(flags, PageFlags::empty());
        let first = match phys {
            Some(addr) => {
                let frames: Vec<Frame> = (0..pages).map(|i| addr.frame().next(i)).collect();
                space.dir.map_frames(base, &frames, &mut NoAllocator::new(&self.phys), mf)?;
                addr.frame()
            }
            None => {
                flags.remove(RegionFlags::NOFREE);
                let frames = self.alloc_frames(pages, align)?;
                if let Err(e) = space.dir.map_frames(base, &frames, &mut NoAllocator::new(&self.phys), mf) {
                    for f in frames {
                        self.phys.free(f, FrameType::Usr);
                    }
                    return Err(e);
                }
                frames[0]
            }
        };
        add_tables(&space, tables);

        let region = Region::new(RegionType::Phys, flags, None, 0, bytes, 0)?;
        let user = space.user(virt, phys.is_some());
        {
            let mut st = region.lock();
            for pf in st.page_flags.iter() {
                user.charge(*pf, 1);
            }
            st.add_user(user);
        }
        regs.insert(virt, VmRegion { region: Arc::new(region), virt });
        log::debug!("vmm: pid {} +phys {:#x} at {:#x}, {} pages", pid, first.addr().as_u64(), virt, pages);
        Ok((virt, first.addr()))
    }

    /// Присоединить разделяемый регион `src_addr` процесса `src` к `dst`.
    /// Attach the shareable region at `src_addr` of `src` to `dst`.
    pub fn join(&self, src: Pid, src_addr: usize, dst: Pid, dst_virt: Option<usize>)
        -> Result<usize, MmError>
    {
        if src == dst {
            return Err(MmError::InvalidArgument);
        }
        let src_space = self.address_space(src)?;
        let dst_space = self.address_space(dst)?;
        let (region, src_virt) = {
            let regs = src_space.regions.read();
            let vm = find(&regs, src_addr).ok_or(MmError::InvalidArgument)?;
            (vm.region.clone(), vm.virt)
        };
        if !region.lock().flags.contains(RegionFlags::SHAREABLE) {
            return Err(MmError::InvalidArgument);
        }
        let mut regs = dst_space.regions.write();
        self.attach(&src_space.dir, src_virt, &region, &dst_space, &mut regs, dst_virt)
    }

    /// Убрать регион, содержащий `addr` / Remove the region containing `addr`.
    pub fn remove(&self, pid: Pid, addr: usize) -> Result<(), MmError> {
        let space = self.address_space(pid)?;
        let mut regs = space.regions.write();
        let virt = region_key(&regs, addr).ok_or(MmError::InvalidArgument)?;
        if let Some(vm) = regs.remove(&virt) {
            self.release(&space, vm);
        }
        Ok(())
    }

    /// Убрать все регионы; стеки — только с `rem_stack`.
    pub fn remove_all(&self, pid: Pid, rem_stack: bool) -> Result<(), MmError> {
        let space = self.address_space(pid)?;
        let mut regs = space.regions.write();
        let victims: Vec<usize> = regs
            .values()
            .filter(|vm| rem_stack || !vm.region.lock().flags.contains(RegionFlags::STACK))
            .map(|vm| vm.virt)
            .collect();
        for virt in victims {
            if let Some(vm) = regs.remove(&virt) {
                self.release(&space, vm);
            }
        }
        Ok(())
    }

    /// fork: скопировать адресное пространство в `dst`.
    /// Clone the address space of the thread's process into `dst`.
    ///
    /// Shareable and physical regions are joined, private ones become copy-on-write.
    /// Stack and TLS regions of other threads are left out. On failure the
    /// child loses whatever was cloned so far.
    pub fn clone_all(&self, thread: &Thread, dst: Pid) -> Result<(), MmError> {
        if thread.pid == dst {
            return Err(MmError::InvalidArgument);
        }
        let src = self.address_space(thread.pid)?;
        let child = self.address_space(dst)?;
        let res = {
            let sregs = src.regions.read();
            let mut dregs = child.regions.write();
            self.clone_regions(thread, &src, &sregs, &child, &mut dregs)
        };
        if let Err(e) = res {
            log::warn!("vmm: cloning pid {} into {} failed: {}", thread.pid, dst, e);
            self.remove_all(dst, true)?;
            return Err(e);
        }
        log::debug!("vmm: cloned pid {} into {}", thread.pid, dst);
        Ok(())
    }

    /// Сменить защиту региона / Change a region's protection.
    ///
    /// Only `WRITABLE` and `EXECUTABLE` may be given. Stacks, TLS, foreign
    /// memory and regions with copy-on-write pages are refused.
    pub fn regctrl(&self, pid: Pid, addr: usize, flags: RegionFlags) -> Result<(), MmError> {
        let allowed = RegionFlags::WRITABLE | RegionFlags::EXECUTABLE;
        if !(flags - allowed).is_empty() {
            return Err(MmError::InvalidArgument);
        }
        let space = self.address_space(pid)?;
        let regs = space.regions.read();
        let vm = find(&regs, addr).ok_or(MmError::InvalidArgument)?;
        let mut st = lock_idle(&vm.region);
        let fixed = RegionFlags::NOFREE | RegionFlags::STACK | RegionFlags::TLS;
        if st.flags.intersects(fixed) || st.has_cow() {
            return Err(MmError::InvalidArgument);
        }
        st.flags.remove(allowed);
        st.flags.insert(flags);
        let mut na = NoAllocator::new(&self.phys);
        for u in st.users.iter() {
            for (i, pf) in st.page_flags.iter().enumerate() {
                if !pf.intersects(PageFlags::DEMANDLOAD | PageFlags::SWAPPED) {
                    u.dir.map(VirtAddr::from(u.page_addr(i)), 1, &mut na, map_flags(st.flags, *pf))?;
                }
            }
        }
        Ok(())
    }

    // ── Page fault ───────────────────────────────────────────────────────

    /// Обработать page fault по `addr`; `Err(Segfault)` — доставить сигнал.
    /// Resolve a fault at `addr`; `Err(Segfault)` goes to the thread as a signal.
    pub fn pagefault(&self, thread: &Thread, addr: usize, write: bool) -> Result<(), MmError> {
        let space = self.address_space(thread.pid)?;
        if !thread.reserve_frames(&self.phys, 1) {
            return Err(MmError::OutOfMemory);
        }
        let res = self.resolve(thread, &space, addr, write);
        thread.discard_frames(&self.phys);
        if let Err(e) = res {
            log::warn!("vmm: {} fault at {:#x} in pid {}: {}",
                       if write { "write" } else { "read" }, addr, thread.pid, e);
        }
        res
    }

    /// Вернуть вытесненную страницу по `addr` / Swap in the page at `addr`.
    ///
    /// Returns whether a page was actually read back.
    pub fn swap_in(&self, thread: &Thread, addr: usize) -> Result<bool, MmError> {
        let space = self.address_space(thread.pid)?;
        let regs = space.regions.read();
        let vm = find(&regs, addr).ok_or(MmError::InvalidArgument)?;
        let idx = (addr - vm.virt) / PAGE_SIZE;
        let st = lock_idle(&vm.region);
        if !st.page_flags[idx].contains(PageFlags::SWAPPED) {
            return Ok(false);
        }
        if !thread.reserve_frames(&self.phys, 1) {
            return Err(MmError::OutOfMemory);
        }
        let res = self.swap_page_in(thread, &vm.region, st, idx);
        thread.discard_frames(&self.phys);
        res.map(|_| true)
    }

    /// Вытеснить до `count` страниц / Swap out up to `count` pages.
    ///
    /// Victims come from `lru_region`. Returns how many pages went out.
    pub fn swap_out(&self, count: usize) -> Result<usize, MmError> {
        let device = self.swap.clone().ok_or(MmError::InvalidArgument)?;
        let mut done = 0;
        while done < count {
            let Some(region) = self.lru_region() else { break };
            match self.swap_page_out(&device, &region) {
                Ok(true) => done += 1,
                Ok(false) => break,
                Err(e) if done == 0 => return Err(e),
                Err(e) => {
                    log::warn!("vmm: swap-out stopped after {} pages: {}", done, e);
                    break;
                }
            }
        }
        log::trace!("vmm: swapped out {} of {} pages", done, count);
        Ok(done)
    }

    /// Давно не использованный регион, где есть что вытеснить.
    /// The least recently used region with a swappable page.
    ///
    /// Never blocks: busy processes and regions are skipped.
    pub fn lru_region(&self) -> Option<Arc<Region>> {
        let procs = self.procs.try_read()?;
        let mut best: Option<(u64, Arc<Region>)> = None;
        for space in procs.values() {
            let Some(regs) = space.regions.try_read() else { continue };
            for vm in regs.values() {
                let Some(st) = vm.region.try_lock() else { continue };
                if st.flags.contains(RegionFlags::NOFREE)
                    || vm.region.kind == RegionType::Phys
                    || st.swappable_page().is_none()
                {
                    continue;
                }
                if best.as_ref().map_or(true, |(ts, _)| st.timestamp < *ts) {
                    best = Some((st.timestamp, vm.region.clone()));
                }
            }
        }
        best.map(|(_, region)| region)
    }

    /// Отметить регионы потока временем `ts` / Stamp the thread's regions with `ts`.
    ///
    /// Stack and TLS regions count only for the thread that owns them.
    pub fn set_timestamp(&self, thread: &Thread, ts: u64) {
        let Ok(space) = self.address_space(thread.pid) else { return };
        let Some(regs) = space.regions.try_read() else { return };
        for vm in regs.values() {
            if let Some(mut st) = vm.region.try_lock() {
                if st.flags.intersects(RegionFlags::STACK | RegionFlags::TLS)
                    && !thread.has_stack_region(vm.virt)
                    && thread.tls_region() != Some(vm.virt)
                {
                    continue;
                }
                st.timestamp = ts;
            }
        }
    }

    // ── Рост / Growth ────────────────────────────────────────────────────

    /// Изменить размер региона `addr` на `amount` страниц.
    /// Grow (or shrink) the region at `addr` by `amount` pages.
    ///
    /// Returns the old start for grows-down regions, the old end otherwise.
    pub fn grow(&self, thread: &Thread, addr: usize, amount: isize) -> Result<usize, MmError> {
        let pid = thread.pid;
        let space = self.address_space(pid)?;
        let mut regs = space.regions.write();
        let virt = region_key(&regs, addr).ok_or(MmError::InvalidArgument)?;
        let region = regs.get(&virt).map(|vm| vm.region.clone()).ok_or(MmError::InvalidArgument)?;
        let (bytes, flags) = {
            let st = region.lock();
            (st.byte_count, st.flags)
        };
        if !flags.contains(RegionFlags::GROWABLE) {
            return Err(MmError::InvalidArgument);
        }
        let down = flags.contains(RegionFlags::GROWS_DOWN);
        let end = virt + round_page_up(bytes);
        let cur = bytes_to_pages(bytes);
        let old = if down { virt } else { end };
        if amount == 0 {
            return Ok(old);
        }
        let delta = amount.unsigned_abs();
        if amount < 0 && delta > cur {
            return Err(MmError::InvalidArgument);
        }
        if amount > 0 && flags.contains(RegionFlags::STACK)
            && cur.checked_add(delta).map_or(true, |n| n > MAX_STACK_PAGES - 1)
        {
            return Err(MmError::LimitExceeded);
        }
        let span = delta.checked_mul(PAGE_SIZE).ok_or(MmError::OutOfMemory)?;

        if amount > 0 {
            let (start, stop) = if down {
                (virt.checked_sub(span).ok_or(MmError::OutOfMemory)?, virt)
            } else {
                (end, end.checked_add(span).ok_or(MmError::OutOfMemory)?)
            };
            if occupied(&regs, start, stop) || (region.kind.is_program() && stop > FREE_AREA_BEGIN) {
                return Err(MmError::OutOfMemory);
            }
        }

        let mut st = lock_idle(&region);
        let user = st.user(pid).cloned().ok_or(MmError::InvalidArgument)?;
        let tables = space.dir.table_count();
        let new_virt = match (down, amount > 0) {
            (true, true)  => virt - span,
            (true, false) => virt + span,
            (false, _)    => virt,
        };

        if amount > 0 {
            let start = VirtAddr::from(if down { new_virt } else { end });
            if !thread.reserve_frames(&self.phys, delta) {
                return Err(MmError::OutOfMemory);
            }
            let mut alloc = UAllocator::new(&self.phys, Some(thread));
            let res = space.dir.map(start, delta, &mut alloc, map_flags(st.flags, PageFlags::empty()));
            thread.discard_frames(&self.phys);
            res?;
            self.zero_pages(&space.dir, start, delta);
            st.grow(amount)?;
            for _ in 0..delta {
                user.charge(PageFlags::empty(), 1);
            }
        } else {
            let first = if down { 0 } else { cur - delta };
            let base = VirtAddr::from(virt);
            self.drop_cow_pages(&space.dir, &st, base, first..first + delta);
            for pf in &st.page_flags[first..first + delta] {
                user.charge(*pf, -1);
            }
            space.dir.unmap(base.add_pages(first), delta, &mut UAllocator::new(&self.phys, None));
            let cut = st.grow(amount)?;
            let mut swmap = self.swmap.lock();
            for slot in cut {
                if let Err(e) = swmap.free(slot.pid, slot.block, 1) {
                    log::warn!("vmm: swap block {} of pid {} leaked: {}", slot.block, slot.pid, e);
                }
            }
        }

        if down {
            for u in st.users.iter_mut().filter(|u| u.pid == pid) {
                u.virt = new_virt;
            }
        }
        drop(st);
        add_tables(&space, tables);
        if new_virt != virt {
            if let Some(mut vm) = regs.remove(&virt) {
                vm.virt = new_virt;
                regs.insert(new_virt, vm);
            }
            thread.move_stack_region(virt, new_virt);
        }
        log::trace!("vmm: pid {} region {:#x} grew by {} pages", pid, new_virt, amount);
        Ok(old)
    }

    /// Дорастить ближайший стек потока до `addr` / Grow the nearest stack to reach `addr`.
    pub fn grow_stack_to(&self, thread: &Thread, addr: usize) -> Result<(), MmError> {
        let space = self.address_space(thread.pid)?;
        let page = addr & !(PAGE_SIZE - 1);
        let mut best: Option<(usize, usize)> = None;
        {
            let regs = space.regions.read();
            for virt in thread.stack_regions() {
                let Some(vm) = regs.get(&virt) else { continue };
                let (bytes, flags) = {
                    let st = vm.region.lock();
                    (st.byte_count, st.flags)
                };
                let end = virt + round_page_up(bytes);
                let need = if flags.contains(RegionFlags::GROWS_DOWN) {
                    if page >= virt {
                        continue;
                    }
                    (virt - page) / PAGE_SIZE
                } else {
                    if page < end {
                        continue;
                    }
                    (page - end) / PAGE_SIZE + 1
                };
                if best.map_or(true, |(_, n)| need < n) {
                    best = Some((virt, need));
                }
            }
        }
        let (virt, need) = best.ok_or(MmError::Segfault(addr))?;
        self.grow(thread, virt, need as isize).map(|_| ())
    }

    // ── Запросы / Queries ────────────────────────────────────────────────

    pub fn mem_usage(&self, pid: Pid) -> Result<MemUsage, MmError> {
        let space = self.address_space(pid)?;
        let get = |c: &core::sync::atomic::AtomicIsize| c.load(Ordering::Relaxed).max(0) as usize;
        Ok(MemUsage {
            own:     get(&space.stats.own),
            shared:  get(&space.stats.shared),
            swapped: get(&space.stats.swapped),
            tables:  get(&space.stats.tables),
        })
    }

    /// Границы региона, содержащего `addr` / Bounds of the region holding `addr`.
    pub fn region_range(&self, pid: Pid, addr: usize) -> Option<(usize, usize)> {
        let space = self.address_space(pid).ok()?;
        let regs = space.regions.read();
        find(&regs, addr).map(extent)
    }

    /// Состояние страницы `addr` / Page state at `addr`.
    pub fn page_state(&self, pid: Pid, addr: usize) -> Option<PageFlags> {
        let space = self.address_space(pid).ok()?;
        let regs = space.regions.read();
        let vm = find(&regs, addr)?;
        let st = vm.region.lock();
        st.page_flags.get((addr - vm.virt) / PAGE_SIZE).copied()
    }

    pub fn translate(&self, pid: Pid, addr: usize) -> Option<Frame> {
        self.address_space(pid).ok()?.dir.translate(VirtAddr::from(addr))
    }

    // ── Внутреннее / Internals ───────────────────────────────────────────

    fn find_binary(&self, pid: Pid, kind: RegionType, bin: &BinDesc, offset: usize) -> Option<(Pid, usize)> {
        let procs = self.procs.read();
        for (p, space) in procs.iter().filter(|(p, _)| **p != pid) {
            let regs = space.regions.read();
            if let Some(vm) = regs.values().find(|vm| vm.region.is_same_binary(kind, bin, offset)) {
                return Some((*p, vm.virt));
            }
        }
        None
    }

    fn attach(&self, src_dir: &PageDir, src_virt: usize, region: &Arc<Region>, dst: &AddressSpace,
              regs: &mut RegionTable, at: Option<usize>) -> Result<usize, MmError>
    {
        let (bytes, flags) = {
            let st = region.lock();
            (st.byte_count, st.flags)
        };
        let virt = match at {
            Some(v) => {
                if v % PAGE_SIZE != 0 || occupied(regs, v, v + round_page_up(bytes)) {
                    return Err(MmError::InvalidArgument);
                }
                v
            }
            None => place(regs, region.kind, bytes, flags)?,
        };

        let mut st = lock_idle(region);
        let tables = dst.dir.table_count();
        src_dir.clone_to(&dst.dir, VirtAddr::from(src_virt), VirtAddr::from(virt), st.pages(), true)?;
        add_tables(dst, tables);
        let user = dst.user(virt, true);
        for pf in st.page_flags.iter() {
            user.charge(*pf, 1);
        }
        st.add_user(user);
        drop(st);
        regs.insert(virt, VmRegion { region: region.clone(), virt });
        log::debug!("vmm: pid {} joined {:?} at {:#x}", dst.pid, region.kind, virt);
        Ok(virt)
    }

    /// Отвязать регион от процесса; последний пользователь забирает кадры.
    /// Unbind a region from a process; the last user frees frames and swap.
    fn release(&self, space: &AddressSpace, vm: VmRegion) {
        let mut st = lock_idle(&vm.region);
        let Some(user) = st.remove_user(space.pid) else {
            log::warn!("vmm: pid {} is not a user of region {:#x}", space.pid, vm.virt);
            return;
        };
        let tables = space.dir.table_count();
        let base = VirtAddr::from(vm.virt);
        let pages = st.pages();
        for pf in st.page_flags.iter() {
            user.charge(*pf, -1);
        }

        if st.users.is_empty() {
            self.drop_cow_pages(&space.dir, &st, base, 0..pages);
            if st.flags.contains(RegionFlags::NOFREE) {
                space.dir.unmap(base, pages, &mut NoAllocator::new(&self.phys));
            } else {
                space.dir.unmap(base, pages, &mut UAllocator::new(&self.phys, None));
            }
            let mut swmap = self.swmap.lock();
            if st.flags.contains(RegionFlags::SHAREABLE) {
                swmap.rem_proc(space.pid, Some(&st.procs));
            } else {
                for slot in st.swap_blocks.iter().flatten() {
                    if let Err(e) = swmap.free(slot.pid, slot.block, 1) {
                        log::warn!("vmm: swap block {} of pid {} leaked: {}", slot.block, slot.pid, e);
                    }
                }
            }
            st.swap_blocks.iter_mut().for_each(|s| *s = None);
        } else {
            space.dir.unmap(base, pages, &mut NoAllocator::new(&self.phys));
        }
        drop(st);
        add_tables(space, tables);
        log::debug!("vmm: pid {} -{:?} at {:#x}", space.pid, vm.region.kind, vm.virt);
    }

    /// Снять copy-on-write страницы, чьи кадры ещё нужны другим.
    /// Unmap (without freeing) copy-on-write pages whose frames others still use.
    fn drop_cow_pages(&self, dir: &PageDir, st: &RegionState, base: VirtAddr, range: core::ops::Range<usize>) {
        let mut cow = self.cow.lock();
        let mut na = NoAllocator::new(&self.phys);
        for i in range {
            if !st.page_flags[i].contains(PageFlags::COPYONWRITE) {
                continue;
            }
            if let Some(frame) = dir.translate(base.add_pages(i)) {
                if cow.remove(frame) {
                    dir.unmap(base.add_pages(i), 1, &mut na);
                }
            }
        }
    }

    fn clone_regions(&self, thread: &Thread, src: &AddressSpace, sregs: &RegionTable,
                     dst: &AddressSpace, dregs: &mut RegionTable) -> Result<(), MmError>
    {
        for vm in sregs.values() {
            let flags = vm.region.lock().flags;
            if flags.contains(RegionFlags::STACK) && !thread.has_stack_region(vm.virt) {
                continue;
            }
            if flags.contains(RegionFlags::TLS) && thread.tls_region() != Some(vm.virt) {
                continue;
            }
            // физическая память не копируется: потомок видит те же кадры
            if flags.contains(RegionFlags::SHAREABLE) || vm.region.kind == RegionType::Phys {
                self.attach(&src.dir, vm.virt, &vm.region, dst, dregs, Some(vm.virt))?;
                continue;
            }

            let mut st = lock_idle(&vm.region);
            let parent = st.user(src.pid).cloned().ok_or(MmError::InvalidArgument)?;
            let base = VirtAddr::from(vm.virt);
            let pages = st.pages();
            let tables = dst.dir.table_count();
            src.dir.clone_to(&dst.dir, base, base, pages, false)?;
            add_tables(dst, tables);

            let copy = Arc::new(vm.region.clone_private(&st));
            dregs.insert(vm.virt, VmRegion { region: copy.clone(), virt: vm.virt });
            let mut cst = copy.lock();
            {
                let mut cow = self.cow.lock();
                for i in 0..pages {
                    let pf = st.page_flags[i];
                    if pf.intersects(PageFlags::DEMANDLOAD | PageFlags::SWAPPED) {
                        continue;
                    }
                    let Some(frame) = src.dir.translate(base.add_pages(i)) else { continue };
                    if !pf.contains(PageFlags::COPYONWRITE) {
                        cow.add(frame);
                        parent.charge(pf, -1);
                        st.page_flags[i] |= PageFlags::COPYONWRITE;
                        parent.charge(st.page_flags[i], 1);
                    }
                    cow.add(frame);
                    cst.page_flags[i] |= PageFlags::COPYONWRITE;
                }
            }
            let child = dst.user(vm.virt, false);
            for pf in cst.page_flags.iter() {
                child.charge(*pf, 1);
            }
            cst.add_user(child);

            // вытесненные страницы получают свои блоки
            for i in 0..pages {
                if let Some(slot) = st.swap_blocks[i] {
                    let block = self.copy_swap_block(slot, dst.pid, vm.virt + i * PAGE_SIZE)?;
                    cst.swap_blocks[i] = Some(SwapSlot { block, pid: dst.pid });
                }
            }
        }
        Ok(())
    }

    fn copy_swap_block(&self, slot: SwapSlot, pid: Pid, virt: usize) -> Result<u32, MmError> {
        let device = self.swap.as_ref().ok_or(MmError::Io)?;
        let block = self.swmap.lock().alloc(pid, None, virt, 1)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        let res = device.read_block(slot.block, &mut buf).and_then(|_| device.write_block(block, &buf));
        if let Err(e) = res {
            if let Err(e) = self.swmap.lock().free(pid, block, 1) {
                log::warn!("vmm: swap block {} of pid {} leaked: {}", block, pid, e);
            }
            return Err(e);
        }
        Ok(block)
    }

    fn resolve(&self, thread: &Thread, space: &AddressSpace, addr: usize, write: bool) -> Result<(), MmError> {
        let regs = space.regions.read();
        if let Some(vm) = find(&regs, addr) {
            return self.resolve_in(thread, space, vm, addr, write);
        }
        drop(regs);
        // вне регионов: может быть, это рост стека
        self.grow_stack_to(thread, addr).map_err(|e| match e {
            MmError::OutOfMemory => e,
            _ => MmError::Segfault(addr),
        })
    }

    fn resolve_in(&self, thread: &Thread, space: &AddressSpace, vm: &VmRegion, addr: usize, write: bool)
        -> Result<(), MmError>
    {
        let idx = (addr - vm.virt) / PAGE_SIZE;
        loop {
            let st = vm.region.lock();
            let pf = st.page_flags[idx];
            if pf.contains(PageFlags::BUSY) {
                drop(st);
                core::hint::spin_loop();
                continue;
            }
            if write && !st.flags.contains(RegionFlags::WRITABLE) {
                return Err(MmError::Segfault(addr));
            }
            if pf.contains(PageFlags::SWAPPED) {
                return self.swap_page_in(thread, &vm.region, st, idx);
            }
            if pf.contains(PageFlags::COPYONWRITE) && write {
                return self.copy_on_write(thread, space, st, vm.virt, idx);
            }
            if pf.contains(PageFlags::DEMANDLOAD) {
                return self.demand_load(thread, &vm.region, st, idx);
            }
            // уже разрешён другим потоком
            return Ok(());
        }
    }

    fn copy_on_write(&self, thread: &Thread, space: &AddressSpace, mut st: MutexGuard<'_, RegionState>,
                     virt: usize, idx: usize) -> Result<(), MmError>
    {
        let v = VirtAddr::from(virt).add_pages(idx);
        let frame = space.dir.translate(v).ok_or(MmError::Segfault(v.as_usize()))?;
        let old = st.page_flags[idx];
        let new = old - PageFlags::COPYONWRITE;
        let flags = map_flags(st.flags, new);
        let mut na = NoAllocator::new(&self.phys);
        {
            let mut cow = self.cow.lock();
            if cow.count(frame) > 1 {
                let copy = thread.take_frame(&self.phys).ok_or(MmError::OutOfMemory)?;
                self.phys.copy_frame(copy, frame);
                if let Err(e) = space.dir.map_frames(v, &[copy], &mut na, flags) {
                    self.phys.free(copy, FrameType::Usr);
                    return Err(e);
                }
                log::trace!("vmm: cow copy {:#x} -> {:#x} at {:#x}", frame.0, copy.0, v.as_u64());
            } else {
                // последний пользователь: кадр остаётся
                space.dir.map(v, 1, &mut na, flags)?;
            }
            cow.remove(frame);
        }
        if let Some(u) = st.user(space.pid) {
            u.charge(old, -1);
            u.charge(new, 1);
        }
        st.page_flags[idx] = new;
        Ok(())
    }

    fn demand_load(&self, thread: &Thread, region: &Region, mut st: MutexGuard<'_, RegionState>, idx: usize)
        -> Result<(), MmError>
    {
        let frame = thread.take_frame(&self.phys).ok_or(MmError::OutOfMemory)?;
        self.phys.zero_frame(frame);
        st.page_flags[idx] |= PageFlags::BUSY;
        drop(st);
        let loaded = self.load_page(region, idx, frame);
        let mut st = region.lock();
        st.page_flags[idx].remove(PageFlags::BUSY);
        if let Err(e) = loaded {
            self.phys.free(frame, FrameType::Usr);
            return Err(e);
        }
        let old = st.page_flags[idx];
        self.map_everywhere(&mut st, idx, frame, old, old - PageFlags::DEMANDLOAD)?;
        log::trace!("vmm: loaded page {} of {:?} into frame {:#x}", idx, region.kind, frame.0);
        Ok(())
    }

    /// Прочитать часть бинарника в кадр; хвост за `load_count` — нули.
    fn load_page(&self, region: &Region, idx: usize, frame: Frame) -> Result<(), MmError> {
        let start = idx * PAGE_SIZE;
        if start >= region.load_count {
            return Ok(());
        }
        let len = (region.load_count - start).min(PAGE_SIZE);
        let bin = region.binary.as_ref().ok_or(MmError::Io)?;
        let source = self.binaries.as_ref().ok_or(MmError::Io)?;
        let mut buf = vec![0u8; len];
        if source.read(bin, region.offset + start, &mut buf)? < len {
            return Err(MmError::Io);
        }
        self.phys.write(frame, 0, &buf);
        Ok(())
    }

    fn swap_page_in(&self, thread: &Thread, region: &Region, mut st: MutexGuard<'_, RegionState>, idx: usize)
        -> Result<(), MmError>
    {
        let slot = st.swap_blocks[idx].ok_or(MmError::Io)?;
        let device = self.swap.clone().ok_or(MmError::Io)?;
        let frame = thread.take_frame(&self.phys).ok_or(MmError::OutOfMemory)?;
        st.page_flags[idx] |= PageFlags::BUSY;
        drop(st);

        let mut buf = vec![0u8; PAGE_SIZE];
        let res = device.read_block(slot.block, &mut buf);
        let mut st = region.lock();
        st.page_flags[idx].remove(PageFlags::BUSY);
        if let Err(e) = res {
            self.phys.free(frame, FrameType::Usr);
            return Err(e);
        }
        self.phys.write(frame, 0, &buf);
        let old = st.page_flags[idx];
        self.map_everywhere(&mut st, idx, frame, old, old - PageFlags::SWAPPED)?;
        st.swap_blocks[idx] = None;
        if let Err(e) = self.swmap.lock().free(slot.pid, slot.block, 1) {
            log::warn!("vmm: swap block {} of pid {} leaked: {}", slot.block, slot.pid, e);
        }
        log::trace!("vmm: swapped in page {} of {:?} from block {}", idx, region.kind, slot.block);
        Ok(())
    }

    fn swap_page_out(&self, device: &Arc<dyn SwapDevice>, region: &Region) -> Result<bool, MmError> {
        let mut st = region.lock();
        let Some(idx) = st.swappable_page() else { return Ok(false) };
        let Some(first) = st.users.first().cloned() else { return Ok(false) };
        let virt = first.page_addr(idx);
        let frame = first.dir.translate(VirtAddr::from(virt)).ok_or(MmError::Io)?;
        let procs = st.flags.contains(RegionFlags::SHAREABLE).then(|| st.procs.clone());
        let block = self.swmap.lock().alloc(first.pid, procs.as_ref(), virt, 1)?;

        let old = st.page_flags[idx];
        let new = old | PageFlags::SWAPPED | PageFlags::BUSY;
        let mut na = NoAllocator::new(&self.phys);
        for u in st.users.iter() {
            u.dir.map(VirtAddr::from(u.page_addr(idx)), 1, &mut na, map_flags(st.flags, new))?;
            u.charge(old, -1);
            u.charge(new, 1);
        }
        st.page_flags[idx] = new;
        st.swap_blocks[idx] = Some(SwapSlot { block, pid: first.pid });
        let mut buf = vec![0u8; PAGE_SIZE];
        self.phys.read(frame, 0, &mut buf);
        drop(st);

        let res = device.write_block(block, &buf);
        let mut st = region.lock();
        if let Err(e) = res {
            // страница возвращается на место
            let swapped = st.page_flags[idx] - PageFlags::BUSY;
            self.map_everywhere(&mut st, idx, frame, swapped, old)?;
            st.swap_blocks[idx] = None;
            if let Err(e) = self.swmap.lock().free(first.pid, block, 1) {
                log::warn!("vmm: swap block {} of pid {} leaked: {}", block, first.pid, e);
            }
            return Err(e);
        }
        self.phys.free(frame, FrameType::Usr);
        st.page_flags[idx].remove(PageFlags::BUSY);
        log::trace!("vmm: swapped out page {} of {:?} to block {}", idx, region.kind, block);
        Ok(true)
    }

    /// Отобразить кадр страницы `idx` у всех пользователей региона.
    /// Map `frame` as page `idx` in every user and move it from `old` to `new`.
    fn map_everywhere(&self, st: &mut RegionState, idx: usize, frame: Frame, old: PageFlags, new: PageFlags)
        -> Result<(), MmError>
    {
        let flags = map_flags(st.flags, new);
        let mut na = NoAllocator::new(&self.phys);
        for u in st.users.iter() {
            u.dir.map_frames(VirtAddr::from(u.page_addr(idx)), &[frame], &mut na, flags)?;
            u.charge(old, -1);
            u.charge(new, 1);
        }
        st.page_flags[idx] = new;
        Ok(())
    }

    fn alloc_frames(&self, pages: usize, align: usize) -> Result<Vec<Frame>, MmError> {
        if align > 1 {
            let first = self.phys.allocate_contiguous(pages, align).ok_or(MmError::OutOfMemory)?;
            return Ok((0..pages).map(|i| first.next(i)).collect());
        }
        let mut frames = Vec::with_capacity(pages);
        for _ in 0..pages {
            match self.phys.allocate(FrameType::Usr) {
                Some(f) => frames.push(f),
                None => {
                    for f in frames {
                        self.phys.free(f, FrameType::Usr);
                    }
                    return Err(MmError::OutOfMemory);
                }
            }
        }
        Ok(frames)
    }

    fn zero_pages(&self, dir: &PageDir, base: VirtAddr, pages: usize) {
        for i in 0..pages {
            if let Some(frame) = dir.translate(base.add_pages(i)) {
                self.phys.zero_frame(frame);
            }
        }
    }
}

impl AddressSpace {
    fn user(&self, virt: usize, shared: bool) -> RegionUser {
        RegionUser { pid: self.pid, virt, dir: self.dir.clone(), stats: self.stats.clone(), shared }
    }
}

fn map_flags(flags: RegionFlags, pf: PageFlags) -> MapFlags {
    let mut mf = MapFlags::empty();
    if !pf.intersects(PageFlags::DEMANDLOAD | PageFlags::SWAPPED) {
        mf |= MapFlags::PRESENT;
    }
    if flags.contains(RegionFlags::WRITABLE) && !pf.contains(PageFlags::COPYONWRITE) {
        mf |= MapFlags::WRITABLE;
    }
    if flags.contains(RegionFlags::EXECUTABLE) {
        mf |= MapFlags::EXECUTABLE;
    }
    mf
}

fn is_heap(st: &RegionState) -> bool {
    st.flags.contains(RegionFlags::GROWABLE) && !st.flags.contains(RegionFlags::STACK)
}

fn add_tables(space: &AddressSpace, before: usize) {
    let diff = space.dir.table_count() as isize - before as isize;
    space.stats.tables.fetch_add(diff, Ordering::Relaxed);
}

/// Ждать, пока у региона не останется BUSY-страниц / Lock once no page is busy.
fn lock_idle(region: &Region) -> MutexGuard<'_, RegionState> {
    loop {
        let st = region.lock();
        if !st.is_busy() {
            return st;
        }
        drop(st);
        core::hint::spin_loop();
    }
}

fn extent(vm: &VmRegion) -> (usize, usize) {
    (vm.virt, vm.virt + round_page_up(vm.region.lock().byte_count))
}

fn find(regs: &RegionTable, addr: usize) -> Option<&VmRegion> {
    regs.range(..=addr).next_back().map(|(_, vm)| vm).filter(|vm| addr < extent(vm).1)
}

/// Начало региона с `addr`; пустые регионы находятся по точному адресу.
fn region_key(regs: &RegionTable, addr: usize) -> Option<usize> {
    if regs.contains_key(&addr) {
        return Some(addr);
    }
    find(regs, addr).map(|vm| vm.virt)
}

fn occupied(regs: &RegionTable, start: usize, end: usize) -> bool {
    regs.values().any(|vm| {
        let (s, e) = extent(vm);
        s < end && start < e
    })
}

/// Адрес для нового региона / Address for a new region.
fn place(regs: &RegionTable, kind: RegionType, bytes: usize, flags: RegionFlags) -> Result<usize, MmError> {
    if kind.is_program() {
        let start = regs
            .range(..FREE_AREA_BEGIN)
            .map(|(_, vm)| extent(vm).1)
            .max()
            .unwrap_or(TEXT_BEGIN)
            .max(TEXT_BEGIN);
        if start + round_page_up(bytes) > FREE_AREA_BEGIN {
            return Err(MmError::OutOfMemory);
        }
        Ok(start)
    } else if flags.contains(RegionFlags::STACK) {
        find_free_stack(regs, bytes, flags)
    } else {
        find_free_area(regs, bytes)
    }
}

/// Первая дыра между FREE_AREA_BEGIN и стеками / First gap below the stack area.
fn find_free_area(regs: &RegionTable, bytes: usize) -> Result<usize, MmError> {
    let size = round_page_up(bytes);
    let mut cursor = FREE_AREA_BEGIN;
    for (_, vm) in regs.range(FREE_AREA_BEGIN..STACK_AREA_BEGIN) {
        let (start, end) = extent(vm);
        if start >= cursor + size {
            return Ok(cursor);
        }
        cursor = cursor.max(end);
    }
    if cursor + size <= STACK_AREA_BEGIN {
        Ok(cursor)
    } else {
        Err(MmError::OutOfMemory)
    }
}

/// Свободный слот стека / A free stack slot.
///
/// Slots are `MAX_STACK_PAGES` long, the last page of each stays unmapped.
/// Grows-down stacks sit at the top of their slot.
fn find_free_stack(regs: &RegionTable, bytes: usize, flags: RegionFlags) -> Result<usize, MmError> {
    let slot = MAX_STACK_PAGES * PAGE_SIZE;
    let max = slot - PAGE_SIZE;
    if bytes > max {
        return Err(MmError::LimitExceeded);
    }
    let mut addr = STACK_AREA_BEGIN;
    while addr + slot <= STACK_AREA_END {
        if !occupied(regs, addr, addr + max) {
            return Ok(if flags.contains(RegionFlags::GROWS_DOWN) {
                addr + max - round_page_up(bytes)
            } else {
                addr
            });
        }
        addr += slot;
    }
    Err(MmError::OutOfMemory)
}
