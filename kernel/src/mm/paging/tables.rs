//! Многоуровневые таблицы страниц / Multi-level page tables
//!
//! Radix-дерево с корнем в физическом кадре. Промежуточные таблицы
//! создаются при отображении и собираются (gc), когда пустеют.
//! A radix tree rooted at a physical frame. Intermediate tables are created
//! on demand while mapping and garbage-collected once they become empty.
//!
//! Все изменения идут через `PhysMem`, поэтому методы берут `&self`;
//! внутренний mutex упорядочивает мутации одного дерева.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::{Allocator, MapFlags, NoAllocator, PageTable, PagingMode, Pte, PteFlags};
use crate::arch;
use crate::config::KERNEL_AREA;
use crate::mm::pmm::{FrameType, PhysMem};
use crate::mm::{Frame, VirtAddr};
use crate::MmError;

pub struct PageTables<M: PagingMode> {
    root:   Frame,
    phys:   Arc<PhysMem>,
    active: AtomicBool,
    lock:   Mutex<()>,
    _mode:  PhantomData<M>,
}

fn pte_flags(flags: MapFlags) -> PteFlags {
    let mut pte = PteFlags::empty();
    if !flags.contains(MapFlags::NOPAGES) {
        pte |= PteFlags::EXISTS;
    }
    if flags.contains(MapFlags::PRESENT) {
        pte |= PteFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            pte |= PteFlags::WRITABLE;
        }
    }
    if !flags.contains(MapFlags::SUPERVISOR) {
        pte |= PteFlags::NOTSUPER;
    }
    if flags.contains(MapFlags::GLOBAL) {
        pte |= PteFlags::GLOBAL;
    }
    if !flags.contains(MapFlags::EXECUTABLE) {
        pte |= PteFlags::NO_EXEC;
    }
    pte
}

impl<M: PagingMode> PageTables<M> {
    /// Новое пустое дерево / A fresh, empty tree.
    pub fn new(phys: Arc<PhysMem>) -> Result<Self, MmError> {
        let root = phys.allocate(FrameType::Kern).ok_or(MmError::OutOfMemory)?;
        phys.zero_frame(root);
        log::trace!("paging: new {} directory, root frame {:#x}", M::NAME, root.0);
        Ok(Self {
            root,
            phys,
            active: AtomicBool::new(false),
            lock:   Mutex::new(()),
            _mode:  PhantomData,
        })
    }

    pub fn root(&self) -> Frame {
        self.root
    }

    pub fn phys(&self) -> &Arc<PhysMem> {
        &self.phys
    }

    pub fn is_current(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Переключение контекста ушло на другое дерево.
    pub fn release_current(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Запись листа для `virt`, если таблицы до него есть.
    pub fn entry(&self, virt: VirtAddr) -> Option<Pte> {
        let virt = virt.as_usize();
        let table = self.leaf_table(virt)?;
        Some(self.phys.read_pte(table, M::index(virt, M::LEVELS - 1)))
    }

    pub fn is_present(&self, virt: VirtAddr) -> bool {
        self.entry(virt).is_some_and(Pte::is_present)
    }

    /// Присутствующих страниц в пользовательской части / Present user pages.
    pub fn page_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |virt, pte| {
            if pte.is_present() && virt.as_usize() < KERNEL_AREA {
                count += 1;
            }
        });
        count
    }

    /// Таблиц под корнем / Tables below the root.
    pub fn table_count(&self) -> usize {
        self.count_tables(self.root, 0)
    }

    fn count_tables(&self, table: Frame, level: usize) -> usize {
        if level == M::LEVELS - 1 {
            return 0;
        }
        (0..M::ENTRIES)
            .map(|i| self.phys.read_pte(table, i))
            .filter(|e| e.is_present())
            .map(|e| 1 + self.count_tables(e.frame(), level + 1))
            .sum()
    }

    fn flush(&self, virt: VirtAddr) {
        if self.is_current() {
            arch::flush_addr(virt);
        }
    }

    fn leaf_table(&self, virt: usize) -> Option<Frame> {
        let mut table = self.root;
        for level in 0..M::LEVELS - 1 {
            let e = self.phys.read_pte(table, M::index(virt, level));
            if !e.is_present() {
                return None;
            }
            table = e.frame();
        }
        Some(table)
    }

    fn leaf_table_create(&self, virt: usize, notsuper: bool, alloc: &mut dyn Allocator)
        -> Result<Frame, MmError>
    {
        let mut table = self.root;
        for level in 0..M::LEVELS - 1 {
            let idx = M::index(virt, level);
            let mut e = self.phys.read_pte(table, idx);
            if e.is_empty() {
                let frame = alloc.alloc_pt()?;
                self.phys.zero_frame(frame);
                let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::EXISTS;
                if notsuper {
                    flags |= PteFlags::NOTSUPER;
                }
                e = Pte::new(frame, flags);
                self.phys.write_pte(table, idx, e);
            }
            table = e.frame();
        }
        Ok(table)
    }

    /// Записать лист; `None` оставляет прежний кадр. Возвращает, был ли он present.
    fn map_entry(&self, virt: usize, frame: Option<Frame>, flags: PteFlags, alloc: &mut dyn Allocator)
        -> Result<bool, MmError>
    {
        let table = self.leaf_table_create(virt, flags.contains(PteFlags::NOTSUPER), alloc)?;
        let idx = M::index(virt, M::LEVELS - 1);
        let old = self.phys.read_pte(table, idx);
        let frame = frame.unwrap_or(old.frame());
        self.phys.write_pte(table, idx, Pte::new(frame, flags));
        Ok(old.is_present())
    }

    fn map_locked(&self, virt: VirtAddr, frames: Option<&[Frame]>, count: usize,
                  alloc: &mut dyn Allocator, flags: MapFlags) -> Result<bool, MmError>
    {
        let base = virt.page_base();
        let pte = pte_flags(flags);
        let mut shootdown = false;
        for i in 0..count {
            let v = base.add_pages(i);
            let frame = match frames {
                Some(frames) => Ok(Some(frames[i])),
                None if flags.contains(MapFlags::PRESENT) => alloc.alloc_page(),
                None => Ok(None),
            };
            let res = match frame {
                Ok(frame) => {
                    let res = self.map_entry(v.as_usize(), frame, pte, alloc);
                    // кадр, взятый у аллокатора, ещё не в таблице
                    if let (Err(_), None, Some(f)) = (&res, frames, frame) {
                        alloc.free_page(f);
                    }
                    res
                }
                Err(e) => Err(e),
            };
            match res {
                Ok(was_present) => {
                    shootdown |= was_present;
                    self.flush(v);
                }
                Err(e) => {
                    log::warn!("paging: mapping {:#x} failed after {} pages: {}", v.as_u64(), i, e);
                    self.unmap_locked(base, i, alloc);
                    return Err(e);
                }
            }
        }
        Ok(shootdown)
    }

    fn unmap_locked(&self, virt: VirtAddr, count: usize, alloc: &mut dyn Allocator) -> bool {
        let base = virt.page_base();
        let mut shootdown = false;
        for i in 0..count {
            let v = base.add_pages(i);
            if let Some(table) = self.leaf_table(v.as_usize()) {
                let idx = M::index(v.as_usize(), M::LEVELS - 1);
                let old = self.phys.read_pte(table, idx);
                if !old.is_empty() {
                    self.phys.write_pte(table, idx, Pte::EMPTY);
                    if old.is_present() && old.frame().0 != 0 {
                        alloc.free_page(old.frame());
                        self.flush(v);
                        shootdown = true;
                    }
                }
            }
            // Последняя страница этой таблицы — попробовать собрать мусор
            let table_done = i + 1 == count || M::index(v.add_pages(1).as_usize(), M::LEVELS - 1) == 0;
            if table_done && v.as_usize() < KERNEL_AREA {
                self.gc(v.as_usize(), alloc);
            }
        }
        shootdown
    }

    /// Освободить опустевшие таблицы на пути к `virt`, снизу вверх (корень остаётся).
    fn gc(&self, virt: usize, alloc: &mut dyn Allocator) {
        let mut path = Vec::with_capacity(M::LEVELS);
        let mut table = self.root;
        path.push(table);
        for level in 0..M::LEVELS - 1 {
            let e = self.phys.read_pte(table, M::index(virt, level));
            if !e.is_present() {
                return;
            }
            table = e.frame();
            path.push(table);
        }
        for level in (1..M::LEVELS).rev() {
            let empty = (0..M::ENTRIES).all(|i| self.phys.read_pte(path[level], i).is_empty());
            if !empty {
                break;
            }
            self.phys.write_pte(path[level - 1], M::index(virt, level - 1), Pte::EMPTY);
            alloc.free_pt(path[level]);
        }
    }

    fn walk_table(&self, table: Frame, level: usize, base: usize, f: &mut dyn FnMut(VirtAddr, Pte)) {
        for i in 0..M::ENTRIES {
            let e = self.phys.read_pte(table, i);
            if e.is_empty() {
                continue;
            }
            let virt = base + i * M::entry_span(level);
            if level == M::LEVELS - 1 {
                f(VirtAddr::from(virt), e);
            } else if e.is_present() {
                self.walk_table(e.frame(), level + 1, virt, f);
            }
        }
    }

    fn free_tables(&self, table: Frame, level: usize) {
        if level < M::LEVELS - 1 {
            for i in 0..M::ENTRIES {
                let e = self.phys.read_pte(table, i);
                if e.is_present() {
                    self.free_tables(e.frame(), level + 1);
                }
            }
        }
        self.phys.free(table, FrameType::Kern);
    }
}

impl<M: PagingMode> PageTable for PageTables<M> {
    fn map(&self, virt: VirtAddr, count: usize, alloc: &mut dyn Allocator, flags: MapFlags)
        -> Result<bool, MmError>
    {
        let _guard = self.lock.lock();
        self.map_locked(virt, None, count, alloc, flags)
    }

    fn map_frames(&self, virt: VirtAddr, frames: &[Frame], alloc: &mut dyn Allocator, flags: MapFlags)
        -> Result<bool, MmError>
    {
        let _guard = self.lock.lock();
        self.map_locked(virt, Some(frames), frames.len(), alloc, flags)
    }

    fn unmap(&self, virt: VirtAddr, count: usize, alloc: &mut dyn Allocator) -> bool {
        let _guard = self.lock.lock();
        self.unmap_locked(virt, count, alloc)
    }

    /// Скопировать записи в `dst`. Без `share` присутствующие страницы
    /// становятся read-only в обоих деревьях (copy-on-write). Всё или ничего.
    fn clone_to(&self, dst: &Self, src: VirtAddr, dst_virt: VirtAddr, count: usize, share: bool)
        -> Result<bool, MmError>
    {
        assert!(!core::ptr::eq(self, dst), "cloning page tables into themselves");
        // Порядок блокировок — по корневому кадру
        let (_g1, _g2) = if self.root < dst.root {
            (self.lock.lock(), dst.lock.lock())
        } else {
            let g2 = dst.lock.lock();
            (self.lock.lock(), g2)
        };

        let mut noalloc = NoAllocator::new(&self.phys);
        let mut downgraded: Vec<(usize, Pte)> = Vec::new();
        let mut shootdown = false;
        let (src, dst_base) = (src.page_base(), dst_virt.page_base());
        for i in 0..count {
            let sv = src.add_pages(i).as_usize();
            let dv = dst_base.add_pages(i).as_usize();
            let pte = match self.entry(VirtAddr::from(sv)) {
                Some(pte) if !pte.is_empty() => pte,
                _ => continue,
            };
            let cow = !share && pte.is_present();
            let mut flags = pte.flags();
            if cow {
                flags.remove(PteFlags::WRITABLE);
            }

            if let Err(e) = dst.map_entry(dv, Some(pte.frame()), flags, &mut noalloc) {
                // откатить: dst снять, у src вернуть запись
                dst.unmap_locked(dst_base, i, &mut noalloc);
                for (v, old) in downgraded {
                    let _ = self.map_entry(v, Some(old.frame()), old.flags(), &mut noalloc);
                    self.flush(VirtAddr::from(v));
                }
                return Err(e);
            }

            if cow {
                self.map_entry(sv, Some(pte.frame()), flags, &mut noalloc)?;
                if pte.is_writable() {
                    self.flush(VirtAddr::from(sv));
                    shootdown = true;
                }
                downgraded.push((sv, pte));
            }
        }
        Ok(shootdown)
    }

    fn translate(&self, virt: VirtAddr) -> Option<Frame> {
        self.entry(virt).filter(|e| e.is_present()).map(Pte::frame)
    }

    fn walk(&self, f: &mut dyn FnMut(VirtAddr, Pte)) {
        self.walk_table(self.root, 0, 0, f);
    }

    fn activate(&self) {
        self.active.store(true, Ordering::Release);
        arch::set_root(self.root);
    }
}

impl<M: PagingMode> Drop for PageTables<M> {
    fn drop(&mut self) {
        // Листовые кадры принадлежат регионам; здесь только таблицы
        self.free_tables(self.root, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::paging::{KAllocator, RangeAllocator, Sv39, UAllocator, X86_64};
    use alloc::vec;

    type Dir = PageTables<Sv39>;

    fn setup() -> (Arc<PhysMem>, Dir) {
        let phys = Arc::new(PhysMem::new(256, 0));
        let dir = Dir::new(phys.clone()).unwrap();
        (phys, dir)
    }

    fn snapshot<T: PageTable>(dir: &T) -> Vec<(u64, u64)> {
        let mut v = Vec::new();
        dir.walk(&mut |virt, pte| v.push((virt.as_u64(), pte.0)));
        v
    }

    const USER: MapFlags = MapFlags::PRESENT.union(MapFlags::WRITABLE);

    #[test]
    fn map_creates_tables_and_frames() {
        let (phys, dir) = setup();
        let mut ua = UAllocator::new(&phys, None);
        let need = dir.map(VirtAddr::new(0x40_0000), 3, &mut ua, USER).unwrap();
        assert!(!need);
        assert_eq!(ua.page_tables(), 2);
        assert_eq!(dir.table_count(), 2);
        assert_eq!(dir.page_count(), 3);
        assert!(dir.is_present(VirtAddr::new(0x40_2000)));
        assert!(!dir.is_present(VirtAddr::new(0x40_3000)));
        let pte = dir.entry(VirtAddr::new(0x40_0000)).unwrap();
        assert!(pte.flags().contains(PteFlags::EXISTS | PteFlags::NOTSUPER | PteFlags::NO_EXEC));
    }

    #[test]
    fn map_then_unmap_restores_structure() {
        let (phys, dir) = setup();
        let mut ua = UAllocator::new(&phys, None);
        dir.map(VirtAddr::new(0x1000), 1, &mut ua, USER).unwrap();
        let before = snapshot(&dir);
        let free_before = phys.free_frames();

        // две страницы на границе листовой таблицы
        let v = VirtAddr::new(0x20_0000 - 0x1000);
        dir.map(v, 2, &mut ua, USER).unwrap();
        assert_eq!(dir.table_count(), 3);
        assert!(dir.unmap(v, 2, &mut ua));

        assert_eq!(snapshot(&dir), before);
        assert_eq!(phys.free_frames(), free_before);
        assert_eq!(dir.table_count(), 2);
    }

    #[test]
    fn not_present_mapping_keeps_entry() {
        let (phys, dir) = setup();
        let mut na = NoAllocator::new(&phys);
        dir.map(VirtAddr::new(0x5000), 1, &mut na, MapFlags::WRITABLE).unwrap();
        let pte = dir.entry(VirtAddr::new(0x5000)).unwrap();
        assert!(pte.exists() && !pte.is_present() && !pte.is_writable());
        assert_eq!(dir.translate(VirtAddr::new(0x5000)), None);
        assert!(!dir.unmap(VirtAddr::new(0x5000), 1, &mut na));
        assert_eq!(dir.table_count(), 0);
    }

    #[test]
    fn remap_with_no_allocator_keeps_frame() {
        let (phys, dir) = setup();
        let mut ua = UAllocator::new(&phys, None);
        let v = VirtAddr::new(0x9000);
        dir.map(v, 1, &mut ua, USER).unwrap();
        let frame = dir.translate(v).unwrap();
        let mut na = NoAllocator::new(&phys);
        assert!(dir.map(v, 1, &mut na, MapFlags::PRESENT).unwrap());
        assert_eq!(dir.translate(v), Some(frame));
        assert!(!dir.entry(v).unwrap().is_writable());
    }

    #[test]
    fn failed_map_unwinds_prefix() {
        let phys = Arc::new(PhysMem::new(8, 0));
        let dir = Dir::new(phys.clone()).unwrap();
        let free_before = phys.free_frames();
        let mut ua = UAllocator::new(&phys, None);
        assert_eq!(dir.map(VirtAddr::new(0), 16, &mut ua, USER), Err(MmError::OutOfMemory));
        assert_eq!(phys.free_frames(), free_before);
        assert_eq!(dir.table_count(), 0);
        assert!(snapshot(&dir).is_empty());
    }

    #[test]
    fn range_allocator_maps_consecutive_frames() {
        let (phys, dir) = setup();
        let mut ra = RangeAllocator::new(&phys, Frame(0x100));
        dir.map(VirtAddr::new(0x10_0000), 4, &mut ra, MapFlags::PRESENT).unwrap();
        for i in 0..4 {
            assert_eq!(dir.translate(VirtAddr::new(0x10_0000).add_pages(i)), Some(Frame(0x100 + i)));
        }
        let mut na = NoAllocator::new(&phys);
        dir.unmap(VirtAddr::new(0x10_0000), 4, &mut na);
    }

    #[test]
    #[should_panic(expected = "kernel-area")]
    fn kernel_allocator_refuses_tables() {
        let (phys, dir) = setup();
        let mut ka = KAllocator::new(&phys);
        let _ = dir.map(VirtAddr::new(KERNEL_AREA as u64), 1, &mut ka, MapFlags::PRESENT);
    }

    #[test]
    fn clone_sets_up_copy_on_write() {
        let (phys, src) = setup();
        let dst = Dir::new(phys.clone()).unwrap();
        let mut ua = UAllocator::new(&phys, None);
        let v = VirtAddr::new(0x7000);
        src.map(v, 2, &mut ua, USER).unwrap();
        let shoot = src.clone_to(&dst, v, v, 2, false).unwrap();
        assert!(shoot);
        for i in 0..2 {
            let (s, d) = (src.entry(v.add_pages(i)).unwrap(), dst.entry(v.add_pages(i)).unwrap());
            assert_eq!(s.frame(), d.frame());
            assert!(!s.is_writable() && !d.is_writable());
            assert!(s.is_present() && d.is_present());
        }
    }

    #[test]
    fn shared_clone_copies_flags_verbatim() {
        let (phys, src) = setup();
        let dst = Dir::new(phys.clone()).unwrap();
        let mut ua = UAllocator::new(&phys, None);
        src.map(VirtAddr::new(0x7000), 1, &mut ua, USER).unwrap();
        assert!(!src.clone_to(&dst, VirtAddr::new(0x7000), VirtAddr::new(0x9000_0000), 1, true).unwrap());
        let s = src.entry(VirtAddr::new(0x7000)).unwrap();
        assert_eq!(dst.entry(VirtAddr::new(0x9000_0000)), Some(s));
        assert!(s.is_writable());
    }

    #[test]
    fn failed_clone_is_all_or_nothing() {
        // 6 кадров: src-корень, 2 таблицы, 2 страницы, dst-корень → для dst-таблиц места нет
        let phys = Arc::new(PhysMem::new(7, 0));
        let src = Dir::new(phys.clone()).unwrap();
        let dst = Dir::new(phys.clone()).unwrap();
        let mut ua = UAllocator::new(&phys, None);
        let v = VirtAddr::new(0x3000);
        src.map(v, 2, &mut ua, USER).unwrap();
        let before = snapshot(&src);
        assert_eq!(src.clone_to(&dst, v, v, 2, false), Err(MmError::OutOfMemory));
        assert_eq!(snapshot(&src), before);
        assert!(snapshot(&dst).is_empty());
    }

    #[test]
    fn drop_returns_table_frames() {
        let phys = Arc::new(PhysMem::new(64, 0));
        let free = phys.free_frames();
        {
            let dir = PageTables::<X86_64>::new(phys.clone()).unwrap();
            let mut na = NoAllocator::new(&phys);
            dir.map(VirtAddr::new(0x1234_5000), 1, &mut na, MapFlags::empty()).unwrap();
            assert_eq!(dir.table_count(), 3);
        }
        assert_eq!(phys.free_frames(), free);
    }

    #[test]
    fn walk_reports_every_existing_leaf() {
        let (phys, dir) = setup();
        let mut na = NoAllocator::new(&phys);
        let addrs = vec![0x1000u64, 0x20_0000, 0x4000_0000];
        for a in &addrs {
            dir.map(VirtAddr::new(*a), 1, &mut na, MapFlags::empty()).unwrap();
        }
        let seen: Vec<u64> = snapshot(&dir).into_iter().map(|(v, _)| v).collect();
        assert_eq!(seen, addrs);
    }
}
