//! Swap Map — раскладка блоков swap-устройства
//!
//! Хранить флаг на каждый блок слишком дорого, поэтому пространство
//! делится на участки: каждый занятый участок — смежные страницы одного
//! процесса, лежащие в смежных блоках. Узлы берутся из фиксированного пула,
//! после `init` память не выделяется.
//! The device is split into areas; a used area holds contiguous pages of one
//! process in contiguous blocks. Nodes come from a fixed pool.
//!
//! Список `used` упорядочен по блокам и покрывает всё устройство без
//! дыр; последний участок всегда свободен и никогда не расходуется целиком.
//! The `used` list is ordered by block and tiles the whole device. The last
//! area is always free and is never consumed entirely.
//!
//! Только метаданные: ввод-вывод делает тот, кто получил номер блока.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use libescape::arena::{Linked, NodeIdx, NodePool};
use spin::Mutex;

use crate::config::PAGE_SIZE;
use crate::sched::Pid;
use crate::MmError;

/// Процессы, разделяющие регион / Processes sharing a region.
pub type ProcList = Arc<Mutex<Vec<Pid>>>;

const INVALID_PID: Pid = Pid::MAX;

#[derive(Default)]
struct SwapArea {
    /// первый блок на устройстве / first block on the device
    block: u32,
    /// число блоков / number of blocks
    size:  u32,
    /// адрес в процессе / virtual address in the owner
    virt:  usize,
    procs: Option<ProcList>,
    pid:   Pid,
    free:  bool,
    next:  Option<NodeIdx>,
}

impl Linked for SwapArea {
    fn next(&self) -> Option<NodeIdx> { self.next }
    fn set_next(&mut self, next: Option<NodeIdx>) { self.next = next; }
}

/// Копия полей участка без `procs` / Plain copy of an area's fields.
#[derive(Clone, Copy)]
struct Meta {
    block: u32,
    size:  u32,
    virt:  usize,
    pid:   Pid,
    free:  bool,
    next:  Option<NodeIdx>,
}

impl Meta {
    fn end(&self) -> u32 {
        self.block + self.size
    }

    fn virt_end(&self) -> usize {
        self.virt + self.size as usize * PAGE_SIZE
    }
}

pub struct SwapMap {
    pool:  NodePool<SwapArea>,
    used:  Option<NodeIdx>,
    total: u32,
}

impl SwapMap {
    /// Пул из `capacity` участков (SWMAP_SIZE).
    pub fn new(capacity: usize) -> Self {
        Self { pool: NodePool::fixed(capacity), used: None, total: 0 }
    }

    /// Один свободный участок на всё устройство / One free area spanning the device.
    pub fn init(&mut self, swap_bytes: usize) -> Result<(), MmError> {
        while let Some(idx) = self.used {
            self.used = self.pool.get(idx).next;
            self.pool.recycle(idx);
        }
        let blocks = u32::try_from(swap_bytes / PAGE_SIZE).map_err(|_| MmError::InvalidArgument)?;
        let idx = self.new_area(0, blocks, INVALID_PID, 0, true, None).ok_or(MmError::NoFreeArea)?;
        self.used = Some(idx);
        self.total = blocks;
        log::debug!("swapmap: {} blocks, {} area nodes", blocks, self.pool.capacity());
        Ok(())
    }

    pub fn total_blocks(&self) -> u32 {
        self.total
    }

    /// Выделить `count` блоков под страницы `virt..` процесса `pid`.
    /// Allocate `count` blocks for the pages at `virt` of process `pid`.
    ///
    /// Prefers growing an area of the same owner that ends right at `virt`,
    /// then prepending to one that starts right after the request. Otherwise
    /// carves from the trailing free area, refusing to use it up.
    pub fn alloc(&mut self, pid: Pid, procs: Option<&ProcList>, virt: usize, count: u32)
        -> Result<u32, MmError>
    {
        if count == 0 {
            return Err(MmError::InvalidArgument);
        }
        let (mut p, mut pp) = (None, None);
        let mut cur = self.used;
        while let Some(a) = cur {
            let am = self.meta(a);
            if let Some(n) = am.next {
                let nm = self.meta(n);

                // за этим участком, а следующий свободен и достаточно велик
                if !am.free && am.pid == pid && self.same_procs(a, procs)
                    && am.virt_end() == virt && nm.free && nm.size >= count
                {
                    if nm.next.is_none() && nm.size == count {
                        return Err(MmError::NoFreeArea);
                    }
                    self.pool.get_mut(a).size += count;
                    let next = self.pool.get_mut(n);
                    next.block += count;
                    next.size -= count;
                    if next.size == 0 {
                        self.rem_free_area(n, Some(a));
                    }
                    return Ok(am.end());
                }

                // перед следующим участком того же владельца
                if am.free && am.size >= count && !nm.free && nm.pid == pid
                    && self.same_procs(n, procs) && virt + count as usize * PAGE_SIZE == nm.virt
                {
                    let next = self.pool.get_mut(n);
                    next.virt = virt;
                    next.size += count;
                    next.block -= count;
                    let block = next.block;
                    let area = self.pool.get_mut(a);
                    area.size -= count;
                    if area.size == 0 {
                        self.rem_free_area(a, p);
                    }
                    return Ok(block);
                }
            }
            pp = p;
            p = cur;
            cur = am.next;
        }

        let last = p.ok_or(MmError::NoFreeArea)?;
        let lm = self.meta(last);
        if !lm.free || lm.size <= count {
            return Err(MmError::NoFreeArea);
        }
        let a = self
            .new_area(lm.block, count, pid, virt, false, procs.cloned())
            .ok_or(MmError::NoFreeArea)?;
        self.link(pp, Some(a));
        self.pool.get_mut(a).next = Some(last);
        let tail = self.pool.get_mut(last);
        tail.block += count;
        tail.size -= count;
        Ok(lm.block)
    }

    /// Блок страницы `virt` процесса `pid` / Block holding page `virt` of `pid`.
    pub fn find(&self, pid: Pid, virt: usize) -> Option<u32> {
        self.iter()
            .map(|i| self.meta(i))
            .find(|m| !m.free && m.pid == pid && virt >= m.virt && virt < m.virt_end())
            .map(|m| m.block + ((virt - m.virt) / PAGE_SIZE) as u32)
    }

    /// Свободно байт / Free bytes on the device.
    pub fn free_space(&self) -> usize {
        self.iter()
            .map(|i| self.meta(i))
            .filter(|m| m.free)
            .map(|m| m.size as usize * PAGE_SIZE)
            .sum()
    }

    /// Освободить `count` блоков с `block` процесса `pid`.
    /// Free `count` blocks starting at `block` owned by `pid`.
    ///
    /// Fails only when the node pool cannot hold the split; freeing blocks
    /// no area owns is fatal.
    pub fn free(&mut self, pid: Pid, block: u32, count: u32) -> Result<(), MmError> {
        let (mut p, mut pp) = (None, None);
        let mut cur = self.used;
        while let Some(a) = cur {
            let m = self.meta(a);
            if !m.free && m.pid == pid && block >= m.block && block + count <= m.end() {
                if m.size == count {
                    self.rem_used_area(a, p, pp);
                    return Ok(());
                }

                let procs = self.pool.get(a).procs.clone();
                if block > m.block && block + count < m.end() {
                    // место с обеих сторон: нужны два новых участка
                    if self.pool.available() < 2 {
                        return Err(MmError::NoFreeArea);
                    }
                    let pre = self
                        .new_area(m.block, block - m.block, pid, m.virt, false, procs.clone())
                        .ok_or(MmError::NoFreeArea)?;
                    let post_virt = m.virt + ((block - m.block) + count) as usize * PAGE_SIZE;
                    let post = self
                        .new_area(block + count, m.end() - (block + count), pid, post_virt, false, procs)
                        .ok_or(MmError::NoFreeArea)?;
                    self.link(p, Some(pre));
                    self.pool.get_mut(pre).next = Some(a);
                    self.pool.get_mut(post).next = m.next;
                    self.pool.get_mut(a).next = Some(post);
                } else if block > m.block {
                    // место слева
                    let pre = self
                        .new_area(m.block, block - m.block, pid, m.virt, false, procs)
                        .ok_or(MmError::NoFreeArea)?;
                    self.link(p, Some(pre));
                    if let Some(n) = m.next.filter(|&n| self.pool.get(n).free) {
                        let next = self.pool.get_mut(n);
                        next.block = block;
                        next.size += count;
                        self.pool.get_mut(pre).next = Some(n);
                        self.pool.recycle(a);
                        return Ok(());
                    }
                    self.pool.get_mut(pre).next = Some(a);
                } else {
                    // место справа
                    let post_virt = m.virt + count as usize * PAGE_SIZE;
                    let post = self
                        .new_area(block + count, m.end() - (block + count), pid, post_virt, false, procs)
                        .ok_or(MmError::NoFreeArea)?;
                    self.pool.get_mut(post).next = m.next;
                    if let Some(prev) = p.filter(|&i| self.pool.get(i).free) {
                        let prev = self.pool.get_mut(prev);
                        prev.size += count;
                        prev.next = Some(post);
                        self.pool.recycle(a);
                        return Ok(());
                    }
                    self.pool.get_mut(a).next = Some(post);
                }

                let area = self.pool.get_mut(a);
                area.block = block;
                area.size = count;
                area.free = true;
                area.pid = INVALID_PID;
                area.procs = None;
                return Ok(());
            }
            pp = p;
            p = cur;
            cur = m.next;
        }
        log::error!("swapmap: no area with pid={} blocks={}..{}", pid, block, block + count);
        panic!("swap area with pid={}, blocks={}..{} not found", pid, block, block + count);
    }

    /// Процесс `pid` уходит / Process `pid` goes away.
    ///
    /// Without `procs`, frees the unshared areas of `pid`. With `procs`, frees
    /// the areas of that shared region once at most one process is left in it.
    pub fn rem_proc(&mut self, pid: Pid, procs: Option<&ProcList>) {
        loop {
            let (mut p, mut pp) = (None, None);
            let mut cur = self.used;
            let mut victim = None;
            while let Some(a) = cur {
                let area = self.pool.get(a);
                let hit = !area.free && match (procs, &area.procs) {
                    (None, None)          => area.pid == pid,
                    (Some(l), Some(mine)) => Arc::ptr_eq(l, mine) && l.lock().len() <= 1,
                    _                     => false,
                };
                if hit {
                    victim = Some(a);
                    break;
                }
                pp = p;
                p = cur;
                cur = area.next;
            }
            match victim {
                Some(a) => self.rem_used_area(a, p, pp),
                None => return,
            }
        }
    }

    // ── Внутреннее / Internals ───────────────────────────────────────────

    fn meta(&self, idx: NodeIdx) -> Meta {
        let a = self.pool.get(idx);
        Meta { block: a.block, size: a.size, virt: a.virt, pid: a.pid, free: a.free, next: a.next }
    }

    fn same_procs(&self, idx: NodeIdx, procs: Option<&ProcList>) -> bool {
        match (&self.pool.get(idx).procs, procs) {
            (None, None)       => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _                  => false,
        }
    }

    fn iter(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        let mut cur = self.used;
        core::iter::from_fn(move || {
            let idx = cur?;
            cur = self.pool.get(idx).next;
            Some(idx)
        })
    }

    fn new_area(&mut self, block: u32, size: u32, pid: Pid, virt: usize, free: bool,
                procs: Option<ProcList>) -> Option<NodeIdx>
    {
        self.pool.take(SwapArea { block, size, virt, procs, pid, free, next: None })
    }

    /// `prev.next = to`, или голова списка / Link after `prev` or at the head.
    fn link(&mut self, prev: Option<NodeIdx>, to: Option<NodeIdx>) {
        match prev {
            Some(p) => self.pool.get_mut(p).next = to,
            None    => self.used = to,
        }
    }

    /// Освободить занятый участок целиком, сливая со свободными соседями.
    fn rem_used_area(&mut self, a: NodeIdx, p: Option<NodeIdx>, pp: Option<NodeIdx>) {
        let m = self.meta(a);
        let prev = p.filter(|&i| self.pool.get(i).free);
        let next = m.next.filter(|&i| self.pool.get(i).free);
        match (prev, next) {
            (Some(pv), Some(n)) => {
                // всё в следующий: хвостовой участок остаётся хвостом
                let (pblock, psize) = (self.pool.get(pv).block, self.pool.get(pv).size);
                let next = self.pool.get_mut(n);
                next.size += psize + m.size;
                next.block = pblock;
                self.link(pp, Some(n));
                self.pool.recycle(a);
                self.pool.recycle(pv);
            }
            (Some(pv), None) => {
                let prev = self.pool.get_mut(pv);
                prev.size += m.size;
                prev.next = m.next;
                self.pool.recycle(a);
            }
            (None, Some(n)) => {
                let next = self.pool.get_mut(n);
                next.size += m.size;
                next.block = m.block;
                self.link(p, Some(n));
                self.pool.recycle(a);
            }
            (None, None) => {
                let area = self.pool.get_mut(a);
                area.free = true;
                area.pid = INVALID_PID;
                area.procs = None;
            }
        }
    }

    /// Убрать опустевший свободный участок; соседей того же процесса склеить.
    fn rem_free_area(&mut self, area: NodeIdx, prev: Option<NodeIdx>) {
        let next = self.pool.get(area).next;
        match prev {
            Some(pv) => {
                let pm = self.meta(pv);
                let joinable = next.filter(|&n| {
                    let nm = self.meta(n);
                    !pm.free && !nm.free && pm.pid == nm.pid && pm.virt_end() == nm.virt
                        && match (&self.pool.get(pv).procs, &self.pool.get(n).procs) {
                            (None, None)       => true,
                            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                            _                  => false,
                        }
                });
                match joinable {
                    Some(n) => {
                        let nm = self.meta(n);
                        let prev = self.pool.get_mut(pv);
                        prev.size += nm.size;
                        prev.next = nm.next;
                        self.pool.recycle(n);
                    }
                    None => self.pool.get_mut(pv).next = next,
                }
            }
            None => self.used = next,
        }
        self.pool.recycle(area);
    }
}

impl fmt::Display for SwapMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SwapMap:")?;
        for m in self.iter().map(|i| self.meta(i)) {
            if m.size == 0 {
                writeln!(f, "\t{:04}: empty", m.block)?;
            } else if m.free {
                writeln!(f, "\t{:04}-{:04}: free", m.block, m.end() - 1)?;
            } else {
                writeln!(
                    f,
                    "\t{:04}-{:04}: p{:02} ({:#x} - {:#x})",
                    m.block,
                    m.end() - 1,
                    m.pid,
                    m.virt,
                    m.virt_end() - 1
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;
    use alloc::vec;
    use proptest::prelude::*;

    const BLOCKS: usize = 64;

    fn swmap() -> SwapMap {
        let mut map = SwapMap::new(256);
        map.init(BLOCKS * PAGE_SIZE).unwrap();
        map
    }

    /// Участки покрывают [0, total) подряд, без дыр и пустых.
    fn assert_partition(map: &SwapMap) {
        let mut expected = 0;
        for m in map.iter().map(|i| map.meta(i)) {
            assert_eq!(m.block, expected, "gap or overlap in\n{}", map);
            assert!(m.size > 0, "empty area in\n{}", map);
            expected = m.end();
        }
        assert_eq!(expected, map.total_blocks());
        let last = map.iter().last().map(|i| map.meta(i));
        assert!(last.is_some_and(|m| m.free));
    }

    #[test]
    fn device_smaller_than_a_block_has_nothing_to_give() {
        let mut map = SwapMap::new(4);
        map.init(PAGE_SIZE / 2).unwrap();
        assert_eq!(map.total_blocks(), 0);
        assert_eq!(map.free_space(), 0);
        assert_eq!(map.alloc(1, None, 0, 1), Err(MmError::NoFreeArea));
        assert_eq!(format!("{}", map), "SwapMap:\n\t0000: empty\n");
    }

    /// Свободное место после сценария то же, что до него.
    fn run(scenario: impl FnOnce(&mut SwapMap)) {
        let mut map = swmap();
        let before = map.free_space();
        scenario(&mut map);
        assert_partition(&map);
        assert_eq!(map.free_space(), before, "leaked blocks:\n{}", map);
    }

    fn alloc(map: &mut SwapMap, pid: Pid, virt: usize, count: u32) -> u32 {
        let block = map.alloc(pid, None, virt, count).unwrap();
        assert_partition(map);
        block
    }

    fn free(map: &mut SwapMap, pid: Pid, block: u32, count: u32) {
        map.free(pid, block, count).unwrap();
        assert_partition(map);
    }

    #[test]
    fn alloc_and_free() {
        run(|m| {
            let b0 = alloc(m, 1, 0x0000, 1);
            let b1 = alloc(m, 1, 0x1000, 3);
            let b2 = alloc(m, 1, 0x5000, 1);
            let b3 = alloc(m, 2, 0x5000, 1);
            let b4 = alloc(m, 2, 0x4000, 1);

            assert_eq!(m.find(1, 0x0000), Some(b0));
            assert_eq!(m.find(1, 0x1000), Some(b1));
            assert_eq!(m.find(1, 0x2000), Some(b1 + 1));
            assert_eq!(m.find(1, 0x3000), Some(b1 + 2));
            assert_eq!(m.find(2, 0x5000), Some(b3));
            assert_eq!(m.find(2, 0x4000), Some(b4));

            free(m, 1, b0, 1);
            free(m, 1, b1 + 1, 1);
            free(m, 1, b1 + 2, 1);
            free(m, 1, b1, 1);
            free(m, 1, b2, 1);
            free(m, 2, b3, 1);
            free(m, 2, b4, 1);
        });
    }

    #[test]
    fn alloc_and_reverse_free() {
        run(|m| {
            let b = [
                alloc(m, 1, 0x0000, 1),
                alloc(m, 1, 0x1000, 2),
                alloc(m, 1, 0x4000, 1),
                alloc(m, 2, 0x5000, 1),
                alloc(m, 2, 0x4000, 1),
            ];
            free(m, 2, b[4], 1);
            free(m, 2, b[3], 1);
            free(m, 1, b[2], 1);
            free(m, 1, b[1], 2);
            free(m, 1, b[0], 1);
        });
    }

    #[test]
    fn free_whole_areas() {
        run(|m| {
            alloc(m, 1, 0x0000, 1);
            alloc(m, 1, 0x1000, 2);
            alloc(m, 1, 0x4000, 1);
            alloc(m, 2, 0x5000, 1);
            alloc(m, 2, 0x4000, 1);

            free(m, 1, 0, 3);
            free(m, 1, 3, 1);
            free(m, 2, 5, 1);
            free(m, 2, 4, 1);
        });
    }

    #[test]
    fn alloc_and_random_free() {
        run(|m| {
            let b = [
                alloc(m, 1, 0x0000, 1),
                alloc(m, 1, 0x1000, 2),
                alloc(m, 1, 0x3000, 4),
                alloc(m, 2, 0x0000, 1),
                alloc(m, 1, 0x8000, 1),
                alloc(m, 2, 0x1000, 3),
                alloc(m, 2, 0x4000, 1),
                alloc(m, 3, 0x0000, 1),
            ];

            assert_eq!(m.find(1, 0x0000), Some(b[0]));
            assert_eq!(m.find(1, 0x2000), Some(b[1] + 1));
            assert_eq!(m.find(1, 0x6000), Some(b[2] + 3));
            assert_eq!(m.find(2, 0x0000), Some(b[3]));
            assert_eq!(m.find(1, 0x8000), Some(b[4]));
            assert_eq!(m.find(2, 0x3000), Some(b[5] + 2));
            assert_eq!(m.find(2, 0x4000), Some(b[6]));
            assert_eq!(m.find(3, 0x0000), Some(b[7]));

            free(m, 2, b[5], 2);
            free(m, 2, b[5] + 2, 1);
            free(m, 3, b[7], 1);
            free(m, 1, b[0], 1);
            free(m, 2, b[6], 1);
            free(m, 1, b[4], 1);
            free(m, 1, b[1], 1);
            free(m, 1, b[1] + 1, 1);
            free(m, 1, b[2], 4);
            free(m, 2, b[3], 1);
        });
    }

    #[test]
    fn alloc_and_free_mixed() {
        run(|m| {
            let b0 = alloc(m, 1, 0x0000, 2);
            let b1 = alloc(m, 1, 0x2000, 1);
            let b2 = alloc(m, 2, 0x4000, 1);
            let b3 = alloc(m, 1, 0x4000, 1);
            assert_eq!(m.find(1, 0x1000), Some(b0 + 1));
            assert_eq!(m.find(1, 0x2000), Some(b1));

            free(m, 2, b2, 1);
            assert_eq!(m.find(2, 0x4000), None);
            assert_eq!(m.find(1, 0x4000), Some(b3));

            // 0x3000 стыкует 1:0x0000.. и 1:0x4000 в один участок
            let b4 = alloc(m, 1, 0x3000, 1);
            let b5 = alloc(m, 2, 0x0000, 1);
            let b6 = alloc(m, 1, 0x8000, 1);
            let b7 = alloc(m, 2, 0x3000, 1);
            assert_eq!(m.find(1, 0x3000), Some(b4));
            assert_eq!(m.find(1, 0x4000), Some(b3));
            assert_eq!(m.find(2, 0x0000), Some(b5));
            assert_eq!(m.find(1, 0x8000), Some(b6));
            assert_eq!(m.find(2, 0x3000), Some(b7));

            free(m, 1, b6, 1);
            assert_eq!(m.find(1, 0x8000), None);
            assert_eq!(m.find(2, 0x3000), Some(b7));

            // встаёт прямо перед 2:0x3000
            let b8 = alloc(m, 2, 0x2000, 1);
            assert_eq!(b8 + 1, b7);
            assert_eq!(m.find(2, 0x2000), Some(b8));

            free(m, 2, b5, 1);
            free(m, 2, b8, 2);
            free(m, 1, b0, 5);
        });
    }

    #[test]
    fn alloc_all_then_free() {
        run(|m| {
            let mut virt = 0;
            while m.free_space() > PAGE_SIZE {
                alloc(m, 1, virt, 1);
                virt += PAGE_SIZE;
            }
            assert!(m.alloc(1, None, virt, 1).is_err());
            free(m, 1, 0, (virt / PAGE_SIZE) as u32);
        });
    }

    #[test]
    fn free_one_area_piecewise() {
        run(|m| {
            let b = alloc(m, 1, 0x0000, 6);
            let check = |m: &SwapMap, present: [bool; 6]| {
                for (i, p) in present.iter().enumerate() {
                    let expect = p.then_some(b + i as u32);
                    assert_eq!(m.find(1, i * PAGE_SIZE), expect, "page {}", i);
                }
            };

            free(m, 1, b + 3, 1);
            check(&*m, [true, true, true, false, true, true]);
            free(m, 1, b, 1);
            check(&*m, [false, true, true, false, true, true]);
            free(m, 1, b + 5, 1);
            check(&*m, [false, true, true, false, true, false]);
            free(m, 1, b + 1, 1);
            check(&*m, [false, false, true, false, true, false]);
            free(m, 1, b + 4, 1);
            check(&*m, [false, false, true, false, false, false]);
            free(m, 1, b + 2, 1);
            check(&*m, [false; 6]);
        });
    }

    #[test]
    fn rem_proc_waits_for_last_sharer() {
        run(|m| {
            let procs: ProcList = Arc::new(Mutex::new(vec![0, 1, 2]));
            let shared = m.alloc(1, Some(&procs), 0x0000, 6).unwrap();
            let private = m.alloc(1, None, 0x6000, 4).unwrap();

            m.rem_proc(1, Some(&procs));
            assert_eq!(m.find(1, 0x0000), Some(shared));
            assert_eq!(m.find(1, 0x6000), Some(private));
            procs.lock().retain(|&p| p != 1);

            m.rem_proc(2, Some(&procs));
            assert_eq!(m.find(1, 0x0000), Some(shared));
            procs.lock().retain(|&p| p != 2);

            m.rem_proc(1, None);
            assert_eq!(m.find(1, 0x0000), Some(shared));
            assert_eq!(m.find(1, 0x6000), None);

            m.rem_proc(0, Some(&procs));
            assert_eq!(m.find(1, 0x0000), None);
        });
    }

    #[test]
    fn last_free_area_is_never_consumed() {
        let mut map = SwapMap::new(4);
        map.init(PAGE_SIZE).unwrap();
        assert_eq!(map.alloc(5, None, 0x1000, 1), Err(MmError::NoFreeArea));
        assert_eq!(map.free_space(), PAGE_SIZE);
    }

    #[test]
    fn split_needs_pool_nodes() {
        let mut map = SwapMap::new(2);
        map.init(16 * PAGE_SIZE).unwrap();
        let b = map.alloc(1, None, 0, 4).unwrap();
        assert_eq!(map.free(1, b + 1, 1), Err(MmError::NoFreeArea));
        assert_eq!(map.find(1, PAGE_SIZE), Some(b + 1));
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn freeing_unknown_blocks_is_fatal() {
        let mut map = swmap();
        let _ = map.free(7, 3, 1);
    }

    proptest! {
        #[test]
        fn areas_always_tile_the_device(
            ops in prop::collection::vec((1u32..4, 0usize..16, 1u32..4, any::<bool>()), 1..60)
        ) {
            let mut map = SwapMap::new(512);
            map.init(BLOCKS * PAGE_SIZE).unwrap();
            let mut live: Vec<(Pid, u32, u32)> = Vec::new();
            for (pid, page, count, free) in ops {
                if free && !live.is_empty() {
                    let (pid, block, count) = live.swap_remove(page % live.len());
                    prop_assert!(map.free(pid, block, count).is_ok());
                } else if let Ok(block) = map.alloc(pid, None, page * PAGE_SIZE, count) {
                    live.push((pid, block, count));
                }
                assert_partition(&map);
                let used: u32 = live.iter().map(|l| l.2).sum();
                prop_assert_eq!(map.free_space(), (BLOCKS - used as usize) * PAGE_SIZE);
            }
        }
    }
}
