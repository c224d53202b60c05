//! Segment allocator — учёт свободных и занятых участков
//!
//! Только метаданные: какие диапазоны адресов свободны и какие выданы.
//! Guard-слова и сама память — забота `heap`.
//! Metadata only: which address ranges are usable and which are handed out.
//! Guard words and the backing memory are the concern of `heap`.
//!
//! Usable list — односвязный список в порядке вставки (first-fit).
//! Occupied map — хеш-таблица адрес → участок с цепочками.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::arena::{Linked, NodeIdx, NodePool};
use crate::heap::HeapError;
use crate::OCC_MAP_SIZE;

/// Узлов метаданных за одно расширение пула / nodes added per pool growth
const NODE_CHUNK: usize = 64;

/// Участок адресного пространства / A range of addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemArea {
    pub addr: usize,
    pub size: usize,
    next:     Option<NodeIdx>,
}

impl MemArea {
    const fn new(addr: usize, size: usize) -> Self {
        Self { addr, size, next: None }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.addr + self.size
    }
}

impl Linked for MemArea {
    fn next(&self) -> Option<NodeIdx> { self.next }
    fn set_next(&mut self, next: Option<NodeIdx>) { self.next = next; }
}

/// Хеш адреса (смешивание как в java.util.HashMap).
/// Address hash, bit-mixed the way java.util.HashMap does it.
#[inline]
pub fn hash(addr: usize) -> usize {
    let mut h = addr;
    h ^= (h >> 20) ^ (h >> 12);
    (h ^ (h >> 7) ^ (h >> 4)) & (OCC_MAP_SIZE - 1)
}

/// First-fit allocator over address ranges.
pub struct SegmentAllocator {
    pool:     NodePool<MemArea>,
    usable:   Option<NodeIdx>,
    occupied: Vec<Option<NodeIdx>>,
}

impl Default for SegmentAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentAllocator {
    pub fn new() -> Self {
        Self {
            pool:     NodePool::growable(NODE_CHUNK),
            usable:   None,
            occupied: vec![None; OCC_MAP_SIZE],
        }
    }

    /// Подготовить `count` узлов заранее / Pre-reserve `count` metadata nodes.
    ///
    /// Callers that must not fail halfway (e.g. before fetching fresh backing
    /// pages) reserve first.
    pub fn reserve_nodes(&mut self, count: usize) -> Result<(), HeapError> {
        if self.pool.reserve(count) { Ok(()) } else { Err(HeapError::OutOfMemory) }
    }

    /// Number of metadata nodes ever created.
    pub fn node_count(&self) -> usize {
        self.pool.capacity()
    }

    /// Добавить новый свободный участок в голову списка.
    /// Add a fresh usable extent at the head of the usable list.
    pub fn add_extent(&mut self, addr: usize, size: usize) -> Result<(), HeapError> {
        let idx = self.pool.take(MemArea::new(addr, size)).ok_or(HeapError::OutOfMemory)?;
        self.push_usable(idx);
        Ok(())
    }

    /// Выделить `size` байт first-fit / Allocate `size` bytes, first fit.
    ///
    /// The remainder of a split goes to the head of the usable list. On
    /// failure nothing is changed.
    pub fn alloc(&mut self, size: usize) -> Result<usize, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidSize);
        }
        let mut prev = None;
        let mut cur = self.usable;
        while let Some(idx) = cur {
            let area = *self.pool.get(idx);
            if area.size >= size {
                if area.size > size && !self.pool.reserve(1) {
                    return Err(HeapError::OutOfMemory);
                }
                self.unlink_after(prev, idx);
                if area.size > size {
                    let rest = MemArea::new(area.addr + size, area.size - size);
                    let ridx = self.pool.take(rest).ok_or(HeapError::OutOfMemory)?;
                    self.push_usable(ridx);
                }
                self.pool.get_mut(idx).size = size;
                self.insert_occupied(idx);
                return Ok(area.addr);
            }
            prev = cur;
            cur = area.next;
        }
        Err(HeapError::OutOfMemory)
    }

    /// Size of the occupied area starting at `addr`.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.find_occupied(addr).map(|(_, idx)| self.pool.get(idx).size)
    }

    /// Освободить участок по адресу; возвращает его размер.
    /// Release the occupied area at `addr` and return its size.
    ///
    /// The area is merged with an adjacent usable area on either side.
    pub fn release(&mut self, addr: usize) -> Result<usize, HeapError> {
        let (oprev, idx) = self.find_occupied(addr).ok_or(HeapError::DoubleFree)?;
        self.unlink_occupied(oprev, idx);

        let area = *self.pool.get(idx);
        let size = area.size;

        // Один проход: соседи слева и справа вместе с их предшественниками
        let (mut prev, mut pprev) = (None, None);
        let (mut next, mut nprev) = (None, None);
        let mut tprev = None;
        let mut cur = self.usable;
        while let Some(i) = cur {
            let a = *self.pool.get(i);
            if a.end() == area.addr {
                prev = Some(i);
                pprev = tprev;
            } else if a.addr == area.end() {
                next = Some(i);
                nprev = tprev;
            }
            if prev.is_some() && next.is_some() {
                break;
            }
            tprev = cur;
            cur = a.next;
        }

        match (prev, next) {
            (Some(p), Some(n)) => {
                self.unlink_after(nprev, n);
                // next стоял прямо перед prev — у prev теперь другой предшественник
                let pp = if pprev == Some(n) { nprev } else { pprev };
                self.unlink_after(pp, p);
                let merged = MemArea::new(
                    self.pool.get(p).addr,
                    self.pool.get(p).size + size + self.pool.get(n).size,
                );
                *self.pool.get_mut(idx) = merged;
                self.push_usable(idx);
                self.pool.recycle(p);
                self.pool.recycle(n);
            }
            (Some(p), None) => {
                self.pool.get_mut(p).size += size;
                self.pool.recycle(idx);
            }
            (None, Some(n)) => {
                let a = self.pool.get_mut(n);
                a.addr = area.addr;
                a.size += size;
                self.pool.recycle(idx);
            }
            (None, None) => self.push_usable(idx),
        }
        Ok(size)
    }

    /// Расширить занятый участок на месте за счёт следующего свободного.
    /// Grow the occupied area at `addr` in place into the usable area right
    /// after it. Never shrinks; returns `false` if that is impossible.
    pub fn grow_in_place(&mut self, addr: usize, new_size: usize) -> bool {
        let Some((_, idx)) = self.find_occupied(addr) else {
            return false;
        };
        let area = *self.pool.get(idx);
        if new_size <= area.size {
            return true;
        }

        let mut prev = None;
        let mut cur = self.usable;
        while let Some(i) = cur {
            let a = *self.pool.get(i);
            if a.addr == area.end() {
                let total = area.size + a.size;
                if total < new_size {
                    return false;
                }
                if total > new_size {
                    let n = self.pool.get_mut(i);
                    n.addr = area.addr + new_size;
                    n.size = total - new_size;
                } else {
                    self.unlink_after(prev, i);
                    self.pool.recycle(i);
                }
                self.pool.get_mut(idx).size = new_size;
                return true;
            }
            prev = cur;
            cur = a.next;
        }
        false
    }

    /// Свободные участки в порядке списка / Usable areas in list order.
    pub fn usable(&self) -> impl Iterator<Item = MemArea> + '_ {
        let mut cur = self.usable;
        core::iter::from_fn(move || {
            let idx = cur?;
            let a = *self.pool.get(idx);
            cur = a.next;
            Some(a)
        })
    }

    /// Все занятые участки (порядок корзин) / All occupied areas, bucket order.
    pub fn occupied(&self) -> impl Iterator<Item = MemArea> + '_ {
        self.occupied.iter().flat_map(move |head| {
            let mut cur = *head;
            core::iter::from_fn(move || {
                let idx = cur?;
                let a = *self.pool.get(idx);
                cur = a.next;
                Some(a)
            })
        })
    }

    /// Bytes handed out.
    pub fn used_bytes(&self) -> usize {
        self.occupied().map(|a| a.size).sum()
    }

    /// Bytes on the usable list.
    pub fn free_bytes(&self) -> usize {
        self.usable().map(|a| a.size).sum()
    }

    fn push_usable(&mut self, idx: NodeIdx) {
        let head = self.usable;
        self.pool.get_mut(idx).next = head;
        self.usable = Some(idx);
    }

    fn unlink_after(&mut self, prev: Option<NodeIdx>, idx: NodeIdx) {
        let next = self.pool.get(idx).next;
        match prev {
            Some(p) => self.pool.get_mut(p).next = next,
            None    => self.usable = next,
        }
    }

    fn insert_occupied(&mut self, idx: NodeIdx) {
        let bucket = hash(self.pool.get(idx).addr);
        let head = self.occupied[bucket];
        self.pool.get_mut(idx).next = head;
        self.occupied[bucket] = Some(idx);
    }

    fn find_occupied(&self, addr: usize) -> Option<(Option<NodeIdx>, NodeIdx)> {
        let mut prev = None;
        let mut cur = self.occupied[hash(addr)];
        while let Some(idx) = cur {
            let a = self.pool.get(idx);
            if a.addr == addr {
                return Some((prev, idx));
            }
            prev = cur;
            cur = a.next;
        }
        None
    }

    fn unlink_occupied(&mut self, prev: Option<NodeIdx>, idx: NodeIdx) {
        let next = self.pool.get(idx).next;
        match prev {
            Some(p) => self.pool.get_mut(p).next = next,
            None    => self.occupied[hash(self.pool.get(idx).addr)] = next,
        }
    }
}

impl fmt::Display for SegmentAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "UsableList:")?;
        for a in self.usable() {
            writeln!(f, "\t{:#x} .. {:#x} ({} bytes)", a.addr, a.end(), a.size)?;
        }
        writeln!(f, "OccupiedMap:")?;
        for (bucket, head) in self.occupied.iter().enumerate() {
            if head.is_none() {
                continue;
            }
            write!(f, "\t{:4}:", bucket)?;
            let mut cur = *head;
            while let Some(idx) = cur {
                let a = self.pool.get(idx);
                write!(f, " {:#x}({})", a.addr, a.size)?;
                cur = a.next;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn areas(seg: &SegmentAllocator) -> Vec<(usize, usize)> {
        let mut v: Vec<_> = seg.usable().map(|a| (a.addr, a.size)).collect();
        v.sort();
        v
    }

    #[test]
    fn first_fit_splits_to_head() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0x1000, 0x100).unwrap();
        assert_eq!(seg.alloc(0x40), Ok(0x1000));
        assert_eq!(seg.alloc(0x40), Ok(0x1040));
        assert_eq!(seg.usable().next().map(|a| a.addr), Some(0x1080));
        assert_eq!(seg.used_bytes(), 0x80);
        assert_eq!(seg.free_bytes(), 0x80);
        assert_eq!(seg.alloc(0x100), Err(HeapError::OutOfMemory));
    }

    #[test]
    fn exact_fit_consumes_area() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0x2000, 0x20).unwrap();
        assert_eq!(seg.alloc(0x20), Ok(0x2000));
        assert_eq!(seg.usable().count(), 0);
        assert_eq!(seg.size_of(0x2000), Some(0x20));
    }

    #[test]
    fn release_merges_both_neighbours() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0, 0x300).unwrap();
        let a = seg.alloc(0x100).unwrap();
        let b = seg.alloc(0x100).unwrap();
        let c = seg.alloc(0x100).unwrap();
        assert_eq!(seg.release(a), Ok(0x100));
        assert_eq!(seg.release(c), Ok(0x100));
        assert_eq!(areas(&seg), vec![(0, 0x100), (0x200, 0x100)]);
        assert_eq!(seg.release(b), Ok(0x100));
        assert_eq!(areas(&seg), vec![(0, 0x300)]);
        assert_eq!(seg.used_bytes(), 0);
    }

    #[test]
    fn release_merges_when_neighbours_are_adjacent_in_list() {
        // next сразу перед prev в списке и наоборот
        for order in [[0usize, 2], [2, 0]] {
            let mut seg = SegmentAllocator::new();
            seg.add_extent(0, 0x300).unwrap();
            let blocks = [seg.alloc(0x100).unwrap(), seg.alloc(0x100).unwrap(), seg.alloc(0x100).unwrap()];
            seg.release(blocks[order[0]]).unwrap();
            seg.release(blocks[order[1]]).unwrap();
            seg.release(blocks[1]).unwrap();
            assert_eq!(areas(&seg), vec![(0, 0x300)]);
        }
    }

    #[test]
    fn double_release_is_reported() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0, 0x100).unwrap();
        let a = seg.alloc(0x10).unwrap();
        seg.release(a).unwrap();
        assert_eq!(seg.release(a), Err(HeapError::DoubleFree));
        assert_eq!(seg.release(0x12345), Err(HeapError::DoubleFree));
    }

    #[test]
    fn grow_in_place_uses_following_area() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0, 0x100).unwrap();
        let a = seg.alloc(0x20).unwrap();
        assert!(seg.grow_in_place(a, 0x80));
        assert_eq!(seg.size_of(a), Some(0x80));
        assert_eq!(areas(&seg), vec![(0x80, 0x80)]);
        assert!(seg.grow_in_place(a, 0x100));
        assert_eq!(seg.usable().count(), 0);
        assert!(!seg.grow_in_place(a, 0x101));
    }

    #[test]
    fn grow_in_place_fails_when_next_is_taken() {
        let mut seg = SegmentAllocator::new();
        seg.add_extent(0, 0x100).unwrap();
        let a = seg.alloc(0x20).unwrap();
        let _b = seg.alloc(0x20).unwrap();
        assert!(!seg.grow_in_place(a, 0x30));
        assert_eq!(seg.size_of(a), Some(0x20));
    }

    #[test]
    fn hash_stays_in_range() {
        for addr in [0usize, 1, 0x1000, 0xdead_beef, usize::MAX] {
            assert!(hash(addr) < OCC_MAP_SIZE);
        }
    }

    proptest! {
        #[test]
        fn bytes_are_conserved(sizes in prop::collection::vec(1usize..0x80, 1..40), keep in any::<u64>()) {
            let mut seg = SegmentAllocator::new();
            seg.add_extent(0x10000, 0x4000).unwrap();
            let mut live = Vec::new();
            for s in &sizes {
                if let Ok(a) = seg.alloc(*s) {
                    live.push(a);
                }
            }
            for (i, a) in live.iter().enumerate() {
                if keep & (1 << (i % 64)) == 0 {
                    seg.release(*a).unwrap();
                }
            }
            prop_assert_eq!(seg.used_bytes() + seg.free_bytes(), 0x4000);
            let mut all: Vec<_> = seg.usable().chain(seg.occupied()).map(|a| (a.addr, a.end())).collect();
            all.sort();
            for w in all.windows(2) {
                prop_assert!(w[0].1 <= w[1].0);
            }
        }

        #[test]
        fn placement_is_first_fit_and_repeatable(
            ops in prop::collection::vec((any::<bool>(), 1usize..0x200, any::<usize>()), 1..60)
        ) {
            let mut one = SegmentAllocator::new();
            let mut two = SegmentAllocator::new();
            for seg in [&mut one, &mut two] {
                seg.add_extent(0x8000, 0x2000).unwrap();
            }
            let mut live = Vec::new();
            for (alloc, size, pick) in ops {
                if alloc || live.is_empty() {
                    let fit = one.usable().find(|a| a.size >= size).map(|a| a.addr);
                    let a = one.alloc(size).ok();
                    prop_assert_eq!(a, fit);
                    prop_assert_eq!(two.alloc(size).ok(), a);
                    live.extend(a);
                } else {
                    let addr = live.swap_remove(pick % live.len());
                    prop_assert_eq!(one.release(addr), two.release(addr));
                }
                prop_assert_eq!(areas(&one), areas(&two));
            }
        }

        #[test]
        fn three_neighbours_coalesce_in_any_order(
            sizes in prop::array::uniform3(1usize..0x400),
            base in (1usize..0x1000).prop_map(|p| p * 0x10)
        ) {
            let total: usize = sizes.iter().sum();
            let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
            for order in orders {
                let mut seg = SegmentAllocator::new();
                seg.add_extent(base, total).unwrap();
                let blocks = sizes.map(|s| seg.alloc(s).unwrap());
                prop_assert_eq!(seg.usable().count(), 0);
                for i in order {
                    prop_assert_eq!(seg.release(blocks[i]), Ok(sizes[i]));
                }
                prop_assert_eq!(areas(&seg), vec![(base, total)]);
                prop_assert_eq!(seg.used_bytes(), 0);
                prop_assert_eq!(seg.occupied().count(), 0);
            }
        }
    }
}
