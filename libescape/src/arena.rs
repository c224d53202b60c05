//! Node arena — пул узлов метаданных
//!
//! Узлы лежат в одном массиве, связи — индексы, а не указатели.
//! Переиспользуемые узлы образуют интрузивный стек свободных индексов.
//! Nodes live in one array and link by index instead of by pointer.
//! Recycled nodes form an intrusive free-index stack.

use alloc::vec::Vec;

/// Индекс узла в пуле / Node index within a pool
pub type NodeIdx = u32;

/// A node that can be chained through the pool's free stack.
pub trait Linked: Default {
    fn next(&self) -> Option<NodeIdx>;
    fn set_next(&mut self, next: Option<NodeIdx>);
}

/// Arena of nodes with O(1) allocation and recycling.
///
/// With a capacity limit the pool never grows beyond it, which is what the
/// swap map needs (all areas preallocated). Without one it grows by `chunk`
/// nodes whenever the free stack runs dry.
pub struct NodePool<T> {
    nodes: Vec<T>,
    free:  Option<NodeIdx>,
    avail: usize,
    chunk: usize,
    limit: Option<usize>,
}

impl<T: Linked> NodePool<T> {
    /// Growable pool that adds `chunk` nodes at a time.
    pub const fn growable(chunk: usize) -> Self {
        Self { nodes: Vec::new(), free: None, avail: 0, chunk, limit: None }
    }

    /// Fixed pool: all `capacity` nodes are created up front.
    pub fn fixed(capacity: usize) -> Self {
        let mut pool = Self {
            nodes: Vec::with_capacity(capacity),
            free:  None,
            avail: 0,
            chunk: capacity,
            limit: Some(capacity),
        };
        pool.grow();
        pool
    }

    /// Number of nodes currently on the free stack.
    pub fn available(&self) -> usize {
        self.avail
    }

    /// Total number of nodes ever created.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// Make sure at least `count` nodes can be taken without failing.
    pub fn reserve(&mut self, count: usize) -> bool {
        while self.avail < count {
            if !self.grow() {
                return false;
            }
        }
        true
    }

    fn grow(&mut self) -> bool {
        let room = match self.limit {
            Some(limit) => limit.saturating_sub(self.nodes.len()).min(self.chunk),
            None        => self.chunk,
        };
        if room == 0 {
            return false;
        }
        let start = self.nodes.len();
        self.nodes.resize_with(start + room, T::default);
        // Первый созданный узел выдаётся первым / lowest index is handed out first
        for idx in (start..start + room).rev() {
            self.push_free(idx as NodeIdx);
        }
        true
    }

    fn push_free(&mut self, idx: NodeIdx) {
        let head = self.free;
        self.nodes[idx as usize].set_next(head);
        self.free = Some(idx);
        self.avail += 1;
    }

    /// Take a node from the free stack and initialize it with `value`.
    pub fn take(&mut self, value: T) -> Option<NodeIdx> {
        if self.free.is_none() && !self.grow() {
            return None;
        }
        let idx = self.free?;
        self.free = self.nodes[idx as usize].next();
        self.avail -= 1;
        self.nodes[idx as usize] = value;
        Some(idx)
    }

    /// Put a node back on the free stack.
    pub fn recycle(&mut self, idx: NodeIdx) {
        self.nodes[idx as usize] = T::default();
        self.push_free(idx);
    }

    #[inline]
    pub fn get(&self, idx: NodeIdx) -> &T {
        &self.nodes[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: NodeIdx) -> &mut T {
        &mut self.nodes[idx as usize]
    }
}
