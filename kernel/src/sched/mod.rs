//! Scheduler-facing thread handle
//!
//! Очереди и переключение контекста живут в планировщике; подсистеме
//! памяти нужен только поток: его процесс, зарезервированные кадры и
//! регионы стека / TLS.
//! Run queues live in the scheduler; memory management only needs the
//! thread's process, its reserved frames and its stack / TLS regions.
//!
//! Резерв кадров: перед участком, который не должен падать на нехватке
//! памяти (page fault, рост стека), поток заранее берёт кадры, а
//! `UAllocator` потом достаёт их отсюда.

use alloc::vec::Vec;
use spin::Mutex;

use crate::mm::pmm::{FrameType, PhysMem};
use crate::mm::Frame;

pub type Pid = u32;
pub type Tid = u32;

pub struct Thread {
    pub tid:  Tid,
    pub pid:  Pid,
    reserved: Mutex<Vec<Frame>>,
    stacks:   Mutex<Vec<usize>>,
    tls:      Mutex<Option<usize>>,
}

impl Thread {
    pub fn new(tid: Tid, pid: Pid) -> Self {
        Self {
            tid,
            pid,
            reserved: Mutex::new(Vec::new()),
            stacks:   Mutex::new(Vec::new()),
            tls:      Mutex::new(None),
        }
    }

    /// Зарезервировать до `count` кадров; всё или ничего.
    /// Reserve frames so that `count` are on hand; all or nothing.
    pub fn reserve_frames(&self, phys: &PhysMem, count: usize) -> bool {
        let mut reserved = self.reserved.lock();
        let have = reserved.len();
        while reserved.len() < count {
            match phys.allocate(FrameType::Usr) {
                Some(f) => reserved.push(f),
                None => {
                    for f in reserved.drain(have..) {
                        phys.free(f, FrameType::Usr);
                    }
                    log::warn!("thread {}: cannot reserve {} frames", self.tid, count);
                    return false;
                }
            }
        }
        true
    }

    /// Взять кадр: сначала из резерва / Take a frame, reserved ones first.
    pub fn take_frame(&self, phys: &PhysMem) -> Option<Frame> {
        self.reserved.lock().pop().or_else(|| phys.allocate(FrameType::Usr))
    }

    /// Вернуть неиспользованный резерв / Give back unused reserved frames.
    pub fn discard_frames(&self, phys: &PhysMem) {
        for f in self.reserved.lock().drain(..) {
            phys.free(f, FrameType::Usr);
        }
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    // ── Регионы потока / Thread regions ──────────────────────────────────

    pub fn add_stack_region(&self, virt: usize) {
        self.stacks.lock().push(virt);
    }

    pub fn stack_regions(&self) -> Vec<usize> {
        self.stacks.lock().clone()
    }

    pub fn has_stack_region(&self, virt: usize) -> bool {
        self.stacks.lock().contains(&virt)
    }

    /// Стек, растущий вниз, переехал / A grows-down stack moved its base.
    pub fn move_stack_region(&self, old: usize, new: usize) {
        for s in self.stacks.lock().iter_mut().filter(|s| **s == old) {
            *s = new;
        }
    }

    pub fn remove_stack_region(&self, virt: usize) {
        self.stacks.lock().retain(|&s| s != virt);
    }

    pub fn tls_region(&self) -> Option<usize> {
        *self.tls.lock()
    }

    pub fn set_tls_region(&self, virt: Option<usize>) {
        *self.tls.lock() = virt;
    }
}
