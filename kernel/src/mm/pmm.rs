//! Physical Memory Manager — источник кадров
//!
//! Выдаёт и забирает физические кадры и даёт доступ к их содержимому
//! (прямое отображение физической памяти). Память здесь — массив байт,
//! так что таблицы страниц и копирование кадров работают и на хосте.
//! Hands out physical frames and gives direct-map access to their contents.
//!
//! Типы кадров / Frame types:
//!   Kern — таблицы страниц и прочее ядро / page tables and other kernel use
//!   Usr  — страницы процессов / process pages
//!   Crit — критичные (куча ядра, стеки ядра); могут брать резерв
//!          critical (kernel heap, kernel stacks); may dip into the reserve
//!
//! Кадр 0 никогда не выдаётся: 0 в PTE означает "нет кадра".

use alloc::collections::BTreeSet;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::paging::Pte;
use super::Frame;
use crate::config::PAGE_SIZE;

/// Тип кадра / Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Kern,
    Usr,
    Crit,
}

impl FrameType {
    const fn idx(self) -> usize {
        match self {
            FrameType::Kern => 0,
            FrameType::Usr  => 1,
            FrameType::Crit => 2,
        }
    }
}

struct Inner {
    ram:     Vec<u8>,
    free:    BTreeSet<usize>,
    reserve: usize,
    used:    [usize; 3],
}

/// Physical memory: frame allocator plus direct-map access.
pub struct PhysMem {
    inner:  Mutex<Inner>,
    frames: usize,
}

impl PhysMem {
    /// `frames` кадров RAM, из них `reserve` только для `Crit`.
    pub fn new(frames: usize, reserve: usize) -> Self {
        log::debug!("pmm: {} frames ({} KiB), {} reserved", frames, frames * PAGE_SIZE / 1024, reserve);
        Self {
            inner: Mutex::new(Inner {
                ram:     vec![0; frames * PAGE_SIZE],
                free:    (1..frames).collect(),
                reserve,
                used:    [0; 3],
            }),
            frames,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.frames
    }

    pub fn free_frames(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Кадров данного типа выдано / Frames of `ty` currently handed out
    pub fn used_frames(&self, ty: FrameType) -> usize {
        self.inner.lock().used[ty.idx()]
    }

    /// Выделить кадр / Allocate one frame.
    pub fn allocate(&self, ty: FrameType) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if ty != FrameType::Crit && inner.free.len() <= inner.reserve {
            log::warn!("pmm: out of {:?} frames", ty);
            return None;
        }
        let frame = inner.free.pop_first()?;
        inner.used[ty.idx()] += 1;
        Some(Frame(frame))
    }

    /// `count` смежных кадров, начало кратно `align` кадрам.
    /// Allocate `count` contiguous frames whose first one is `align`-aligned.
    pub fn allocate_contiguous(&self, count: usize, align: usize) -> Option<Frame> {
        let align = align.max(1);
        let mut inner = self.inner.lock();
        if inner.free.len() < count + inner.reserve {
            return None;
        }
        let mut start = None;
        let mut run = 0;
        let mut last = 0;
        for &f in inner.free.iter() {
            if run > 0 && f == last + 1 {
                run += 1;
            } else if f % align == 0 {
                start = Some(f);
                run = 1;
            } else {
                run = 0;
            }
            last = f;
            if run == count {
                break;
            }
        }
        let first = start.filter(|_| run == count)?;
        for f in first..first + count {
            inner.free.remove(&f);
        }
        inner.used[FrameType::Usr.idx()] += count;
        Some(Frame(first))
    }

    /// Вернуть кадр / Free a frame; freeing twice is fatal.
    pub fn free(&self, frame: Frame, ty: FrameType) {
        let mut inner = self.inner.lock();
        if frame.0 == 0 || frame.0 >= self.frames || !inner.free.insert(frame.0) {
            log::error!("pmm: bogus free of frame {:#x}", frame.0);
            panic!("freeing frame {:#x} twice or out of range", frame.0);
        }
        inner.used[ty.idx()] = inner.used[ty.idx()].saturating_sub(1);
    }

    pub fn is_free(&self, frame: Frame) -> bool {
        self.inner.lock().free.contains(&frame.0)
    }

    pub fn read_pte(&self, table: Frame, idx: usize) -> Pte {
        let inner = self.inner.lock();
        let off = table.0 * PAGE_SIZE + idx * 8;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&inner.ram[off..off + 8]);
        Pte(u64::from_le_bytes(buf))
    }

    pub fn write_pte(&self, table: Frame, idx: usize, pte: Pte) {
        let mut inner = self.inner.lock();
        let off = table.0 * PAGE_SIZE + idx * 8;
        inner.ram[off..off + 8].copy_from_slice(&pte.0.to_le_bytes());
    }

    pub fn zero_frame(&self, frame: Frame) {
        let mut inner = self.inner.lock();
        let off = frame.0 * PAGE_SIZE;
        inner.ram[off..off + PAGE_SIZE].fill(0);
    }

    pub fn copy_frame(&self, dst: Frame, src: Frame) {
        let mut inner = self.inner.lock();
        inner.ram.copy_within(src.0 * PAGE_SIZE..(src.0 + 1) * PAGE_SIZE, dst.0 * PAGE_SIZE);
    }

    /// Прочитать байты кадра начиная с `offset` / Read bytes of a frame.
    pub fn read(&self, frame: Frame, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        let off = frame.0 * PAGE_SIZE + offset;
        buf.copy_from_slice(&inner.ram[off..off + buf.len()]);
    }

    pub fn write(&self, frame: Frame, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        let off = frame.0 * PAGE_SIZE + offset;
        inner.ram[off..off + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_zero_is_never_handed_out() {
        let pm = PhysMem::new(4, 0);
        let got: Vec<_> = core::iter::from_fn(|| pm.allocate(FrameType::Usr)).collect();
        assert_eq!(got, vec![Frame(1), Frame(2), Frame(3)]);
        assert_eq!(pm.used_frames(FrameType::Usr), 3);
    }

    #[test]
    fn reserve_is_for_critical_only() {
        let pm = PhysMem::new(4, 2);
        assert!(pm.allocate(FrameType::Kern).is_some());
        assert!(pm.allocate(FrameType::Usr).is_none());
        assert!(pm.allocate(FrameType::Crit).is_some());
        assert!(pm.allocate(FrameType::Crit).is_some());
        assert!(pm.allocate(FrameType::Crit).is_none());
    }

    #[test]
    fn contiguous_respects_alignment() {
        let pm = PhysMem::new(32, 0);
        let a = pm.allocate(FrameType::Usr).unwrap();
        let run = pm.allocate_contiguous(4, 4).unwrap();
        assert_eq!(run, Frame(4));
        assert!(!pm.is_free(Frame(7)));
        assert!(pm.is_free(Frame(2)));
        pm.free(a, FrameType::Usr);
        assert!(pm.allocate_contiguous(64, 1).is_none());
    }

    #[test]
    #[should_panic]
    fn double_free_is_fatal() {
        let pm = PhysMem::new(4, 0);
        let f = pm.allocate(FrameType::Kern).unwrap();
        pm.free(f, FrameType::Kern);
        pm.free(f, FrameType::Kern);
    }

    #[test]
    fn frame_contents_roundtrip() {
        let pm = PhysMem::new(4, 0);
        let a = pm.allocate(FrameType::Usr).unwrap();
        let b = pm.allocate(FrameType::Usr).unwrap();
        pm.write(a, 100, b"escape");
        pm.copy_frame(b, a);
        let mut buf = [0u8; 6];
        pm.read(b, 100, &mut buf);
        assert_eq!(&buf, b"escape");
        pm.zero_frame(b);
        pm.read(b, 100, &mut buf);
        assert_eq!(buf, [0; 6]);
    }
}
