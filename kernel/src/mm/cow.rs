//! Copy-on-write — счётчики совместно используемых кадров
//!
//! После fork приватные страницы родителя и потомка смотрят в один кадр,
//! отображённый read-only. Здесь хранится, сколько пользователей у кадра;
//! первый, кто пишет, получает копию, последний забирает кадр себе.
//! After fork, private pages of parent and child share one read-only frame.
//! This table counts the users of each such frame.

use alloc::collections::BTreeMap;

use super::Frame;

#[derive(Default)]
pub struct CopyOnWrite {
    frames: BTreeMap<Frame, usize>,
}

impl CopyOnWrite {
    pub const fn new() -> Self {
        Self { frames: BTreeMap::new() }
    }

    /// Ещё один пользователь кадра / One more user of `frame`.
    pub fn add(&mut self, frame: Frame) {
        *self.frames.entry(frame).or_insert(0) += 1;
        log::trace!("cow: frame {:#x} has {} users", frame.0, self.count(frame));
    }

    /// Один пользователь ушёл; `true`, если остались другие.
    /// Drop one user of `frame`; returns whether other users remain.
    pub fn remove(&mut self, frame: Frame) -> bool {
        match self.frames.get_mut(&frame) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                self.frames.remove(&frame);
                false
            }
            None => false,
        }
    }

    pub fn count(&self, frame: Frame) -> usize {
        self.frames.get(&frame).copied().unwrap_or(0)
    }

    /// Кадров под copy-on-write / Frames currently shared copy-on-write.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_keeps_the_frame() {
        let mut cow = CopyOnWrite::new();
        let f = Frame(42);
        cow.add(f);
        cow.add(f);
        assert_eq!(cow.count(f), 2);
        assert!(cow.remove(f));
        assert!(!cow.remove(f));
        assert_eq!(cow.frame_count(), 0);
        assert!(!cow.remove(f));
    }
}
