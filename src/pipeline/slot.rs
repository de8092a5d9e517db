//! Single-frame "latest value" slot shared between acquisition and readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::utils::CachePadded;

use crate::capture::Frame;

/// Holds the most recently acquired frame.
///
/// Writes overwrite unconditionally; readers get their own copy and may skip
/// frames. This is not a queue.
pub struct FrameSlot {
    latest: Mutex<Latest>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Latest {
    frame: Option<Frame>,
    /// Whether any reader copied `frame` since it was written
    seen: bool,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicU64,
    frames_read: AtomicU64,
    frames_overwritten: AtomicU64,
}

/// Counters reported by [`FrameSlot::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SlotStats {
    pub frames_written: u64,
    pub frames_read: u64,
    /// Frames replaced before any reader copied them
    pub frames_overwritten: u64,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            latest: Mutex::new(Latest::default()),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the held frame.
    pub fn write(&self, frame: Frame) {
        let previous = {
            let mut latest = self.lock();
            let seen = std::mem::replace(&mut latest.seen, false);
            latest.frame.replace(frame).map(|prev| (prev, seen))
        };
        if let Some((_, false)) = previous {
            self.stats.frames_overwritten.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: copy out the held frame, `None` if nothing was ever written.
    pub fn read_copy(&self) -> Option<Frame> {
        let frame = {
            let mut latest = self.lock();
            latest.seen = true;
            latest.frame.clone()
        };
        if frame.is_some() {
            self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn has_frame(&self) -> bool {
        self.lock().frame.is_some()
    }

    /// Drops the held frame.
    pub fn clear(&self) {
        let mut latest = self.lock();
        latest.frame = None;
        latest.seen = false;
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            frames_written: self.stats.frames_written.load(Ordering::Relaxed),
            frames_read: self.stats.frames_read.load(Ordering::Relaxed),
            frames_overwritten: self.stats.frames_overwritten.load(Ordering::Relaxed),
        }
    }

    // The swap is a single move, so a poisoned lock never hides a half-written frame.
    fn lock(&self) -> MutexGuard<'_, Latest> {
        self.latest.lock().unwrap_or_else(|e| e.into_inner())
    }
}
