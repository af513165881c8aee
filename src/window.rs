use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::audio::AudioChunk;
use crate::config::AudioConfig;

/// Read-only view of the live window for the duration of one tick.
#[derive(Debug, Clone, Copy)]
pub struct AudioWindow<'a> {
    pub samples: &'a [f32],
    /// The chunk feeding this window arrived late.
    pub stale: bool,
}

#[derive(Debug)]
pub enum Push<'a> {
    Ready(AudioWindow<'a>),
    Pending { filled: usize, capacity: usize },
}

impl Push<'_> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Push::Ready(_))
    }
}

/// Every push after the first fill yields a window; there is no independent timer.
pub struct RollingWindow {
    samples: VecDeque<f32>,
    capacity: usize,
    filled_once: bool,
    stale_after: Duration,
    max_gap: Duration,
    last_push: Option<Instant>,
}

impl RollingWindow {
    pub fn new(config: &AudioConfig) -> Self {
        let capacity = config.window_size();
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            filled_once: false,
            stale_after: config.stale_after(),
            max_gap: config.window_duration(),
            last_push: None,
        }
    }

    pub fn push(&mut self, chunk: AudioChunk) -> Push<'_> {
        self.push_at(chunk, Instant::now())
    }

    pub fn push_at(&mut self, chunk: AudioChunk, now: Instant) -> Push<'_> {
        let gap = self.last_push.map(|last| now.saturating_duration_since(last));
        self.last_push = Some(now);

        // Older audio than one window is never reused
        if gap.is_some_and(|g| g > self.max_gap) {
            log::warn!(
                "Audio gap of {:.0} ms exceeds the window, refilling",
                gap.unwrap_or_default().as_secs_f32() * 1000.0
            );
            self.samples.clear();
            self.filled_once = false;
        }

        let incoming = chunk.into_samples();
        let keep = incoming.len().min(self.capacity);
        let tail = &incoming[incoming.len() - keep..];

        let overflow = (self.samples.len() + keep).saturating_sub(self.capacity);
        self.samples.drain(..overflow);
        self.samples.extend(tail.iter().copied());

        if self.samples.len() == self.capacity {
            self.filled_once = true;
        }

        if !self.filled_once {
            return Push::Pending {
                filled: self.samples.len(),
                capacity: self.capacity,
            };
        }

        let stale = gap.is_some_and(|g| g > self.stale_after);
        Push::Ready(AudioWindow {
            samples: self.samples.make_contiguous(),
            stale,
        })
    }
}
