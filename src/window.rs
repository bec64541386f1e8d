use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};

/// Maximum span of a single range query.
pub const SUB_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Validated global time window for a run: `[start, end)` sampled every `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
}

impl TimeWindow {
    /// Creates a window, rejecting `start >= end` and a zero step.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Result<Self> {
        if start >= end {
            bail!("start must precede end (start={start}, end={end})");
        }

        if step.is_zero() {
            bail!("step must be positive");
        }

        Ok(Self { start, end, step })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Total span of the window.
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Splits the window into contiguous sub-windows of at most `chunk`.
    pub fn sub_windows(&self, chunk: Duration) -> Result<SubWindows> {
        if chunk.is_zero() {
            bail!("sub-window size must be positive");
        }

        let chunk = TimeDelta::from_std(chunk).context("sub-window size out of range")?;

        Ok(SubWindows {
            current: self.start,
            end: self.end,
            chunk,
            next_index: 1,
        })
    }
}

/// One bounded slice of a [`TimeWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubWindow {
    /// 1-based position within the parent window.
    pub index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SubWindow {
    pub fn span(&self) -> TimeDelta {
        self.end - self.start
    }
}

/// Iterator over the sub-windows of a window, in chronological order.
#[derive(Debug, Clone)]
pub struct SubWindows {
    current: DateTime<Utc>,
    end: DateTime<Utc>,
    chunk: TimeDelta,
    next_index: usize,
}

impl Iterator for SubWindows {
    type Item = SubWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.end {
            return None;
        }

        let start = self.current;
        let end = start
            .checked_add_signed(self.chunk)
            .map_or(self.end, |candidate| candidate.min(self.end));

        let window = SubWindow {
            index: self.next_index,
            start,
            end,
        };

        self.current = end;
        self.next_index += 1;

        Some(window)
    }
}
