use crate::source::Record;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Count,
    Interval,
}

/// Decides whether a pending batch must be flushed. The count threshold is
/// checked first, so when both hold the reason is `Count`. An empty batch is
/// never flushed.
pub fn flush_reason(
    len: usize,
    max_len: usize,
    since_last_flush: Duration,
    max_interval: Duration,
) -> Option<FlushReason> {
    if len == 0 {
        None
    } else if len >= max_len {
        Some(FlushReason::Count)
    } else if since_last_flush >= max_interval {
        Some(FlushReason::Interval)
    } else {
        None
    }
}

/// Records collected since the last flush.
#[derive(Debug)]
pub struct Batch {
    records: Vec<Record>,
    last_flush: Instant,
    max_len: usize,
    max_interval: Duration,
}

impl Batch {
    pub fn new(max_len: usize, max_interval: Duration, now: Instant) -> Self {
        Self {
            records: Vec::new(),
            last_flush: now,
            max_len: max_len.max(1),
            max_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends records and splits off every chunk that reaches `max_len`.
    /// Whatever is left over stays pending, so no chunk ever exceeds the limit.
    pub fn fill(&mut self, records: Vec<Record>, now: Instant) -> Vec<Vec<Record>> {
        let mut full = Vec::new();
        for record in records {
            self.records.push(record);
            if self.records.len() >= self.max_len {
                full.push(self.take(now));
            }
        }
        full
    }

    pub fn check(&self, now: Instant) -> Option<FlushReason> {
        flush_reason(
            self.records.len(),
            self.max_len,
            now.saturating_duration_since(self.last_flush),
            self.max_interval,
        )
    }

    /// Hands over every pending record and restarts the interval.
    pub fn take(&mut self, now: Instant) -> Vec<Record> {
        self.last_flush = now;
        std::mem::take(&mut self.records)
    }
}

/// Marks captured after each collect, released once every record collected
/// up to that point has been flushed.
#[derive(Debug)]
pub struct Checkpoints<T> {
    collected: u64,
    flushed: u64,
    pending: VecDeque<(u64, T)>,
}

impl<T> Default for Checkpoints<T> {
    fn default() -> Self {
        Self {
            collected: 0,
            flushed: 0,
            pending: VecDeque::new(),
        }
    }
}

impl<T> Checkpoints<T> {
    pub fn collected(&mut self, count: usize, mark: T) {
        self.collected += count as u64;
        self.pending.push_back((self.collected, mark));
    }

    /// Records a flush and returns the newest mark it fully covers.
    pub fn flushed(&mut self, count: usize) -> Option<T> {
        self.flushed += count as u64;
        let mut ready = None;
        while self.pending.front().is_some_and(|(at, _)| *at <= self.flushed) {
            ready = self.pending.pop_front().map(|(_, mark)| mark);
        }
        ready
    }
}
