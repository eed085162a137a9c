use crate::storage::meta::Statistic;
use crate::transform::TransformStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Speed changes smaller than this are reported as stable.
pub const TREND_EPSILON: f64 = 0.001;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

impl Trend {
    pub fn between(previous: f64, current: f64) -> Self {
        if current - previous > TREND_EPSILON {
            Trend::Up
        } else if previous - current > TREND_EPSILON {
            Trend::Down
        } else {
            Trend::Stable
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    #[default]
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkStats {
    pub success: u64,
    pub errors: u64,
    pub speed: f64,
    pub trend: Trend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserStats {
    pub success: u64,
    pub errors: u64,
}

/// Signed adjustment to a sink's counters from one delivery attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsDelta {
    pub success: i64,
    pub errors: i64,
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Point-in-time view of one runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub name: String,
    pub state: RunnerState,
    pub read_count: u64,
    pub read_speed: f64,
    pub read_speed_trend: Trend,
    pub parser: ParserStats,
    pub transforms: BTreeMap<String, TransformStats>,
    pub sinks: BTreeMap<String, SinkStats>,
    pub last_snapshot: DateTime<Utc>,
    /// Seconds covered by all recomputations so far.
    pub elapsed: f64,
}

impl RunnerStatus {
    fn new(name: &str, sink_names: &[String], now: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            state: RunnerState::Created,
            read_count: 0,
            read_speed: 0.0,
            read_speed_trend: Trend::Stable,
            parser: ParserStats::default(),
            transforms: BTreeMap::new(),
            sinks: sink_names
                .iter()
                .map(|n| (n.clone(), SinkStats::default()))
                .collect(),
            last_snapshot: now,
            elapsed: 0.0,
        }
    }
}

struct Snapshots {
    current: RunnerStatus,
    previous: RunnerStatus,
}

/// Live counters for one runner plus the copy taken at the last observation,
/// which is what speeds are measured against.
pub struct StatsStore {
    inner: RwLock<Snapshots>,
    collect_interval: Duration,
}

impl StatsStore {
    pub fn new(name: &str, sink_names: &[String], collect_interval: Duration) -> Self {
        Self::new_at(name, sink_names, collect_interval, Utc::now())
    }

    pub fn new_at(
        name: &str,
        sink_names: &[String],
        collect_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let current = RunnerStatus::new(name, sink_names, now);
        Self {
            inner: RwLock::new(Snapshots {
                previous: current.clone(),
                current,
            }),
            collect_interval,
        }
    }

    // Counters stay usable even if a writer panicked mid-update.
    fn read(&self) -> RwLockReadGuard<'_, Snapshots> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshots> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RunnerState {
        self.read().current.state
    }

    pub fn set_state(&self, state: RunnerState) {
        self.write().current.state = state;
    }

    pub fn add_read(&self, count: usize) {
        self.write().current.read_count += count as u64;
    }

    pub fn add_parsed(&self, success: u64, errors: u64) {
        let mut inner = self.write();
        inner.current.parser.success += success;
        inner.current.parser.errors += errors;
    }

    pub fn apply_sink_delta(&self, sink: &str, delta: StatsDelta) {
        let mut inner = self.write();
        let stats = inner.current.sinks.entry(sink.to_string()).or_default();
        stats.success = apply_delta(stats.success, delta.success);
        stats.errors = apply_delta(stats.errors, delta.errors);
    }

    /// Replaces counters with ones a sink keeps itself.
    pub fn set_sink_counts(&self, sink: &str, success: u64, errors: u64) {
        let mut inner = self.write();
        let stats = inner.current.sinks.entry(sink.to_string()).or_default();
        stats.success = success;
        stats.errors = errors;
    }

    pub fn set_transform_stats(&self, key: String, stats: TransformStats) {
        self.write().current.transforms.insert(key, stats);
    }

    pub fn status(&self) -> RunnerStatus {
        self.status_at(Utc::now())
    }

    /// Returns a copy of the counters. Within two collect intervals of the
    /// last recomputation the copy is returned as-is; after that, speeds and
    /// trends are recomputed against the previous observation.
    pub fn status_at(&self, now: DateTime<Utc>) -> RunnerStatus {
        let cheap_window = self.collect_interval * 2;
        {
            let inner = self.read();
            let elapsed = (now - inner.current.last_snapshot)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed <= cheap_window {
                return inner.current.clone();
            }
        }

        let mut inner = self.write();
        let Snapshots { current, previous } = &mut *inner;
        let elapsed = (now - current.last_snapshot)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        // Another caller may have just recomputed.
        if elapsed <= cheap_window.as_secs_f64() {
            return current.clone();
        }

        current.elapsed += elapsed;
        current.last_snapshot = now;
        current.read_speed =
            current.read_count.saturating_sub(previous.read_count) as f64 / elapsed;
        current.read_speed_trend = Trend::between(previous.read_speed, current.read_speed);

        for (name, stats) in current.sinks.iter_mut() {
            let (prev_success, prev_speed) = previous
                .sinks
                .get(name)
                .map(|p| (p.success, p.speed))
                .unwrap_or((0, 0.0));
            stats.speed = stats.success.saturating_sub(prev_success) as f64 / elapsed;
            stats.trend = Trend::between(prev_speed, stats.speed);
        }

        *previous = current.clone();
        current.clone()
    }

    /// Seeds the counters from a persisted snapshot.
    pub fn restore(&self, statistic: &Statistic) {
        let mut inner = self.write();
        inner.current.read_count = statistic.reader_count;
        inner.current.parser = ParserStats {
            success: statistic.parser.success,
            errors: statistic.parser.errors,
        };
        for (name, counts) in &statistic.sinks {
            let stats = inner.current.sinks.entry(name.clone()).or_default();
            stats.success = counts.success;
            stats.errors = counts.errors;
        }
        inner.previous = inner.current.clone();
    }

    /// The durable part of the current status.
    pub fn backup(&self) -> Statistic {
        Statistic::from(&self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::meta::Counts;

    fn store(now: DateTime<Utc>) -> StatsStore {
        StatsStore::new_at("app", &["file".to_string()], Duration::from_secs(3), now)
    }

    #[test]
    fn test_trend_epsilon() {
        assert_eq!(Trend::between(1.0, 1.0005), Trend::Stable);
        assert_eq!(Trend::between(1.0, 1.01), Trend::Up);
        assert_eq!(Trend::between(1.0, 0.5), Trend::Down);
    }

    #[test]
    fn test_cheap_path_skips_recompute() {
        let t0 = Utc::now();
        let s = store(t0);
        s.add_read(60);

        let status = s.status_at(t0 + chrono::Duration::seconds(6));
        assert_eq!(status.read_count, 60);
        assert_eq!(status.read_speed, 0.0);
        assert_eq!(status.last_snapshot, t0);
    }

    #[test]
    fn test_recompute_uses_wallclock_delta() {
        let t0 = Utc::now();
        let s = store(t0);
        s.add_read(100);
        s.apply_sink_delta("file", StatsDelta { success: 50, errors: 0 });

        let t1 = t0 + chrono::Duration::seconds(10);
        let status = s.status_at(t1);
        assert_eq!(status.read_speed, 10.0);
        assert_eq!(status.read_speed_trend, Trend::Up);
        assert_eq!(status.sinks["file"].speed, 5.0);
        assert_eq!(status.last_snapshot, t1);
        assert_eq!(status.elapsed, 10.0);

        // Same count again: speed falls to zero relative to the previous copy.
        let status = s.status_at(t1 + chrono::Duration::seconds(10));
        assert_eq!(status.read_speed, 0.0);
        assert_eq!(status.read_speed_trend, Trend::Down);
        assert_eq!(status.elapsed, 20.0);
    }

    #[test]
    fn test_restore_then_status_reflects_counters() {
        let s = StatsStore::new("app", &["file".to_string()], Duration::from_secs(3));
        let mut statistic = Statistic {
            reader_count: 42,
            ..Statistic::default()
        };
        statistic.parser = Counts { success: 40, errors: 2 };
        statistic.sinks.insert("file".into(), Counts { success: 38, errors: 4 });
        s.restore(&statistic);

        let status = s.status();
        assert_eq!(status.read_count, 42);
        assert_eq!(status.parser.errors, 2);
        assert_eq!(status.sinks["file"].success, 38);
        assert_eq!(status.sinks["file"].errors, 4);
    }

    #[test]
    fn test_delta_never_underflows() {
        let s = store(Utc::now());
        s.apply_sink_delta("file", StatsDelta { success: 0, errors: -5 });
        assert_eq!(s.status().sinks["file"].errors, 0);
    }
}
