pub mod batch;
pub mod retry;
pub mod status;

use crate::config::types::{RunnerConfig, SourceKind, DEFAULT_COLLECT_INTERVAL};
use crate::sink::{build_sinks, Sink, SinkError};
use crate::source::{
    build_file_source, CollectSource, Cursor, LineParser, PluginRegistry, PluginSource, Record,
    SourceError, SourceOutput,
};
use crate::storage::meta::{MetaError, MetaStore};
use crate::transform::{apply, apply_raw, build_transform, Transform};
use batch::{Batch, Checkpoints};
use retry::send_with_retry;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use batch::FlushReason;
pub use retry::{AttemptOutcome, RetryPolicy, RetryState};
pub use status::{RunnerState, RunnerStatus, SinkStats, StatsStore, Trend};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("meta error: {0}")]
    Meta(#[from] MetaError),

    #[error("runner '{runner}' uses plugin '{plugin}' but no plugin directory is configured")]
    PluginsNotLoaded { runner: String, plugin: String },

    #[error("cannot {action} runner '{runner}' while it is {state:?}")]
    InvalidState {
        runner: String,
        action: &'static str,
        state: RunnerState,
    },

    #[error("reset of runner '{runner}' failed: {}", .errors.join("; "))]
    Reset { runner: String, errors: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub collect_interval: Duration,
    pub max_batch_len: usize,
    pub max_batch_interval: Duration,
    pub retry: RetryPolicy,
    pub stop_timeout: Duration,
    pub parser: LineParser,
    /// Added to every record as `hostname` when set.
    pub hostname: Option<String>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            max_batch_len: 10,
            max_batch_interval: Duration::from_secs(30),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_secs(1),
            },
            stop_timeout: Duration::from_secs(10),
            parser: LineParser::Raw,
            hostname: None,
        }
    }
}

/// Everything the collection loop works on. The loop holds the lock for as
/// long as it runs, so the runner can only reach the parts again once the
/// loop has finished or been aborted.
pub struct RunnerParts {
    pub source: Box<dyn CollectSource>,
    pub transforms: Vec<Box<dyn Transform>>,
    pub sinks: Vec<Box<dyn Sink>>,
}

/// One collection task: collect on a fixed tick, batch, transform, deliver.
pub struct Runner {
    name: String,
    settings: RunnerSettings,
    stats: Arc<StatsStore>,
    meta: MetaStore,
    parts: Arc<Mutex<RunnerParts>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Runner {
    /// Creates a runner and seeds it from whatever was persisted for `name`.
    /// Unreadable persisted state is logged and ignored.
    pub fn new(
        name: impl Into<String>,
        settings: RunnerSettings,
        mut parts: RunnerParts,
        meta: MetaStore,
    ) -> Self {
        let name = name.into();
        let sink_names: Vec<String> = parts.sinks.iter().map(|s| s.name().to_string()).collect();
        let stats = Arc::new(StatsStore::new(&name, &sink_names, settings.collect_interval));

        match meta.read_statistics() {
            Ok(Some(statistic)) => {
                stats.restore(&statistic);
                for sink in parts.sinks.iter_mut() {
                    if let Some(counts) = statistic.sinks.get(sink.name()) {
                        sink.restore(&SinkStats {
                            success: counts.success,
                            errors: counts.errors,
                            ..SinkStats::default()
                        });
                    }
                }
                info!(runner = %name, read_count = statistic.reader_count, "Restored statistics");
            }
            Ok(None) => {}
            Err(e) => warn!(runner = %name, error = %e, "Failed to restore statistics, starting from zero"),
        }

        match meta.read_cursors() {
            Ok(cursors) if !cursors.is_empty() => {
                debug!(runner = %name, count = cursors.len(), "Restored read cursors");
                parts.source.restore_cursors(cursors);
            }
            Ok(_) => {}
            Err(e) => warn!(runner = %name, error = %e, "Failed to restore read cursors"),
        }

        Self {
            name,
            settings,
            stats,
            meta,
            parts: Arc::new(Mutex::new(parts)),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Builds a runner from its configuration. Bad paths and unknown plugins
    /// fail here, before the runner ever enters `Running`.
    pub fn from_config(
        config: &RunnerConfig,
        plugins: Option<&PluginRegistry>,
        meta_root: &Path,
    ) -> Result<Self, RunnerError> {
        let (source, collect_interval): (Box<dyn CollectSource>, Duration) = match &config.source {
            SourceKind::File(file) => (
                build_file_source(file)?,
                config.batch.collect_interval.unwrap_or(DEFAULT_COLLECT_INTERVAL),
            ),
            SourceKind::Plugin(p) => {
                let registry = plugins.ok_or_else(|| RunnerError::PluginsNotLoaded {
                    runner: config.name.clone(),
                    plugin: p.plugin.clone(),
                })?;
                let plugin = registry
                    .get(&p.plugin)
                    .ok_or_else(|| SourceError::UnknownPlugin(p.plugin.clone()))?;
                let interval = config.batch.collect_interval.unwrap_or(plugin.default_cycle);
                let source = PluginSource::new(&config.name, plugin, &p.config, interval)?;
                (Box::new(source), interval)
            }
        };

        let hostname = if config.add_hostname {
            match hostname::get() {
                Ok(h) => Some(h.to_string_lossy().into_owned()),
                Err(e) => {
                    warn!(
                        runner = %config.name,
                        error = %e,
                        "Could not resolve hostname, records will not be tagged"
                    );
                    None
                }
            }
        } else {
            None
        };

        let settings = RunnerSettings {
            collect_interval,
            max_batch_len: config.batch.max_batch_len,
            max_batch_interval: config.batch.max_batch_interval,
            retry: RetryPolicy {
                max_attempts: config.delivery.max_send_attempts,
                backoff: config.delivery.retry_backoff,
            },
            stop_timeout: config.delivery.stop_timeout,
            parser: config.parser,
            hostname,
        };

        let parts = RunnerParts {
            source,
            transforms: config.transforms.iter().map(build_transform).collect(),
            sinks: build_sinks(&config.sinks)?,
        };

        let meta = MetaStore::open(meta_root, &config.name)?;
        Ok(Self::new(config.name.clone(), settings, parts, meta))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunnerState {
        self.stats.state()
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    fn invalid(&self, action: &'static str) -> RunnerError {
        RunnerError::InvalidState {
            runner: self.name.clone(),
            action,
            state: self.state(),
        }
    }

    /// Spawns the collection loop. A runner starts at most once.
    pub fn start(&mut self) -> Result<(), RunnerError> {
        if self.state() != RunnerState::Created {
            return Err(self.invalid("start"));
        }
        let parts = Arc::clone(&self.parts).try_lock_owned().map_err(|_| self.invalid("start"))?;

        self.stats.set_state(RunnerState::Running);
        info!(
            runner = %self.name,
            source = parts.source.kind(),
            sinks = parts.sinks.len(),
            interval = ?self.settings.collect_interval,
            "Runner started"
        );

        let task = RunLoop {
            name: self.name.clone(),
            settings: self.settings.clone(),
            stats: Arc::clone(&self.stats),
            meta: self.meta.clone(),
            cancel: self.cancel.clone(),
        };
        self.handle = Some(tokio::spawn(task.run(parts)));
        Ok(())
    }

    /// Signals the loop to stop and waits up to the stop timeout for it to
    /// drain. On timeout the loop is aborted, its in-flight batch abandoned,
    /// and the sinks and source are closed from here instead. The runner ends
    /// up `Stopped` either way.
    pub async fn stop(&mut self) -> Result<(), RunnerError> {
        match self.state() {
            RunnerState::Running => {}
            RunnerState::Created => {
                close_parts(&self.name, &mut *self.parts.lock().await).await;
                self.stats.set_state(RunnerState::Stopped);
                return Ok(());
            }
            RunnerState::Stopped => return Ok(()),
            RunnerState::Stopping => return Err(self.invalid("stop")),
        }

        self.stats.set_state(RunnerState::Stopping);
        self.cancel.cancel();

        if let Some(mut handle) = self.handle.take() {
            match tokio::time::timeout(self.settings.stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(runner = %self.name, error = %e, "Runner task failed");
                    self.force_close().await;
                }
                Err(_) => {
                    warn!(
                        runner = %self.name,
                        timeout = ?self.settings.stop_timeout,
                        "Runner did not stop in time, abandoning in-flight work"
                    );
                    handle.abort();
                    // Resolves once the aborted task is dropped and the parts are free.
                    if let Err(e) = handle.await {
                        debug!(runner = %self.name, error = %e, "Aborted runner task");
                    }
                    self.force_close().await;
                }
            }
        }

        self.stats.set_state(RunnerState::Stopped);
        info!(runner = %self.name, "Runner stopped");
        Ok(())
    }

    /// Forgets persisted read positions and every sink's send position so
    /// the data is read again. Every part is reset even if an earlier one
    /// fails.
    pub async fn reset(&mut self) -> Result<(), RunnerError> {
        if matches!(self.state(), RunnerState::Running | RunnerState::Stopping) {
            return Err(self.invalid("reset"));
        }

        let mut errors = Vec::new();
        if let Err(e) = self.meta.reset_cursors() {
            errors.push(format!("cursors: {}", e));
        }
        let mut parts = self.parts.lock().await;
        parts.source.reset();
        for sink in parts.sinks.iter_mut() {
            if let Some(Err(e)) = sink.reset().await {
                errors.push(format!("sink '{}': {}", sink.name(), e));
            }
        }
        drop(parts);

        if errors.is_empty() {
            info!(runner = %self.name, "Runner reset");
            Ok(())
        } else {
            Err(RunnerError::Reset {
                runner: self.name.clone(),
                errors,
            })
        }
    }

    pub fn status(&self) -> RunnerStatus {
        self.stats.status()
    }

    /// Writes the current counters to disk.
    pub fn backup(&self) -> Result<(), RunnerError> {
        self.meta.write_statistics(&self.stats.backup())?;
        Ok(())
    }

    /// Cleanup for a loop that never reached its own shutdown. Read cursors
    /// are left at the last completed flush, so the abandoned batch is read
    /// again on the next start.
    async fn force_close(&self) {
        let mut parts = self.parts.lock().await;
        if tokio::time::timeout(self.settings.stop_timeout, close_parts(&self.name, &mut parts))
            .await
            .is_err()
        {
            warn!(runner = %self.name, "Closing sinks and source timed out");
        }
        if let Err(e) = self.backup() {
            warn!(runner = %self.name, error = %e, "Failed to back up statistics");
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn close_parts(runner: &str, parts: &mut RunnerParts) {
    for sink in parts.sinks.iter_mut() {
        if let Err(e) = sink.close().await {
            warn!(runner = %runner, sink = %sink.name(), error = %e, "Failed to close sink");
        }
    }
    if let Err(e) = parts.source.close().await {
        warn!(runner = %runner, error = %e, "Failed to close source");
    }
}

struct RunLoop {
    name: String,
    settings: RunnerSettings,
    stats: Arc<StatsStore>,
    meta: MetaStore,
    cancel: CancellationToken,
}

impl RunLoop {
    async fn run(self, mut parts: OwnedMutexGuard<RunnerParts>) {
        let parts = &mut *parts;
        let mut ticker = tokio::time::interval(self.settings.collect_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut batch = Batch::new(
            self.settings.max_batch_len,
            self.settings.max_batch_interval,
            Instant::now(),
        );
        let mut checkpoints = Checkpoints::default();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if let Some(records) = self.collect(parts).await {
                        checkpoints.collected(records.len(), parts.source.cursors());
                        for chunk in batch.fill(records, Instant::now()) {
                            debug!(
                                runner = %self.name,
                                reason = ?FlushReason::Count,
                                records = chunk.len(),
                                "Flushing batch"
                            );
                            self.flush(parts, chunk, &mut checkpoints).await;
                        }
                    }
                    if let Some(reason) = batch.check(Instant::now()) {
                        debug!(runner = %self.name, ?reason, records = batch.len(), "Flushing batch");
                        let records = batch.take(Instant::now());
                        self.flush(parts, records, &mut checkpoints).await;
                    }
                }
            }
        }

        self.shutdown(parts, batch).await;
    }

    async fn collect(&self, parts: &mut RunnerParts) -> Option<Vec<Record>> {
        let output = match parts.source.collect().await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    runner = %self.name,
                    source = parts.source.kind(),
                    error = %e,
                    "Collect failed, retrying next tick"
                );
                return None;
            }
        };
        if output.is_empty() {
            return None;
        }
        self.stats.add_read(output.len());

        let mut records = match output {
            SourceOutput::Lines(lines) => {
                let lines = apply_raw(&mut parts.transforms, lines);
                let parsed = self.settings.parser.parse(lines);
                self.stats.add_parsed(parsed.success, parsed.errors);
                parsed.records
            }
            SourceOutput::Records(records) => records,
        };

        if let Some(host) = &self.settings.hostname {
            for record in records.iter_mut() {
                record.insert("hostname".to_string(), Value::String(host.clone()));
            }
        }

        Some(records)
    }

    async fn flush(
        &self,
        parts: &mut RunnerParts,
        records: Vec<Record>,
        checkpoints: &mut Checkpoints<Vec<Cursor>>,
    ) {
        let collected = records.len();
        let records = apply(&mut parts.transforms, records);

        // Sinks are independent: a failing one never holds back the others.
        for sink in parts.sinks.iter_mut() {
            send_with_retry(
                sink.as_mut(),
                &records,
                &self.settings.retry,
                &self.stats,
                &self.cancel,
            )
            .await;
        }

        for (i, transform) in parts.transforms.iter().enumerate() {
            self.stats
                .set_transform_stats(format!("{}_{}", transform.name(), i), transform.stats());
        }
        for sink in parts.sinks.iter() {
            if let Some(kept) = sink.stats() {
                self.stats.set_sink_counts(sink.name(), kept.success, kept.errors);
            }
        }

        // Only positions whose records have all been flushed are persisted.
        if let Some(cursors) = checkpoints.flushed(collected) {
            self.save_cursors(&cursors);
        }
    }

    fn save_cursors(&self, cursors: &[Cursor]) {
        if cursors.is_empty() {
            return;
        }
        if let Err(e) = self.meta.write_cursors(cursors) {
            warn!(runner = %self.name, error = %e, "Failed to save read cursors");
        }
    }

    async fn shutdown(&self, parts: &mut RunnerParts, mut batch: Batch) {
        if !batch.is_empty() {
            info!(runner = %self.name, records = batch.len(), "Flushing pending batch before stop");
            let records = batch.take(Instant::now());
            self.flush(parts, records, &mut Checkpoints::default()).await;
        }
        // Everything collected has now been flushed.
        self.save_cursors(&parts.source.cursors());

        close_parts(&self.name, parts).await;

        if let Err(e) = self.meta.write_statistics(&self.stats.backup()) {
            warn!(runner = %self.name, error = %e, "Failed to back up statistics");
        }
    }
}
