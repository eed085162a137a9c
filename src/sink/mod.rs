pub mod file;
pub mod http;

use crate::config::types::{sink_names, SinkConfig};
use crate::runner::status::SinkStats;
use crate::source::Record;
use async_trait::async_trait;
use thiserror::Error;

pub use file::FileSink;
pub use http::HttpSink;

#[derive(Debug, Error)]
pub enum SinkError {
    /// The first `success` records of the batch were delivered, the rest were not.
    #[error("{success} delivered, {errors} failed: {source}")]
    Partial {
        success: u64,
        errors: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// A destination for delivered records. Each sink belongs to exactly one runner.
#[async_trait]
pub trait Sink: Send {
    fn name(&self) -> &str;

    async fn send(&mut self, records: &[Record]) -> Result<(), SinkError>;

    async fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Counters the sink keeps itself, if any. They take precedence over the
    /// runner's own accounting.
    fn stats(&self) -> Option<SinkStats> {
        None
    }

    fn restore(&mut self, _stats: &SinkStats) {}

    /// Forget any persisted send position. `None` when there is nothing to reset.
    async fn reset(&mut self) -> Option<Result<(), SinkError>> {
        None
    }
}

pub fn build_sinks(configs: &[SinkConfig]) -> Result<Vec<Box<dyn Sink>>, SinkError> {
    configs
        .iter()
        .zip(sink_names(configs))
        .map(|(config, name)| -> Result<Box<dyn Sink>, SinkError> {
            Ok(match config {
                SinkConfig::File(c) => Box::new(FileSink::new(name, c.path.clone())),
                SinkConfig::Http(c) => Box::new(HttpSink::new(name, c)?),
            })
        })
        .collect()
}
