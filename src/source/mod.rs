pub mod cursor;
pub mod identity;
pub mod mode;
pub mod multi;
pub mod parser;
pub mod plugin;
pub mod seqfile;
pub mod single;

use crate::config::types::{SourceConfig, Whence};
use async_trait::async_trait;
use thiserror::Error;

pub use cursor::{Cursor, FileTail};
pub use identity::{identity_of, same_file, FileIdentity, FileIdentityExt};
pub use mode::ReaderMode;
pub use multi::MultiFileSource;
pub use parser::{LineParser, ParseOutcome};
pub use plugin::{Plugin, PluginRegistry, PluginSource};
pub use seqfile::SequentialFileSource;
pub use single::SingleFileSource;

/// A semantic key/value record flowing from sources to sinks.
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("no plugin named '{0}'")]
    UnknownPlugin(String),
}

/// What one collection produced.
///
/// File sources hand back raw lines that still need parsing; plugins already
/// emit structured records.
#[derive(Debug, Clone)]
pub enum SourceOutput {
    Lines(Vec<String>),
    Records(Vec<Record>),
}

impl SourceOutput {
    pub fn len(&self) -> usize {
        match self {
            SourceOutput::Lines(lines) => lines.len(),
            SourceOutput::Records(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A collection source driven once per runner tick.
#[async_trait]
pub trait CollectSource: Send {
    fn kind(&self) -> &'static str;

    /// Collect whatever is available now. Returning an empty output is the
    /// normal "nothing new yet" case; errors are transient unless the runner
    /// is still starting up.
    async fn collect(&mut self) -> Result<SourceOutput, SourceError>;

    /// Current read positions, for persistence.
    fn cursors(&self) -> Vec<Cursor> {
        Vec::new()
    }

    /// Seed read positions from a previous run.
    fn restore_cursors(&mut self, _cursors: Vec<Cursor>) {}

    /// Forget every read position so the next collect starts from the oldest data.
    fn reset(&mut self) {}

    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Builds the file source for a configured path. Mode selection happens once
/// here; switching modes requires rebuilding the source.
pub fn build_file_source(config: &SourceConfig) -> Result<Box<dyn CollectSource>, SourceError> {
    let whence = config.whence.unwrap_or(Whence::Oldest);
    let mode = ReaderMode::select(&config.path)?;
    tracing::info!(path = %config.path, mode = mode.name(), "Selected reader mode");

    let source: Box<dyn CollectSource> = match mode {
        ReaderMode::SingleFile(path) => Box::new(SingleFileSource::new(
            path,
            whence,
            config.max_lines_per_collect,
        )),
        ReaderMode::Directory(dir) => Box::new(SequentialFileSource::new(
            dir,
            &config.dir,
            whence,
            config.max_lines_per_collect,
        )?),
        ReaderMode::Wildcard(pattern) => Box::new(MultiFileSource::new(
            pattern,
            &config.tailx,
            whence,
            config.max_lines_per_collect,
        )?),
    };

    Ok(source)
}
