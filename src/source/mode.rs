use crate::source::SourceError;
use std::path::{PathBuf, MAIN_SEPARATOR};

const WILDCARD_CHARS: &[char] = &['*', '?', '['];

/// Tailing strategy for a configured path, decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderMode {
    /// Direct tail of one named file.
    SingleFile(PathBuf),
    /// A directory of sequentially rotated files read as one stream.
    Directory(PathBuf),
    /// A glob matching any number of concurrently tailed files.
    Wildcard(String),
}

impl ReaderMode {
    pub fn select(path: &str) -> Result<Self, SourceError> {
        let path = strip_trailing_separator(path);

        if path.contains(WILDCARD_CHARS) {
            return Ok(ReaderMode::Wildcard(path.to_string()));
        }

        // A failed stat here is a configuration error: the runner never starts.
        let metadata = std::fs::metadata(path)?;
        if metadata.is_dir() {
            Ok(ReaderMode::Directory(PathBuf::from(path)))
        } else {
            Ok(ReaderMode::SingleFile(PathBuf::from(path)))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReaderMode::SingleFile(_) => "file",
            ReaderMode::Directory(_) => "dir",
            ReaderMode::Wildcard(_) => "tailx",
        }
    }
}

// "/var/log/app/" names the directory "/var/log/app".
fn strip_trailing_separator(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', MAIN_SEPARATOR]);
    if trimmed.is_empty() {
        path
    } else {
        trimmed
    }
}
