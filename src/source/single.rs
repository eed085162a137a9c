use crate::config::types::Whence;
use crate::source::cursor::{Cursor, FileTail, StartAt};
use crate::source::identity::identity_of_path;
use crate::source::{CollectSource, SourceError, SourceOutput};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, info};

/// Tails one named file, following it across rotations.
pub struct SingleFileSource {
    path: PathBuf,
    whence: Whence,
    max_lines: usize,
    tail: Option<FileTail>,
    saved: Option<Cursor>,
}

impl SingleFileSource {
    pub fn new(path: PathBuf, whence: Whence, max_lines: usize) -> Self {
        Self {
            path,
            whence,
            max_lines,
            tail: None,
            saved: None,
        }
    }

    fn ensure_open(&mut self) -> Result<bool, SourceError> {
        if self.tail.is_some() {
            return Ok(true);
        }
        match FileTail::resume(&self.path, self.saved.as_ref(), self.whence) {
            Ok(tail) => {
                debug!(path = %self.path.display(), offset = tail.offset(), "Opened file");
                self.tail = Some(tail);
                Ok(true)
            }
            // Between a rename and the writer recreating the file.
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// True when the path now names a different file than the open handle.
    fn rotated(&self) -> Result<bool, SourceError> {
        let Some(tail) = &self.tail else {
            return Ok(false);
        };
        match identity_of_path(&self.path) {
            Ok(current) => Ok(!current.same_file(tail.identity())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CollectSource for SingleFileSource {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn collect(&mut self) -> Result<SourceOutput, SourceError> {
        if !self.ensure_open()? {
            return Ok(SourceOutput::Lines(Vec::new()));
        }

        let mut lines = match self.tail.as_mut() {
            Some(tail) => tail.read_lines(self.max_lines)?,
            None => Vec::new(),
        };

        // The old handle is drained before switching, so nothing written to
        // the rotated-out file is lost.
        if lines.len() < self.max_lines && self.rotated()? {
            info!(path = %self.path.display(), "File rotated, reopening from start");
            self.tail = Some(FileTail::open(&self.path, StartAt::Beginning)?);
            if let Some(tail) = self.tail.as_mut() {
                let remaining = self.max_lines - lines.len();
                lines.extend(tail.read_lines(remaining)?);
            }
        }

        if let Some(tail) = &self.tail {
            self.saved = Some(tail.cursor().clone());
        }
        Ok(SourceOutput::Lines(lines))
    }

    fn cursors(&self) -> Vec<Cursor> {
        self.tail
            .as_ref()
            .map(|t| t.cursor().clone())
            .or_else(|| self.saved.clone())
            .into_iter()
            .collect()
    }

    fn restore_cursors(&mut self, cursors: Vec<Cursor>) {
        self.saved = cursors.into_iter().find(|c| c.path == self.path);
        self.tail = None;
    }

    fn reset(&mut self) {
        self.tail = None;
        self.saved = None;
        self.whence = Whence::Oldest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &std::path::Path, text: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn lines(output: SourceOutput) -> Vec<String> {
        match output {
            SourceOutput::Lines(lines) => lines,
            SourceOutput::Records(_) => panic!("expected lines"),
        }
    }

    #[tokio::test]
    async fn test_tails_appended_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\nb\n");

        let mut source = SingleFileSource::new(path.clone(), Whence::Oldest, 100);
        assert_eq!(lines(source.collect().await.unwrap()), vec!["a", "b"]);
        assert!(source.collect().await.unwrap().is_empty());

        append(&path, "c\n");
        assert_eq!(lines(source.collect().await.unwrap()), vec!["c"]);
    }

    #[tokio::test]
    async fn test_rotation_drains_old_then_reads_new() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "1\n");

        let mut source = SingleFileSource::new(path.clone(), Whence::Oldest, 100);
        assert_eq!(lines(source.collect().await.unwrap()), vec!["1"]);

        // Writer adds one more line, then the file is rotated away.
        append(&path, "2\n");
        fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        append(&path, "3\n");

        assert_eq!(lines(source.collect().await.unwrap()), vec!["2", "3"]);
        assert!(source.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.log");

        let mut source = SingleFileSource::new(path.clone(), Whence::Oldest, 100);
        assert!(source.collect().await.unwrap().is_empty());

        append(&path, "hello\n");
        assert_eq!(lines(source.collect().await.unwrap()), vec!["hello"]);
    }

    #[tokio::test]
    async fn test_restore_resumes_from_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\nb\n");

        let mut first = SingleFileSource::new(path.clone(), Whence::Oldest, 1);
        assert_eq!(lines(first.collect().await.unwrap()), vec!["a"]);
        let cursors = first.cursors();

        let mut second = SingleFileSource::new(path.clone(), Whence::Oldest, 100);
        second.restore_cursors(cursors);
        assert_eq!(lines(second.collect().await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_reset_rereads_from_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "a\n");

        let mut source = SingleFileSource::new(path.clone(), Whence::Newest, 100);
        assert!(source.collect().await.unwrap().is_empty());

        source.reset();
        assert_eq!(lines(source.collect().await.unwrap()), vec!["a"]);
    }
}
