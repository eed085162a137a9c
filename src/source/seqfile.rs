use crate::config::types::{DirConfig, Whence};
use crate::source::cursor::{Cursor, FileTail, StartAt};
use crate::source::identity::{identity_of_path, FileIdentity};
use crate::source::{CollectSource, SourceError, SourceOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Presents a directory of rotated files as one ordered stream.
pub struct SequentialFileSource {
    dir: PathBuf,
    ignore_hidden: bool,
    ignore_suffixes: Vec<String>,
    valid_pattern: glob::Pattern,
    whence: Whence,
    max_lines: usize,
    tail: Option<FileTail>,
    saved: Option<Cursor>,
}

#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
    identity: FileIdentity,
}

impl Candidate {
    fn order_key(&self) -> (SystemTime, &Path) {
        (self.modified, self.path.as_path())
    }
}

impl SequentialFileSource {
    pub fn new(
        dir: PathBuf,
        config: &DirConfig,
        whence: Whence,
        max_lines: usize,
    ) -> Result<Self, SourceError> {
        let valid_pattern = glob::Pattern::new(&config.valid_file_pattern).map_err(|e| {
            SourceError::InvalidPattern {
                pattern: config.valid_file_pattern.clone(),
                message: e.to_string(),
            }
        })?;

        Ok(Self {
            dir,
            ignore_hidden: config.ignore_hidden,
            ignore_suffixes: config.ignore_file_suffix.clone(),
            valid_pattern,
            whence,
            max_lines,
            tail: None,
            saved: None,
        })
    }

    fn accepts(&self, name: &str) -> bool {
        if self.ignore_hidden && name.starts_with('.') {
            return false;
        }
        if self.ignore_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            return false;
        }
        self.valid_pattern.matches(name)
    }

    /// Lists eligible files ordered by modification time, then name.
    fn list(&self) -> Result<Vec<Candidate>, SourceError> {
        let mut candidates = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !self.accepts(name) {
                continue;
            }
            let path = entry.path();
            let metadata = match std::fs::metadata(&path) {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            // A file may vanish between listing and stat; skip it this round.
            let Ok(identity) = identity_of_path(&path) else {
                continue;
            };
            candidates.push(Candidate {
                path,
                modified: metadata.modified()?,
                identity,
            });
        }
        candidates.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(candidates)
    }

    /// Picks the file to start from when nothing is open yet.
    fn open_initial(&mut self) -> Result<(), SourceError> {
        let candidates = self.list()?;

        // The saved file may have been renamed by rotation; find it by identity.
        if let Some(saved) = &self.saved {
            if let Some(c) = candidates.iter().find(|c| c.identity.same_file(&saved.identity)) {
                let tail = FileTail::open(&c.path, StartAt::Offset(saved.offset))?;
                debug!(path = %c.path.display(), offset = tail.offset(), "Resumed directory cursor");
                self.tail = Some(tail);
                return Ok(());
            }

            // Gone while we were down. Everything written up to the last read
            // was delivered, so carry on with the first file changed after it.
            let last_read = (SystemTime::from(saved.last_activity), saved.path.as_path());
            if let Some(c) = candidates.iter().find(|c| c.order_key() > last_read) {
                info!(
                    missing = %saved.path.display(),
                    path = %c.path.display(),
                    "Saved file is gone, continuing with the next one"
                );
                self.tail = Some(FileTail::open(&c.path, StartAt::Beginning)?);
            }
            return Ok(());
        }

        let chosen = match self.whence {
            Whence::Oldest => candidates.first().map(|c| (c, StartAt::Beginning)),
            Whence::Newest => candidates.last().map(|c| (c, StartAt::End)),
        };
        if let Some((c, start)) = chosen {
            info!(path = %c.path.display(), "Opening first file in directory");
            self.tail = Some(FileTail::open(&c.path, start)?);
        }
        Ok(())
    }

    /// The next file after the current one, never the current file itself.
    fn next_file(&self, current: &FileTail) -> Result<Option<Candidate>, SourceError> {
        let candidates = self.list()?;
        // The handle still knows even if the file moved out of the directory.
        let current_modified = current.modified()?;
        let current_path = current.path().to_path_buf();

        Ok(candidates.into_iter().find(|c| {
            !c.identity.same_file(current.identity())
                && (c.modified, c.path.as_path()) > (current_modified, current_path.as_path())
        }))
    }
}

#[async_trait]
impl CollectSource for SequentialFileSource {
    fn kind(&self) -> &'static str {
        "dir"
    }

    async fn collect(&mut self) -> Result<SourceOutput, SourceError> {
        if self.tail.is_none() {
            self.open_initial()?;
        }

        let mut lines = Vec::new();
        while lines.len() < self.max_lines {
            let Some(tail) = self.tail.as_mut() else {
                break;
            };
            lines.extend(tail.read_lines(self.max_lines - lines.len())?);
            if lines.len() >= self.max_lines {
                break;
            }

            // Drained; move on only if a genuinely new file exists. Otherwise
            // wait for the next tick.
            let next = match self.tail.as_ref() {
                Some(tail) => self.next_file(tail)?,
                None => None,
            };
            match next {
                Some(c) => {
                    info!(path = %c.path.display(), "Advancing to next file in directory");
                    self.tail = Some(FileTail::open(&c.path, StartAt::Beginning)?);
                }
                None => break,
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
        self.saved = cursors.into_iter().next();
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
    use std::fs::{self, File, FileTimes, OpenOptions};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_at(path: &Path, text: &str, secs: u64) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        set_mtime(path, secs);
    }

    fn set_mtime(path: &Path, secs: u64) {
        let f = File::options().write(true).open(path).unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs);
        f.set_times(FileTimes::new().set_modified(t)).unwrap();
    }

    fn source(dir: &Path, max_lines: usize) -> SequentialFileSource {
        SequentialFileSource::new(dir.to_path_buf(), &DirConfig::default(), Whence::Oldest, max_lines)
            .unwrap()
    }

    fn lines(output: SourceOutput) -> Vec<String> {
        match output {
            SourceOutput::Lines(lines) => lines,
            SourceOutput::Records(_) => panic!("expected lines"),
        }
    }

    #[tokio::test]
    async fn test_reads_files_in_modification_order() {
        let dir = TempDir::new().unwrap();
        // Lexical order disagrees with rotation order on purpose.
        write_at(&dir.path().join("b.log"), "first\n", 10);
        write_at(&dir.path().join("a.log"), "second\n", 20);

        let mut src = source(dir.path(), 100);
        assert_eq!(lines(src.collect().await.unwrap()), vec!["first", "second"]);
        assert!(src.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filters_hidden_and_suffixes() {
        let dir = TempDir::new().unwrap();
        write_at(&dir.path().join(".hidden"), "hidden\n", 1);
        write_at(&dir.path().join("app.pid"), "123\n", 2);
        write_at(&dir.path().join("app.log"), "visible\n", 3);

        let mut src = source(dir.path(), 100);
        assert_eq!(lines(src.collect().await.unwrap()), vec!["visible"]);
    }

    #[tokio::test]
    async fn test_valid_pattern_limits_files() {
        let dir = TempDir::new().unwrap();
        write_at(&dir.path().join("app.log"), "keep\n", 1);
        write_at(&dir.path().join("app.txt"), "skip\n", 2);

        let config = DirConfig {
            valid_file_pattern: "*.log".to_string(),
            ..DirConfig::default()
        };
        let mut src =
            SequentialFileSource::new(dir.path().to_path_buf(), &config, Whence::Oldest, 100).unwrap();
        assert_eq!(lines(src.collect().await.unwrap()), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_rotation_neither_duplicates_nor_skips() {
        let dir = TempDir::new().unwrap();
        let current = dir.path().join("app.log");
        write_at(&current, "1\n2\n", 10);

        let mut src = source(dir.path(), 100);
        assert_eq!(lines(src.collect().await.unwrap()), vec!["1", "2"]);

        // More data lands in the old file, then it is rotated and a new one begins.
        write_at(&current, "3\n", 11);
        fs::rename(&current, dir.path().join("app.log.1")).unwrap();
        write_at(&current, "4\n", 12);

        assert_eq!(lines(src.collect().await.unwrap()), vec!["3", "4"]);

        write_at(&current, "5\n", 13);
        assert_eq!(lines(src.collect().await.unwrap()), vec!["5"]);
    }

    #[tokio::test]
    async fn test_waits_when_no_next_file() {
        let dir = TempDir::new().unwrap();
        write_at(&dir.path().join("app.log"), "only\n", 10);

        let mut src = source(dir.path(), 100);
        assert_eq!(lines(src.collect().await.unwrap()), vec!["only"]);
        assert!(src.collect().await.unwrap().is_empty());
        assert!(src.collect().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_directory_is_transient_error() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("logs");
        fs::create_dir(&sub).unwrap();
        let mut src = source(&sub, 100);

        fs::remove_dir(&sub).unwrap();
        assert!(matches!(src.collect().await, Err(SourceError::Io(_))));
    }

    #[tokio::test]
    async fn test_resume_follows_renamed_file_by_identity() {
        let dir = TempDir::new().unwrap();
        let current = dir.path().join("app.log");
        write_at(&current, "a\nb\n", 10);

        let mut first = source(dir.path(), 1);
        assert_eq!(lines(first.collect().await.unwrap()), vec!["a"]);
        let cursors = first.cursors();

        fs::rename(&current, dir.path().join("app.log.1")).unwrap();
        set_mtime(&dir.path().join("app.log.1"), 10);
        write_at(&current, "c\n", 20);

        let mut second = source(dir.path(), 100);
        second.restore_cursors(cursors);
        assert_eq!(lines(second.collect().await.unwrap()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_resume_skips_files_read_before_saved_one_vanished() {
        let dir = TempDir::new().unwrap();
        let current = dir.path().join("app.log");
        write_at(&dir.path().join("app.log.1"), "old1\nold2\n", 10);
        write_at(&current, "cur1\ncur2\n", 20);

        let mut first = source(dir.path(), 100);
        assert_eq!(
            lines(first.collect().await.unwrap()),
            vec!["old1", "old2", "cur1", "cur2"]
        );
        let cursors = first.cursors();
        let last_read = SystemTime::from(cursors[0].last_activity);

        // Deleted while the agent was down, then recreated.
        fs::remove_file(&current).unwrap();
        write_at(&current, "new1\n", 0);
        File::options()
            .write(true)
            .open(&current)
            .unwrap()
            .set_times(FileTimes::new().set_modified(last_read + Duration::from_secs(60)))
            .unwrap();

        let mut second = source(dir.path(), 100);
        second.restore_cursors(cursors);
        assert_eq!(lines(second.collect().await.unwrap()), vec!["new1"]);
    }

    #[tokio::test]
    async fn test_resume_waits_when_nothing_newer_than_vanished_file() {
        let dir = TempDir::new().unwrap();
        let current = dir.path().join("app.log");
        write_at(&dir.path().join("app.log.1"), "old\n", 10);
        write_at(&current, "cur\n", 20);

        let mut first = source(dir.path(), 100);
        assert_eq!(lines(first.collect().await.unwrap()), vec!["old", "cur"]);
        let cursors = first.cursors();
        fs::remove_file(&current).unwrap();

        let mut second = source(dir.path(), 100);
        second.restore_cursors(cursors.clone());
        assert!(second.collect().await.unwrap().is_empty());
        assert_eq!(second.cursors(), cursors);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let dir = TempDir::new().unwrap();
        let config = DirConfig {
            valid_file_pattern: "[".to_string(),
            ..DirConfig::default()
        };
        let err = SequentialFileSource::new(dir.path().to_path_buf(), &config, Whence::Oldest, 10);
        assert!(matches!(err, Err(SourceError::InvalidPattern { .. })));
    }
}
