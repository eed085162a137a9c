use crate::config::types::Whence;
use crate::source::identity::{FileIdentity, FileIdentityExt};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::warn;

/// Persisted read position plus the identity of the file it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub identity: FileIdentity,
    pub path: PathBuf,
    pub offset: u64,
    pub last_activity: DateTime<Utc>,
}

impl Cursor {
    pub fn new(identity: FileIdentity, path: PathBuf, offset: u64) -> Self {
        Self {
            identity,
            path,
            offset,
            last_activity: Utc::now(),
        }
    }

    /// Resets the offset when the file shrank beneath it. Returns true if a
    /// truncation was detected.
    pub fn check_truncation(&mut self, current_size: u64) -> bool {
        if self.offset > current_size {
            self.offset = 0;
            true
        } else {
            false
        }
    }
}

/// Where to position a freshly opened file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    Beginning,
    End,
    Offset(u64),
}

impl StartAt {
    /// Resume from a saved cursor when it still describes this exact file,
    /// otherwise fall back to the configured whence.
    pub fn resolve(identity: &FileIdentity, saved: Option<&Cursor>, whence: Whence) -> Self {
        match saved {
            Some(cursor) if cursor.identity.same_file(identity) => StartAt::Offset(cursor.offset),
            _ => match whence {
                Whence::Oldest => StartAt::Beginning,
                Whence::Newest => StartAt::End,
            },
        }
    }
}

/// An open file being tailed line by line, owning its cursor.
pub struct FileTail {
    file: BufReader<File>,
    cursor: Cursor,
}

impl FileTail {
    pub fn open(path: &Path, start: StartAt) -> io::Result<Self> {
        let file = File::open(path)?;
        let identity = file.identity()?;
        let size = file.metadata()?.len();

        let offset = match start {
            StartAt::Beginning => 0,
            StartAt::End => size,
            StartAt::Offset(offset) if offset > size => {
                warn!(
                    path = %path.display(),
                    offset,
                    size,
                    "Saved offset beyond end of file, file was truncated; reading from start"
                );
                0
            }
            StartAt::Offset(offset) => offset,
        };

        let mut file = BufReader::new(file);
        file.seek(SeekFrom::Start(offset))?;

        Ok(Self {
            file,
            cursor: Cursor::new(identity, path.to_path_buf(), offset),
        })
    }

    /// Opens the path choosing the start position from a saved cursor or whence.
    pub fn resume(path: &Path, saved: Option<&Cursor>, whence: Whence) -> io::Result<Self> {
        let identity = {
            let file = File::open(path)?;
            file.identity()?
        };
        let start = StartAt::resolve(&identity, saved, whence);
        let tail = Self::open(path, start)?;
        if !tail.identity().same_file(&identity) {
            // Replaced between the two opens; the new file is read from the top.
            return Self::open(path, StartAt::Beginning);
        }
        Ok(tail)
    }

    pub fn identity(&self) -> &FileIdentity {
        &self.cursor.identity
    }

    pub fn path(&self) -> &Path {
        &self.cursor.path
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn offset(&self) -> u64 {
        self.cursor.offset
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.cursor.last_activity
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.cursor.last_activity = at;
    }

    /// Size of the file behind the open handle.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.get_ref().metadata()?.len())
    }

    pub fn modified(&self) -> io::Result<SystemTime> {
        self.file.get_ref().metadata()?.modified()
    }

    pub fn at_end(&self) -> io::Result<bool> {
        Ok(self.cursor.offset >= self.size()?)
    }

    /// Reads up to `max` complete lines. A trailing line without its newline
    /// is left unread until the writer finishes it.
    pub fn read_lines(&mut self, max: usize) -> io::Result<Vec<String>> {
        let size = self.size()?;
        if self.cursor.check_truncation(size) {
            warn!(
                path = %self.cursor.path.display(),
                size,
                "File truncated, resetting offset to start"
            );
            self.file.seek(SeekFrom::Start(0))?;
        }

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < max {
            buf.clear();
            let bytes_read = self.file.read_until(b'\n', &mut buf)?;
            if bytes_read == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                self.file.seek(SeekFrom::Start(self.cursor.offset))?;
                break;
            }

            self.cursor.offset += bytes_read as u64;
            let line = String::from_utf8_lossy(&buf);
            lines.push(line.trim_end_matches(&['\n', '\r'][..]).to_string());
        }

        if !lines.is_empty() {
            self.cursor.last_activity = Utc::now();
        }
        Ok(lines)
    }
}
