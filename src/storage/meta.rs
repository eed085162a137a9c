use crate::runner::status::RunnerStatus;
use crate::source::Cursor;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

const CURRENT_VERSION: u32 = 1;
const CURSORS_FILE: &str = "cursors.json";
const STATISTICS_FILE: &str = "statistics.json";

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt meta file '{path}': {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported meta version {found} in '{path}'")]
    InvalidVersion { path: PathBuf, found: u32 },
}

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub success: u64,
    pub errors: u64,
}

/// The durable subset of a runner's status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistic {
    pub reader_count: u64,
    pub parser: Counts,
    pub sinks: BTreeMap<String, Counts>,
}

impl From<&RunnerStatus> for Statistic {
    fn from(status: &RunnerStatus) -> Self {
        Self {
            reader_count: status.read_count,
            parser: Counts {
                success: status.parser.success,
                errors: status.parser.errors,
            },
            sinks: status
                .sinks
                .iter()
                .map(|(name, s)| {
                    (
                        name.clone(),
                        Counts {
                            success: s.success,
                            errors: s.errors,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    data: T,
}

/// Per-runner persisted state under `<root>/<runner>/`.
#[derive(Debug, Clone)]
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    pub fn open(root: &Path, runner: &str) -> Result<Self> {
        let dir = root.join(runner);
        fs::create_dir_all(&dir).map_err(|source| MetaError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read_cursors(&self) -> Result<Vec<Cursor>> {
        Ok(self.read(CURSORS_FILE)?.unwrap_or_default())
    }

    pub fn write_cursors(&self, cursors: &[Cursor]) -> Result<()> {
        self.write(CURSORS_FILE, &cursors)
    }

    pub fn read_statistics(&self) -> Result<Option<Statistic>> {
        self.read(STATISTICS_FILE)
    }

    pub fn write_statistics(&self, statistic: &Statistic) -> Result<()> {
        self.write(STATISTICS_FILE, statistic)
    }

    /// Forgets saved read positions. Statistics are kept.
    pub fn reset_cursors(&self) -> Result<()> {
        let path = self.dir.join(CURSORS_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(MetaError::Io { path, source }),
        }
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let path = self.dir.join(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(MetaError::Io { path, source }),
        };

        let envelope: Envelope<T> = serde_json::from_reader(BufReader::new(file))
            .map_err(|source| MetaError::Corrupt {
                path: path.clone(),
                source,
            })?;
        if envelope.version != CURRENT_VERSION {
            return Err(MetaError::InvalidVersion {
                path,
                found: envelope.version,
            });
        }
        Ok(Some(envelope.data))
    }

    fn write<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let envelope = Envelope {
            version: CURRENT_VERSION,
            saved_at: Utc::now(),
            data,
        };
        atomic_write(&self.dir.join(name), &envelope)
    }
}

/// Write to a temp file, then rename over the target.
fn atomic_write<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let io_err = |source| MetaError::Io {
        path: path.to_path_buf(),
        source,
    };

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| MetaError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;
    drop(writer);

    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(e));
    }
    Ok(())
}
