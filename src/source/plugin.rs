use crate::source::{CollectSource, Record, SourceError, SourceOutput};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const CONF_DIR: &str = "conf";

/// A discovered collection plugin: a directory holding one `<cycle>_<name>`
/// executable and a `conf/` directory for per-runner configs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plugin {
    pub name: String,
    pub path: PathBuf,
    pub exec_file: String,
    pub default_cycle: Duration,
}

impl Plugin {
    pub fn executable(&self) -> PathBuf {
        self.path.join(&self.exec_file)
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.path.join(CONF_DIR)
    }
}

/// Plugins found under a plugin directory, keyed by directory name.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Plugin>,
}

impl PluginRegistry {
    pub fn discover(dir: &Path) -> Result<Self, SourceError> {
        if !dir.is_dir() {
            return Err(SourceError::Plugin(format!(
                "plugin directory '{}' does not exist",
                dir.display()
            )));
        }

        let mut plugins = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Some(plugin) = Self::inspect(&name, &entry.path())? {
                debug!(plugin = %plugin.name, exec = %plugin.exec_file, "Discovered plugin");
                plugins.insert(name, plugin);
            }
        }

        info!(dir = %dir.display(), count = plugins.len(), "Plugin discovery complete");
        Ok(Self { plugins })
    }

    fn inspect(name: &str, path: &Path) -> Result<Option<Plugin>, SourceError> {
        let mut files: Vec<String> = std::fs::read_dir(path)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        files.sort();

        for file in files {
            let Some(cycle) = parse_cycle(&file) else {
                continue;
            };
            let conf_dir = path.join(CONF_DIR);
            if !conf_dir.is_dir() {
                std::fs::create_dir_all(&conf_dir)?;
            }
            return Ok(Some(Plugin {
                name: name.to_string(),
                path: path.to_path_buf(),
                exec_file: file,
                default_cycle: Duration::from_secs(cycle),
            }));
        }
        Ok(None)
    }

    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.plugins.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

// "60_cpu" -> 60
fn parse_cycle(file_name: &str) -> Option<u64> {
    let (prefix, rest) = file_name.split_once('_')?;
    if rest.is_empty() {
        return None;
    }
    prefix.parse().ok()
}

/// Runs a plugin once per tick and returns its stdout as records.
pub struct PluginSource {
    plugin: Plugin,
    conf_file: PathBuf,
    timeout: Duration,
}

impl PluginSource {
    /// Writes the runner's plugin config to `conf/<runner>.conf`.
    pub fn new(
        runner: &str,
        plugin: &Plugin,
        config: &serde_json::Map<String, Value>,
        interval: Duration,
    ) -> Result<Self, SourceError> {
        let conf_file = plugin.conf_dir().join(format!("{}.conf", runner));
        let body = serde_json::to_vec_pretty(config)
            .map_err(|e| SourceError::Plugin(format!("failed to encode plugin config: {}", e)))?;
        std::fs::write(&conf_file, body)?;

        Ok(Self {
            plugin: plugin.clone(),
            conf_file,
            timeout: invocation_timeout(interval),
        })
    }

    pub fn conf_file(&self) -> &Path {
        &self.conf_file
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Half a second short of the interval so a slow plugin never overlaps the next tick.
fn invocation_timeout(interval: Duration) -> Duration {
    let timeout = interval.saturating_sub(Duration::from_millis(500));
    if timeout.is_zero() {
        interval
    } else {
        timeout
    }
}

fn decode_records(stdout: &[u8]) -> Result<Vec<Record>, String> {
    match serde_json::from_slice::<Value>(stdout).map_err(|e| e.to_string())? {
        Value::Object(map) => Ok(vec![map]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(format!("expected JSON object, got {}", other)),
            })
            .collect(),
        other => Err(format!("expected JSON object or array, got {}", other)),
    }
}

#[async_trait]
impl CollectSource for PluginSource {
    fn kind(&self) -> &'static str {
        "plugin"
    }

    async fn collect(&mut self) -> Result<SourceOutput, SourceError> {
        let exe = self.plugin.executable();
        if !exe.is_file() {
            return Err(SourceError::Plugin(format!(
                "plugin executable '{}' is missing",
                exe.display()
            )));
        }

        let run = Command::new(&exe)
            .arg("-f")
            .arg(&self.conf_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(SourceError::Plugin(format!(
                    "plugin '{}' timed out after {:?} and was killed",
                    self.plugin.name, self.timeout
                )))
            }
        };

        if !output.status.success() {
            return Err(SourceError::Plugin(format!(
                "plugin '{}' exited with {}: {}",
                self.plugin.name,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if output.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(SourceError::Plugin(format!(
                "plugin '{}' stdout is blank",
                self.plugin.name
            )));
        }

        let records = decode_records(&output.stdout).map_err(|e| {
            SourceError::Plugin(format!(
                "plugin '{}' produced invalid output: {}",
                self.plugin.name, e
            ))
        })?;
        Ok(SourceOutput::Records(records))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        match tokio::fs::remove_file(&self.conf_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(file = %self.conf_file.display(), error = %e, "Failed to remove plugin config");
                Err(e.into())
            }
        }
    }
}
