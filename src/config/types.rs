use crate::source::LineParser;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub runners: Vec<RunnerConfig>,
    #[serde(default)]
    pub plugins: Option<PluginDirConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn runner(&self, name: &str) -> Option<&RunnerConfig> {
        self.runners.iter().find(|r| r.name == name)
    }

    pub fn uses_plugins(&self) -> bool {
        self.runners
            .iter()
            .any(|r| matches!(r.source, SourceKind::Plugin(_)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDirConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
    #[serde(default = "default_backup_interval", with = "humantime_serde")]
    pub backup_interval: Duration,
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("~/.local/share/logship/meta")
}

fn default_backup_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            meta_dir: default_meta_dir(),
            backup_interval: default_backup_interval(),
        }
    }
}

/// One collect → parse → transform → deliver task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub name: String,
    pub source: SourceKind,
    #[serde(default)]
    pub parser: LineParser,
    #[serde(default)]
    pub transforms: Vec<TransformConfig>,
    pub sinks: Vec<SinkConfig>,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub add_hostname: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceKind {
    File(SourceConfig),
    Plugin(PluginSourceConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub path: String,
    #[serde(default)]
    pub whence: Option<Whence>,
    #[serde(default = "default_max_lines_per_collect")]
    pub max_lines_per_collect: usize,
    #[serde(default)]
    pub dir: DirConfig,
    #[serde(default)]
    pub tailx: TailxConfig,
}

fn default_max_lines_per_collect() -> usize {
    10_000
}

impl SourceConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            whence: None,
            max_lines_per_collect: default_max_lines_per_collect(),
            dir: DirConfig::default(),
            tailx: TailxConfig::default(),
        }
    }
}

/// Where to start reading a file that has no saved cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Whence {
    Oldest,
    Newest,
}

/// Options for a directory of sequentially rotated files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirConfig {
    #[serde(default = "default_true")]
    pub ignore_hidden: bool,
    #[serde(default = "default_ignore_file_suffix")]
    pub ignore_file_suffix: Vec<String>,
    #[serde(default = "default_valid_file_pattern")]
    pub valid_file_pattern: String,
}

fn default_true() -> bool {
    true
}

fn default_ignore_file_suffix() -> Vec<String> {
    [".pid", ".swap", ".go", ".conf", ".tar.gz", ".tar", ".zip", ".a", ".o", ".so"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_valid_file_pattern() -> String {
    "*".to_string()
}

impl Default for DirConfig {
    fn default() -> Self {
        Self {
            ignore_hidden: true,
            ignore_file_suffix: default_ignore_file_suffix(),
            valid_file_pattern: default_valid_file_pattern(),
        }
    }
}

/// Options for tailing every file a glob matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailxConfig {
    #[serde(default = "default_expire", with = "humantime_serde")]
    pub expire: Duration,
    #[serde(default = "default_stat_interval", with = "humantime_serde")]
    pub stat_interval: Duration,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: usize,
}

fn default_expire() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_stat_interval() -> Duration {
    Duration::from_secs(180)
}

fn default_max_open_files() -> usize {
    256
}

impl Default for TailxConfig {
    fn default() -> Self {
        Self {
            expire: default_expire(),
            stat_interval: default_stat_interval(),
            max_open_files: default_max_open_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSourceConfig {
    pub plugin: String,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

/// When to cut a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Defaults to 3s, or the plugin's own cycle for plugin sources.
    #[serde(default, with = "humantime_serde")]
    pub collect_interval: Option<Duration>,
    #[serde(default = "default_max_batch_len")]
    pub max_batch_len: usize,
    #[serde(default = "default_max_batch_interval", with = "humantime_serde")]
    pub max_batch_interval: Duration,
}

pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(3);

fn default_max_batch_len() -> usize {
    10
}

fn default_max_batch_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            collect_interval: None,
            max_batch_len: default_max_batch_len(),
            max_batch_interval: default_max_batch_interval(),
        }
    }
}

/// How hard to try delivering a batch, and how long to wait on shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(default = "default_stop_timeout", with = "humantime_serde")]
    pub stop_timeout: Duration,
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_stop_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_send_attempts: default_max_send_attempts(),
            retry_backoff: default_retry_backoff(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransformConfig {
    /// Rewrite a date field as RFC 3339.
    Date {
        key: String,
        #[serde(default)]
        offset: i32,
        /// strptime layout for string input; common formats are tried when absent.
        #[serde(default)]
        input_layout: Option<String>,
        /// strftime layout for the output; RFC 3339 when absent.
        #[serde(default)]
        layout: Option<String>,
    },
    Rename {
        key: String,
        new_key: String,
    },
    /// Strip surrounding whitespace from raw lines before parsing.
    Trim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkConfig {
    File(FileSinkConfig),
    Http(HttpSinkConfig),
}

impl SinkConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::File(_) => "file",
            SinkConfig::Http(_) => "http",
        }
    }

    pub fn explicit_name(&self) -> Option<&str> {
        match self {
            SinkConfig::File(c) => c.name.as_deref(),
            SinkConfig::Http(c) => c.name.as_deref(),
        }
    }
}

/// Sink names as they appear in statistics: the configured name, or the sink
/// kind with a position suffix when the kind repeats.
pub fn sink_names(sinks: &[SinkConfig]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    sinks
        .iter()
        .enumerate()
        .map(|(i, sink)| match sink.explicit_name() {
            Some(name) => name.to_string(),
            None if seen.insert(sink.kind()) => sink.kind().to_string(),
            None => format!("{}_{}", sink.kind(), i),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSinkConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpSinkConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let yaml = r#"
runners:
  - name: app
    source:
      type: file
      path: /var/log/app
    sinks:
      - type: file
        path: /tmp/out.jsonl
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let runner = &config.runners[0];
        assert_eq!(runner.parser, LineParser::Raw);
        assert_eq!(runner.batch.max_batch_len, 10);
        assert_eq!(runner.batch.max_batch_interval, Duration::from_secs(30));
        assert!(runner.batch.collect_interval.is_none());
        assert_eq!(runner.delivery.max_send_attempts, 3);
        assert_eq!(runner.delivery.stop_timeout, Duration::from_secs(10));
        assert_eq!(config.storage.backup_interval, Duration::from_secs(60));

        let SourceKind::File(source) = &runner.source else {
            panic!("expected file source");
        };
        assert_eq!(source.max_lines_per_collect, 10_000);
        assert!(source.dir.ignore_hidden);
        assert!(source.dir.ignore_file_suffix.contains(&".pid".to_string()));
        assert_eq!(source.tailx.expire, Duration::from_secs(86_400));
        assert_eq!(source.tailx.stat_interval, Duration::from_secs(180));
        assert_eq!(source.tailx.max_open_files, 256);
    }

    #[test]
    fn test_sink_names_unique() {
        let sinks = vec![
            SinkConfig::File(FileSinkConfig {
                name: None,
                path: "/a".into(),
            }),
            SinkConfig::File(FileSinkConfig {
                name: None,
                path: "/b".into(),
            }),
            SinkConfig::File(FileSinkConfig {
                name: Some("archive".into()),
                path: "/c".into(),
            }),
        ];
        assert_eq!(sink_names(&sinks), vec!["file", "file_1", "archive"]);
    }

    #[test]
    fn test_parses_durations_and_variants() {
        let yaml = r#"
runners:
  - name: cpu
    source:
      type: plugin
      plugin: cpu
      config:
        device: all
    parser: json
    transforms:
      - type: date
        key: time
        offset: -8
      - type: trim
    sinks:
      - type: http
        url: http://localhost:9200/bulk
        timeout: 5s
    batch:
      collect_interval: 500ms
      max_batch_interval: 2m
    delivery:
      retry_backoff: 250ms
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let runner = &config.runners[0];
        assert!(config.uses_plugins());
        assert_eq!(runner.batch.collect_interval, Some(Duration::from_millis(500)));
        assert_eq!(runner.batch.max_batch_interval, Duration::from_secs(120));
        assert_eq!(runner.delivery.retry_backoff, Duration::from_millis(250));
        assert_eq!(runner.transforms[1], TransformConfig::Trim);
        assert!(matches!(
            &runner.sinks[0],
            SinkConfig::Http(h) if h.timeout == Duration::from_secs(5)
        ));
    }
}
