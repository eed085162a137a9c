pub fn generate_starter_config() -> String {
    r#"# =============================================================================
# LOGSHIP CONFIGURATION
# =============================================================================
# Each runner collects from one source, parses and transforms the records, and
# delivers them in batches to one or more sinks.
#
# Config file locations (in order of precedence):
#   1. Path specified via --config argument
#   2. ~/.config/logship/config.yml
#   3. /etc/logship/config.yml
#
# Values of the form $env{NAME} are replaced from the environment before parsing.

# =============================================================================
# STORAGE
# =============================================================================
# Read positions and delivery statistics survive restarts here, one file per
# runner.

storage:
  meta_dir: ~/.local/share/logship/meta
  # How often every runner's statistics are written out
  backup_interval: 60s

# =============================================================================
# PLUGINS (optional)
# =============================================================================
# Each plugin is a directory holding one executable named <cycle>_<name>, for
# example 60_cpu. It is run as `<exe> -f <conf>` and must print JSON to stdout.

plugins:
  dir: /opt/logship/plugins

# =============================================================================
# RUNNERS
# =============================================================================

runners:
  # A single file, followed across rotations.
  - name: app
    source:
      type: file
      path: /var/log/app/app.log
      # Where to start reading files with no saved position: oldest | newest
      whence: oldest
    parser: json
    transforms:
      - type: date
        key: time
        # Hours to shift the parsed time by
        offset: 0
    sinks:
      - type: file
        path: /var/lib/logship/app.jsonl
    batch:
      collect_interval: 3s
      max_batch_len: 10
      max_batch_interval: 30s
    delivery:
      max_send_attempts: 3
      retry_backoff: 1s
      stop_timeout: 10s

  # A directory of rotated files, read oldest first as one stream.
  - name: nginx
    source:
      type: file
      path: /var/log/nginx/
      dir:
        ignore_hidden: true
        valid_file_pattern: "access.log*"
    parser: raw
    transforms:
      - type: trim
    add_hostname: true
    sinks:
      - type: http
        url: http://localhost:8080/ingest
        timeout: 30s

  # Every file a glob matches, tailed concurrently.
  - name: services
    source:
      type: file
      path: /var/log/services/*.log
      whence: newest
      tailx:
        # Stop tailing files idle for this long
        expire: 24h
        # How often to look for newly matching files
        stat_interval: 3m
        max_open_files: 256
    sinks:
      - type: file
        path: /var/lib/logship/services.jsonl

  # A metrics plugin; runs at the plugin's own cycle unless collect_interval is set.
  - name: host_cpu
    source:
      type: plugin
      plugin: cpu
      config:
        percpu: false
    sinks:
      - type: file
        path: /var/lib/logship/cpu.jsonl
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::config::types::SourceKind;

    #[test]
    fn test_starter_config_is_valid() {
        let config = parse_config(&generate_starter_config()).unwrap();
        assert_eq!(config.runners.len(), 4);
        assert!(config.uses_plugins());
        assert!(matches!(config.runners[3].source, SourceKind::Plugin(_)));
    }
}
