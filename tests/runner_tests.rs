use logship::config::parse_config;
use logship::runner::{Runner, RunnerState};
use logship::storage::MetaStore;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

fn append(path: &Path, text: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn output_lines(path: &Path) -> Vec<serde_json::Value> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn config_yaml(dir: &Path, source_path: &Path) -> String {
    format!(
        r#"
runners:
  - name: app
    source:
      type: file
      path: {source}
    parser: json
    transforms:
      - type: date
        key: ts
      - type: rename
        key: msg
        new_key: message
    sinks:
      - type: file
        path: {dir}/out.jsonl
    batch:
      collect_interval: 10ms
      max_batch_len: 100
      max_batch_interval: 1h
storage:
  meta_dir: {dir}/meta
"#,
        source = source_path.display(),
        dir = dir.display()
    )
}

fn build(dir: &Path, source_path: &Path) -> Runner {
    let config = parse_config(&config_yaml(dir, source_path)).unwrap();
    Runner::from_config(&config.runners[0], None, &config.storage.meta_dir).unwrap()
}

#[tokio::test]
async fn test_restart_resumes_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    let out = dir.path().join("out.jsonl");
    append(
        &log,
        "{\"ts\": 1700000000, \"msg\": \"a\"}\nnot json\n{\"ts\": 1700000001, \"msg\": \"b\"}\n",
    );

    let mut runner = build(dir.path(), &log);
    runner.start().unwrap();
    wait_for(|| runner.status().read_count == 3).await;
    runner.stop().await.unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);

    let first = output_lines(&out);
    assert_eq!(first.len(), 2);
    assert_eq!(first[0]["ts"], "2023-11-14T22:13:20Z");
    assert_eq!(first[0]["message"], "a");
    assert!(first[0].get("msg").is_none());

    let status = runner.status();
    assert_eq!(status.parser.success, 2);
    assert_eq!(status.parser.errors, 1);
    assert_eq!(status.sinks["file"].success, 2);

    append(&log, "{\"ts\": 1700000002, \"msg\": \"c\"}\n");

    let mut restarted = build(dir.path(), &log);
    assert_eq!(restarted.status().read_count, 3);
    restarted.start().unwrap();
    wait_for(|| restarted.status().read_count == 4).await;
    restarted.stop().await.unwrap();

    let all = output_lines(&out);
    assert_eq!(all.len(), 3);
    assert_eq!(all[2]["message"], "c");
    assert_eq!(restarted.status().sinks["file"].success, 3);
}

#[tokio::test]
async fn test_reset_rereads_from_start() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("app.log");
    let out = dir.path().join("out.jsonl");
    append(&log, "{\"ts\": 1700000000, \"msg\": \"a\"}\n");

    let mut runner = build(dir.path(), &log);
    runner.start().unwrap();
    wait_for(|| runner.status().read_count == 1).await;
    runner.stop().await.unwrap();
    assert_eq!(output_lines(&out).len(), 1);

    runner.reset().await.unwrap();
    assert!(MetaStore::open(&dir.path().join("meta"), "app")
        .unwrap()
        .read_cursors()
        .unwrap()
        .is_empty());
    // The file sink truncates its output on reset.
    assert!(output_lines(&out).is_empty());

    let mut again = build(dir.path(), &log);
    again.start().unwrap();
    wait_for(|| again.status().read_count == 2).await;
    again.stop().await.unwrap();
    assert_eq!(output_lines(&out).len(), 1);
}

#[tokio::test]
async fn test_directory_source_follows_rotation() {
    let dir = TempDir::new().unwrap();
    let logs = dir.path().join("logs");
    fs::create_dir(&logs).unwrap();
    append(&logs.join("app-1.log"), "{\"msg\": \"one\"}\n{\"msg\": \"two\"}\n");

    let mut runner = build(dir.path(), &logs);
    runner.start().unwrap();
    wait_for(|| runner.status().read_count == 2).await;

    // Ensure the new file sorts after the old one by modification time.
    tokio::time::sleep(Duration::from_millis(20)).await;
    append(&logs.join("app-2.log"), "{\"msg\": \"three\"}\n");
    wait_for(|| runner.status().read_count == 3).await;
    runner.stop().await.unwrap();

    let messages: Vec<_> = output_lines(&dir.path().join("out.jsonl"))
        .iter()
        .map(|v| v["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn test_missing_source_path_fails_at_creation() {
    let dir = TempDir::new().unwrap();
    let config = parse_config(&config_yaml(dir.path(), &dir.path().join("nope.log"))).unwrap();
    assert!(Runner::from_config(&config.runners[0], None, &config.storage.meta_dir).is_err());
}
