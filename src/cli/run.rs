use crate::config::parse::load_config;
use crate::config::Config;
use crate::registry::{RegistryError, RunnerRegistry};
use crate::runner::{Runner, RunnerError};
use crate::source::{PluginRegistry, SourceError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::parse::ConfigError),

    #[error("plugin discovery failed: {0}")]
    Plugins(#[from] SourceError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("no runner could be started")]
    NothingToRun,

    #[error("signal error: {0}")]
    Signal(#[from] std::io::Error),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match config_path {
        Some(path) => path,
        None => {
            eprintln!("Error: config not found");
            eprintln!("Searched locations:");
            eprintln!("  ~/.config/logship/config.yml");
            eprintln!("  {}", crate::config::SYSTEM_CONFIG_PATH);
            eprintln!("\nUse --config <path> to specify a config file, or run 'logship config init' to generate one.");
            std::process::exit(1);
        }
    };

    run_agent(&config_path).await.map_err(|e| e.into())
}

async fn run_agent(config_path: &Path) -> Result<(), RunError> {
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(config_path)?;

    let plugins = match &config.plugins {
        Some(p) => {
            let registry = PluginRegistry::discover(&p.dir)?;
            info!(dir = %p.dir.display(), count = registry.len(), "Discovered plugins");
            Some(registry)
        }
        None => None,
    };

    let mut registry = build_registry(&config, plugins.as_ref())?;
    if registry.is_empty() {
        return Err(RunError::NothingToRun);
    }

    let failed = registry.start_all();
    if failed.len() == registry.len() {
        registry.stop_all().await;
        return Err(RunError::NothingToRun);
    }
    info!(
        runners = registry.len() - failed.len(),
        "Agent started, press Ctrl+C to shutdown"
    );

    let mut backup = tokio::time::interval(config.storage.backup_interval);
    backup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing worth saving yet.
    backup.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Shutdown signal received");
                break;
            }
            _ = backup.tick() => registry.backup_all(),
        }
    }

    registry.stop_all().await;
    info!("Agent shutdown complete");
    Ok(())
}

/// Creates a runner per configured entry. A runner whose source or sinks
/// cannot be built is logged and skipped so the others still run.
fn build_registry(
    config: &Config,
    plugins: Option<&PluginRegistry>,
) -> Result<RunnerRegistry, RunError> {
    let mut registry = RunnerRegistry::new();
    for runner_config in &config.runners {
        match Runner::from_config(runner_config, plugins, &config.storage.meta_dir) {
            Ok(runner) => registry.add(runner)?,
            Err(e) => log_build_failure(&runner_config.name, &e),
        }
    }
    Ok(registry)
}

fn log_build_failure(name: &str, e: &RunnerError) {
    match e {
        RunnerError::Source(_) | RunnerError::PluginsNotLoaded { .. } => {
            error!(runner = %name, error = %e, "Runner not started: bad source configuration")
        }
        _ => warn!(runner = %name, error = %e, "Runner not started"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use tempfile::TempDir;

    #[test]
    fn test_bad_runner_does_not_block_others() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "hello\n").unwrap();

        let yaml = format!(
            r#"
runners:
  - name: good
    source:
      type: file
      path: {log}
    sinks:
      - type: file
        path: {dir}/good.out
  - name: missing
    source:
      type: file
      path: {dir}/does-not-exist.log
    sinks:
      - type: file
        path: {dir}/missing.out
storage:
  meta_dir: {dir}/meta
"#,
            log = log.display(),
            dir = dir.path().display()
        );
        let config = parse_config(&yaml).unwrap();

        let registry = build_registry(&config, None).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["good"]);
    }
}
