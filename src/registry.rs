use crate::runner::{Runner, RunnerError, RunnerStatus};
use futures::future::join_all;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("runner '{0}' is already registered")]
    Duplicate(String),

    #[error("no runner named '{0}'")]
    NotFound(String),

    #[error("runner error: {0}")]
    Runner(#[from] RunnerError),
}

/// The set of live runners, owned by whoever composes the process.
#[derive(Default)]
pub struct RunnerRegistry {
    runners: BTreeMap<String, Runner>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, runner: Runner) -> Result<(), RegistryError> {
        if self.runners.contains_key(runner.name()) {
            return Err(RegistryError::Duplicate(runner.name().to_string()));
        }
        self.runners.insert(runner.name().to_string(), runner);
        Ok(())
    }

    /// Stops the runner and hands it back.
    pub async fn remove(&mut self, name: &str) -> Result<Runner, RegistryError> {
        let mut runner = self
            .runners
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        runner.stop().await?;
        Ok(runner)
    }

    pub fn get(&self, name: &str) -> Option<&Runner> {
        self.runners.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Runner> {
        self.runners.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.runners.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Starts every runner still in `Created`. Returns the names that failed.
    pub fn start_all(&mut self) -> Vec<String> {
        let mut failed = Vec::new();
        for (name, runner) in self.runners.iter_mut() {
            if let Err(e) = runner.start() {
                warn!(runner = %name, error = %e, "Failed to start runner");
                failed.push(name.clone());
            }
        }
        failed
    }

    pub fn status_all(&self) -> Vec<RunnerStatus> {
        self.runners.values().map(Runner::status).collect()
    }

    /// Writes every runner's statistics, logging failures.
    pub fn backup_all(&self) {
        for runner in self.runners.values() {
            if let Err(e) = runner.backup() {
                warn!(runner = %runner.name(), error = %e, "Failed to back up statistics");
            }
        }
    }

    /// Stops every runner concurrently.
    pub async fn stop_all(&mut self) {
        info!(runners = self.runners.len(), "Stopping all runners");
        let results = join_all(self.runners.values_mut().map(|runner| async move {
            let result = runner.stop().await;
            (runner.name().to_string(), result)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                warn!(runner = %name, error = %e, "Failed to stop runner");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::Whence;
    use crate::runner::{RunnerParts, RunnerSettings, RunnerState};
    use crate::sink::FileSink;
    use crate::source::SingleFileSource;
    use crate::storage::MetaStore;
    use tempfile::TempDir;

    fn runner(dir: &TempDir, name: &str) -> Runner {
        let parts = RunnerParts {
            source: Box::new(SingleFileSource::new(
                dir.path().join(format!("{}.log", name)),
                Whence::Oldest,
                100,
            )),
            transforms: Vec::new(),
            sinks: vec![Box::new(FileSink::new(
                "file".into(),
                dir.path().join(format!("{}.out", name)),
            ))],
        };
        let meta = MetaStore::open(&dir.path().join("meta"), name).unwrap();
        Runner::new(name, RunnerSettings::default(), parts, meta)
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let mut registry = RunnerRegistry::new();
        registry.add(runner(&dir, "a")).unwrap();

        let err = registry.add(runner(&dir, "a")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_stops_runner() {
        let dir = TempDir::new().unwrap();
        let mut registry = RunnerRegistry::new();
        registry.add(runner(&dir, "a")).unwrap();
        assert!(registry.start_all().is_empty());

        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.state(), RunnerState::Stopped);
        assert!(registry.get("a").is_none());
        assert!(matches!(
            registry.remove("a").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_all_and_status_all() {
        let dir = TempDir::new().unwrap();
        let mut registry = RunnerRegistry::new();
        registry.add(runner(&dir, "a")).unwrap();
        registry.add(runner(&dir, "b")).unwrap();
        registry.start_all();

        registry.stop_all().await;
        let statuses = registry.status_all();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == RunnerState::Stopped));
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
