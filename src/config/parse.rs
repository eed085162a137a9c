use super::types::*;
use super::types::sink_names as sink_names_of;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;
    parse_config(&yaml_string)
}

/// Parses, expands and validates a YAML config document.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = serde_yaml::from_str(&yaml_string)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let unexpanded = unexpanded_env_vars(yaml_string);
    match unexpanded.as_slice() {
        [] => Ok(()),
        [one] => Err(ConfigError::Validation(format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            one
        ))),
        many => Err(ConfigError::Validation(format!(
            "Environment variables are not set: {}",
            many.join(", ")
        ))),
    }
}

fn expand_paths(config: &mut Config) {
    config.storage.meta_dir = expand_tilde(&config.storage.meta_dir);
    if let Some(plugins) = config.plugins.as_mut() {
        plugins.dir = expand_tilde(&plugins.dir);
    }

    for runner in &mut config.runners {
        if let SourceKind::File(source) = &mut runner.source {
            source.path = expand_tilde(&PathBuf::from(&source.path))
                .to_string_lossy()
                .into_owned();
        }
        for sink in &mut runner.sinks {
            if let SinkConfig::File(file) = sink {
                file.path = expand_tilde(&file.path);
            }
        }
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.runners.is_empty() {
        errors.push("config must define at least one runner under 'runners'".to_string());
    }

    let mut names = HashSet::new();
    for (i, runner) in config.runners.iter().enumerate() {
        let context = if runner.name.is_empty() {
            format!("runners[{}]", i)
        } else {
            format!("runner '{}'", runner.name)
        };
        validate_runner(&context, runner, config, &mut errors);

        if !runner.name.is_empty() && !names.insert(runner.name.as_str()) {
            errors.push(format!("{}: duplicate runner name", context));
        }
    }

    if config.storage.backup_interval.is_zero() {
        errors.push("storage.backup_interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_runner(context: &str, runner: &RunnerConfig, config: &Config, errors: &mut Vec<String>) {
    if runner.name.is_empty() {
        errors.push(format!("{}: name cannot be empty", context));
    } else if !is_valid_runner_name(&runner.name) {
        // The name becomes a file name under the meta directory.
        errors.push(format!(
            "{}: name may only contain letters, digits, '-', '_' and '.'",
            context
        ));
    }

    match &runner.source {
        SourceKind::File(source) => validate_file_source(context, source, errors),
        SourceKind::Plugin(plugin) => {
            if plugin.plugin.is_empty() {
                errors.push(format!("{}: source.plugin cannot be empty", context));
            }
            if config.plugins.is_none() {
                errors.push(format!(
                    "{}: plugin sources require a top-level 'plugins.dir'",
                    context
                ));
            }
        }
    }

    let mut sink_names = HashSet::new();
    for name in sink_names_of(&runner.sinks) {
        if !sink_names.insert(name.clone()) {
            errors.push(format!("{}: duplicate sink name '{}'", context, name));
        }
    }

    if runner.sinks.is_empty() {
        errors.push(format!("{}: at least one sink is required", context));
    }
    for (i, sink) in runner.sinks.iter().enumerate() {
        if let SinkConfig::Http(http) = sink {
            if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                errors.push(format!(
                    "{}: sinks[{}].url must start with http:// or https://",
                    context, i
                ));
            }
        }
    }

    for (i, transform) in runner.transforms.iter().enumerate() {
        match transform {
            TransformConfig::Date { key, offset, .. } => {
                if key.is_empty() {
                    errors.push(format!("{}: transforms[{}].key cannot be empty", context, i));
                }
                if !(-23..=23).contains(offset) {
                    errors.push(format!(
                        "{}: transforms[{}].offset must be between -23 and 23 hours",
                        context, i
                    ));
                }
            }
            TransformConfig::Rename { key, new_key } => {
                if key.is_empty() || new_key.is_empty() {
                    errors.push(format!(
                        "{}: transforms[{}] needs both key and new_key",
                        context, i
                    ));
                }
            }
            TransformConfig::Trim => {}
        }
    }

    if runner.batch.max_batch_len == 0 {
        errors.push(format!("{}: batch.max_batch_len must be at least 1", context));
    }
    if runner.batch.collect_interval.is_some_and(|d| d.is_zero()) {
        errors.push(format!("{}: batch.collect_interval must be greater than zero", context));
    }
    if runner.delivery.max_send_attempts == 0 {
        errors.push(format!("{}: delivery.max_send_attempts must be at least 1", context));
    }
}

fn validate_file_source(context: &str, source: &SourceConfig, errors: &mut Vec<String>) {
    if source.path.is_empty() {
        errors.push(format!("{}: source.path cannot be empty", context));
    }
    if source.max_lines_per_collect == 0 {
        errors.push(format!("{}: source.max_lines_per_collect must be at least 1", context));
    }
    if source.tailx.max_open_files == 0 {
        errors.push(format!("{}: source.tailx.max_open_files must be at least 1", context));
    }
    if let Err(e) = glob::Pattern::new(&source.dir.valid_file_pattern) {
        errors.push(format!(
            "{}: source.dir.valid_file_pattern '{}' is invalid: {}",
            context, source.dir.valid_file_pattern, e
        ));
    }
}

fn is_valid_runner_name(name: &str) -> bool {
    name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
