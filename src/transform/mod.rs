pub mod date;
pub mod rename;
pub mod trim;

use crate::config::types::TransformConfig;
use crate::source::Record;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use date::DateTransform;
pub use rename::RenameTransform;
pub use trim::TrimTransform;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{transform}: {failed} of {total} records failed, last error: {last}")]
    Partial {
        transform: &'static str,
        failed: usize,
        total: usize,
        last: String,
    },

    #[error("{transform} does not support the {stage:?} stage")]
    Unsupported { transform: &'static str, stage: Stage },
}

/// Where in the pipeline a transform runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// On raw lines, before the parser.
    BeforeParser,
    /// On parsed records.
    AfterParser,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformStats {
    pub success: u64,
    pub errors: u64,
    pub last_error: Option<String>,
}

impl TransformStats {
    /// Folds one call's outcome into the running counts.
    pub fn record(&mut self, total: usize, failed: usize, last: Option<String>) {
        self.success += (total - failed) as u64;
        self.errors += failed as u64;
        if last.is_some() {
            self.last_error = last;
        }
    }
}

/// A record or line rewriter. Errors come back alongside the output, which
/// is used regardless.
pub trait Transform: Send {
    fn name(&self) -> &'static str;

    fn stage(&self) -> Stage;

    fn transform(&mut self, records: Vec<Record>) -> (Vec<Record>, Option<TransformError>);

    fn raw_transform(&mut self, lines: Vec<String>) -> (Vec<String>, Option<TransformError>) {
        (lines, None)
    }

    fn stats(&self) -> TransformStats;
}

pub fn build_transform(config: &TransformConfig) -> Box<dyn Transform> {
    match config {
        TransformConfig::Date {
            key,
            offset,
            input_layout,
            layout,
        } => Box::new(DateTransform::new(
            key.clone(),
            *offset,
            input_layout.clone(),
            layout.clone(),
        )),
        TransformConfig::Rename { key, new_key } => {
            Box::new(RenameTransform::new(key.clone(), new_key.clone()))
        }
        TransformConfig::Trim => Box::new(TrimTransform::default()),
    }
}

/// Runs every transform of the given stage in order over the lines, logging
/// errors without stopping.
pub fn apply_raw(transforms: &mut [Box<dyn Transform>], mut lines: Vec<String>) -> Vec<String> {
    for t in transforms.iter_mut().filter(|t| t.stage() == Stage::BeforeParser) {
        let (out, err) = t.raw_transform(lines);
        if let Some(e) = err {
            tracing::warn!(transform = t.name(), error = %e, "Raw transform reported errors");
        }
        lines = out;
    }
    lines
}

pub fn apply(transforms: &mut [Box<dyn Transform>], mut records: Vec<Record>) -> Vec<Record> {
    for t in transforms.iter_mut().filter(|t| t.stage() == Stage::AfterParser) {
        let (out, err) = t.transform(records);
        if let Some(e) = err {
            tracing::warn!(transform = t.name(), error = %e, "Transform reported errors");
        }
        records = out;
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_apply_respects_stage_and_order() {
        let mut transforms = vec![
            build_transform(&TransformConfig::Trim),
            build_transform(&TransformConfig::Rename {
                key: "a".into(),
                new_key: "b".into(),
            }),
            build_transform(&TransformConfig::Rename {
                key: "b".into(),
                new_key: "c".into(),
            }),
        ];

        let lines = apply_raw(&mut transforms, vec!["  x  ".to_string()]);
        assert_eq!(lines, vec!["x"]);

        let records = apply(&mut transforms, vec![record(json!({"a": 1}))]);
        assert_eq!(records[0].get("c"), Some(&json!(1)));
        assert!(records[0].get("a").is_none());
    }

    #[test]
    fn test_errors_do_not_drop_output() {
        let mut transforms = vec![build_transform(&TransformConfig::Rename {
            key: "missing".into(),
            new_key: "x".into(),
        })];
        let records = apply(&mut transforms, vec![record(json!({"a": 1}))]);
        assert_eq!(records.len(), 1);
        assert_eq!(transforms[0].stats().errors, 1);
    }
}
