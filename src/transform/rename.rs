use crate::source::Record;
use crate::transform::{Stage, Transform, TransformError, TransformStats};

/// Moves a value from one key to another.
pub struct RenameTransform {
    key: String,
    new_key: String,
    stats: TransformStats,
}

impl RenameTransform {
    pub fn new(key: String, new_key: String) -> Self {
        Self {
            key,
            new_key,
            stats: TransformStats::default(),
        }
    }
}

impl Transform for RenameTransform {
    fn name(&self) -> &'static str {
        "rename"
    }

    fn stage(&self) -> Stage {
        Stage::AfterParser
    }

    fn transform(&mut self, mut records: Vec<Record>) -> (Vec<Record>, Option<TransformError>) {
        let mut failed = 0;
        for record in &mut records {
            match record.remove(&self.key) {
                Some(value) => {
                    record.insert(self.new_key.clone(), value);
                }
                None => failed += 1,
            }
        }

        let last = (failed > 0).then(|| format!("key '{}' not found", self.key));
        self.stats.record(records.len(), failed, last.clone());
        let err = last.map(|last| TransformError::Partial {
            transform: "rename",
            failed,
            total: records.len(),
            last,
        });
        (records, err)
    }

    fn raw_transform(&mut self, lines: Vec<String>) -> (Vec<String>, Option<TransformError>) {
        (
            lines,
            Some(TransformError::Unsupported {
                transform: "rename",
                stage: Stage::BeforeParser,
            }),
        )
    }

    fn stats(&self) -> TransformStats {
        self.stats.clone()
    }
}
