use crate::source::Record;
use crate::transform::{Stage, Transform, TransformError, TransformStats};

/// Strips leading and trailing whitespace from raw lines.
#[derive(Default)]
pub struct TrimTransform {
    stats: TransformStats,
}

impl Transform for TrimTransform {
    fn name(&self) -> &'static str {
        "trim"
    }

    fn stage(&self) -> Stage {
        Stage::BeforeParser
    }

    fn transform(&mut self, records: Vec<Record>) -> (Vec<Record>, Option<TransformError>) {
        (
            records,
            Some(TransformError::Unsupported {
                transform: "trim",
                stage: Stage::AfterParser,
            }),
        )
    }

    fn raw_transform(&mut self, lines: Vec<String>) -> (Vec<String>, Option<TransformError>) {
        let lines: Vec<String> = lines.into_iter().map(|l| l.trim().to_string()).collect();
        self.stats.record(lines.len(), 0, None);
        (lines, None)
    }

    fn stats(&self) -> TransformStats {
        self.stats.clone()
    }
}
