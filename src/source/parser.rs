use crate::source::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Turns raw lines into records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineParser {
    /// Wraps each line as `{"raw": line}`.
    #[default]
    Raw,
    /// Each line must be a JSON object.
    Json,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub records: Vec<Record>,
    pub success: u64,
    pub errors: u64,
}

impl LineParser {
    pub fn name(&self) -> &'static str {
        match self {
            LineParser::Raw => "raw",
            LineParser::Json => "json",
        }
    }

    pub fn parse(&self, lines: Vec<String>) -> ParseOutcome {
        let mut outcome = ParseOutcome {
            records: Vec::with_capacity(lines.len()),
            ..ParseOutcome::default()
        };

        for line in lines {
            match self.parse_line(&line) {
                Some(record) => {
                    outcome.records.push(record);
                    outcome.success += 1;
                }
                None => {
                    debug!(parser = self.name(), line = %line, "Dropping unparseable line");
                    outcome.errors += 1;
                }
            }
        }
        outcome
    }

    fn parse_line(&self, line: &str) -> Option<Record> {
        match self {
            LineParser::Raw => {
                let mut record = Record::new();
                record.insert("raw".to_string(), Value::String(line.to_string()));
                Some(record)
            }
            LineParser::Json => match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_never_fails() {
        let outcome = LineParser::Raw.parse(vec!["hello".into(), "".into()]);
        assert_eq!(outcome.success, 2);
        assert_eq!(outcome.errors, 0);
        assert_eq!(outcome.records[0]["raw"], "hello");
    }

    #[test]
    fn test_json_counts_failures() {
        let lines = vec![
            r#"{"level":"info","n":1}"#.to_string(),
            "not json".to_string(),
            "[1,2]".to_string(),
        ];
        let outcome = LineParser::Json.parse(lines);
        assert_eq!(outcome.success, 1);
        assert_eq!(outcome.errors, 2);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0]["n"], 1);
    }

    #[test]
    fn test_deserializes_lowercase() {
        let parser: LineParser = serde_yaml::from_str("json").unwrap();
        assert_eq!(parser, LineParser::Json);
    }
}
