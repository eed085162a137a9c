use crate::source::Record;
use crate::transform::{Stage, Transform, TransformError, TransformStats};
use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

// Epoch values of any precision are normalised to this many digits (microseconds).
const EPOCH_MICROS_DIGITS: usize = 16;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%d/%b/%Y:%H:%M:%S",
];

/// Rewrites a date field, given as epoch or as a string, into a normalised
/// timestamp shifted by a whole number of hours.
pub struct DateTransform {
    key: String,
    offset: i32,
    input_layout: Option<String>,
    layout: Option<String>,
    stats: TransformStats,
}

impl DateTransform {
    pub fn new(key: String, offset: i32, input_layout: Option<String>, layout: Option<String>) -> Self {
        Self {
            key,
            offset,
            input_layout,
            layout,
            stats: TransformStats::default(),
        }
    }

    fn convert(&self, value: &Value) -> Result<String, String> {
        let parsed = match value {
            Value::Number(n) => match n.as_i64() {
                Some(epoch) => from_epoch(epoch)?,
                None => return Err(format!("cannot read {} as an integer epoch", n)),
            },
            Value::String(s) => self.parse_str(s)?,
            other => return Err(format!("cannot parse {} as a date", other)),
        };

        let shifted = parsed + Duration::hours(i64::from(self.offset));
        Ok(match &self.layout {
            Some(layout) => shifted.format(layout).to_string(),
            None => shifted.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        })
    }

    fn parse_str(&self, s: &str) -> Result<DateTime<Utc>, String> {
        let s = s.trim();
        if let Some(layout) = &self.input_layout {
            if let Ok(dt) = DateTime::parse_from_str(s, layout) {
                return Ok(dt.with_timezone(&Utc));
            }
            return NaiveDateTime::parse_from_str(s, layout)
                .map(|naive| naive.and_utc())
                .map_err(|e| format!("cannot parse '{}' with layout '{}': {}", s, layout, e));
        }

        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
            return Ok(dt.with_timezone(&Utc));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
                return Ok(naive.and_utc());
            }
        }
        if let Ok(epoch) = s.parse::<i64>() {
            return from_epoch(epoch);
        }
        Err(format!("unrecognised date '{}'", s))
    }
}

fn from_epoch(epoch: i64) -> Result<DateTime<Utc>, String> {
    if epoch < 0 {
        return Err(format!("negative epoch {}", epoch));
    }
    let mut digits = epoch.to_string();
    digits.truncate(EPOCH_MICROS_DIGITS);
    while digits.len() < EPOCH_MICROS_DIGITS {
        digits.push('0');
    }
    let micros: i64 = digits.parse().map_err(|e| format!("{}", e))?;

    let secs = micros / 1_000_000;
    let nanos = ((micros % 1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .ok_or_else(|| format!("epoch {} out of range", epoch))
}

impl Transform for DateTransform {
    fn name(&self) -> &'static str {
        "date"
    }

    fn stage(&self) -> Stage {
        Stage::AfterParser
    }

    fn transform(&mut self, mut records: Vec<Record>) -> (Vec<Record>, Option<TransformError>) {
        let mut failed = 0;
        let mut last = None;

        for record in &mut records {
            let result = match record.get(&self.key) {
                Some(value) => self.convert(value),
                None => Err(format!("key '{}' not found", self.key)),
            };
            match result {
                Ok(converted) => {
                    record.insert(self.key.clone(), Value::String(converted));
                }
                Err(e) => {
                    failed += 1;
                    last = Some(e);
                }
            }
        }

        self.stats.record(records.len(), failed, last.clone());
        let err = last.map(|last| TransformError::Partial {
            transform: "date",
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
                transform: "date",
                stage: Stage::BeforeParser,
            }),
        )
    }

    fn stats(&self) -> TransformStats {
        self.stats.clone()
    }
}
