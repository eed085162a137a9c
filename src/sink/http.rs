use crate::config::types::HttpSinkConfig;
use crate::sink::{Sink, SinkError};
use crate::source::Record;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;

/// Body a receiver may return to report a partly accepted batch.
#[derive(Debug, Deserialize)]
struct DeliveryReport {
    success: u64,
    errors: u64,
    #[serde(default)]
    message: Option<String>,
}

/// POSTs each batch as a JSON array.
#[derive(Debug)]
pub struct HttpSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new(name: String, config: &HttpSinkConfig) -> Result<Self, SinkError> {
        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| SinkError::Rejected {
                status: 0,
                message: format!("invalid header name '{}': {}", key, e),
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| SinkError::Rejected {
                status: 0,
                message: format!("invalid value for header '{}': {}", key, e),
            })?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            name,
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, records: &[Record]) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(records).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        match serde_json::from_str::<DeliveryReport>(&body) {
            Ok(report) if report.errors > 0 => Err(SinkError::Partial {
                success: report.success.min(records.len() as u64),
                errors: report.errors,
                source: report
                    .message
                    .unwrap_or_else(|| "receiver rejected part of the batch".to_string())
                    .into(),
            }),
            _ => Ok(()),
        }
    }
}
