use crate::sink::{Sink, SinkError};
use crate::source::Record;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Appends records to a local file, one JSON object per line.
pub struct FileSink {
    name: String,
    path: PathBuf,
    file: Option<File>,
}

impl FileSink {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            file: None,
        }
    }

    async fn file(&mut self) -> Result<&mut File, SinkError> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!(sink = %self.name, path = %self.path.display(), "Opened output file");
            self.file = Some(file);
        }
        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(SinkError::Io(std::io::Error::other("output file not open"))),
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, records: &[Record]) -> Result<(), SinkError> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let file = self.file().await?;
        if let Err(e) = file.write_all(&buf).await {
            // Reopen on the next send; the handle may be stale.
            self.file = None;
            return Err(e.into());
        }
        file.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }

    /// Truncates the output so a deliberate re-read does not duplicate lines.
    async fn reset(&mut self) -> Option<Result<(), SinkError>> {
        self.file = None;
        let result = match OpenOptions::new().write(true).open(&self.path).await {
            Ok(file) => file.set_len(0).await.map_err(SinkError::from),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        };
        Some(result)
    }
}
