use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};

use super::{Envelope, Sink};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    path: String,
}

/// Appends one JSON document per reading.
pub struct FileSink {
    path: String,
    file: File,
}

impl FileSink {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)
            .await
            .with_context(|| format!("failed to open file {}", config.path))?;
        Ok(Self {
            file,
            path: config.path,
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn update(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(envelope).context("failed to serialize reading")?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to append to file {}", self.path))?;
        self.file
            .flush()
            .await
            .with_context(|| format!("failed to flush file {}", self.path))?;
        Ok(())
    }
}
