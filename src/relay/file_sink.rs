//! Writes consumed messages to an output directory, one file per message.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::messaging::DeliveryHandler;
use crate::types::{ConsumerProfile, Delivery};

/// `ddMMyyyyHHmmssfff`
const TIMESTAMP_FORMAT: &str = "%d%m%Y%H%M%S%3f";

/// Timestamp used in generated file names.
pub fn timestamp(now: DateTime<Local>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// Materializes each delivery as a UTF-8 text file.
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
    extension: String,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            directory: directory.into(),
            extension: extension.to_string(),
        }
    }

    pub fn from_profile(profile: &ConsumerProfile) -> Self {
        Self::new(profile.output_directory(), &profile.output_extension())
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Write `content` to a new file and return its path.
    ///
    /// Existing files are never overwritten: a name taken within the same
    /// millisecond gets a `_{n}` suffix.
    pub async fn write(&self, content: &str) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let stem = timestamp(Local::now());

        let mut attempt = 0u32;
        loop {
            let name = if attempt == 0 {
                format!("{}{}", stem, self.extension)
            } else {
                format!("{}_{}{}", stem, attempt, self.extension)
            };
            let path = self.directory.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path).await {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).await?;
                    file.flush().await?;
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for FileSink {
    async fn handle(&self, delivery: &Delivery) -> anyhow::Result<()> {
        let path = self.write(&delivery.payload_text()).await?;
        info!(
            path = %path.display(),
            routing_key = %delivery.routing_key,
            bytes = delivery.payload.len(),
            "Message written"
        );
        Ok(())
    }
}
