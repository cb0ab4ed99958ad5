//! Outbound directory scanning and completion moves.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::debug;

use super::file_sink::timestamp;
use crate::types::PublisherProfile;

/// Finds outbound files and moves them away once published.
#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    source: PathBuf,
    completion: PathBuf,
    extensions: Vec<String>,
}

impl DirectoryScanner {
    pub fn new(profile: &PublisherProfile) -> Self {
        Self {
            source: profile.file_directory.clone(),
            completion: profile.completion_directory.clone(),
            extensions: profile.extensions(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Whether `path` passes the extension filter. An empty filter
    /// matches everything.
    pub fn matches(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let name = name.to_lowercase();
        self.extensions.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    /// Matching regular files in the source directory, oldest name first.
    ///
    /// A missing source directory yields no files.
    pub async fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.source).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(directory = %self.source.display(), "Source directory does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if self.matches(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Move a published file to the completion directory as
    /// `{file_name}_{timestamp}`.
    pub async fn complete(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.completion).await?;
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?
            .to_string_lossy();

        let stem = format!("{}_{}", name, timestamp(Local::now()));
        let mut target = self.completion.join(&stem);
        let mut attempt = 0u32;
        while tokio::fs::try_exists(&target).await? {
            attempt += 1;
            target = self.completion.join(format!("{}_{}", stem, attempt));
        }

        if tokio::fs::rename(path, &target).await.is_err() {
            // Different filesystem.
            tokio::fs::copy(path, &target).await?;
            tokio::fs::remove_file(path).await?;
        }
        Ok(target)
    }
}
