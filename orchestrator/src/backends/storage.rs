use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use super::PersistenceSink;

/// Writes artifacts under a root directory; the locator is the file path.
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

#[async_trait]
impl PersistenceSink for FileSink {
    async fn persist(&self, key: &str, data: &[u8]) -> std::io::Result<String> {
        // keys are generated by the pipeline, never by users, but keep them flat
        let name = key.replace(['/', '\\'], "_");
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        tokio::fs::write(&path, data).await?;
        info!(path = %path.display(), bytes = data.len(), "Artifact written");
        Ok(path.display().to_string())
    }
}
