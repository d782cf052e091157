use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::OpenOptions;

/// Liveness file refreshed on every `check` message.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    path: PathBuf,
}

impl HealthCheck {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file if needed and bump its modification time.
    pub async fn touch(&self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
            .await
            .map_err(io::Error::other)?
    }
}
