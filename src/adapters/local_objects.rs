use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use super::{LOCAL_ADAPTER, ObjectStore};

/// How the adapter reports failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Log the error and return normally. The original caller paths rely on
    /// this non-throwing contract, so it stays the default.
    BestEffort,
    /// Propagate the error to the caller.
    Strict,
}

/// Filesystem object storage under a single root directory.
pub struct LocalObjectStore {
    root: PathBuf,
    mode: FailureMode,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, mode: FailureMode) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            mode,
        }
    }

    fn absorb<T>(&self, op: &str, result: Result<T>, fallback: T) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => match self.mode {
                FailureMode::BestEffort => {
                    warn!(op = op, error = %format!("{:#}", e), "Object storage operation failed");
                    Ok(fallback)
                }
                FailureMode::Strict => Err(e),
            },
        }
    }

    async fn try_upload(&self, source: &Path, upload_path: &str) -> Result<()> {
        let target = self.root.join(upload_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &target)
            .await
            .with_context(|| format!("Failed to store object at {}", target.display()))?;
        Ok(())
    }

    async fn try_download(&self, download_path: &str, temp_path: &Path) -> Result<()> {
        let source = self.root.join(download_path);
        tokio::fs::copy(&source, temp_path)
            .await
            .with_context(|| format!("Failed to fetch object {}", source.display()))?;
        Ok(())
    }

    async fn try_remove(&self, source_path: &str) -> Result<()> {
        let target = self.root.join(source_path);
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            // Already gone; removal is idempotent.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(anyhow::Error::from(e).context(format!("Failed to remove object {}", target.display())))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn name(&self) -> &str {
        LOCAL_ADAPTER
    }

    async fn upload(&self, source: &Path, upload_path: &str) -> Result<()> {
        let result = self.try_upload(source, upload_path).await;
        self.absorb("upload", result, ())
    }

    async fn download(&self, download_path: &str) -> Result<PathBuf> {
        let file_name = Path::new(download_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let temp_path =
            std::env::temp_dir().join(format!("annopipe-{}-{}", Uuid::new_v4(), file_name));

        let result = self
            .try_download(download_path, &temp_path)
            .await
            .map(|()| temp_path.clone());
        self.absorb("download", result, temp_path)
    }

    async fn remove(&self, source_path: &str) -> Result<()> {
        let result = self.try_remove(source_path).await;
        self.absorb("remove", result, ())
    }

    async fn request_url(&self, url: &str, _expires_in_s: Option<u64>) -> Result<String> {
        // Local objects are not served over HTTP, so the URL resolves to itself.
        Ok(url.to_string())
    }
}
