use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::{Client, primitives::ByteStream};
use uuid::Uuid;

use super::ObjectStore;

pub const S3_ADAPTER: &str = "S3";

const DEFAULT_EXPIRES_IN_S: u64 = 3600;
const MAX_EXPIRES_IN_S: u64 = 604800;

/// Connection settings for an S3 (or S3-compatible) bucket.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

/// Object storage backed by S3. Unlike the local adapter this backend always
/// propagates failures.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn connect(settings: S3Settings) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(Region::new(region));
        }

        let base_config = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&base_config);
        builder = builder.force_path_style(settings.force_path_style);
        if let Some(endpoint) = settings.endpoint_url.clone() {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn name(&self) -> &str {
        S3_ADAPTER
    }

    async fn upload(&self, source: &Path, upload_path: &str) -> Result<()> {
        let body = ByteStream::from_path(source)
            .await
            .with_context(|| format!("Failed to read upload source {}", source.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(upload_path)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload s3://{}/{}", self.bucket, upload_path))?;
        Ok(())
    }

    async fn download(&self, download_path: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(download_path)
            .send()
            .await
            .with_context(|| format!("Failed to fetch s3://{}/{}", self.bucket, download_path))?;

        let data = response
            .body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes();

        let file_name = Path::new(download_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let temp_path =
            std::env::temp_dir().join(format!("annopipe-{}-{}", Uuid::new_v4(), file_name));
        tokio::fs::write(&temp_path, &data)
            .await
            .with_context(|| format!("Failed to write temp file {}", temp_path.display()))?;

        Ok(temp_path)
    }

    async fn remove(&self, source_path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(source_path)
            .send()
            .await
            .with_context(|| format!("Failed to remove s3://{}/{}", self.bucket, source_path))?;
        Ok(())
    }

    async fn request_url(&self, url: &str, expires_in_s: Option<u64>) -> Result<String> {
        let expires_in = expires_in_s.unwrap_or(DEFAULT_EXPIRES_IN_S);
        if expires_in == 0 || expires_in > MAX_EXPIRES_IN_S {
            anyhow::bail!(
                "Presign expiry must be between 1 and {} seconds",
                MAX_EXPIRES_IN_S
            );
        }

        let config = PresigningConfig::expires_in(Duration::from_secs(expires_in))
            .context("Invalid presigning configuration")?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(url)
            .presigned(config)
            .await
            .with_context(|| format!("Failed to presign s3://{}/{}", self.bucket, url))?;

        Ok(presigned.uri().to_string())
    }
}
