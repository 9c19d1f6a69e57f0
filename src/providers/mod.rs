//! Storage Providers Module
//!
//! This module provides a unified abstraction layer for different storage backends.
//! All providers implement the `StorageProvider` trait, allowing the navigation
//! layer to browse object storage, remote filesystems and the custom store through
//! a common interface.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           StorageProvider Trait             │
//! │  list, upload, download, delete, stat, close│
//! └─────────────────────────────────────────────┘
//!                      │
//!          ┌───────────┼───────────┐
//!          ▼           ▼           ▼
//!       ┌─────┐    ┌──────┐    ┌──────┐
//!       │ S3  │    │ SFTP │    │ Stub │
//!       └─────┘    └──────┘    └──────┘
//! ```

pub mod types;
pub mod s3;
pub mod sftp;
pub mod stub;

#[cfg(test)]
pub(crate) mod testing;

pub use types::*;
pub use s3::S3Provider;
pub use sftp::SftpProvider;
pub use stub::StubProvider;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Unified storage provider trait
///
/// All storage backends implement this trait. Every method takes `&self`:
/// one provider instance is shared by the refresh task and any transfer in
/// flight, so implementations must tolerate concurrent calls.
///
/// Long-running calls observe a [`CancellationToken`]; once it fires they
/// return [`ProviderError::Cancelled`] instead of a partial result.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider type identifier
    fn provider_type(&self) -> ProviderType;

    /// Get display name for this provider instance
    fn display_name(&self) -> String;

    /// Navigation path a fresh view starts at
    fn initial_path(&self) -> String {
        String::new()
    }

    /// List one page of the directory at `path`.
    ///
    /// An empty `cursor` asks for the first page. An empty `next_cursor` in the
    /// result means the listing is exhausted.
    async fn list(
        &self,
        path: &str,
        cursor: &str,
        cancel: &CancellationToken,
    ) -> Result<ListPage, ProviderError>;

    /// Upload a seekable source to `key`
    async fn upload(
        &self,
        source: Box<dyn UploadSource>,
        key: &str,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Stream the object at `key` into `sink`
    async fn download(
        &self,
        sink: &mut dyn DownloadSink,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError>;

    /// Delete a file
    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<(), ProviderError>;

    /// Get file info
    async fn stat(&self, key: &str, cancel: &CancellationToken) -> Result<Entry, ProviderError>;

    /// Release session resources. Calling it again is a no-op.
    async fn close(&self) -> Result<(), ProviderError>;
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        res = fut => res,
    }
}

/// Provider factory for creating provider instances
pub struct ProviderFactory;

impl ProviderFactory {
    /// Create and connect a provider for the given configuration.
    ///
    /// Connection and authentication failures are returned before any listing
    /// can begin.
    pub async fn connect(config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>, ProviderError> {
        match config.kind()? {
            ProviderType::S3 => {
                let s3_config = S3Config::from_provider_config(config)?;
                Ok(Arc::new(S3Provider::new(s3_config)?))
            }
            ProviderType::Sftp => {
                let sftp_config = SftpConfig::from_provider_config(config)?;
                Ok(Arc::new(SftpProvider::connect(sftp_config).await?))
            }
            ProviderType::Custom => Ok(Arc::new(StubProvider::new())),
        }
    }
}
