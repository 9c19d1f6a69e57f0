//! Custom store placeholder
//!
//! The custom backend has no implementation yet. Every operation fails with
//! [`ProviderError::NotReady`] so the navigation engine can drive it like any
//! other provider.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{DownloadSink, Entry, ListPage, ProviderError, ProviderType, StorageProvider, UploadSource};

#[derive(Debug, Default)]
pub struct StubProvider;

impl StubProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageProvider for StubProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Custom
    }

    fn display_name(&self) -> String {
        "custom (not ready)".to_string()
    }

    async fn list(&self, _path: &str, _cursor: &str, _cancel: &CancellationToken) -> Result<ListPage, ProviderError> {
        Err(ProviderError::NotReady)
    }

    async fn upload(
        &self,
        _source: Box<dyn UploadSource>,
        _key: &str,
        _content_type: Option<&str>,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::NotReady)
    }

    async fn download(
        &self,
        _sink: &mut dyn DownloadSink,
        _key: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::NotReady)
    }

    async fn delete(&self, _key: &str, _cancel: &CancellationToken) -> Result<(), ProviderError> {
        Err(ProviderError::NotReady)
    }

    async fn stat(&self, _key: &str, _cancel: &CancellationToken) -> Result<Entry, ProviderError> {
        Err(ProviderError::NotReady)
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
