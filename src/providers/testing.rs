//! In-memory provider with scripted listing pages, used by the engine and controller tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::{
    cancellable, DownloadSink, Entry, ListPage, ProviderError, ProviderType, StorageProvider, UploadSource,
    PATH_SEPARATOR,
};

#[derive(Default)]
pub(crate) struct ScriptedProvider {
    pages: HashMap<(String, String), ListPage>,
    failing: HashSet<(String, String)>,
    /// Continuation pages (non-empty cursor) wait for a permit
    list_gate: Option<Arc<Semaphore>>,
    /// Uploads, downloads and deletes wait for a permit
    transfer_gate: Option<Arc<Semaphore>>,
    calls: Mutex<Vec<(String, String)>>,
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

/// Entry for a scripted name: a trailing separator makes it a directory
pub(crate) fn entry(name: &str) -> Entry {
    if name.ends_with(PATH_SEPARATOR) {
        Entry::directory(name)
    } else {
        Entry::file(name, 10, None)
    }
}

fn cursor_for(path: &str, page: usize) -> String {
    if page == 0 {
        String::new()
    } else {
        format!("{}#{}", path, page)
    }
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Script the pages of `path`; cursors are chained automatically
    pub(crate) fn with_pages(mut self, path: &str, pages: &[&[&str]]) -> Self {
        for (i, names) in pages.iter().enumerate() {
            let next = if i + 1 < pages.len() { cursor_for(path, i + 1) } else { String::new() };
            let page = ListPage::new(names.iter().map(|n| entry(n)).collect(), next);
            self.pages.insert((path.to_string(), cursor_for(path, i)), page);
        }
        self
    }

    /// Page `page` of `path` fails with a network error
    pub(crate) fn failing_at(mut self, path: &str, page: usize) -> Self {
        self.failing.insert((path.to_string(), cursor_for(path, page)));
        self
    }

    pub(crate) fn gate_continuation(mut self, gate: Arc<Semaphore>) -> Self {
        self.list_gate = Some(gate);
        self
    }

    pub(crate) fn gate_transfers(mut self, gate: Arc<Semaphore>) -> Self {
        self.transfer_gate = Some(gate);
        self
    }

    pub(crate) fn with_object(self, key: &str, data: &[u8]) -> Self {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), data.to_vec());
        self
    }

    /// Every `(path, cursor)` passed to `list`, in call order
    pub(crate) fn list_calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    async fn pass(gate: &Option<Arc<Semaphore>>) -> Result<(), ProviderError> {
        if let Some(gate) = gate {
            gate.acquire().await.map_err(|_| ProviderError::Cancelled)?.forget();
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for ScriptedProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Custom
    }

    fn display_name(&self) -> String {
        "scripted".to_string()
    }

    async fn list(&self, path: &str, cursor: &str, cancel: &CancellationToken) -> Result<ListPage, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((path.to_string(), cursor.to_string()));

        cancellable(cancel, async {
            if !cursor.is_empty() {
                Self::pass(&self.list_gate).await?;
            }
            let key = (path.to_string(), cursor.to_string());
            if self.failing.contains(&key) {
                return Err(ProviderError::NetworkError(format!("connection reset listing {}", path)));
            }
            self.pages
                .get(&key)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(path.to_string()))
        })
        .await
        .map_err(|e| ProviderError::context("list", path, e))
    }

    async fn upload(
        &self,
        mut source: Box<dyn UploadSource>,
        key: &str,
        _content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        cancellable(cancel, async {
            Self::pass(&self.transfer_gate).await?;
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            self.objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.to_string(), data);
            Ok(())
        })
        .await
        .map_err(|e| ProviderError::context("upload", key, e))
    }

    async fn download(
        &self,
        sink: &mut dyn DownloadSink,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        cancellable(cancel, async {
            Self::pass(&self.transfer_gate).await?;
            let data = self.object(key).ok_or_else(|| ProviderError::NotFound(key.to_string()))?;
            sink.write_all(&data).await?;
            sink.flush().await?;
            Ok(())
        })
        .await
        .map_err(|e| ProviderError::context("download", key, e))
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        cancellable(cancel, async {
            Self::pass(&self.transfer_gate).await?;
            self.objects
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound(key.to_string()))
        })
        .await
        .map_err(|e| ProviderError::context("delete", key, e))
    }

    async fn stat(&self, key: &str, _cancel: &CancellationToken) -> Result<Entry, ProviderError> {
        let data = self.object(key).ok_or_else(|| ProviderError::NotFound(key.to_string()))?;
        Ok(Entry::file(key, data.len() as u64, None))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
