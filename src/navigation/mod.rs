//! Navigation controller
//!
//! Owns the "current directory" view of one session and serializes every
//! mutation of it through a single lock:
//!
//! ```text
//!   refresh(path) ──► page 1 ──► replace view ──► collect_remaining ──► one batch append
//!        │                                              │
//!        └────────────── cancel(Refresh) ───────────────┘
//! ```
//!
//! Refresh, upload, download and delete are each single-flight: a second
//! request of the same kind is refused with [`NavError::Busy`] until the first
//! one finishes or is cancelled. Every change is published as a
//! [`ViewSnapshot`] on a watch channel.

mod path;
mod slots;
mod status;
mod view;

pub use path::{child_path, parent_path, split_key};
pub use slots::OperationKind;
pub use status::{status_message, truncate_message, STATUS_MAX_CHARS};
pub use view::ViewSnapshot;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::listing::{collect_remaining, ContinuationStop};
use crate::providers::{DownloadSink, Entry, ProviderError, StorageProvider, UploadSource, PATH_SEPARATOR};
use view::SessionState;

/// Controller error type
#[derive(Debug, Error)]
pub enum NavError {
    /// An operation of this kind is still running
    #[error("{}", .0.confirm_prompt())]
    Busy(OperationKind),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("{0} is a directory")]
    IsDirectory(String),

    #[error("No entry named {0}")]
    NoSuchEntry(String),

    #[error("{kind} {target}")]
    Operation {
        kind: OperationKind,
        target: String,
        #[source]
        source: ProviderError,
    },

    #[error("Task aborted: {0}")]
    Aborted(#[from] JoinError),
}

impl NavError {
    /// Message for the single-line status area
    pub fn status_line(&self) -> String {
        match self {
            NavError::Busy(kind) => kind.confirm_prompt(),
            other => status_message(other),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, NavError::Cancelled)
    }
}

/// Handle to an operation running in the background
pub struct Task<T> {
    kind: OperationKind,
    token: CancellationToken,
    handle: JoinHandle<Result<T, NavError>>,
}

impl<T> Task<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Ask the operation to stop; `wait` then reports [`NavError::Cancelled`]
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<T, NavError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(NavError::Aborted(e)),
        }
    }
}

struct Shared {
    provider: Arc<dyn StorageProvider>,
    state: Mutex<SessionState>,
    updates: watch::Sender<ViewSnapshot>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send the current snapshot. The lock is held across the send so
    /// snapshots reach the channel in the order the state changed.
    fn publish(&self) {
        let state = self.lock();
        self.updates.send_replace(state.snapshot());
    }

    /// Record a failed operation in the status line
    fn fail(&self, kind: OperationKind, target: String, err: ProviderError) -> NavError {
        if err.is_cancelled() {
            debug!("{} {} cancelled", kind, target);
            return NavError::Cancelled;
        }
        let err = NavError::Operation {
            kind,
            target,
            source: err,
        };
        let line = err.status_line();
        warn!("{} failed: {}", err, line);
        self.lock().status = Some(line);
        self.publish();
        err
    }
}

/// Claimed operation slot; dropping it frees the slot
struct SlotGuard {
    shared: Arc<Shared>,
    kind: OperationKind,
    id: u64,
    token: CancellationToken,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let released = self.shared.lock().slots.release(self.kind, self.id);
        if released {
            self.shared.publish();
        }
    }
}

/// Navigation over one provider binding
pub struct Navigator {
    shared: Arc<Shared>,
}

impl Navigator {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        let state = SessionState::new(provider.initial_path());
        let (updates, _) = watch::channel(state.snapshot());
        Self {
            shared: Arc::new(Shared {
                provider,
                state: Mutex::new(state),
                updates,
            }),
        }
    }

    pub fn provider(&self) -> &Arc<dyn StorageProvider> {
        &self.shared.provider
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.shared.lock().snapshot()
    }

    /// Receive a snapshot after every change of the view
    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot> {
        self.shared.updates.subscribe()
    }

    pub fn current_path(&self) -> String {
        self.shared.lock().view.path.clone()
    }

    fn claim(&self, kind: OperationKind) -> Result<SlotGuard, NavError> {
        let claimed = self.shared.lock().slots.claim(kind);
        let (id, token) = claimed.ok_or(NavError::Busy(kind))?;
        self.shared.publish();
        Ok(SlotGuard {
            shared: self.shared.clone(),
            kind,
            id,
            token,
        })
    }

    fn spawn<T, F, Fut>(&self, guard: SlotGuard, run: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Shared>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, NavError>> + Send + 'static,
    {
        let kind = guard.kind;
        let token = guard.token.clone();
        let fut = run(self.shared.clone(), token.clone());
        let handle = tokio::spawn(async move {
            let _guard = guard;
            fut.await
        });
        Task { kind, token, handle }
    }

    /// List `path` into the view: page 1 replaces the entries, the remaining
    /// pages are appended as one batch. Resolves to the final entry count.
    pub fn refresh(&self, path: &str) -> Result<Task<usize>, NavError> {
        let guard = self.claim(OperationKind::Refresh)?;
        let path = path.to_string();
        debug!("Refreshing {:?}", path);
        Ok(self.spawn(guard, move |shared, token| run_refresh(shared, token, path)))
    }

    /// Refresh the path currently shown
    pub fn reload(&self) -> Result<Task<usize>, NavError> {
        let path = self.current_path();
        self.refresh(&path)
    }

    /// Enter the directory entry called `name`
    pub fn navigate_into(&self, name: &str) -> Result<Task<usize>, NavError> {
        let target = {
            let state = self.shared.lock();
            let entry = state
                .view
                .entries
                .iter()
                .find(|e| e.name() == name)
                .ok_or_else(|| NavError::NoSuchEntry(name.to_string()))?;
            if !entry.is_dir() {
                return Err(NavError::NotADirectory(name.to_string()));
            }
            child_path(&state.view.path, entry.name())
        };
        self.refresh(&target)
    }

    /// Go to the parent directory; `None` when already at the top
    pub fn navigate_up(&self) -> Result<Option<Task<usize>>, NavError> {
        let current = self.current_path();
        match parent_path(&current) {
            Some(parent) => self.refresh(&parent).map(Some),
            None => {
                debug!("Already at the top of {:?}", current);
                Ok(None)
            }
        }
    }

    /// Cancel the running operation of `kind`; false when none is running
    pub fn cancel(&self, kind: OperationKind) -> bool {
        self.shared.lock().slots.cancel(kind)
    }

    /// Upload `source` to `key`. On success a placeholder entry shows up in
    /// the view until the next refresh.
    pub fn upload(
        &self,
        source: Box<dyn UploadSource>,
        key: &str,
        content_type: Option<String>,
    ) -> Result<Task<()>, NavError> {
        let guard = self.claim(OperationKind::Upload)?;
        let key = key.to_string();
        Ok(self.spawn(guard, move |shared, token| {
            run_upload(shared, token, source, key, content_type)
        }))
    }

    /// Upload a local file into the current directory
    pub async fn upload_file(&self, local: impl AsRef<Path>) -> Result<Task<()>, NavError> {
        let local = local.as_ref();
        let name = local
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| NavError::NoSuchEntry(local.display().to_string()))?;
        let key = child_path(&self.current_path(), &name);
        let content_type = mime_guess::from_path(local).first().map(|m| m.essence_str().to_string());

        let file = tokio::fs::File::open(local)
            .await
            .map_err(|e| self.shared.fail(OperationKind::Upload, local.display().to_string(), e.into()))?;
        self.upload(Box::new(file), &key, content_type)
    }

    /// Stream the object at `key` into `sink`
    pub fn download(&self, sink: Box<dyn DownloadSink>, key: &str) -> Result<Task<()>, NavError> {
        if key.ends_with(PATH_SEPARATOR) {
            return Err(NavError::IsDirectory(key.to_string()));
        }
        let guard = self.claim(OperationKind::Download)?;
        let key = key.to_string();
        Ok(self.spawn(guard, move |shared, token| run_download(shared, token, sink, key)))
    }

    /// Download `key` into a local file.
    ///
    /// Bytes land in a temporary file next to `local`, which replaces
    /// `local` only once the download succeeded.
    pub async fn download_to_file(&self, key: &str, local: impl AsRef<Path>) -> Result<Task<()>, NavError> {
        if key.ends_with(PATH_SEPARATOR) {
            return Err(NavError::IsDirectory(key.to_string()));
        }
        let guard = self.claim(OperationKind::Download)?;
        let local = local.as_ref().to_path_buf();
        let parent = match local.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(|e| self.shared.fail(OperationKind::Download, local.display().to_string(), e.into()))?;
        let (file, temp_path) = temp.into_parts();
        let sink = Box::new(tokio::fs::File::from_std(file));

        let key = key.to_string();
        Ok(self.spawn(guard, move |shared, token| async move {
            run_download(shared.clone(), token, sink, key).await?;
            temp_path.persist(&local).map_err(|e| {
                shared.fail(OperationKind::Download, local.display().to_string(), e.error.into())
            })?;
            debug!("Saved download to {}", local.display());
            Ok(())
        }))
    }

    /// Delete the object at `key`; its entry leaves the view on success
    pub fn delete(&self, key: &str) -> Result<Task<()>, NavError> {
        if key.ends_with(PATH_SEPARATOR) {
            return Err(NavError::IsDirectory(key.to_string()));
        }
        let guard = self.claim(OperationKind::Delete)?;
        let key = key.to_string();
        let position = {
            let state = self.shared.lock();
            let (dir, name) = split_key(&key);
            if state.view.path == dir {
                state.view.position(name).map(|i| (state.view.generation, i))
            } else {
                None
            }
        };
        Ok(self.spawn(guard, move |shared, token| run_delete(shared, token, key, position)))
    }

    /// Cancel everything in flight and close the provider binding
    pub async fn close(&self) -> Result<(), ProviderError> {
        self.shared.lock().slots.cancel_all();
        info!("Closing {}", self.shared.provider.display_name());
        self.shared.provider.close().await
    }
}

async fn run_refresh(shared: Arc<Shared>, token: CancellationToken, path: String) -> Result<usize, NavError> {
    let listed = shared.provider.list(&path, "", &token).await;
    let first = match listed {
        Ok(page) => page,
        Err(e) => return Err(shared.fail(OperationKind::Refresh, path, e)),
    };

    let generation = {
        let mut state = shared.lock();
        if token.is_cancelled() {
            return Err(NavError::Cancelled);
        }
        state.status = None;
        state.view.replace(path.clone(), first.entries)
    };
    shared.publish();

    let rest = collect_remaining(shared.provider.as_ref(), &path, first.next_cursor, &token).await;
    let pages = rest.pages + 1;

    // Err(None) means the batch was dropped because of cancellation
    let appended: Result<usize, Option<ProviderError>> = {
        let mut state = shared.lock();
        match rest.stop {
            ContinuationStop::Cancelled => Err(None),
            _ if token.is_cancelled() || state.view.generation != generation => Err(None),
            ContinuationStop::Exhausted => {
                state.view.entries.extend(rest.entries);
                Ok(state.view.entries.len())
            }
            ContinuationStop::Failed(e) => {
                state.view.entries.extend(rest.entries);
                Err(Some(e))
            }
        }
    };
    shared.publish();

    match appended {
        Ok(total) => {
            info!("Listed {} entries in {:?} ({} pages)", total, path, pages);
            Ok(total)
        }
        Err(None) => {
            debug!("Refresh of {:?} cancelled", path);
            Err(NavError::Cancelled)
        }
        Err(Some(e)) => Err(shared.fail(OperationKind::Refresh, path, e)),
    }
}

async fn run_upload(
    shared: Arc<Shared>,
    token: CancellationToken,
    source: Box<dyn UploadSource>,
    key: String,
    content_type: Option<String>,
) -> Result<(), NavError> {
    let uploaded = shared
        .provider
        .upload(source, &key, content_type.as_deref(), &token)
        .await;
    if let Err(e) = uploaded {
        return Err(shared.fail(OperationKind::Upload, key, e));
    }

    // The placeholder only lands in an idle view of the upload's directory
    {
        let mut state = shared.lock();
        let (dir, name) = split_key(&key);
        if state.view.path == dir && !state.slots.is_busy(OperationKind::Refresh) {
            let placeholder = Entry::placeholder(name);
            match state.view.position(name) {
                Some(i) => state.view.entries[i] = placeholder,
                None => state.view.entries.push(placeholder),
            }
        }
    }
    shared.publish();
    info!("Upload of {} finished", key);
    Ok(())
}

async fn run_download(
    shared: Arc<Shared>,
    token: CancellationToken,
    mut sink: Box<dyn DownloadSink>,
    key: String,
) -> Result<(), NavError> {
    let downloaded = shared.provider.download(sink.as_mut(), &key, &token).await;
    match downloaded {
        Ok(()) => {
            info!("Download of {} finished", key);
            Ok(())
        }
        Err(e) => Err(shared.fail(OperationKind::Download, key, e)),
    }
}

async fn run_delete(
    shared: Arc<Shared>,
    token: CancellationToken,
    key: String,
    position: Option<(u64, usize)>,
) -> Result<(), NavError> {
    let deleted = shared.provider.delete(&key, &token).await;
    if let Err(e) = deleted {
        return Err(shared.fail(OperationKind::Delete, key, e));
    }

    // Only remove the entry if the view was not replaced in between
    if let Some((generation, index)) = position {
        let (_, name) = split_key(&key);
        let removed = {
            let mut state = shared.lock();
            let same = state.view.generation == generation
                && state.view.entries.get(index).map(|e| e.name()) == Some(name);
            if same {
                state.view.entries.remove(index);
            }
            same
        };
        if removed {
            shared.publish();
        }
    }
    info!("Delete of {} finished", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::StubProvider;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn navigator(provider: ScriptedProvider) -> (Navigator, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        (Navigator::new(provider.clone()), provider)
    }

    fn names(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.entries.iter().map(|e| e.name().to_string()).collect()
    }

    async fn wait_for_entries(nav: &Navigator, count: usize) {
        let mut rx = nav.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.entries.len() == count))
            .await
            .expect("view never reached the expected size")
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_collects_all_pages() {
        let (nav, provider) = navigator(ScriptedProvider::new().with_pages("", &[&["a/", "b"], &["c"], &["d"]]));

        let total = nav.refresh("").unwrap().wait().await.unwrap();

        assert_eq!(total, 4);
        let snapshot = nav.snapshot();
        assert_eq!(names(&snapshot), vec!["a/", "b", "c", "d"]);
        assert!(!snapshot.listing);
        assert_eq!(snapshot.status, None);
        assert_eq!(provider.list_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_second_refresh_rejected_while_listing() {
        let gate = Arc::new(Semaphore::new(0));
        let (nav, provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["a/", "b"], &["c"]])
                .with_pages("a/", &[&["x"]])
                .gate_continuation(gate.clone()),
        );

        let first = nav.refresh("").unwrap();
        wait_for_entries(&nav, 2).await;
        assert!(nav.snapshot().listing);

        let err = nav.refresh("").err().unwrap();
        assert!(matches!(err, NavError::Busy(OperationKind::Refresh)));
        assert_eq!(err.status_line(), "Cancel current Refreshing?");
        assert!(matches!(nav.navigate_into("a/"), Err(NavError::Busy(_))));
        assert!(matches!(nav.navigate_up(), Ok(None)));

        tokio::task::yield_now().await;
        let first_pages = provider.list_calls().iter().filter(|(_, c)| c.is_empty()).count();
        assert_eq!(first_pages, 1);

        gate.add_permits(1);
        assert_eq!(first.wait().await.unwrap(), 3);
        assert!(!nav.snapshot().listing);

        nav.navigate_into("a/").unwrap().wait().await.unwrap();
        assert_eq!(nav.current_path(), "a/");
    }

    #[tokio::test]
    async fn test_cancel_after_first_page_keeps_first_page() {
        let gate = Arc::new(Semaphore::new(0));
        let (nav, _provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["a", "b"], &["c", "d"], &["e"]])
                .gate_continuation(gate),
        );

        let task = nav.refresh("").unwrap();
        wait_for_entries(&nav, 2).await;
        assert!(nav.cancel(OperationKind::Refresh));

        assert!(task.wait().await.unwrap_err().is_cancelled());
        let snapshot = nav.snapshot();
        assert_eq!(names(&snapshot), vec!["a", "b"]);
        assert!(!snapshot.listing);
        assert_eq!(snapshot.status, None);
        assert!(!nav.cancel(OperationKind::Refresh));
    }

    #[tokio::test]
    async fn test_cancel_drops_undelivered_batch() {
        let gate = Arc::new(Semaphore::new(0));
        let (nav, provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["a"], &["b"], &["c"]])
                .gate_continuation(gate.clone()),
        );

        let task = nav.refresh("").unwrap();
        gate.add_permits(1);
        // Page 2 was fetched, page 3 is blocked
        tokio::time::timeout(Duration::from_secs(5), async {
            while provider.list_calls().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        task.cancel();

        assert!(task.wait().await.unwrap_err().is_cancelled());
        assert_eq!(names(&nav.snapshot()), vec!["a"]);
    }

    #[tokio::test]
    async fn test_pagination_error_keeps_entries() {
        let (nav, _provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["a"], &["b"], &["c"]])
                .failing_at("", 2),
        );

        let err = nav.refresh("").unwrap().wait().await.unwrap_err();
        assert!(matches!(err, NavError::Operation { kind: OperationKind::Refresh, .. }));

        let snapshot = nav.snapshot();
        assert_eq!(names(&snapshot), vec!["a", "b"]);
        assert!(!snapshot.listing);
        let status = snapshot.status.unwrap();
        assert!(status.starts_with("Network error"));
        assert!(status.chars().count() <= STATUS_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_navigate_up_to_root_then_noop() {
        let (nav, provider) = navigator(
            ScriptedProvider::new()
                .with_pages("a/b/", &[&["f"]])
                .with_pages("a/", &[&["b/"]])
                .with_pages("", &[&["a/"]]),
        );

        nav.refresh("a/b/").unwrap().wait().await.unwrap();
        nav.navigate_up().unwrap().unwrap().wait().await.unwrap();
        assert_eq!(nav.current_path(), "a/");
        nav.navigate_up().unwrap().unwrap().wait().await.unwrap();
        assert_eq!(nav.current_path(), "");

        let calls = provider.list_calls().len();
        assert!(nav.navigate_up().unwrap().is_none());
        assert_eq!(provider.list_calls().len(), calls);
    }

    #[tokio::test]
    async fn test_navigate_into_requires_directory() {
        let (nav, _provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["docs/", "x.txt"]])
                .with_pages("docs/", &[&["inner.txt"]]),
        );
        nav.refresh("").unwrap().wait().await.unwrap();

        assert!(matches!(nav.navigate_into("x.txt"), Err(NavError::NotADirectory(_))));
        assert!(matches!(nav.navigate_into("nope/"), Err(NavError::NoSuchEntry(_))));

        nav.navigate_into("docs/").unwrap().wait().await.unwrap();
        let snapshot = nav.snapshot();
        assert_eq!(snapshot.path, "docs/");
        assert_eq!(names(&snapshot), vec!["inner.txt"]);
    }

    #[tokio::test]
    async fn test_stub_provider_reports_not_ready() {
        let nav = Navigator::new(Arc::new(StubProvider::new()));

        let err = nav.refresh("").unwrap().wait().await.unwrap_err();
        assert_eq!(err.status_line(), "not ready");
        let snapshot = nav.snapshot();
        assert_eq!(snapshot.status.as_deref(), Some("not ready"));
        assert!(!snapshot.listing);

        let upload = nav.upload(Box::new(Cursor::new(vec![1u8])), "k", None).unwrap();
        assert!(upload.wait().await.is_err());
        assert!(nav.delete("k").unwrap().wait().await.is_err());
        assert!(nav.snapshot().running.is_empty());
    }

    #[tokio::test]
    async fn test_upload_single_flight_and_placeholder() {
        let gate = Arc::new(Semaphore::new(0));
        let (nav, provider) = navigator(ScriptedProvider::new().gate_transfers(gate.clone()));

        let task = nav.upload(Box::new(Cursor::new(b"payload".to_vec())), "new.bin", None).unwrap();
        let second = nav.upload(Box::new(Cursor::new(vec![])), "other.bin", None);
        assert!(matches!(second, Err(NavError::Busy(OperationKind::Upload))));
        assert!(nav.snapshot().is_running(OperationKind::Upload));

        gate.add_permits(1);
        task.wait().await.unwrap();

        let snapshot = nav.snapshot();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.entries[0].name(), "new.bin");
        assert_eq!(snapshot.entries[0].size(), 1);
        assert!(!snapshot.is_running(OperationKind::Upload));
        assert_eq!(provider.object("new.bin"), Some(b"payload".to_vec()));
    }

    #[tokio::test]
    async fn test_upload_elsewhere_leaves_view_alone() {
        let (nav, provider) = navigator(ScriptedProvider::new());
        nav.upload(Box::new(Cursor::new(vec![1u8, 2])), "other/dir/f.bin", None)
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(nav.snapshot().entries.is_empty());
        assert!(provider.object("other/dir/f.bin").is_some());
    }

    #[tokio::test]
    async fn test_cancel_upload() {
        let gate = Arc::new(Semaphore::new(0));
        let (nav, provider) = navigator(ScriptedProvider::new().gate_transfers(gate));

        let task = nav.upload(Box::new(Cursor::new(vec![1u8])), "x", None).unwrap();
        assert!(nav.cancel(OperationKind::Upload));
        assert!(task.wait().await.unwrap_err().is_cancelled());
        assert!(provider.object("x").is_none());
        assert!(nav.upload(Box::new(Cursor::new(vec![1u8])), "x", None).is_ok());
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let (nav, provider) = navigator(
            ScriptedProvider::new()
                .with_pages("", &[&["a.txt", "b.txt"]])
                .with_object("a.txt", b"a"),
        );
        nav.refresh("").unwrap().wait().await.unwrap();

        nav.delete("a.txt").unwrap().wait().await.unwrap();
        assert_eq!(names(&nav.snapshot()), vec!["b.txt"]);
        assert!(provider.object("a.txt").is_none());

        assert!(matches!(nav.delete("docs/"), Err(NavError::IsDirectory(_))));
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_entry() {
        let (nav, _provider) = navigator(ScriptedProvider::new().with_pages("", &[&["gone.txt"]]));
        nav.refresh("").unwrap().wait().await.unwrap();

        let err = nav.delete("gone.txt").unwrap().wait().await.unwrap_err();
        assert!(matches!(err, NavError::Operation { kind: OperationKind::Delete, .. }));
        assert_eq!(names(&nav.snapshot()), vec!["gone.txt"]);
        assert_eq!(nav.snapshot().status.as_deref(), Some("Path not found: gone.txt"));
    }

    #[tokio::test]
    async fn test_download_and_upload_files() {
        let dir = tempfile::tempdir().unwrap();
        let (nav, provider) = navigator(ScriptedProvider::new().with_object("hello.txt", b"hello"));

        let local = dir.path().join("hello.txt");
        nav.download_to_file("hello.txt", &local).await.unwrap().wait().await.unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"hello");

        let report = dir.path().join("report.txt");
        std::fs::write(&report, b"quarterly").unwrap();
        nav.upload_file(&report).await.unwrap().wait().await.unwrap();
        assert_eq!(provider.object("report.txt"), Some(b"quarterly".to_vec()));

        assert!(matches!(
            nav.download_to_file("docs/", dir.path().join("x")).await,
            Err(NavError::IsDirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_download_keeps_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let (nav, _provider) = navigator(ScriptedProvider::new());

        let local = dir.path().join("keep.txt");
        std::fs::write(&local, b"precious local data").unwrap();

        let err = nav
            .download_to_file("missing.txt", &local)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(err.status_line(), "Path not found: missing.txt");
        assert_eq!(std::fs::read(&local).unwrap(), b"precious local data");
        // The temporary file is gone as well
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let (nav, _provider) = navigator(
            ScriptedProvider::new()
                .with_object("a.bin", b"remote")
                .gate_transfers(gate),
        );

        let local = dir.path().join("a.bin");
        std::fs::write(&local, b"old").unwrap();
        let task = nav.download_to_file("a.bin", &local).await.unwrap();
        task.cancel();

        assert!(task.wait().await.unwrap_err().is_cancelled());
        assert_eq!(std::fs::read(&local).unwrap(), b"old");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_download_and_delete_are_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let (nav, provider) = navigator(
            ScriptedProvider::new()
                .with_object("a.txt", b"a")
                .with_object("b.txt", b"b")
                .gate_transfers(gate.clone()),
        );

        let download = nav.download_to_file("a.txt", dir.path().join("a.txt")).await.unwrap();
        let second = nav.download_to_file("b.txt", dir.path().join("b.txt")).await;
        assert!(matches!(second, Err(NavError::Busy(OperationKind::Download))));
        assert!(matches!(
            nav.download(Box::new(Vec::new()), "b.txt"),
            Err(NavError::Busy(OperationKind::Download))
        ));

        let delete = nav.delete("b.txt").unwrap();
        assert!(matches!(nav.delete("a.txt"), Err(NavError::Busy(OperationKind::Delete))));
        assert_eq!(
            nav.snapshot().running,
            vec![OperationKind::Download, OperationKind::Delete]
        );

        gate.add_permits(2);
        download.wait().await.unwrap();
        delete.wait().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"a");
        assert!(provider.object("b.txt").is_none());
        assert!(nav.snapshot().running.is_empty());
        assert!(nav.delete("a.txt").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_completions_leave_final_snapshot() {
        for _ in 0..200 {
            let gate = Arc::new(Semaphore::new(0));
            let (nav, _provider) = navigator(
                ScriptedProvider::new()
                    .with_object("a.txt", b"a")
                    .gate_transfers(gate.clone()),
            );
            let rx = nav.subscribe();

            let upload = nav.upload(Box::new(Cursor::new(vec![1u8])), "up.bin", None).unwrap();
            let download = nav.download(Box::new(Vec::new()), "a.txt").unwrap();
            gate.add_permits(2);
            upload.wait().await.unwrap();
            download.wait().await.unwrap();

            let watched = rx.borrow().clone();
            let actual = nav.snapshot();
            assert!(actual.running.is_empty());
            assert_eq!(watched.running, actual.running);
            assert_eq!(watched.listing, actual.listing);
            assert_eq!(watched.entries, actual.entries);
        }
    }
}
