//! Pagination engine
//!
//! Drives repeated `list` calls with the cursor returned by the previous page
//! until a page reports an empty cursor. Entries are accumulated and handed
//! back as one batch so the caller can append them in a single step.

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::providers::{Entry, ProviderError, StorageProvider};

/// Why a continuation loop stopped
#[derive(Debug)]
pub enum ContinuationStop {
    /// A page came back with an empty cursor
    Exhausted,
    /// The token fired before the listing was exhausted
    Cancelled,
    /// A page failed; entries gathered before it are still returned
    Failed(ProviderError),
}

/// Entries gathered after the first page
#[derive(Debug)]
pub struct Continuation {
    pub entries: Vec<Entry>,
    /// Number of pages that were fetched successfully
    pub pages: usize,
    pub stop: ContinuationStop,
}

/// Fetch every page of `path` starting at `cursor` (the first page's next cursor).
///
/// An empty starting cursor returns immediately as exhausted.
pub async fn collect_remaining(
    provider: &dyn StorageProvider,
    path: &str,
    mut cursor: String,
    cancel: &CancellationToken,
) -> Continuation {
    let mut entries = Vec::new();
    let mut pages = 0;

    let stop = loop {
        if cursor.is_empty() {
            break ContinuationStop::Exhausted;
        }
        if cancel.is_cancelled() {
            break ContinuationStop::Cancelled;
        }

        match provider.list(path, &cursor, cancel).await {
            Ok(page) => {
                pages += 1;
                entries.extend(page.entries);
                if !page.next_cursor.is_empty() && page.next_cursor == cursor {
                    warn!("Listing of {:?} did not advance past cursor {:?}", path, cursor);
                    break ContinuationStop::Failed(ProviderError::context(
                        "list",
                        path,
                        ProviderError::ParseError(format!("cursor {} repeated", cursor)),
                    ));
                }
                cursor = page.next_cursor;
            }
            Err(e) if e.is_cancelled() => break ContinuationStop::Cancelled,
            Err(e) => break ContinuationStop::Failed(e),
        }
    };

    debug!(
        "Continuation of {:?} stopped after {} pages with {} entries: {:?}",
        path,
        pages,
        entries.len(),
        stop
    );

    Continuation { entries, pages, stop }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::ScriptedProvider;
    use crate::providers::StubProvider;
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name()).collect()
    }

    #[tokio::test]
    async fn test_pages_concatenate_in_call_order() {
        let provider = ScriptedProvider::new().with_pages("d/", &[&["a/", "b"], &["c", "d"], &["e"]]);
        let token = CancellationToken::new();

        let first = provider.list("d/", "", &token).await.unwrap();
        let rest = collect_remaining(&provider, "d/", first.next_cursor, &token).await;

        assert!(matches!(rest.stop, ContinuationStop::Exhausted));
        assert_eq!(rest.pages, 2);
        assert_eq!(names(&rest.entries), vec!["c", "d", "e"]);
        assert_eq!(provider.list_calls().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_cursor_is_exhausted_without_calls() {
        let provider = ScriptedProvider::new();
        let rest = collect_remaining(&provider, "", String::new(), &CancellationToken::new()).await;
        assert!(matches!(rest.stop, ContinuationStop::Exhausted));
        assert!(rest.entries.is_empty());
        assert!(provider.list_calls().is_empty());
    }

    #[tokio::test]
    async fn test_error_keeps_accumulated_entries() {
        let provider = ScriptedProvider::new()
            .with_pages("", &[&["a"], &["b", "c"], &["d"], &["e"]])
            .failing_at("", 3);
        let token = CancellationToken::new();

        let first = provider.list("", "", &token).await.unwrap();
        let rest = collect_remaining(&provider, "", first.next_cursor, &token).await;

        assert_eq!(names(&rest.entries), vec!["b", "c", "d"]);
        match rest.stop {
            ContinuationStop::Failed(e) => assert!(e.is_recoverable()),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_blocked_page() {
        let gate = Arc::new(Semaphore::new(0));
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_pages("", &[&["a"], &["b"], &["c"]])
                .gate_continuation(gate.clone()),
        );
        let token = CancellationToken::new();

        let task = {
            let provider = provider.clone();
            let token = token.clone();
            tokio::spawn(async move { collect_remaining(provider.as_ref(), "", "#1".to_string(), &token).await })
        };
        gate.add_permits(1);
        while provider.list_calls().len() < 2 {
            tokio::task::yield_now().await;
        }
        token.cancel();

        let rest = task.await.unwrap();
        assert!(matches!(rest.stop, ContinuationStop::Cancelled));
        assert_eq!(names(&rest.entries), vec!["b"]);
    }

    #[tokio::test]
    async fn test_stub_provider_fails_cleanly() {
        let rest = collect_remaining(&StubProvider::new(), "", "next".to_string(), &CancellationToken::new()).await;
        assert!(rest.entries.is_empty());
        assert_eq!(rest.pages, 0);
        assert!(matches!(rest.stop, ContinuationStop::Failed(ProviderError::NotReady)));
    }
}
