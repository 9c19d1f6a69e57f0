//! Single-flight operation slots
//!
//! The session holds at most one live cancellation token per operation kind.
//! A second request of the same kind is refused until the first one finishes
//! or is cancelled.

use std::collections::HashMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Long-running operation categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Refresh,
    Upload,
    Download,
    Delete,
}

impl OperationKind {
    /// Question asked when the user repeats an operation that is still running
    pub fn confirm_prompt(&self) -> String {
        format!("Cancel current {}?", self)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Refresh => write!(f, "Refreshing"),
            OperationKind::Upload => write!(f, "Uploading"),
            OperationKind::Download => write!(f, "Downloading"),
            OperationKind::Delete => write!(f, "Deleting"),
        }
    }
}

#[derive(Debug)]
struct Slot {
    id: u64,
    token: CancellationToken,
}

/// Tagged "current operation" slots, one per kind
#[derive(Debug, Default)]
pub(crate) struct OperationSlots {
    slots: HashMap<OperationKind, Slot>,
    next_id: u64,
}

impl OperationSlots {
    /// Claim the slot for `kind`, returning its id and fresh token
    pub(crate) fn claim(&mut self, kind: OperationKind) -> Option<(u64, CancellationToken)> {
        if self.slots.contains_key(&kind) {
            return None;
        }
        self.next_id += 1;
        let token = CancellationToken::new();
        self.slots.insert(
            kind,
            Slot {
                id: self.next_id,
                token: token.clone(),
            },
        );
        Some((self.next_id, token))
    }

    /// Free the slot if it still belongs to the claim `id`
    pub(crate) fn release(&mut self, kind: OperationKind, id: u64) -> bool {
        if self.slots.get(&kind).map(|s| s.id) == Some(id) {
            self.slots.remove(&kind);
            return true;
        }
        false
    }

    /// Fire the token of a running operation
    pub(crate) fn cancel(&self, kind: OperationKind) -> bool {
        match self.slots.get(&kind) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_all(&self) {
        for slot in self.slots.values() {
            slot.token.cancel();
        }
    }

    pub(crate) fn is_busy(&self, kind: OperationKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Running kinds in a stable order
    pub(crate) fn running(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.slots.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
