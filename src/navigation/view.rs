//! View state of the current directory

use super::slots::{OperationKind, OperationSlots};
use crate::providers::Entry;

/// Entries shown for one path
#[derive(Debug, Clone, Default)]
pub(crate) struct ViewState {
    pub(crate) path: String,
    pub(crate) entries: Vec<Entry>,
    /// Bumped every time the entries are replaced wholesale
    pub(crate) generation: u64,
}

impl ViewState {
    pub(crate) fn new(path: String) -> Self {
        Self {
            path,
            entries: Vec::new(),
            generation: 0,
        }
    }

    pub(crate) fn replace(&mut self, path: String, entries: Vec<Entry>) -> u64 {
        self.path = path;
        self.entries = entries;
        self.generation += 1;
        self.generation
    }

    pub(crate) fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name() == name)
    }
}

/// Everything the session mutates, guarded by one lock
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) view: ViewState,
    pub(crate) slots: OperationSlots,
    pub(crate) status: Option<String>,
}

impl SessionState {
    pub(crate) fn new(path: String) -> Self {
        Self {
            view: ViewState::new(path),
            ..Default::default()
        }
    }

    pub(crate) fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            path: self.view.path.clone(),
            entries: self.view.entries.clone(),
            generation: self.view.generation,
            listing: self.slots.is_busy(OperationKind::Refresh),
            running: self.slots.running(),
            status: self.status.clone(),
        }
    }
}

/// Read-only copy of the view published to renderers
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    pub path: String,
    pub entries: Vec<Entry>,
    pub generation: u64,
    /// A refresh is in flight
    pub listing: bool,
    pub running: Vec<OperationKind>,
    /// Last failure, already truncated for the status line
    pub status: Option<String>,
}

impl ViewSnapshot {
    pub fn is_running(&self, kind: OperationKind) -> bool {
        self.running.contains(&kind)
    }
}
