//! Strata - paged browsing of remote storage
//!
//! A small engine that lists, uploads, downloads and deletes objects on
//! S3-compatible object storage and SFTP servers behind one provider trait,
//! with a navigation controller that streams listing pages into a view.

pub mod config;
pub mod listing;
pub mod navigation;
pub mod providers;

pub use navigation::{NavError, Navigator, OperationKind, Task, ViewSnapshot};
pub use providers::{
    Entry, EntryKind, ListPage, ProviderConfig, ProviderError, ProviderFactory, ProviderType,
    StorageProvider,
};
