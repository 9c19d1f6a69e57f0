//! Shared types for storage providers
//!
//! This module contains the types every backend speaks: configuration structs,
//! the remote entry model, listing pages and the provider error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// Path separator used by every backend's navigation paths
pub const PATH_SEPARATOR: char = '/';

/// Supported storage provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Amazon S3 and S3-compatible object storage
    S3,
    /// SSH File Transfer Protocol
    Sftp,
    /// Custom store (not implemented yet, always reports "not ready")
    Custom,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::S3 => write!(f, "S3"),
            ProviderType::Sftp => write!(f, "SFTP"),
            ProviderType::Custom => write!(f, "Custom"),
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "s3" => Ok(ProviderType::S3),
            "sftp" | "ssh" => Ok(ProviderType::Sftp),
            "custom" | "mystor" => Ok(ProviderType::Custom),
            other => Err(ProviderError::InvalidConfig(format!("Unknown backend: {}", other))),
        }
    }
}

impl ProviderType {
    /// Get default port for this provider type
    pub fn default_port(&self) -> u16 {
        match self {
            ProviderType::S3 => 443,
            ProviderType::Sftp => 22,
            ProviderType::Custom => 0,
        }
    }

    /// Key under which connection profiles for this backend are persisted
    pub fn profile_key(&self) -> &'static str {
        match self {
            ProviderType::S3 => "s3",
            ProviderType::Sftp => "sftp",
            ProviderType::Custom => "custom",
        }
    }
}

/// Generic provider configuration
///
/// Already-resolved connection parameters for one backend.
/// Provider-specific fields are stored in the `extra` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Display name for this connection
    pub name: String,
    /// Provider type
    pub provider_type: Option<ProviderType>,
    /// Host or endpoint URL
    pub host: String,
    /// Port number (uses default if None)
    pub port: Option<u16>,
    /// Username or access key id
    pub username: Option<String>,
    /// Password or secret key. Never persisted.
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Root path (SFTP directory) the session starts in
    pub initial_path: Option<String>,
    /// Extra provider-specific options
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ProviderConfig {
    /// Provider type, or an error when the profile never chose one
    pub fn kind(&self) -> Result<ProviderType, ProviderError> {
        self.provider_type
            .ok_or_else(|| ProviderError::InvalidConfig("Backend type is required".to_string()))
    }

    fn flag(&self, key: &str) -> Option<bool> {
        self.extra.get(key).map(|v| v == "true" || v == "1")
    }
}

/// S3-specific configuration
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3-compatible endpoint URL (None for AWS S3)
    pub endpoint: Option<String>,
    /// Signing region (e.g., us-east-1)
    pub region: String,
    /// Access key ID (empty for anonymous access)
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: secrecy::SecretString,
    /// Bucket name (empty when only listing buckets)
    pub bucket: String,
    /// Root key prefix inside the bucket, "" or ending with "/"
    pub prefix: String,
    /// Use path-style addressing (MinIO and most S3-compatible stores)
    pub path_style: bool,
    /// Whether to verify TLS certificates
    pub verify_cert: bool,
    /// Max keys per list request (None = server default)
    pub page_size: Option<u32>,
}

impl S3Config {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let raw_bucket = config.extra.get("bucket").map(|b| b.trim()).unwrap_or("");
        let (bucket, prefix) = split_bucket_path(raw_bucket);

        let region = config
            .extra
            .get("region")
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string());

        let host = config.host.trim();
        let endpoint = if host.is_empty() || host == "s3.amazonaws.com" {
            None
        } else if host.starts_with("http://") || host.starts_with("https://") {
            Some(host.trim_end_matches('/').to_string())
        } else {
            Some(format!("https://{}", host.trim_end_matches('/')))
        };

        let page_size = match config.extra.get("page_size") {
            Some(v) => Some(v.parse().map_err(|_| {
                ProviderError::InvalidConfig(format!("page_size must be a number, got {}", v))
            })?),
            None => None,
        };

        Ok(Self {
            endpoint,
            region,
            access_key_id: config.username.clone().unwrap_or_default(),
            secret_access_key: secrecy::SecretString::from(config.password.clone().unwrap_or_default()),
            bucket,
            prefix,
            path_style: config.flag("path_style").unwrap_or(true),
            verify_cert: config.flag("verify_cert").unwrap_or(true),
            page_size,
        })
    }
}

/// Split "bucket/sub/path" into the bucket name and a normalized root prefix
pub fn split_bucket_path(raw: &str) -> (String, String) {
    match raw.split_once(PATH_SEPARATOR) {
        Some((bucket, rest)) => (bucket.to_string(), normalize_dir(rest.trim_start_matches(PATH_SEPARATOR))),
        None => (raw.to_string(), String::new()),
    }
}

/// Ensure a non-empty directory path ends with the separator
pub fn normalize_dir(path: &str) -> String {
    if path.is_empty() || path.ends_with(PATH_SEPARATOR) {
        path.to_string()
    } else {
        format!("{}{}", path, PATH_SEPARATOR)
    }
}

/// SFTP-specific configuration
#[derive(Debug, Clone)]
pub struct SftpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Password, also used to answer keyboard-interactive prompts
    pub password: Option<secrecy::SecretString>,
    /// Path to private key file (e.g., ~/.ssh/id_ed25519)
    pub private_key_path: Option<String>,
    /// Passphrase for encrypted private key
    pub key_passphrase: Option<secrecy::SecretString>,
    /// Root directory; the server's working directory when None
    pub initial_path: Option<String>,
    /// Connection timeout in seconds
    pub timeout_secs: u64,
}

impl SftpConfig {
    pub fn from_provider_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let username = config
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| ProviderError::InvalidConfig("Username required for SFTP".to_string()))?;

        let (host, port) = split_host_port(
            config.host.trim(),
            config.port.unwrap_or(ProviderType::Sftp.default_port()),
        )?;

        let timeout_secs = config
            .extra
            .get("timeout")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            host,
            port,
            username,
            password: config.password.clone().map(secrecy::SecretString::from),
            private_key_path: config.extra.get("private_key_path").cloned(),
            key_passphrase: config
                .extra
                .get("key_passphrase")
                .map(|v| secrecy::SecretString::from(v.clone())),
            initial_path: config.initial_path.clone().filter(|p| !p.is_empty()),
            timeout_secs,
        })
    }
}

/// Split "host:port"; a bare host gets the default port
fn split_host_port(server: &str, default_port: u16) -> Result<(String, u16), ProviderError> {
    if server.is_empty() {
        return Err(ProviderError::InvalidConfig("Server address is required".to_string()));
    }
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| ProviderError::InvalidConfig(format!("Invalid port in {}", server)))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((server.to_string(), default_port)),
    }
}

/// Kind of a remote entry, decided when the entry is built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Regular,
    Directory,
}

/// One remote object or directory node
///
/// Directory names always end with [`PATH_SEPARATOR`]; names are relative to
/// the listed path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    name: String,
    kind: EntryKind,
    size: u64,
    content_type: Option<String>,
    modified: Option<DateTime<Utc>>,
}

impl Entry {
    /// Directory entry; a missing trailing separator is added
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: normalize_dir(&name.into()),
            kind: EntryKind::Directory,
            size: 0,
            content_type: None,
            modified: None,
        }
    }

    /// Directory entry with the modification time the server reported
    pub fn directory_at(name: impl Into<String>, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            modified,
            ..Self::directory(name)
        }
    }

    /// Regular file entry
    pub fn file(name: impl Into<String>, size: u64, modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular,
            size,
            content_type: None,
            modified,
        }
    }

    /// Stand-in for a freshly uploaded file until the next refresh
    pub fn placeholder(name: impl Into<String>) -> Self {
        Self::file(name, 1, Some(Utc::now()))
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Size in bytes, 0 for directories
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    /// Timestamp and size, the short description shown for a selected file
    pub fn info(&self) -> String {
        format!("{} {:>8}", self.timestamp(), format_size(self.size))
    }

    fn timestamp(&self) -> String {
        self.modified
            .unwrap_or(DateTime::UNIX_EPOCH)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.info(), self.name)
    }
}

/// Human readable byte count with short binary units (512B, 1K, 1.5M)
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["K", "M", "G", "T", "P", "E"];
    if bytes < 1024 {
        return format!("{}B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }
    let text = format!("{:.1}", value);
    format!("{}{}", text.trim_end_matches(".0"), unit)
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListPage {
    pub entries: Vec<Entry>,
    /// Cursor for the next page; empty when the listing is exhausted
    pub next_cursor: String,
}

impl ListPage {
    pub fn new(entries: Vec<Entry>, next_cursor: impl Into<String>) -> Self {
        Self {
            entries,
            next_cursor: next_cursor.into(),
        }
    }

    /// Whether this was the last page
    pub fn is_last(&self) -> bool {
        self.next_cursor.is_empty()
    }
}

/// Seekable byte source for uploads (adapters may re-read it)
pub trait UploadSource: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Sync + Unpin + ?Sized> UploadSource for T {}

/// Destination for downloads, written chunk by chunk
pub trait DownloadSink: AsyncWrite + Send + Unpin {}

impl<T: AsyncWrite + Send + Unpin + ?Sized> DownloadSink for T {}

/// Provider error type
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not connected to server")]
    NotConnected,

    #[error("not ready")]
    NotReady,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Sftp(#[from] russh_sftp::client::error::Error),

    /// Operation and key/path context around an underlying failure
    #[error("{op} {target}")]
    Context {
        op: &'static str,
        target: String,
        #[source]
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Wrap an error with the operation and the key or path it touched
    pub fn context(op: &'static str, target: impl Into<String>, source: impl Into<ProviderError>) -> Self {
        let source = source.into();
        // Cancellation stays recognizable without unwrapping.
        if matches!(source, ProviderError::Cancelled) {
            return source;
        }
        ProviderError::Context {
            op,
            target: target.into(),
            source: Box::new(source),
        }
    }

    /// Innermost provider error below any context wrappers
    pub fn innermost(&self) -> &ProviderError {
        let mut current = self;
        while let ProviderError::Context { source, .. } = current {
            current = source;
        }
        current
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.innermost(), ProviderError::Cancelled)
    }

    /// Check if this error is transient (worth retrying), judged by the root cause
    pub fn is_recoverable(&self) -> bool {
        match self.innermost() {
            ProviderError::NetworkError(_) | ProviderError::NotConnected => true,
            ProviderError::Http(e) => e.is_timeout() || e.is_connect(),
            ProviderError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

/// Innermost error of a `source()` chain
pub fn root_cause<'a>(err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current
}
