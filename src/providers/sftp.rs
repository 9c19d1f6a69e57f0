//! SFTP Provider Implementation
//!
//! SSH File Transfer Protocol support on top of russh and russh-sftp.
//! Authentication tries the private key, then the password, then
//! keyboard-interactive (every prompt answered with the password).
//!
//! Directories are real here, so a listing is always a single page.

use async_trait::async_trait;
use chrono::DateTime;
use russh::client::{self, AuthResult, Config, Handle, Handler, KeyboardInteractiveAuthResponse};
use russh::keys::{self, known_hosts, PrivateKeyWithHashAlg, PublicKey};
use russh_sftp::client::SftpSession;
use secrecy::ExposeSecret;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    cancellable, DownloadSink, Entry, ListPage, ProviderError, ProviderType, SftpConfig, StorageProvider,
    UploadSource, PATH_SEPARATOR,
};

/// Upper bound on keyboard-interactive prompt rounds
const MAX_INTERACTIVE_ROUNDS: usize = 8;

/// SSH handler, host keys are checked against known_hosts (trust on first use)
struct SftpHandler {
    host: String,
    port: u16,
}

impl Handler for SftpHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        match known_hosts::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                info!("SFTP: learning new host key for {}:{}", self.host, self.port);
                if let Err(e) = known_hosts::learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!("SFTP: failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(keys::Error::KeyChanged { line }) => {
                tracing::error!(
                    "SFTP: REJECTING {} - host key changed at line {} (possible MITM)",
                    self.host,
                    line
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!("SFTP: REJECTING {} - known_hosts verification error: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

/// Live SSH connection and the SFTP subsystem on top of it
struct SftpLink {
    sftp: SftpSession,
    handle: Handle<SftpHandler>,
}

/// SFTP Provider
pub struct SftpProvider {
    config: SftpConfig,
    /// Absolute working directory resolved at connect time
    root: String,
    link: Mutex<Option<Arc<SftpLink>>>,
}

impl SftpProvider {
    /// Connect, authenticate and open the SFTP subsystem
    pub async fn connect(config: SftpConfig) -> Result<Self, ProviderError> {
        let target = format!("{}:{}", config.host, config.port);
        let ssh_config = Config {
            inactivity_timeout: Some(Duration::from_secs(120)),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = SftpHandler {
            host: config.host.clone(),
            port: config.port,
        };
        let mut handle = tokio::time::timeout(
            Duration::from_secs(config.timeout_secs),
            client::connect(Arc::new(ssh_config), target.as_str(), handler),
        )
        .await
        .map_err(|_| ProviderError::ConnectionFailed(format!("{} timed out", target)))?
        .map_err(|e| ProviderError::context("connect", target.clone(), e))?;

        if !authenticate(&mut handle, &config).await? {
            return Err(ProviderError::AuthenticationFailed(format!(
                "{}@{}: no method accepted",
                config.username, target
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ProviderError::context("open session", target.clone(), e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ProviderError::context("request subsystem", target.clone(), e))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ProviderError::context("start sftp", target.clone(), e))?;

        let start = config.initial_path.clone().unwrap_or_else(|| ".".to_string());
        let root = sftp
            .canonicalize(start.as_str())
            .await
            .map_err(|e| ProviderError::context("resolve", start.clone(), e))?;

        info!("SFTP connected to {} in {}", target, root);

        Ok(Self {
            config,
            root,
            link: Mutex::new(Some(Arc::new(SftpLink { sftp, handle }))),
        })
    }

    fn link(&self) -> Result<Arc<SftpLink>, ProviderError> {
        self.link
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(ProviderError::NotConnected)
    }

    fn resolve(&self, path: &str) -> String {
        resolve_path(&self.root, path)
    }
}

/// Try private key, password, then keyboard-interactive
async fn authenticate(handle: &mut Handle<SftpHandler>, config: &SftpConfig) -> Result<bool, ProviderError> {
    let username = config.username.as_str();

    if let Some(ref key_path) = config.private_key_path {
        let passphrase = config.key_passphrase.as_ref().map(|p| p.expose_secret().to_string());
        match keys::load_secret_key(key_path, passphrase.as_deref()) {
            Ok(key) => {
                let key_pair = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                if let Ok(AuthResult::Success) = handle.authenticate_publickey(username, key_pair).await {
                    return Ok(true);
                }
                debug!("SFTP: public key rejected for {}", username);
            }
            Err(e) => warn!("SFTP: cannot load private key {}: {}", key_path, e),
        }
    }

    let Some(ref password) = config.password else {
        return Ok(false);
    };
    let password = password.expose_secret();

    if let AuthResult::Success = handle.authenticate_password(username, password).await? {
        return Ok(true);
    }
    debug!("SFTP: password rejected for {}, trying keyboard-interactive", username);

    let mut response = handle
        .authenticate_keyboard_interactive_start(username, None::<String>)
        .await?;
    for _ in 0..MAX_INTERACTIVE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(true),
            KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                let answers = prompts.iter().map(|_| password.to_string()).collect();
                response = handle.authenticate_keyboard_interactive_respond(answers).await?;
            }
            _ => return Ok(false),
        }
    }
    Ok(false)
}

/// Absolute remote path for a navigation path or key; "" is the working directory
fn resolve_path(root: &str, path: &str) -> String {
    let joined = if path.is_empty() {
        root.to_string()
    } else if path.starts_with(PATH_SEPARATOR) {
        path.to_string()
    } else {
        format!("{}/{}", root.trim_end_matches(PATH_SEPARATOR), path)
    };
    let trimmed = joined.trim_end_matches(PATH_SEPARATOR);
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn entry_from_listing(name: &str, is_dir: bool, size: u64, mtime: Option<u32>) -> Entry {
    let modified = mtime.and_then(|t| DateTime::from_timestamp(i64::from(t), 0));
    if is_dir {
        Entry::directory_at(name, modified)
    } else {
        Entry::file(name, size, modified)
    }
}

#[async_trait]
impl StorageProvider for SftpProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Sftp
    }

    fn display_name(&self) -> String {
        format!("{}@{}:{}", self.config.username, self.config.host, self.root)
    }

    fn initial_path(&self) -> String {
        if self.root.ends_with(PATH_SEPARATOR) {
            self.root.clone()
        } else {
            format!("{}{}", self.root, PATH_SEPARATOR)
        }
    }

    async fn list(&self, path: &str, cursor: &str, cancel: &CancellationToken) -> Result<ListPage, ProviderError> {
        debug!("SFTP list path={:?} cursor={:?}", path, cursor);
        // One page holds the whole directory
        if !cursor.is_empty() {
            return Ok(ListPage::default());
        }

        let dir = self.resolve(path);
        let result = cancellable(cancel, async {
            let link = self.link()?;
            let read_dir = link.sftp.read_dir(dir.as_str()).await?;
            let entries = read_dir
                .filter_map(|entry| {
                    let name = entry.file_name();
                    if name == "." || name == ".." {
                        return None;
                    }
                    let metadata = entry.metadata();
                    Some(entry_from_listing(
                        &name,
                        metadata.is_dir(),
                        metadata.size.unwrap_or(0),
                        metadata.mtime,
                    ))
                })
                .collect();
            Ok(ListPage::new(entries, ""))
        })
        .await;

        result.map_err(|e| ProviderError::context("list", dir, e))
    }

    async fn upload(
        &self,
        mut source: Box<dyn UploadSource>,
        key: &str,
        _content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let remote = self.resolve(key);
        let result = cancellable(cancel, async {
            let link = self.link()?;
            let mut file = link.sftp.create(remote.as_str()).await?;
            let written = tokio::io::copy(&mut source, &mut file).await?;
            file.shutdown().await?;
            Ok(written)
        })
        .await;

        match result {
            Ok(written) => {
                info!("Uploaded {} bytes to {}", written, remote);
                Ok(())
            }
            Err(e) => {
                warn!("SFTP upload of {} failed: {}", remote, e);
                Err(ProviderError::context("upload", remote, e))
            }
        }
    }

    async fn download(
        &self,
        sink: &mut dyn DownloadSink,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let remote = self.resolve(key);
        let result = cancellable(cancel, async {
            let link = self.link()?;
            let mut file = link.sftp.open(remote.as_str()).await?;
            let received = tokio::io::copy(&mut file, &mut *sink).await?;
            sink.flush().await?;
            Ok(received)
        })
        .await;

        match result {
            Ok(received) => {
                info!("Downloaded {} bytes from {}", received, remote);
                Ok(())
            }
            Err(e) => {
                warn!("SFTP download of {} failed: {}", remote, e);
                Err(ProviderError::context("download", remote, e))
            }
        }
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let remote = self.resolve(key);
        let result = cancellable(cancel, async {
            let link = self.link()?;
            link.sftp.remove_file(remote.as_str()).await?;
            Ok(())
        })
        .await;

        match result {
            Ok(()) => {
                info!("Deleted {}", remote);
                Ok(())
            }
            Err(e) => {
                warn!("SFTP delete of {} failed: {}", remote, e);
                Err(ProviderError::context("delete", remote, e))
            }
        }
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> Result<Entry, ProviderError> {
        let remote = self.resolve(key);
        let result = cancellable(cancel, async {
            let link = self.link()?;
            let metadata = link.sftp.metadata(remote.as_str()).await?;
            Ok(entry_from_listing(
                key.trim_end_matches(PATH_SEPARATOR),
                metadata.is_dir(),
                metadata.size.unwrap_or(0),
                metadata.mtime,
            ))
        })
        .await;

        result.map_err(|e| ProviderError::context("stat", remote, e))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(link) = link else {
            return Ok(());
        };

        let closed = link.sftp.close().await;
        if let Err(e) = link
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SFTP disconnect: {}", e);
        }
        info!("SFTP session to {} closed", self.config.host);
        closed.map_err(|e| ProviderError::context("close", self.config.host.clone(), e))
    }
}
