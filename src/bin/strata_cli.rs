//! Strata CLI - browse S3 buckets and SFTP servers from the terminal
//!
//! Usage:
//!   strata-cli --backend s3 --endpoint localhost:9000 --bucket photos ls [path]
//!   strata-cli --backend sftp --host example.org --user me get <key> [local]
//!   strata-cli --profile sftp put <local> [key]
//!   strata-cli --profile s3 rm <key>
//!   strata-cli --profile s3 stat <key>
//!   strata-cli --backend s3 --user AKIA... --password ... buckets
//!   strata-cli --backend sftp --host example.org --user me save

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use std::fs::OpenOptions;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use strata::config::{load_profiles, save_profiles, validate_profile};
use strata::navigation::{split_key, status_message};
use strata::providers::{S3Config, S3Provider};
use strata::{
    NavError, Navigator, OperationKind, ProviderConfig, ProviderError, ProviderFactory, ProviderType, StorageProvider,
};

#[derive(Parser)]
#[command(
    name = "strata-cli",
    about = "Strata CLI - browse remote storage",
    version,
    long_about = "Lists, downloads, uploads and deletes objects on S3-compatible storage and SFTP servers.\nConnection settings come from flags or a saved profile (--profile)."
)]
struct Cli {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Log file (default: <tmp>/strata.log)
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Log at DEBUG level
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConnectionArgs {
    /// Backend: s3, sftp or custom
    #[arg(long, global = true)]
    backend: Option<String>,

    /// S3 endpoint or SFTP host, optionally with :port
    #[arg(long, alias = "host", global = true)]
    endpoint: Option<String>,

    /// S3 region
    #[arg(long, global = true)]
    region: Option<String>,

    /// S3 bucket, optionally followed by a root prefix (bucket/sub/path)
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// S3 access key or SFTP user
    #[arg(long, global = true)]
    user: Option<String>,

    /// S3 secret key or SFTP password
    #[arg(long, global = true)]
    password: Option<String>,

    /// Initial directory on the remote side
    #[arg(long, global = true)]
    dir: Option<String>,

    /// Load a saved connection profile
    #[arg(long, global = true)]
    profile: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory (Ctrl-C stops after the pages received so far)
    Ls {
        /// Remote path (default: the initial directory)
        path: Option<String>,
    },
    /// Download an object
    Get {
        /// Remote key
        key: String,
        /// Local destination (default: the key's file name)
        local: Option<PathBuf>,
    },
    /// Upload a local file
    Put {
        /// Local file path
        local: PathBuf,
        /// Remote key (default: the file name in the initial directory)
        key: Option<String>,
    },
    /// Delete an object
    Rm {
        /// Remote key
        key: String,
    },
    /// Show size, type and modification time of an object
    Stat {
        /// Remote key
        key: String,
    },
    /// List the buckets visible to the S3 credentials
    Buckets,
    /// Save the connection settings as a profile (secrets are not stored)
    Save,
}

fn init_logging(path: &Path, debug: bool) -> anyhow::Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .init();
    Ok(())
}

/// Merge the saved profile (if any) with the flags given on the command line
fn resolve_config(args: &ConnectionArgs) -> anyhow::Result<ProviderConfig> {
    let mut config = match &args.profile {
        Some(name) => load_profiles()
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("No saved profile named {}", name))?,
        None => ProviderConfig::default(),
    };

    if let Some(backend) = &args.backend {
        config.provider_type = Some(backend.parse()?);
    }
    if let Some(endpoint) = &args.endpoint {
        config.host = endpoint.clone();
    }
    if let Some(user) = &args.user {
        config.username = Some(user.clone());
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    if let Some(dir) = &args.dir {
        config.initial_path = Some(dir.clone());
    }
    if let Some(region) = &args.region {
        config.extra.insert("region".to_string(), region.clone());
    }
    if let Some(bucket) = &args.bucket {
        config.extra.insert("bucket".to_string(), bucket.clone());
    }

    let kind = config.kind()?;
    if config.name.is_empty() {
        config.name = kind.profile_key().to_string();
    }
    Ok(config)
}

/// Wait for `task`, cancelling its operation on Ctrl-C
async fn wait_interruptible<T>(
    navigator: &Navigator,
    kind: OperationKind,
    task: impl Future<Output = Result<T, NavError>>,
) -> Result<T, NavError> {
    tokio::pin!(task);
    tokio::select! {
        result = &mut task => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted, cancelling {}", kind);
            navigator.cancel(kind);
            task.await
        }
    }
}

/// Print the entries of the view
fn print_view(navigator: &Navigator) {
    for entry in &navigator.snapshot().entries {
        println!("{}", entry);
    }
}

/// One-line message for a failed command: the root cause for storage errors,
/// the whole context chain for everything else
fn error_line(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<NavError>() {
        return e.status_line();
    }
    if let Some(e) = err.downcast_ref::<ProviderError>() {
        return status_message(e);
    }
    format!("{:#}", err)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = resolve_config(&cli.connection)?;

    match cli.command {
        Commands::Save => {
            validate_profile(&config)?;
            let mut profiles = load_profiles();
            let name = cli
                .connection
                .profile
                .clone()
                .unwrap_or_else(|| config.name.clone());
            profiles.insert(name.clone(), config);
            let path = save_profiles(&profiles)?;
            println!("Saved profile {} to {}", name, path.display());
            return Ok(());
        }
        Commands::Buckets => {
            if config.kind()? != ProviderType::S3 {
                bail!("Bucket listing needs the s3 backend");
            }
            let provider = S3Provider::new(S3Config::from_provider_config(&config)?)?;
            for bucket in provider.list_buckets(&CancellationToken::new()).await? {
                println!("{}", bucket);
            }
            return Ok(());
        }
        _ => {}
    }

    let provider = ProviderFactory::connect(&config).await?;
    let navigator = Navigator::new(provider.clone());
    let outcome = run_navigation(&navigator, provider.as_ref(), cli.command).await;
    if let Err(e) = navigator.close().await {
        tracing::warn!("Close failed: {}", e);
    }
    outcome
}

async fn run_navigation(
    navigator: &Navigator,
    provider: &dyn StorageProvider,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::Ls { path } => {
            let path = path.unwrap_or_else(|| navigator.current_path());
            let task = navigator.refresh(&path)?;
            let outcome = wait_interruptible(navigator, OperationKind::Refresh, task.wait()).await;
            print_view(navigator);
            match outcome {
                Ok(_) | Err(NavError::Cancelled) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Commands::Get { key, local } => {
            let local = match local {
                Some(local) => local,
                None => PathBuf::from(split_key(&key).1),
            };
            let task = navigator.download_to_file(&key, &local).await?;
            wait_interruptible(navigator, OperationKind::Download, task.wait()).await?;
            println!("{} -> {}", key, local.display());
            Ok(())
        }
        Commands::Put { local, key } => {
            let task = match key {
                Some(key) => {
                    let file = tokio::fs::File::open(&local)
                        .await
                        .with_context(|| format!("Cannot open {}", local.display()))?;
                    let content_type = mime_guess::from_path(&local)
                        .first()
                        .map(|m| m.essence_str().to_string());
                    navigator.upload(Box::new(file), &key, content_type)?
                }
                None => navigator.upload_file(&local).await?,
            };
            wait_interruptible(navigator, OperationKind::Upload, task.wait()).await?;
            println!("{} uploaded", local.display());
            Ok(())
        }
        Commands::Rm { key } => {
            let task = navigator.delete(&key)?;
            wait_interruptible(navigator, OperationKind::Delete, task.wait()).await?;
            println!("{} deleted", key);
            Ok(())
        }
        Commands::Stat { key } => {
            let entry = provider.stat(&key, &CancellationToken::new()).await?;
            println!("{}", entry);
            if let Some(content_type) = entry.content_type() {
                println!("type: {}", content_type);
            }
            Ok(())
        }
        Commands::Save | Commands::Buckets => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_path = cli
        .log
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("strata.log"));
    if let Err(e) = init_logging(&log_path, cli.debug) {
        eprintln!("Warning: {:#}", e);
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", error_line(&e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_line_shows_root_cause() {
        let err = NavError::Operation {
            kind: OperationKind::Refresh,
            target: "a/".to_string(),
            source: ProviderError::context("list", "a/", ProviderError::NotFound("bucket/a/".to_string())),
        };
        assert_eq!(error_line(&err.into()), "Path not found: bucket/a/");

        let connect = ProviderError::context(
            "connect",
            "host:22",
            ProviderError::AuthenticationFailed("bad password".to_string()),
        );
        assert_eq!(error_line(&connect.into()), "Authentication failed: bad password");
    }

    #[test]
    fn test_error_line_keeps_local_context() {
        let err = anyhow!("disk full").context("Cannot open report.txt");
        assert_eq!(error_line(&err), "Cannot open report.txt: disk full");
    }
}
