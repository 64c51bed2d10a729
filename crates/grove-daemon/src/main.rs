//! grove-daemon: Edit remote grovebooks as local markdown files.
//!
//! Downloads grovebooks into a working directory, watches it, and uploads
//! saved files back to their server, asking it to hot-reload the notebook.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use grove_core::{Bridge, BridgeOptions, CredentialStore, SaveOutcome, SettingsStore};
use grove_daemon::daemon::log_events;
use grove_daemon::watcher::managed_relative_path;
use grove_daemon::{
    ChannelBridge, Config, Daemon, FileCredentialStore, FileWatcher, HttpGroveApi, JsonSettings,
    NativeFs, ReloadChannels, ReloadConfig, ReloadEvent, AUTO_SYNC_DELAY,
};

#[derive(Parser, Debug)]
#[command(name = "grove-daemon")]
#[command(about = "Edit remote grovebooks as local markdown files")]
struct Args {
    /// Working directory for downloaded grovebooks (default: ~/.grovebook)
    #[arg(long, global = true, env = "GROVE_WORKDIR")]
    workdir: Option<String>,

    /// Directory for settings.json and the credential vault
    #[arg(long, global = true, env = "GROVE_CONFIG_DIR")]
    config_dir: Option<String>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a grovebook from a deep link
    Open {
        /// e.g. grovebook://open?open=/api/grove/file/<project>/<file>&baseUrl=<origin>
        link: String,
    },
    /// Upload a local grovebook
    Save {
        /// Path of the .grove.md file
        path: String,
        /// Upload even when the content matches the last sync
        #[arg(long)]
        force: bool,
    },
    /// Watch the working directory and upload on every save
    Watch {
        /// Debounce uploads instead of uploading on every write
        #[arg(long)]
        auto_sync: bool,
        /// Snapshot every download into backups/
        #[arg(long)]
        backups: bool,
    },
    /// List grovebooks in the working directory
    Status,
    /// Manage API keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Move API keys out of settings.json into the credential vault
    Migrate,
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /// Store the API key for a server origin
    Set { origin: String, secret: String },
    /// Forget the API key for a server origin
    Delete { origin: String },
}

type DaemonBridge = ChannelBridge<NativeFs, HttpGroveApi, FileCredentialStore>;

type ReloadReceiver = tokio::sync::mpsc::UnboundedReceiver<ReloadEvent>;

fn build_bridge(config: &Config, options: BridgeOptions) -> Result<(DaemonBridge, ReloadReceiver)> {
    let fs = NativeFs::new(config.workdir.clone());
    let api = HttpGroveApi::new()?;
    let credentials = FileCredentialStore::new(config.credentials_path());
    let (reload, reload_rx) = ReloadChannels::new(ReloadConfig::default());
    Ok((Bridge::new(fs, api, credentials, reload, options), reload_rx))
}

/// Accept a path relative to the working directory or an absolute one inside it.
fn relative_document_path(config: &Config, path: &str) -> Result<String> {
    let candidate = Path::new(path);
    let absolute = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else if candidate.exists() {
        std::env::current_dir()?.join(candidate)
    } else {
        config.workdir.join(candidate)
    };
    let workdir = config.workdir.canonicalize().unwrap_or_else(|_| config.workdir.clone());
    let absolute = absolute.canonicalize().unwrap_or(absolute);
    managed_relative_path(&workdir, &absolute)
        .with_context(|| format!("{} is not a grovebook in {:?}", path, config.workdir))
}

async fn watch(config: Config, settings: &JsonSettings, auto_sync: bool, backups: bool) -> Result<()> {
    let stored = settings.load().await?;
    let options = BridgeOptions {
        backups: backups || stored.backups,
    };
    let auto_sync = auto_sync || stored.auto_sync;

    let (bridge, mut reload_rx) = build_bridge(&config, options)?;
    let bridge = Arc::new(bridge);
    let _log = log_events(bridge.events());
    bridge.migrate_credentials(settings).await?;

    let mut watcher = FileWatcher::new(config.workdir.clone())?;
    info!("Watching {:?} (auto-sync {})", watcher.workdir(), if auto_sync { "on" } else { "off" });

    let mut daemon = Daemon::new(Arc::clone(&bridge), auto_sync.then_some(AUTO_SYNC_DELAY));
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Daemon running. Paste grovebook links to open them; Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                daemon.on_file_event(event).await;
            }

            Some(path) = daemon.next_expired() => {
                daemon.on_autosync_expired(path);
            }

            Some(event) = reload_rx.recv() => {
                daemon.on_reload_event(event);
            }

            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(link)) if !link.trim().is_empty() => daemon.on_link(link.trim().to_string()),
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        debug!("stdin closed, no more links");
                        stdin_open = false;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    daemon.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,grove_daemon=debug"
    } else {
        "info,grove_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::resolve(args.workdir.as_deref(), args.config_dir.as_deref())?;
    config.ensure_dirs()?;
    debug!("Working directory: {:?}", config.workdir);
    debug!("Config directory: {:?}", config.config_dir);
    let settings = JsonSettings::new(config.settings_path());

    match args.command {
        Command::Open { link } => {
            let stored = settings.load().await?;
            let (bridge, _reload_rx) = build_bridge(&config, BridgeOptions { backups: stored.backups })?;
            let _log = log_events(bridge.events());
            bridge.migrate_credentials(&settings).await?;
            match bridge.open_link(&link).await? {
                Some(opened) => println!("{}", config.workdir.join(&opened.path).display()),
                None => info!("Link has nothing to open"),
            }
        }

        Command::Save { path, force } => {
            let relative = relative_document_path(&config, &path)?;
            let (bridge, _reload_rx) = build_bridge(&config, BridgeOptions::default())?;
            let _log = log_events(bridge.events());
            bridge.migrate_credentials(&settings).await?;
            // A fresh process has no session; without --force every save uploads
            let outcome = bridge.save(&relative, force).await?;
            if let SaveOutcome::Uploaded { format, reload_requested } = outcome {
                info!("Uploaded {} ({:?}, reload requested: {})", relative, format, reload_requested);
            }
            bridge.reload().shutdown().await;
        }

        Command::Watch { auto_sync, backups } => {
            watch(config, &settings, auto_sync, backups).await?;
        }

        Command::Status => {
            let (bridge, _reload_rx) = build_bridge(&config, BridgeOptions::default())?;
            let files = bridge.managed_files().await?;
            if files.is_empty() {
                println!("No grovebooks in {}", config.workdir.display());
            }
            for file in files {
                println!("{}{}\n    {}", file.remote.origin, file.remote.remote_path, file.path);
            }
        }

        Command::Key { action } => {
            let credentials = FileCredentialStore::new(config.credentials_path());
            match action {
                KeyAction::Set { origin, secret } => {
                    if secret.is_empty() {
                        bail!("API key must not be empty");
                    }
                    credentials.set(&origin, &secret).await?;
                    info!("Stored API key for {}", origin.trim_end_matches('/'));
                }
                KeyAction::Delete { origin } => {
                    credentials.delete(&origin).await?;
                    info!("Deleted API key for {}", origin.trim_end_matches('/'));
                }
            }
        }

        Command::Migrate => {
            let (bridge, _reload_rx) = build_bridge(&config, BridgeOptions::default())?;
            let _log = log_events(bridge.events());
            let report = bridge.migrate_credentials(&settings).await?;
            if !report.ran {
                info!("API keys were already migrated");
            }
        }
    }

    Ok(())
}
