use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::{info, warn};

use vcfs::{
    logging, GitCli, MountSession, RelayServer, RepoPaths, SyncAction, SyncClient, SyncOutcome,
    VcfsConfig,
};

#[derive(Parser)]
#[command(name = "vcfs")]
#[command(about = "Notification relay and lazy pull-before-serve sync for version-controlled mounts", version)]
#[command(after_help = "Environment:
  VCFS_PREFIX           root of the backing working trees (default /vcfs)
  VCFS_RELAY            relay subscribe endpoint for replicas
  VCFS_NOTIFY           relay notify endpoint for hooks
  VCFS_NOTIFY_PORT      relay notify listener port (default 9001)
  VCFS_SUBSCRIBE_PORT   relay subscribe listener port (default 9000)
  RUST_LOG              log filter, e.g. vcfs=debug")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "VCFS_CONFIG")]
    config: Option<PathBuf>,

    /// Also write daily-rotated logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the notification relay
    Relay {
        /// Port replicas subscribe on
        #[arg(short, long)]
        port: Option<u16>,

        /// Port hooks send notifications to
        #[arg(long)]
        hook_port: Option<u16>,
    },

    /// Send one notification to the relay (what the post-receive hook does)
    Notify {
        /// Payload, conventionally the branch name
        payload: String,

        /// Relay notify endpoint, host:port
        #[arg(short, long)]
        relay: Option<String>,
    },

    /// Keep a mounted replica's working tree in step with the relay
    Follow {
        /// Mount point whose backing tree lives under the prefix
        mount_point: PathBuf,

        /// Relay subscribe endpoint, host:port
        #[arg(short, long)]
        relay: Option<String>,

        /// How often to poll the relay link
        #[arg(long, default_value = "500")]
        interval_ms: u64,

        /// Fail instead of starting offline when the relay is unreachable
        #[arg(long)]
        strict: bool,
    },

    /// Commit and push pending edits of a mounted replica
    Publish {
        mount_point: PathBuf,
    },
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log = logging::init("vcfs=info", cli.log_dir.as_deref());

    let config = VcfsConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Relay { port, hook_port } => {
            let mut relay_config = config.relay_config();
            if let Some(port) = port {
                relay_config.subscribe_addr.set_port(port);
            }
            if let Some(port) = hook_port {
                relay_config.notify_addr.set_port(port);
            }

            let server = RelayServer::bind(relay_config)
                .await
                .context("binding relay listeners")?;
            println!(
                "{} relay up: subscribe {}, notify {}",
                "✓".green(),
                server.subscribe_addr().to_string().bright_white(),
                server.notify_addr().to_string().bright_white()
            );

            let running = server.spawn();
            tokio::signal::ctrl_c().await?;
            println!("{}", "Shutting down relay...".yellow());
            running.shutdown().await?;
        }

        Commands::Notify { payload, relay } => {
            let addr = relay.unwrap_or(config.client.notify);
            vcfs::notify(&addr, payload.as_bytes())
                .await
                .with_context(|| format!("notifying relay at {addr}"))?;
            println!("{} Notified {} ({})", "✓".green(), addr, payload.bright_yellow());
        }

        Commands::Follow {
            mount_point,
            relay,
            interval_ms,
            strict,
        } => {
            let paths = RepoPaths::new(&config.mount.prefix, &mount_point);
            let git: Arc<dyn SyncAction> = Arc::new(
                GitCli::new(paths.root()).with_commit_message(config.mount.commit_message.clone()),
            );
            let addr = relay.unwrap_or_else(|| config.client.relay.clone());
            let options = config.sync_options();

            let client = if strict {
                SyncClient::connect(addr.clone(), options, git.clone())
                    .await
                    .with_context(|| format!("subscribing to relay at {addr}"))?
            } else {
                SyncClient::connect_or_offline(addr.clone(), options, git.clone()).await
            };

            println!(
                "{} Following {} via {}",
                "👁".cyan(),
                paths.root().display().to_string().bright_white(),
                addr
            );
            let session = Arc::new(MountSession::new(paths, client, git));
            follow(
                session,
                Duration::from_millis(interval_ms),
                tokio::signal::ctrl_c(),
            )
            .await?;
            println!("{}", "Stopped following".yellow());
        }

        Commands::Publish { mount_point } => {
            let paths = RepoPaths::new(&config.mount.prefix, &mount_point);
            let git = Arc::new(
                GitCli::new(paths.root()).with_commit_message(config.mount.commit_message.clone()),
            );
            let session = MountSession::standalone(paths, git);
            tokio::task::spawn_blocking(move || session.flush())
                .await?
                .context("publishing changes")?;
            println!("{} Changes published", "✓".green());
        }
    }

    Ok(())
}

/// Poll the relay link until `shutdown` resolves, pulling whenever it has news
async fn follow<F>(session: Arc<MountSession>, interval: Duration, shutdown: F) -> Result<()>
where
    F: Future<Output = std::io::Result<()>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let session = session.clone();
                match tokio::task::spawn_blocking(move || session.before_op()).await? {
                    SyncOutcome::Pulled { frames } => {
                        info!(frames, "working tree updated");
                        println!("{} Pulled ({} notification(s))", "✓".green(), frames);
                    }
                    SyncOutcome::PullFailed { frames } => {
                        warn!(frames, "pull failed");
                        println!("{} Pull failed, keeping current tree", "✗".red());
                    }
                    SyncOutcome::Idle | SyncOutcome::Offline => {}
                }
            }
            stopped = &mut shutdown => {
                stopped.context("waiting for shutdown signal")?;
                return Ok(());
            }
        }
    }
}
