//! # vcfs - Notification relay for version-controlled mounts
//!
//! A relay fans out "the repository changed" messages from version-control
//! hooks to every mounted replica. Replicas pull lazily: each filesystem
//! operation first checks, without blocking, whether a notification arrived
//! and pulls before serving if one did.
//!
//! ## Features
//!
//! - **Length-prefixed framing**: 4-byte big-endian length, opaque payload
//! - **Single-owner relay**: one control task owns the subscriber registry
//! - **Slow-subscriber isolation**: per-write deadlines, dead peers are pruned
//! - **Pull-before-serve**: non-blocking drain, coalesced pulls, offline fallback
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vcfs::{GitCli, RelayConfig, RelayServer, SyncClient, SyncOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let relay = RelayServer::bind(RelayConfig::local()).await?;
//!     let subscribe = relay.subscribe_addr().to_string();
//!     let notify = relay.notify_addr().to_string();
//!     let running = relay.spawn();
//!
//!     let git = Arc::new(GitCli::new("/vcfs/mnt/docs"));
//!     let client = SyncClient::connect(subscribe, SyncOptions::default(), git).await?;
//!
//!     vcfs::notify(&notify, b"main").await?;
//!     println!("{:?}", client.check_and_sync());
//!
//!     running.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mount;
pub mod protocol;
pub mod relay;
pub mod vcs;

// Re-export main types for library consumers
pub use client::{notify, notify_with_timeout, LinkState, SyncClient, SyncOptions, SyncOutcome};
pub use config::VcfsConfig;
pub use error::{RelayError, Result, RetryPolicy};
pub use mount::{MountSession, RepoPaths};
pub use relay::{RelayConfig, RelayHandle, RelayServer, RelayStats, RunningRelay};
pub use vcs::{GitCli, SyncAction};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
