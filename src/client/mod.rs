pub mod notify;
pub mod sync_client;

pub use notify::{notify, notify_with_timeout};
pub use sync_client::{LinkState, SyncClient, SyncOptions, SyncOutcome};
