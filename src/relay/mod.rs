pub mod registry;
pub mod server;

pub use registry::{Registry, Subscriber, SubscriberId};
pub use server::{
    broadcast, BroadcastReport, RelayConfig, RelayHandle, RelayServer, RelayStats, RunningRelay,
};
