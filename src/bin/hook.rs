//! Post-receive hook: tell the relay a branch changed.
//!
//! Usage: `vcfs-hook <host> <port> <branch>`

use std::net::Ipv6Addr;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "vcfs-hook", about = "Notify the vcfs relay that a branch was updated", version)]
struct Args {
    /// Relay host
    host: String,

    /// Relay notify port
    port: u16,

    /// Updated branch, sent as the notification payload
    branch: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log = vcfs::logging::init("warn", None);

    let addr = relay_addr(&args.host, args.port);
    vcfs::notify(&addr, args.branch.as_bytes())
        .await
        .with_context(|| format!("notifying relay at {addr}"))?;
    Ok(())
}

/// `host:port`, bracketing bare IPv6 literals
fn relay_addr(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let addr = relay_addr("::1", 9001);
        assert_eq!(addr, "[::1]:9001");
        assert!(addr.parse::<SocketAddr>().is_ok());

        assert_eq!(relay_addr("127.0.0.1", 9001), "127.0.0.1:9001");
        assert_eq!(relay_addr("relay.internal", 9001), "relay.internal:9001");
        assert_eq!(relay_addr("[::1]", 9001), "[::1]:9001");
    }
}
