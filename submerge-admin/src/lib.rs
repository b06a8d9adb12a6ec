#![allow(dead_code)]

// Process-wide configuration and logging setup: the one ambient-stack crate
// every deployable binary links against, but that no library crate (net,
// txn, rowdb, ...) ever depends on itself, so those stay subscriber-agnostic
// and testable in isolation (see submerge-base::Error's `tracing::error!` at
// mint time, and submerge-net's unconditional `tracing` calls with no
// subscriber wired in).
//
// CLI flag parsing and config-file loading are out of scope (spec §1);
// `Config` is built by explicit struct construction or `Config::default()`.

use std::ops::Range;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use submerge_net::chunk::LockBackoff;
use submerge_net::hub::HubConfig;

#[cfg(test)]
use test_log::test;

/// The process-wide knobs named in spec §6 (`ip_port`, `enable_visualization`)
/// plus the retry/backoff ranges the Design Notes ask to be made
/// configurable rather than hard-coded.
#[derive(Clone, Debug)]
pub struct Config {
    /// Bind address override, e.g. for deterministic tests that want a
    /// fixed host instead of the default loopback/random-port search.
    pub ip_port: Option<String>,
    pub port_range: Range<u16>,
    /// Out of core; carried through so a deployment harness can decide
    /// whether to stand up a visualization surface alongside the peer.
    pub enable_visualization: bool,
    pub request_timeout: Duration,
    pub directory_retries: u32,
    pub directory_retry_spacing: Duration,
    pub lock_backoff: LockBackoff,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ip_port: None,
            port_range: 1024..65535,
            enable_visualization: false,
            request_timeout: Duration::from_secs(5),
            directory_retries: 1000,
            directory_retry_spacing: Duration::from_millis(1),
            lock_backoff: LockBackoff::default(),
        }
    }
}

impl Config {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            bind_host: self.ip_port.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
            port_range: self.port_range.clone(),
            request_timeout: self.request_timeout,
        }
    }
}

/// Installs a `tracing-subscriber` formatter honoring `RUST_LOG` (defaulting
/// to `info`). Call once per process; library crates never do this
/// themselves. Returns `Err` only if a global subscriber is already set.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_original_constants() {
        let c = Config::default();
        assert_eq!(c.directory_retries, 1000);
        assert_eq!(c.directory_retry_spacing, Duration::from_millis(1));
        assert!(!c.enable_visualization);
        assert!(c.ip_port.is_none());
    }

    #[test]
    fn test_hub_config_honors_ip_port_override() {
        let mut c = Config::default();
        c.ip_port = Some("10.0.0.1".to_string());
        assert_eq!(c.hub_config().bind_host, "10.0.0.1");
    }
}
