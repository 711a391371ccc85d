//! The abstract datapath contracts, per `spec.md` §4.7: a rule engine
//! (per-subscriber counting + permit) and a traffic shaper, specified by
//! contract rather than mechanism so a future native-netlink backend can
//! replace the shell-backed implementation without touching the engine.

pub mod shell;

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::DatapathError;

/// An opaque, stable identifier for an installed counting rule. Durable
/// across the engine's lifetime; callers never interpret its value.
pub type RuleHandle = u64;

#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub bytes: u64,
    pub packets: u64,
}

/// Per-subscriber forwarding + counting rules, keyed by `(ip, mac, iface)`.
/// `install_subscriber_rules` is idempotent on that triple: a caller may
/// retry after a failed install without leaking duplicate rules.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn install_subscriber_rules(
        &self,
        ip: Ipv4Addr,
        mac: &str,
        subscriber_iface: &str,
    ) -> Result<(RuleHandle, RuleHandle), DatapathError>;

    async fn delete_rule(&self, handle: RuleHandle) -> Result<(), DatapathError>;

    /// Monotonic counters are observed via a handle; counters stop
    /// advancing once the rule backing them is deleted.
    async fn snapshot_counters(&self) -> Result<HashMap<RuleHandle, Counters>, DatapathError>;

    async fn allow(&self, ip: Ipv4Addr) -> Result<(), DatapathError>;
    async fn revoke(&self, ip: Ipv4Addr) -> Result<(), DatapathError>;
}

/// Per-subscriber hierarchical shaping, identified by the subscriber's
/// IPv4 address deterministically hashed to a local handle.
#[async_trait]
pub trait TrafficShaper: Send + Sync {
    async fn add_shaping(
        &self,
        ip: Ipv4Addr,
        upload_kbit: u32,
        download_kbit: u32,
        upload_burst_kbit: Option<u32>,
        download_burst_kbit: Option<u32>,
    ) -> Result<bool, DatapathError>;

    async fn remove_shaping(&self, ip: Ipv4Addr) -> Result<bool, DatapathError>;
}
