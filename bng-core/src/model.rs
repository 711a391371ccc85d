//! The subscriber session table's value types: `Session`, `Tombstone`, the
//! lease-service's read-only `Lease`, and the access-router inventory
//! entry, per `spec.md` §3.
//!
//! Grounded on `examples/original_source/bng/lib/radius/session.py`
//! (`DHCPSession`) and `bng/lib/services/bng_session.py` (`Tombstone`),
//! translated from Python's mutable dataclasses to Rust structs owned
//! exclusively by the engine task (`spec.md` §5).

use std::net::Ipv4Addr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

/// `(bng_id, circuit_id, remote_id)` — the primary session table key,
/// per `spec.md` §3.
pub type SessionKey = (String, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Active,
    Idle,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    PendingAuth,
    Authorized,
    Rejected,
}

/// The QoS policy parsed from a RADIUS Access-Accept, per `spec.md` §4.4
/// step 3, installed into the traffic shaper on authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QosPolicy {
    pub download_kbit: u32,
    pub upload_kbit: u32,
    pub download_burst_kbit: Option<u32>,
    pub upload_burst_kbit: Option<u32>,
}

/// Datapath counter baselines and last-observed totals, split out of
/// `Session` because every read/write site touches them together.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterState {
    pub base_up_bytes: u64,
    pub base_up_pkts: u64,
    pub base_down_bytes: u64,
    pub base_down_pkts: u64,
    pub last_up_bytes: Option<u64>,
    pub last_down_bytes: Option<u64>,
}

/// A subscriber session, per `spec.md` §3's mutable-fields table.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub bng_id: String,
    pub circuit_id: String,
    pub remote_id: String,

    pub mac: String,
    pub ip: Option<Ipv4Addr>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Absolute lease-expiry instant, expressed as Unix epoch seconds (the
    /// wire/lease-service unit), per `spec.md` §3 and §6.
    pub expiry: Option<u64>,

    pub status: Status,
    pub auth_state: AuthState,
    pub last_status_change_ts: Instant,
    pub last_interim: Option<Instant>,

    pub last_idle_ts: Option<Instant>,
    pub last_traffic_seen_ts: Option<Instant>,

    pub up_handle: Option<u64>,
    pub down_handle: Option<u64>,
    pub counters: CounterState,

    pub qos: Option<QosPolicy>,

    pub dhcp_nak_count: u32,
}

impl Session {
    pub fn new(bng_id: &str, circuit_id: &str, remote_id: &str, mac: String, now: Instant) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            bng_id: bng_id.to_string(),
            circuit_id: circuit_id.to_string(),
            remote_id: remote_id.to_string(),
            mac,
            ip: None,
            first_seen: now,
            last_seen: now,
            expiry: None,
            status: Status::Pending,
            auth_state: AuthState::PendingAuth,
            last_status_change_ts: now,
            last_interim: None,
            last_idle_ts: None,
            last_traffic_seen_ts: None,
            up_handle: None,
            down_handle: None,
            counters: CounterState::default(),
            qos: None,
            dhcp_nak_count: 0,
        }
    }

    pub fn key(&self) -> SessionKey {
        (self.bng_id.clone(), self.circuit_id.clone(), self.remote_id.clone())
    }

    /// `"{relay_id}/{remote_id}/{circuit_id}"`, the RADIUS `User-Name` and
    /// the event stream's `access_key`, per `spec.md` §4.4 and the
    /// original's `DHCPSession.access_key`.
    pub fn access_key(&self) -> String {
        format!("{}/{}/{}", self.bng_id, self.remote_id, self.circuit_id)
    }

    pub fn has_datapath_rules(&self) -> bool {
        self.up_handle.is_some() && self.down_handle.is_some()
    }

    /// `Acct-Session-Id`, per `spec.md` §6: `"{mac}-{ip}-{first_seen_epoch}"`.
    /// `first_seen_epoch` is derived from the monotonic `first_seen`
    /// instant and the process-wide monotonic-to-epoch anchor so it stays
    /// stable across the session's life without storing a second clock.
    pub fn acct_session_id(&self, epoch_anchor: EpochAnchor) -> String {
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_default();
        format!("{}-{}-{}", self.mac, ip, epoch_anchor.epoch_secs(self.first_seen))
    }

    pub fn session_time_secs(&self, now: Instant) -> u32 {
        now.saturating_duration_since(self.first_seen).as_secs() as u32
    }
}

/// Anchors `Instant` (monotonic, process-relative) to wall-clock epoch
/// seconds, so `Session` can report RADIUS-facing timestamps without
/// carrying a second, driftable clock field per event.
#[derive(Debug, Clone, Copy)]
pub struct EpochAnchor {
    instant: Instant,
    epoch_secs: u64,
}

impl EpochAnchor {
    pub fn now() -> Self {
        Self {
            instant: Instant::now(),
            epoch_secs: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        }
    }

    pub fn epoch_secs(&self, at: Instant) -> u64 {
        if at >= self.instant {
            self.epoch_secs + at.duration_since(self.instant).as_secs()
        } else {
            self.epoch_secs.saturating_sub(self.instant.duration_since(at).as_secs())
        }
    }
}

/// A short-lived marker preventing the reconciler from resurrecting a
/// just-terminated session, per `spec.md` §3 and the original's
/// `Tombstone` dataclass (including the `missing_seen` bookkeeping flag
/// carried into `SPEC_FULL.md` §C).
#[derive(Debug, Clone)]
pub struct Tombstone {
    pub ip_at_stop: Option<Ipv4Addr>,
    pub latest_state_update_ts_at_stop: u64,
    pub stopped_at: Instant,
    pub reason: String,
    /// Set once a reconcile pass has observed this key absent from the
    /// lease snapshot without the tombstone having expired yet, so repeat
    /// misses log at `debug` instead of `info`.
    pub missing_seen: bool,
}

/// A lease record from the authoritative lease service, per `spec.md` §3.
#[derive(Debug, Clone)]
pub struct Lease {
    pub circuit_id: String,
    pub remote_id: String,
    pub relay_id: String,
    pub mac: String,
    pub ip: Ipv4Addr,
    pub expiry: u64,
    pub last_state_update_ts: u64,
    pub is_active: bool,
}

/// An access-router inventory entry, per `spec.md` §3.
#[derive(Debug, Clone)]
pub struct AccessRouterEntry {
    pub giaddr: Ipv4Addr,
    pub is_alive: bool,
    pub last_seen: Instant,
    pub next_ping: Instant,
}
