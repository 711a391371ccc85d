//! Process configuration: the `--bng-id` CLI flag plus every other tunable,
//! environment-sourced per `spec.md` §6 ("Environment variables select
//! interface names, CIDRs, upstream addresses, and the Redis/stream
//! host"). Defaults for the timing constants mirror
//! `examples/original_source/bng/lib/constants.py`.

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

/// BNG control-plane core.
#[derive(Debug, Clone, Parser)]
#[command(name = "bng", version, about)]
pub struct Config {
    /// This BNG's identifier, used as Relay-ID and as the `bng_id` key
    /// component throughout the session table and event stream.
    #[arg(long, env = "BNG_ID")]
    pub bng_id: String,

    /// Subscriber-facing interface (access-router side).
    #[arg(env = "BNG_SUBSCRIBER_IFACE")]
    pub subscriber_iface: String,

    /// Uplink interface (DHCP/RADIUS server side).
    #[arg(env = "BNG_UPLINK_IFACE")]
    pub uplink_iface: String,

    /// This BNG's IPv4 address on the subscriber-facing interface, used as
    /// `giaddr` when an access router has not already set one.
    #[arg(env = "BNG_SUBSCRIBER_IP")]
    pub subscriber_ip: Ipv4Addr,

    /// This BNG's NAS-IP-Address, sent on every RADIUS packet and used to
    /// bind the CoA listener.
    #[arg(env = "BNG_NAS_IP")]
    pub nas_ip: Ipv4Addr,

    /// Upstream DHCP server address.
    #[arg(env = "BNG_DHCP_SERVER")]
    pub dhcp_server: Ipv4Addr,

    /// RADIUS authentication/accounting/CoA server address.
    #[arg(env = "BNG_RADIUS_SERVER")]
    pub radius_server: Ipv4Addr,

    /// Shared secret for RADIUS Authenticator computation.
    #[arg(env = "BNG_RADIUS_SECRET")]
    pub radius_secret: String,

    /// Lease service base URL, e.g. `https://kea.example.net:8000`.
    #[arg(env = "BNG_LEASE_SERVICE_URL")]
    pub lease_service_url: String,

    #[arg(env = "BNG_LEASE_SERVICE_USER")]
    pub lease_service_user: String,

    #[arg(env = "BNG_LEASE_SERVICE_PASSWORD")]
    pub lease_service_password: String,

    /// Redis host backing the event stream (`XADD`).
    #[arg(env = "BNG_REDIS_URL", default_value = "redis://127.0.0.1/")]
    pub redis_url: String,

    /// Event stream key.
    #[arg(env = "BNG_EVENT_STREAM", default_value = "bng_events")]
    pub event_stream: String,

    /// CoA IPC socket path.
    #[arg(env = "BNG_COA_SOCK", default_value = "/tmp/coad.sock")]
    pub coa_sock_path: String,

    /// Access-router inventory source (a JSON file path; refreshed by the
    /// OSS backend out-of-band per `spec.md` §1 "out of scope").
    #[arg(env = "BNG_ROUTER_INVENTORY")]
    pub router_inventory_path: Option<String>,

    /// cgroup root the health sampler reads from, per `spec.md` §4.8.
    #[arg(env = "BNG_CGROUP_ROOT", default_value = "/sys/fs/cgroup")]
    pub cgroup_root: String,

    /// The original gated this behind a compile-time flag that defaulted
    /// off; here it is a runtime switch with the same default (`DESIGN.md`).
    #[arg(env = "BNG_ENABLE_IDLE_DISCONNECT", default_value_t = false)]
    pub enable_idle_disconnect: bool,

    #[arg(value_parser = parse_secs, default_value = "40", env = "BNG_IDLE_GRACE_AFTER_CONNECT_SECS")]
    pub idle_grace_after_connect: Duration,

    #[arg(value_parser = parse_secs, default_value = "20", env = "BNG_MARK_IDLE_GRACE_SECS")]
    pub mark_idle_grace: Duration,

    #[arg(value_parser = parse_secs, default_value = "10", env = "BNG_MARK_DISCONNECT_GRACE_SECS")]
    pub mark_disconnect_grace: Duration,

    #[arg(value_parser = parse_secs, default_value = "600", env = "BNG_TOMBSTONE_TTL_SECS")]
    pub tombstone_ttl: Duration,

    #[arg(value_parser = parse_secs, default_value = "60", env = "BNG_TOMBSTONE_EXPIRY_GRACE_SECS")]
    pub tombstone_expiry_grace: Duration,

    #[arg(default_value_t = 3, env = "BNG_DHCP_NAK_TERMINATE_THRESHOLD")]
    pub dhcp_nak_terminate_threshold: u32,

    /// PENDING-with-no-IP grace before the reconciler promotes a lease,
    /// per `spec.md` §4.5.
    #[arg(value_parser = parse_secs, default_value = "8", env = "BNG_ACK_GRACE_SECS")]
    pub ack_grace: Duration,

    #[arg(value_parser = parse_secs, default_value = "10", env = "BNG_INTERIM_INTERVAL_SECS")]
    pub interim_interval: Duration,

    #[arg(value_parser = parse_secs, default_value = "15", env = "BNG_AUTH_RETRY_INTERVAL_SECS")]
    pub auth_retry_interval: Duration,

    #[arg(value_parser = parse_secs, default_value = "5", env = "BNG_DISCONNECTION_CHECK_INTERVAL_SECS")]
    pub disconnection_check_interval: Duration,

    #[arg(value_parser = parse_secs, default_value = "30", env = "BNG_RECONCILE_INTERVAL_SECS")]
    pub reconcile_interval: Duration,

    #[arg(value_parser = parse_secs, default_value = "20", env = "BNG_ROUTER_PING_INTERVAL_SECS")]
    pub router_ping_interval: Duration,

    #[arg(value_parser = parse_secs, default_value = "60", env = "BNG_HEALTH_INTERVAL_SECS")]
    pub health_interval: Duration,

    /// Sniffer-to-engine queue bound, per `spec.md` §5.
    #[arg(default_value_t = 1000, env = "BNG_EVENT_QUEUE_SIZE")]
    pub event_queue_size: usize,

    /// Command queue bound, per `spec.md` §5.
    #[arg(default_value_t = 2048, env = "BNG_COMMAND_QUEUE_SIZE")]
    pub command_queue_size: usize,

    #[arg(value_parser = parse_secs, default_value = "1", env = "BNG_RADIUS_TIMEOUT_SECS")]
    pub radius_timeout: Duration,

    #[arg(value_parser = parse_secs, default_value = "3", env = "BNG_COA_READ_TIMEOUT_SECS")]
    pub coa_read_timeout: Duration,

    #[arg(value_parser = parse_secs, default_value = "5", env = "BNG_COA_REPLY_TIMEOUT_SECS")]
    pub coa_reply_timeout: Duration,
}

fn parse_secs(raw: &str) -> Result<Duration, std::num::ParseIntError> {
    raw.parse::<u64>().map(Duration::from_secs)
}
