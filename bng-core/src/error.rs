//! Structured error types for `bng-core`, per `SPEC_FULL.md` §B: `thiserror`
//! enums per module, `anyhow` reserved for the process boundary in the
//! `bng` binary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("rule install failed for {ip}: {reason}")]
    InstallFailed { ip: std::net::Ipv4Addr, reason: String },
    #[error("rule delete failed for handle {handle}: {reason}")]
    DeleteFailed { handle: u64, reason: String },
    #[error("counter snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("shaper command failed for {ip}: {reason}")]
    ShaperFailed { ip: std::net::Ipv4Addr, reason: String },
    #[error("backend command {command} exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("i/o error running backend command: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LeaseServiceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response shape: {0}")]
    BadResponse(String),
}

#[derive(Debug, Error)]
pub enum DispatcherError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("event serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SnifferError {
    #[error("failed to open link-layer channel on {iface}: {source}")]
    ChannelOpen { iface: String, source: std::io::Error },
    #[error("unsupported datalink channel type for {iface}")]
    UnsupportedChannelType { iface: String },
    #[error("interface {iface} not found")]
    InterfaceNotFound { iface: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CoaError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request read timed out")]
    ReadTimeout,
    #[error("reply wait timed out")]
    ReplyTimeout,
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("i/o error reading cgroup file {path}: {source}")]
    CgroupRead { path: String, source: std::io::Error },
}
