//! Event dispatcher: publishes session/router/health events onto the
//! append-only Redis stream external systems ingest from, per `spec.md`
//! §4 and §6 ("Event Stream").
//!
//! Grounded on `examples/original_source/bng/lib/services/event_dispatcher.py`'s
//! `BNGEventDispatcher`: one `XADD` per event, a per-process monotonic
//! `seq` for idempotency, and a fixed field set per event type. The
//! original targets `redis.asyncio`; this carries the same shape through
//! `redis`'s `tokio-comp` feature, which `bng-core`'s Cargo.toml already
//! depends on for this purpose.

use std::time::SystemTime;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::DispatcherError;
use crate::model::{EpochAnchor, Session};

fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn session_username(session: &Session) -> String {
    format!("{}/{}/{}", session.bng_id, session.remote_id, session.circuit_id)
}

fn status_str(status: crate::model::Status) -> &'static str {
    match status {
        crate::model::Status::Pending => "PENDING",
        crate::model::Status::Active => "ACTIVE",
        crate::model::Status::Idle => "IDLE",
        crate::model::Status::Expired => "EXPIRED",
    }
}

fn auth_state_str(auth_state: crate::model::AuthState) -> &'static str {
    match auth_state {
        crate::model::AuthState::PendingAuth => "PENDING_AUTH",
        crate::model::AuthState::Authorized => "AUTHORIZED",
        crate::model::AuthState::Rejected => "REJECTED",
    }
}

/// Accounting counters carried on `SESSION_UPDATE`/`SESSION_STOP`, in the
/// RFC 2866 input/output convention resolved in `SPEC_FULL.md` §C
/// (input = from the subscriber, output = to the subscriber).
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountingCounters {
    pub input_octets: u64,
    pub output_octets: u64,
    pub input_packets: u64,
    pub output_packets: u64,
}

/// The session engine's only view of the dispatcher, extracted so tests can
/// drive the engine against an in-memory recorder instead of a live Redis
/// stream — the same "generalize the contract, shell/network backend stays
/// the default impl" shape `datapath::{RuleEngine, TrafficShaper}` already
/// use for nftables/tc (`DESIGN.md`).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch_session_start(&mut self, session: &Session) -> Result<(), DispatcherError>;
    async fn dispatch_session_update(&mut self, session: &Session, counters: AccountingCounters) -> Result<(), DispatcherError>;
    async fn dispatch_session_stop(
        &mut self,
        session: &Session,
        counters: AccountingCounters,
        terminate_cause: &str,
    ) -> Result<(), DispatcherError>;
    async fn dispatch_policy_apply(&mut self, session: &Session) -> Result<(), DispatcherError>;
    async fn dispatch_router_update(&mut self, router_name: &str, is_alive: bool, last_seen_epoch: f64) -> Result<(), DispatcherError>;
    async fn dispatch_bng_health_update(
        &mut self,
        cpu_usage: f64,
        mem_usage: f64,
        mem_max: f64,
        first_seen: bool,
    ) -> Result<(), DispatcherError>;
}

pub struct EventDispatcher {
    conn: MultiplexedConnection,
    stream_key: String,
    bng_id: String,
    bng_instance_id: String,
    nas_ip: String,
    epoch_anchor: EpochAnchor,
    seq: u64,
}

impl EventDispatcher {
    pub async fn connect(
        redis_url: &str,
        stream_key: String,
        bng_id: String,
        nas_ip: String,
        epoch_anchor: EpochAnchor,
    ) -> Result<Self, DispatcherError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self {
            conn,
            stream_key,
            bng_id,
            // Changes every restart, letting downstream consumers detect a
            // process bounce without the BNG's own persistent identity
            // changing, per the original's `bng_instance_id`.
            bng_instance_id: Uuid::new_v4().to_string(),
            nas_ip,
            epoch_anchor,
            seq: 0,
        })
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    async fn xadd(&mut self, fields: Vec<(&'static str, String)>) -> Result<(), DispatcherError> {
        self.conn.xadd(&self.stream_key, "*", &fields).await?;
        Ok(())
    }

    fn common_fields(&mut self, event_type: &'static str, session: &Session) -> Vec<(&'static str, String)> {
        vec![
            ("bng_id", self.bng_id.clone()),
            ("bng_instance_id", self.bng_instance_id.clone()),
            ("seq", self.next_seq().to_string()),
            ("event_type", event_type.to_string()),
            ("ts", now_ts().to_string()),
            ("session_last_update", now_ts().to_string()),
            ("nas_ip", self.nas_ip.clone()),
            ("session_id", session.session_id.clone()),
            ("access_key", session.access_key()),
            ("remote_id", session.remote_id.clone()),
            ("circuit_id", session.circuit_id.clone()),
            ("auth_state", auth_state_str(session.auth_state).to_string()),
            ("status", status_str(session.status).to_string()),
        ]
    }

    pub async fn dispatch_session_start(&mut self, session: &Session) -> Result<(), DispatcherError> {
        let mut fields = self.common_fields("SESSION_START", session);
        fields.push(("mac_address", session.mac.clone()));
        fields.push(("ip_address", session.ip.map(|ip| ip.to_string()).unwrap_or_default()));
        fields.push(("username", session_username(session)));
        fields.push(("input_octets", "0".into()));
        fields.push(("output_octets", "0".into()));
        fields.push(("input_packets", "0".into()));
        fields.push(("output_packets", "0".into()));
        fields.push(("session_start", now_ts().to_string()));
        self.xadd(fields).await
    }

    pub async fn dispatch_session_update(
        &mut self,
        session: &Session,
        counters: AccountingCounters,
    ) -> Result<(), DispatcherError> {
        let mut fields = self.common_fields("SESSION_UPDATE", session);
        fields.push(("mac_address", session.mac.clone()));
        fields.push(("ip_address", session.ip.map(|ip| ip.to_string()).unwrap_or_default()));
        fields.push(("username", session_username(session)));
        fields.push(("input_octets", counters.input_octets.to_string()));
        fields.push(("output_octets", counters.output_octets.to_string()));
        fields.push(("input_packets", counters.input_packets.to_string()));
        fields.push(("output_packets", counters.output_packets.to_string()));
        self.xadd(fields).await
    }

    pub async fn dispatch_session_stop(
        &mut self,
        session: &Session,
        counters: AccountingCounters,
        terminate_cause: &str,
    ) -> Result<(), DispatcherError> {
        let mut fields = self.common_fields("SESSION_STOP", session);
        fields.push(("mac_address", session.mac.clone()));
        fields.push(("ip_address", session.ip.map(|ip| ip.to_string()).unwrap_or_default()));
        fields.push(("username", session_username(session)));
        fields.push(("input_octets", counters.input_octets.to_string()));
        fields.push(("output_octets", counters.output_octets.to_string()));
        fields.push(("input_packets", counters.input_packets.to_string()));
        fields.push(("output_packets", counters.output_packets.to_string()));
        fields.push(("terminate_cause", terminate_cause.to_string()));
        fields.push(("session_end", now_ts().to_string()));
        self.xadd(fields).await
    }

    pub async fn dispatch_policy_apply(&mut self, session: &Session) -> Result<(), DispatcherError> {
        let mut fields = self.common_fields("POLICY_APPLY", session);
        fields.push(("mac_address", session.mac.clone()));
        fields.push(("ip_address", session.ip.map(|ip| ip.to_string()).unwrap_or_default()));
        fields.push(("username", session_username(session)));
        self.xadd(fields).await
    }

    pub async fn dispatch_router_update(&mut self, router_name: &str, is_alive: bool, last_seen_epoch: f64) -> Result<(), DispatcherError> {
        let fields = vec![
            ("bng_id", self.bng_id.clone()),
            ("bng_instance_id", self.bng_instance_id.clone()),
            ("seq", self.next_seq().to_string()),
            ("event_type", "ROUTER_UPDATE".to_string()),
            ("ts", now_ts().to_string()),
            ("router_name", router_name.to_string()),
            ("is_alive", is_alive.to_string()),
            ("last_seen", last_seen_epoch.to_string()),
        ];
        self.xadd(fields).await
    }

    pub async fn dispatch_bng_health_update(
        &mut self,
        cpu_usage: f64,
        mem_usage: f64,
        mem_max: f64,
        first_seen: bool,
    ) -> Result<(), DispatcherError> {
        let mut fields = vec![
            ("bng_id", self.bng_id.clone()),
            ("bng_instance_id", self.bng_instance_id.clone()),
            ("seq", self.next_seq().to_string()),
            ("event_type", "BNG_HEALTH_UPDATE".to_string()),
            ("ts", now_ts().to_string()),
            ("cpu_usage", cpu_usage.to_string()),
            ("mem_usage", mem_usage.to_string()),
            ("mem_max", mem_max.to_string()),
        ];
        if first_seen {
            fields.push(("first_seen", now_ts().to_string()));
        }
        self.xadd(fields).await
    }
}

#[async_trait]
impl EventSink for EventDispatcher {
    async fn dispatch_session_start(&mut self, session: &Session) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_session_start(self, session).await
    }

    async fn dispatch_session_update(&mut self, session: &Session, counters: AccountingCounters) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_session_update(self, session, counters).await
    }

    async fn dispatch_session_stop(
        &mut self,
        session: &Session,
        counters: AccountingCounters,
        terminate_cause: &str,
    ) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_session_stop(self, session, counters, terminate_cause).await
    }

    async fn dispatch_policy_apply(&mut self, session: &Session) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_policy_apply(self, session).await
    }

    async fn dispatch_router_update(&mut self, router_name: &str, is_alive: bool, last_seen_epoch: f64) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_router_update(self, router_name, is_alive, last_seen_epoch).await
    }

    async fn dispatch_bng_health_update(
        &mut self,
        cpu_usage: f64,
        mem_usage: f64,
        mem_max: f64,
        first_seen: bool,
    ) -> Result<(), DispatcherError> {
        EventDispatcher::dispatch_bng_health_update(self, cpu_usage, mem_usage, mem_max, first_seen).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sample_session() -> Session {
        let mut s = Session::new("bng-1", "1/0/1", "R1", "aa:bb:cc:dd:ee:ff".into(), Instant::now());
        s.ip = Some("10.0.0.5".parse().unwrap());
        s
    }

    #[test]
    fn common_fields_carry_access_key_and_identity() {
        let session = sample_session();
        assert_eq!(session.access_key(), "bng-1/R1/1/0/1");
        assert_eq!(session_username(&session), "bng-1/R1/1/0/1");
    }

    #[test]
    fn status_and_auth_state_render_upper_snake() {
        assert_eq!(status_str(crate::model::Status::Idle), "IDLE");
        assert_eq!(auth_state_str(crate::model::AuthState::Authorized), "AUTHORIZED");
    }
}
