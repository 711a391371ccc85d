//! The single-writer session engine, per `spec.md` §5: one task owns the
//! session table and every piece of mutable state reachable from it,
//! reading DHCP events and periodic/CoA commands off two bounded channels
//! through `tokio::select!`, so no lock ever guards subscriber state.
//!
//! Grounded on `examples/original_source/bng/lib/services/bng_loop.py`
//! (the `asyncio.wait(..., FIRST_COMPLETED)` select loop and periodic
//! ticker wiring), `bng_dhcp.py` (`dhcp_lease_handler`'s DHCP event state
//! machine and `reconcile_handler`'s lease-diffing reconciler), and
//! `bng_session.py` (`authorize_session`/`terminate_session`/
//! `get_counters_for_session`).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use bng_dhcp::MessageType;
use bng_radius::client::RadiusClient;

use crate::coa::{CoaCommand, CoaReply, CoaRequest};
use crate::config::Config;
use crate::datapath::{Counters as DatapathCounters, RuleEngine, TrafficShaper};
use crate::dhcp_event::{DhcpEvent, QueuedEvent};
use crate::dispatcher::{AccountingCounters, EventSink};
use crate::health::HealthReporter;
use crate::lease_service::LeaseService;
use crate::model::{AccessRouterEntry, AuthState, EpochAnchor, Lease, Session, SessionKey, Status, Tombstone};
use crate::router_tracker::RouterTracker;

/// One tick of a periodic loop, enqueued onto the command channel
/// alongside CoA requests, per `spec.md` §5's "command" priority band.
#[derive(Debug, Clone, Copy)]
pub enum TickKind {
    Interim,
    AuthRetry,
    DisconnectionCheck,
    Reconcile,
    RouterPing,
    BngHealth,
}

pub enum EngineCommand {
    Tick(TickKind),
    Coa(CoaCommand),
}

/// Spawns one `tokio::time::interval` loop per periodic tick kind, each
/// feeding `EngineCommand::Tick` onto the shared command queue at the
/// interval `config` specifies, per `spec.md` §4.6/§4.8/§4.9's cadences.
pub fn spawn_tickers(command_tx: mpsc::Sender<EngineCommand>, config: &Config) -> Vec<JoinHandle<()>> {
    let specs = [
        (TickKind::Interim, config.interim_interval),
        (TickKind::AuthRetry, config.auth_retry_interval),
        (TickKind::DisconnectionCheck, config.disconnection_check_interval),
        (TickKind::Reconcile, config.reconcile_interval),
        (TickKind::RouterPing, config.router_ping_interval),
        (TickKind::BngHealth, config.health_interval),
    ];

    specs
        .into_iter()
        .map(|(kind, interval)| {
            let tx = command_tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // first tick fires immediately; skip it
                loop {
                    ticker.tick().await;
                    if tx.send(EngineCommand::Tick(kind)).await.is_err() {
                        return;
                    }
                }
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
struct SessionCounterDeltas {
    up_bytes: u64,
    up_pkts: u64,
    down_bytes: u64,
    down_pkts: u64,
}

fn as_radius_counters(d: SessionCounterDeltas) -> bng_radius::packets::Counters {
    bng_radius::packets::Counters {
        input_bytes: d.up_bytes,
        output_bytes: d.down_bytes,
        input_packets: d.up_pkts,
        output_packets: d.down_pkts,
    }
}

fn as_accounting_counters(d: SessionCounterDeltas) -> AccountingCounters {
    AccountingCounters {
        input_octets: d.up_bytes,
        output_octets: d.down_bytes,
        input_packets: d.up_pkts,
        output_packets: d.down_pkts,
    }
}

/// The result of evaluating the idle-detection rule for one session over
/// one interim tick, per `spec.md` §4.6.
///
/// Grounded on `examples/original_source/bng/lib/radius/handlers.py`'s
/// `radius_handle_interim_updates`: traffic is "seen" when either counter's
/// delta differs from the previous tick's; absence of any traffic for
/// `idle_grace_after_connect` after first-seen, or no change for
/// `mark_idle_grace` after the last traffic sighting, marks the session
/// IDLE.
struct IdleEvaluation {
    status: Status,
    last_traffic_seen_ts: Option<Instant>,
    last_idle_ts: Option<Instant>,
}

#[allow(clippy::too_many_arguments)]
fn evaluate_idle(
    current_status: Status,
    first_seen: Instant,
    mut last_traffic_seen_ts: Option<Instant>,
    mut last_idle_ts: Option<Instant>,
    prev_up: u64,
    prev_down: u64,
    up_delta: u64,
    down_delta: u64,
    now: Instant,
    idle_grace_after_connect: Duration,
    mark_idle_grace: Duration,
) -> IdleEvaluation {
    let mut status = current_status;

    if up_delta != prev_up || down_delta != prev_down {
        last_traffic_seen_ts = Some(now);
    }

    match last_traffic_seen_ts {
        None => {
            if now.saturating_duration_since(first_seen) >= idle_grace_after_connect {
                last_idle_ts = Some(now);
                last_traffic_seen_ts = Some(now);
                status = Status::Idle;
            }
        }
        Some(seen) => {
            if up_delta == prev_up && down_delta == prev_down {
                if status != Status::Idle && now.saturating_duration_since(seen) >= mark_idle_grace {
                    last_idle_ts = Some(now);
                    status = Status::Idle;
                }
            } else {
                status = Status::Active;
            }
        }
    }

    IdleEvaluation {
        status,
        last_traffic_seen_ts,
        last_idle_ts,
    }
}

/// Drops events missing any of `circuit_id`/`remote_id`/`mac`, per
/// `spec.md` §4.2: a DHCP message without a complete Option 82 cannot be
/// attributed to a session key and is dropped rather than buffered.
fn has_access_context(event: &DhcpEvent) -> bool {
    event.circuit_id.is_some() && event.remote_id.is_some() && !event.mac.is_empty()
}

/// The subscriber session table and every service it takes input from,
/// owned exclusively by the task that calls [`SessionEngine::run`].
pub struct SessionEngine {
    config: Config,
    epoch_anchor: EpochAnchor,

    sessions: HashMap<SessionKey, Session>,
    by_ip: HashMap<Ipv4Addr, SessionKey>,
    by_session_id: HashMap<String, SessionKey>,
    tombstones: HashMap<SessionKey, Tombstone>,
    routers: HashMap<String, AccessRouterEntry>,

    radius_auth: RadiusClient,
    radius_acct: RadiusClient,
    radius_identifier: u8,

    rule_engine: Arc<dyn RuleEngine>,
    shaper: Arc<dyn TrafficShaper>,
    lease_service: LeaseService,
    dispatcher: Box<dyn EventSink>,
    router_tracker: RouterTracker,
    health_reporter: HealthReporter,
    health_seen_once: bool,
}

impl SessionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        epoch_anchor: EpochAnchor,
        rule_engine: Arc<dyn RuleEngine>,
        shaper: Arc<dyn TrafficShaper>,
        lease_service: LeaseService,
        dispatcher: Box<dyn EventSink>,
        router_tracker: RouterTracker,
        health_reporter: HealthReporter,
    ) -> Self {
        let radius_auth = RadiusClient::new(config.radius_server, bng_radius::AUTH_PORT, config.radius_secret.clone(), config.radius_timeout);
        let radius_acct = RadiusClient::new(config.radius_server, bng_radius::ACCT_PORT, config.radius_secret.clone(), config.radius_timeout);

        Self {
            config,
            epoch_anchor,
            sessions: HashMap::new(),
            by_ip: HashMap::new(),
            by_session_id: HashMap::new(),
            tombstones: HashMap::new(),
            routers: HashMap::new(),
            radius_auth,
            radius_acct,
            radius_identifier: 0,
            rule_engine,
            shaper,
            lease_service,
            dispatcher,
            router_tracker,
            health_reporter,
            health_seen_once: false,
        }
    }

    /// The engine's main loop, per `spec.md` §5: whichever of the event or
    /// command queue completes first is processed; the other simply is not
    /// polled to completion this iteration and is re-armed on the next.
    pub async fn run(mut self, mut events_rx: mpsc::Receiver<QueuedEvent>, mut commands_rx: mpsc::Receiver<EngineCommand>) {
        loop {
            tokio::select! {
                cmd = commands_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => return,
                    }
                }
                queued = events_rx.recv() => {
                    match queued {
                        Some(queued) => self.handle_dhcp_event(queued.event).await,
                        None => return,
                    }
                }
            }
        }
    }

    fn next_radius_id(&mut self) -> u8 {
        self.radius_identifier = self.radius_identifier.wrapping_add(1);
        self.radius_identifier
    }

    async fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::Tick(TickKind::Interim) => self.run_interim_tick().await,
            EngineCommand::Tick(TickKind::AuthRetry) => self.run_auth_retry_tick().await,
            EngineCommand::Tick(TickKind::DisconnectionCheck) => self.run_disconnection_check_tick().await,
            EngineCommand::Tick(TickKind::Reconcile) => self.run_reconcile_tick().await,
            EngineCommand::Tick(TickKind::RouterPing) => self.run_router_ping_tick().await,
            EngineCommand::Tick(TickKind::BngHealth) => self.run_bng_health_tick().await,
            EngineCommand::Coa(cmd) => self.handle_coa(cmd).await,
        }
    }

    // ---- DHCP event dispatch, spec.md §4.3 -------------------------------

    async fn handle_dhcp_event(&mut self, event: DhcpEvent) {
        self.track_router(&event).await;

        match event.msg_type {
            MessageType::Release => self.handle_release(event).await,
            MessageType::Request => {
                if !has_access_context(&event) {
                    debug!("dhcp: dropping REQUEST missing circuit_id/remote_id/mac");
                    return;
                }
                self.handle_request(event);
            }
            MessageType::Ack => {
                if !has_access_context(&event) {
                    debug!("dhcp: dropping ACK missing circuit_id/remote_id/mac");
                    return;
                }
                self.handle_ack(event).await;
            }
            MessageType::Nak => {
                if !has_access_context(&event) {
                    debug!("dhcp: dropping NAK missing circuit_id/remote_id/mac");
                    return;
                }
                self.handle_nak(event).await;
            }
            MessageType::Discover | MessageType::Offer | MessageType::Decline | MessageType::Inform => {
                debug!("dhcp: {:?} observed, no session-engine action", event.msg_type);
            }
        }
    }

    fn handle_request(&mut self, event: DhcpEvent) {
        let (Some(circuit_id), Some(remote_id)) = (event.circuit_id, event.remote_id) else {
            return;
        };
        let key: SessionKey = (self.config.bng_id.clone(), circuit_id, remote_id);
        if self.sessions.contains_key(&key) {
            return;
        }

        let now = Instant::now();
        let session = Session::new(&self.config.bng_id, &key.1, &key.2, event.mac, now);
        self.by_session_id.insert(session.session_id.clone(), key.clone());
        self.sessions.insert(key, session);
    }

    async fn handle_ack(&mut self, event: DhcpEvent) {
        let (Some(circuit_id), Some(remote_id)) = (event.circuit_id, event.remote_id) else {
            return;
        };
        let key: SessionKey = (self.config.bng_id.clone(), circuit_id, remote_id);
        let now = Instant::now();

        if !self.sessions.contains_key(&key) {
            debug!("dhcp: ACK for unknown session {:?}", key);
            return;
        }

        self.tombstones.remove(&key);
        if let Some(live) = self.sessions.get_mut(&key) {
            live.last_seen = now;
            live.dhcp_nak_count = 0;
            live.mac = event.mac;
        }

        let Some(new_ip) = event.ip else {
            // yiaddr == 0.0.0.0: the server granted no address this round.
            if let Some(live) = self.sessions.get_mut(&key) {
                live.status = Status::Pending;
                live.last_status_change_ts = now;
            }
            return;
        };

        let current_ip = self.sessions.get(&key).and_then(|s| s.ip);

        if current_ip == Some(new_ip) {
            if let Some(live) = self.sessions.get_mut(&key) {
                live.expiry = event.expiry;
                live.status = Status::Active;
                live.last_status_change_ts = now;
                live.last_idle_ts = None;
                live.last_traffic_seen_ts = None;
            }
            return;
        }

        // IP assignment or reassignment. If the session was AUTHORIZED
        // under the old IP, tear it down (Acct-Stop, datapath rules) before
        // adopting the new one.
        let was_authorized = self.sessions.get(&key).is_some_and(|s| s.auth_state == AuthState::Authorized);
        if current_ip.is_some() && was_authorized {
            self.stop_current(&key, "IP-change", now).await;
        }

        if let Some(old_ip) = current_ip {
            self.by_ip.remove(&old_ip);
        }
        let old_session_id = self.sessions.get(&key).map(|s| s.session_id.clone());

        if let Some(live) = self.sessions.get_mut(&key) {
            live.ip = Some(new_ip);
            live.expiry = event.expiry;
            live.first_seen = now;
            live.status = Status::Active;
            live.last_status_change_ts = now;
            live.session_id = Uuid::new_v4().to_string();
        }
        if let Some(old_sid) = old_session_id {
            self.by_session_id.remove(&old_sid);
        }
        if let Some(live) = self.sessions.get(&key) {
            self.by_session_id.insert(live.session_id.clone(), key.clone());
        }
        self.by_ip.insert(new_ip, key.clone());

        self.dispatch_session_start(&key).await;
        self.authorize(key.clone()).await;
        self.dispatch_policy_apply(&key).await;
    }

    async fn handle_nak(&mut self, event: DhcpEvent) {
        let (Some(circuit_id), Some(remote_id)) = (event.circuit_id, event.remote_id) else {
            return;
        };
        let key: SessionKey = (self.config.bng_id.clone(), circuit_id, remote_id);

        let should_terminate = {
            let Some(live) = self.sessions.get_mut(&key) else { return };
            live.status = Status::Pending;
            live.dhcp_nak_count += 1;
            live.dhcp_nak_count >= self.config.dhcp_nak_terminate_threshold && live.ip.is_none()
        };

        if should_terminate {
            info!("dhcp: terminating {:?} after {} consecutive NAKs with no IP", key, self.config.dhcp_nak_terminate_threshold);
            self.terminate_session(key, "Nak-Threshold").await;
        }
    }

    async fn handle_release(&mut self, event: DhcpEvent) {
        let Some(ip) = event.ip else {
            debug!("dhcp: dropping RELEASE without an IP");
            return;
        };
        let Some(key) = self.by_ip.get(&ip).cloned() else {
            debug!("dhcp: RELEASE for unknown ip {ip}");
            return;
        };
        self.terminate_session(key, "User-Request").await;
    }

    async fn track_router(&mut self, event: &DhcpEvent) {
        let Some(remote_id) = event.remote_id.as_deref() else { return };
        let now = Instant::now();
        if let Some(update) = self.router_tracker.on_dhcp_event(&mut self.routers, remote_id, event.giaddr, now) {
            let epoch = self.epoch_anchor.epoch_secs(update.last_seen) as f64;
            if let Err(e) = self.dispatcher.dispatch_router_update(&update.router_name, update.is_alive, epoch).await {
                warn!("failed to dispatch ROUTER_UPDATE for {}: {e}", update.router_name);
            }
        }
    }

    // ---- Authorization and termination pipelines, spec.md §4.4 ----------

    /// Idempotent: re-running on a session whose datapath rules are already
    /// installed touches neither the rule engine nor the shaper again, and
    /// re-sends Acct-Start only when no baseline existed yet (a fresh IP).
    async fn authorize(&mut self, key: SessionKey) {
        let Some(snapshot) = self.sessions.get(&key).cloned() else { return };
        let Some(ip) = snapshot.ip else { return };

        let identifier = self.next_radius_id();
        let authenticator = bng_radius::request_authenticator();
        let req = bng_radius::packets::access_request(
            identifier,
            authenticator,
            &self.config.bng_id,
            &snapshot.remote_id,
            &snapshot.circuit_id,
            &snapshot.mac,
            ip,
            self.config.nas_ip,
            &self.config.subscriber_iface,
        );

        let reply = match self.radius_auth.exchange(&req).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                debug!("authorize: no RADIUS reply for {}, will retry", snapshot.access_key());
                return;
            }
            Err(e) => {
                warn!("authorize: RADIUS exchange failed for {}: {e}", snapshot.access_key());
                return;
            }
        };

        if reply.code == bng_radius::CODE_ACCESS_REJECT {
            if let Some(live) = self.sessions.get_mut(&key) {
                live.auth_state = AuthState::Rejected;
            }
            info!("authorize: Access-Reject for {}", snapshot.access_key());
            return;
        }
        if reply.code != bng_radius::CODE_ACCESS_ACCEPT {
            warn!("authorize: unexpected RADIUS reply code {} for {}", reply.code, snapshot.access_key());
            return;
        }

        let already_installed = snapshot.has_datapath_rules();
        if !already_installed {
            match self.rule_engine.install_subscriber_rules(ip, &snapshot.mac, &self.config.subscriber_iface).await {
                Ok((up, down)) => {
                    let counters = self.rule_engine.snapshot_counters().await.unwrap_or_default();
                    let base_up = counters.get(&up).copied().unwrap_or_default();
                    let base_down = counters.get(&down).copied().unwrap_or_default();
                    if let Some(live) = self.sessions.get_mut(&key) {
                        live.up_handle = Some(up);
                        live.down_handle = Some(down);
                        live.counters.base_up_bytes = base_up.bytes;
                        live.counters.base_up_pkts = base_up.packets;
                        live.counters.base_down_bytes = base_down.bytes;
                        live.counters.base_down_pkts = base_down.packets;
                    }
                }
                Err(e) => {
                    warn!("authorize: failed to install datapath rules for {ip}: {e}");
                    return;
                }
            }
        }

        if let Some(qos) = bng_radius::packets::parse_qos_policy(&reply) {
            match self
                .shaper
                .add_shaping(ip, qos.upload_kbit, qos.download_kbit, qos.upload_burst_kbit, qos.download_burst_kbit)
                .await
            {
                Ok(true) => {
                    if let Some(live) = self.sessions.get_mut(&key) {
                        live.qos = Some(crate::model::QosPolicy {
                            download_kbit: qos.download_kbit,
                            upload_kbit: qos.upload_kbit,
                            download_burst_kbit: qos.download_burst_kbit,
                            upload_burst_kbit: qos.upload_burst_kbit,
                        });
                    }
                }
                Ok(false) => warn!("authorize: shaper reported failure applying QoS for {ip}"),
                Err(e) => warn!("authorize: failed to apply QoS for {ip}: {e}"),
            }
        }

        if let Err(e) = self.rule_engine.allow(ip).await {
            warn!("authorize: failed to allow forwarding for {ip}: {e}");
        }

        if !already_installed {
            if let Some(live) = self.sessions.get(&key).cloned() {
                self.send_acct_start(&live).await;
            }
        }

        if let Some(live) = self.sessions.get_mut(&key) {
            live.auth_state = AuthState::Authorized;
        }
    }

    /// Tears down datapath rules, shaping, and sends Acct-Stop for the
    /// session's *current* association, without removing it from the
    /// session table — used both by IP-change (where the same key is
    /// immediately re-armed with a new IP) and as the first half of
    /// [`Self::terminate_session`]. A no-op if the session was never
    /// AUTHORIZED (nothing was ever installed to tear down).
    async fn stop_current(&mut self, key: &SessionKey, cause: &str, now: Instant) {
        let Some(snapshot) = self.sessions.get(key).cloned() else { return };
        if snapshot.auth_state != AuthState::Authorized {
            return;
        }

        let deltas = self.read_session_counters(&snapshot).await;
        self.send_acct_stop(&snapshot, &deltas, cause, now).await;

        if let Some(ip) = snapshot.ip {
            if snapshot.qos.is_some() {
                if let Err(e) = self.shaper.remove_shaping(ip).await {
                    warn!("stop_current: failed to remove shaping for {ip}: {e}");
                }
            }
            if let Err(e) = self.rule_engine.revoke(ip).await {
                warn!("stop_current: failed to revoke forwarding for {ip}: {e}");
            }
        }
        if let Some(h) = snapshot.up_handle {
            if let Err(e) = self.rule_engine.delete_rule(h).await {
                warn!("stop_current: failed to delete up rule {h}: {e}");
            }
        }
        if let Some(h) = snapshot.down_handle {
            if let Err(e) = self.rule_engine.delete_rule(h).await {
                warn!("stop_current: failed to delete down rule {h}: {e}");
            }
        }

        if let Err(e) = self.dispatcher.dispatch_session_stop(&snapshot, as_accounting_counters(deltas), cause).await {
            warn!("stop_current: failed to dispatch SESSION_STOP for {}: {e}", snapshot.access_key());
        }

        if let Some(live) = self.sessions.get_mut(key) {
            live.auth_state = AuthState::PendingAuth;
            live.up_handle = None;
            live.down_handle = None;
            live.counters = Default::default();
            live.qos = None;
        }
    }

    /// Tears down (if AUTHORIZED) and removes the session from every index,
    /// writing a tombstone so the reconciler will not resurrect it from a
    /// lease snapshot that has not yet caught up, per `spec.md` §4.5.
    async fn terminate_session(&mut self, key: SessionKey, cause: &str) {
        let now = Instant::now();
        self.stop_current(&key, cause, now).await;

        if let Some(session) = self.sessions.remove(&key) {
            if let Some(ip) = session.ip {
                self.by_ip.remove(&ip);
            }
            self.by_session_id.remove(&session.session_id);

            let ts_at_stop = session.expiry.unwrap_or_else(|| self.epoch_anchor.epoch_secs(now));
            self.tombstones.insert(
                key,
                Tombstone {
                    ip_at_stop: session.ip,
                    latest_state_update_ts_at_stop: ts_at_stop,
                    stopped_at: now,
                    reason: cause.to_string(),
                    missing_seen: false,
                },
            );
        }
    }

    async fn read_session_counters(&self, session: &Session) -> SessionCounterDeltas {
        let snapshot = match self.rule_engine.snapshot_counters().await {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to snapshot datapath counters for {}: {e}", session.access_key());
                return SessionCounterDeltas::default();
            }
        };
        let up: DatapathCounters = session.up_handle.and_then(|h| snapshot.get(&h).copied()).unwrap_or_default();
        let down: DatapathCounters = session.down_handle.and_then(|h| snapshot.get(&h).copied()).unwrap_or_default();

        SessionCounterDeltas {
            up_bytes: up.bytes.saturating_sub(session.counters.base_up_bytes),
            up_pkts: up.packets.saturating_sub(session.counters.base_up_pkts),
            down_bytes: down.bytes.saturating_sub(session.counters.base_down_bytes),
            down_pkts: down.packets.saturating_sub(session.counters.base_down_pkts),
        }
    }

    fn accounting_subject<'a>(&self, session: &'a Session, acct_session_id: &'a str, now: Instant) -> bng_radius::packets::AccountingSubject<'a> {
        bng_radius::packets::AccountingSubject {
            relay_id: &self.config.bng_id,
            remote_id: &session.remote_id,
            circuit_id: &session.circuit_id,
            mac: &session.mac,
            ip: session.ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            acct_session_id,
            session_time_secs: session.session_time_secs(now),
        }
    }

    async fn send_acct_start(&mut self, session: &Session) {
        if session.ip.is_none() {
            return;
        }
        let now = Instant::now();
        let acct_session_id = session.acct_session_id(self.epoch_anchor);
        let now_epoch = self.epoch_anchor.epoch_secs(now);
        let subject = self.accounting_subject(session, &acct_session_id, now);
        let identifier = self.next_radius_id();
        let pkt = bng_radius::packets::acct_start(identifier, &subject, self.config.nas_ip, &self.config.subscriber_iface, now_epoch);

        if let Err(e) = self.radius_acct.exchange(&pkt).await {
            warn!("send_acct_start: RADIUS exchange failed for {}: {e}", session.access_key());
        }
    }

    async fn send_acct_interim(&mut self, session: &Session, deltas: &SessionCounterDeltas, now: Instant) {
        if session.ip.is_none() {
            return;
        }
        let acct_session_id = session.acct_session_id(self.epoch_anchor);
        let now_epoch = self.epoch_anchor.epoch_secs(now);
        let subject = self.accounting_subject(session, &acct_session_id, now);
        let counters = as_radius_counters(*deltas);
        let identifier = self.next_radius_id();
        let pkt = bng_radius::packets::acct_interim(identifier, &subject, self.config.nas_ip, &self.config.subscriber_iface, now_epoch, &counters);

        if let Err(e) = self.radius_acct.exchange(&pkt).await {
            warn!("send_acct_interim: RADIUS exchange failed for {}: {e}", session.access_key());
        }
    }

    async fn send_acct_stop(&mut self, session: &Session, deltas: &SessionCounterDeltas, cause: &str, now: Instant) {
        if session.ip.is_none() {
            return;
        }
        let acct_session_id = session.acct_session_id(self.epoch_anchor);
        let now_epoch = self.epoch_anchor.epoch_secs(now);
        let subject = self.accounting_subject(session, &acct_session_id, now);
        let counters = as_radius_counters(*deltas);
        let identifier = self.next_radius_id();
        let pkt = bng_radius::packets::acct_stop(identifier, &subject, self.config.nas_ip, &self.config.subscriber_iface, now_epoch, &counters, cause);

        if let Err(e) = self.radius_acct.exchange(&pkt).await {
            warn!("send_acct_stop: RADIUS exchange failed for {}: {e}", session.access_key());
        }
    }

    async fn dispatch_session_start(&mut self, key: &SessionKey) {
        if let Some(session) = self.sessions.get(key).cloned() {
            if let Err(e) = self.dispatcher.dispatch_session_start(&session).await {
                warn!("failed to dispatch SESSION_START for {}: {e}", session.access_key());
            }
        }
    }

    async fn dispatch_policy_apply(&mut self, key: &SessionKey) {
        if let Some(session) = self.sessions.get(key).cloned() {
            if let Err(e) = self.dispatcher.dispatch_policy_apply(&session).await {
                warn!("failed to dispatch POLICY_APPLY for {}: {e}", session.access_key());
            }
        }
    }

    // ---- Periodic ticks ---------------------------------------------------

    /// `spec.md` §4.6: samples datapath counters for every AUTHORIZED
    /// session, evaluates idle transitions, and sends an Interim-Update.
    async fn run_interim_tick(&mut self) {
        let now = Instant::now();
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.status, Status::Active | Status::Idle) && s.auth_state == AuthState::Authorized)
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            self.run_interim_for(&key, now).await;
        }
    }

    async fn run_interim_for(&mut self, key: &SessionKey, now: Instant) {
        let Some(snapshot) = self.sessions.get(key).cloned() else { return };
        let deltas = self.read_session_counters(&snapshot).await;

        let prev_up = snapshot.counters.last_up_bytes.unwrap_or(0);
        let prev_down = snapshot.counters.last_down_bytes.unwrap_or(0);
        let eval = evaluate_idle(
            snapshot.status,
            snapshot.first_seen,
            snapshot.last_traffic_seen_ts,
            snapshot.last_idle_ts,
            prev_up,
            prev_down,
            deltas.up_bytes,
            deltas.down_bytes,
            now,
            self.config.idle_grace_after_connect,
            self.config.mark_idle_grace,
        );

        self.send_acct_interim(&snapshot, &deltas, now).await;
        if let Err(e) = self.dispatcher.dispatch_session_update(&snapshot, as_accounting_counters(deltas)).await {
            warn!("failed to dispatch SESSION_UPDATE for {}: {e}", snapshot.access_key());
        }

        if let Some(live) = self.sessions.get_mut(key) {
            live.status = eval.status;
            live.last_traffic_seen_ts = eval.last_traffic_seen_ts;
            live.last_idle_ts = eval.last_idle_ts;
            live.last_interim = Some(now);
            live.counters.last_up_bytes = Some(deltas.up_bytes);
            live.counters.last_down_bytes = Some(deltas.down_bytes);
        }
    }

    /// `spec.md` §4.4: re-runs authorization for every session still
    /// waiting on a RADIUS decision.
    async fn run_auth_retry_tick(&mut self) {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.auth_state == AuthState::PendingAuth && s.ip.is_some())
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            self.authorize(key).await;
        }
    }

    /// `spec.md` §4.6: terminates sessions that have been IDLE for longer
    /// than `mark_disconnect_grace`. Gated behind `enable_idle_disconnect`
    /// since the original shipped this behind a compile-time flag that
    /// defaulted off (`DESIGN.md`).
    async fn run_disconnection_check_tick(&mut self) {
        if !self.config.enable_idle_disconnect {
            return;
        }
        let now = Instant::now();
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                s.status == Status::Idle
                    && s.last_idle_ts
                        .is_some_and(|t| now.saturating_duration_since(t) >= self.config.mark_disconnect_grace)
            })
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            self.terminate_session(key, "Idle-Timeout").await;
        }
    }

    async fn run_router_ping_tick(&mut self) {
        let now = Instant::now();
        let updates = self.router_tracker.check_routers(&mut self.routers, now).await;
        for update in updates {
            let epoch = self.epoch_anchor.epoch_secs(update.last_seen) as f64;
            if let Err(e) = self.dispatcher.dispatch_router_update(&update.router_name, update.is_alive, epoch).await {
                warn!("failed to dispatch ROUTER_UPDATE for {}: {e}", update.router_name);
            }
        }
    }

    async fn run_bng_health_tick(&mut self) {
        let sample = self.health_reporter.sample().await;
        let first_seen = !self.health_seen_once;
        self.health_seen_once = true;
        if let Err(e) = self
            .dispatcher
            .dispatch_bng_health_update(sample.cpu_usage_percent, sample.mem_usage_bytes as f64, sample.mem_max_bytes as f64, first_seen)
            .await
        {
            warn!("failed to dispatch BNG_HEALTH_UPDATE: {e}");
        }
    }

    // ---- Reconciler, spec.md §4.5 -----------------------------------------

    async fn run_reconcile_tick(&mut self) {
        let now = Instant::now();
        let leases = match self.lease_service.get_all_leases(&self.config.bng_id).await {
            Ok(leases) => leases,
            Err(e) => {
                warn!("reconcile: lease service query failed: {e}");
                return;
            }
        };

        self.expire_tombstones(now);

        let mut current: HashMap<SessionKey, Lease> = HashMap::new();
        for lease in leases {
            let key: SessionKey = (self.config.bng_id.clone(), lease.circuit_id.clone(), lease.remote_id.clone());
            current.insert(key, lease);
        }

        let keys: Vec<SessionKey> = current.keys().cloned().collect();
        for key in keys {
            let lease = current.get(&key).cloned().expect("key drawn from current");

            if let Some(tombstone) = self.tombstones.get_mut(&key) {
                if lease.last_state_update_ts <= tombstone.latest_state_update_ts_at_stop {
                    if tombstone.missing_seen {
                        debug!("reconcile: {:?} still suppressed by tombstone", key);
                    } else {
                        info!("reconcile: suppressing resurrection of {:?}, tombstone still active", key);
                        tombstone.missing_seen = true;
                    }
                    continue;
                }
                self.tombstones.remove(&key);
            }

            if !self.sessions.contains_key(&key) {
                if lease.is_active {
                    self.synthesize_session_from_lease(key, &lease).await;
                }
                continue;
            }

            self.reconcile_existing(&key, &lease, now).await;
        }

        let now_epoch = self.epoch_anchor.epoch_secs(now);
        let to_terminate: Vec<SessionKey> = self
            .sessions
            .iter()
            .filter(|(key, session)| match current.get(*key) {
                None => session.expiry.is_some_and(|exp| now_epoch >= exp),
                Some(lease) => !lease.is_active,
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in to_terminate {
            self.terminate_session(key, "Reconcile-Timeout").await;
        }
    }

    fn expire_tombstones(&mut self, now: Instant) {
        let now_epoch = self.epoch_anchor.epoch_secs(now);
        let ttl = self.config.tombstone_ttl;
        let grace = self.config.tombstone_expiry_grace.as_secs();
        self.tombstones.retain(|_, t| {
            let expired_by_ttl = now.saturating_duration_since(t.stopped_at) >= ttl;
            let expired_by_lease = now_epoch >= t.latest_state_update_ts_at_stop + grace;
            !(expired_by_ttl || expired_by_lease)
        });
    }

    async fn synthesize_session_from_lease(&mut self, key: SessionKey, lease: &Lease) {
        let now = Instant::now();
        let mut session = Session::new(&self.config.bng_id, &key.1, &key.2, lease.mac.clone(), now);
        session.ip = Some(lease.ip);
        session.expiry = Some(lease.expiry);
        session.status = Status::Active;
        session.last_status_change_ts = now;

        self.by_ip.insert(lease.ip, key.clone());
        self.by_session_id.insert(session.session_id.clone(), key.clone());
        self.sessions.insert(key.clone(), session);

        self.dispatch_session_start(&key).await;
        self.authorize(key.clone()).await;
        self.dispatch_policy_apply(&key).await;
    }

    async fn reconcile_existing(&mut self, key: &SessionKey, lease: &Lease, now: Instant) {
        let Some(snapshot) = self.sessions.get(key).cloned() else { return };

        // A session still waiting for its first ACK: promote it off the
        // lease snapshot once it has waited past the grace period, per
        // `spec.md` §4.5.
        if snapshot.status == Status::Pending && snapshot.ip.is_none() {
            if now.saturating_duration_since(snapshot.first_seen) >= self.config.ack_grace {
                if let Some(live) = self.sessions.get_mut(key) {
                    live.ip = Some(lease.ip);
                    live.expiry = Some(lease.expiry);
                    live.status = Status::Active;
                    live.last_status_change_ts = now;
                    live.dhcp_nak_count = 0;
                }
                self.by_ip.insert(lease.ip, key.clone());

                self.dispatch_session_start(key).await;
                self.authorize(key.clone()).await;
                self.dispatch_policy_apply(key).await;
            }
            return;
        }

        if snapshot.ip != Some(lease.ip) {
            // The lease service's IP disagrees with ours: tear down the
            // old association and replay the fresh-ACK path with a new
            // session_id, same as an in-band ACK IP-change.
            self.stop_current(key, "IP-change", now).await;

            if let Some(old_ip) = snapshot.ip {
                self.by_ip.remove(&old_ip);
            }

            let old_session_id = self.sessions.get(key).map(|s| s.session_id.clone());
            if let Some(live) = self.sessions.get_mut(key) {
                live.ip = Some(lease.ip);
                live.expiry = Some(lease.expiry);
                live.status = Status::Active;
                live.last_status_change_ts = now;
                live.last_idle_ts = None;
                live.last_traffic_seen_ts = None;
                live.counters.last_up_bytes = None;
                live.counters.last_down_bytes = None;
                live.session_id = Uuid::new_v4().to_string();
            }
            if let Some(old_sid) = old_session_id {
                self.by_session_id.remove(&old_sid);
            }
            if let Some(live) = self.sessions.get(key) {
                self.by_session_id.insert(live.session_id.clone(), key.clone());
            }
            self.by_ip.insert(lease.ip, key.clone());

            self.dispatch_session_start(key).await;
            self.authorize(key.clone()).await;
            self.dispatch_policy_apply(key).await;
            return;
        }

        if snapshot.expiry != Some(lease.expiry) {
            if let Some(live) = self.sessions.get_mut(key) {
                live.expiry = Some(lease.expiry);
            }
        }
        if let Some(live) = self.sessions.get_mut(key) {
            live.last_seen = now;
        }
    }

    // ---- CoA bridge, spec.md §4.9 -----------------------------------------

    async fn handle_coa(&mut self, cmd: CoaCommand) {
        let reply = match cmd.request {
            CoaRequest::Disconnect { session_id } => match self.by_session_id.get(&session_id).cloned() {
                Some(key) => {
                    self.terminate_session(key, "Admin-Reset").await;
                    CoaReply::ok()
                }
                None => CoaReply::err(format!("session not found: {session_id}")),
            },
            CoaRequest::PolicyChange { session_id, filter_id } => {
                info!("coa: policy_change acknowledged for session={session_id} filter_id={filter_id} (no-op, per DESIGN.md)");
                CoaReply::ok()
            }
        };
        let _ = cmd.reply_tx.send(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(msg_type: MessageType) -> DhcpEvent {
        DhcpEvent {
            msg_type,
            xid: 1,
            circuit_id: Some("1/0/1".into()),
            remote_id: Some("R1".into()),
            relay_id: Some("bng-a".into()),
            mac: "aa:bb:cc:dd:ee:ff".into(),
            ip: None,
            requested_ip: None,
            lease_time_secs: None,
            expiry: None,
            giaddr: Ipv4Addr::UNSPECIFIED,
            src_port: 68,
            dst_port: 67,
            received_at: Instant::now(),
        }
    }

    #[test]
    fn access_context_requires_circuit_and_remote_id() {
        let mut e = event(MessageType::Request);
        assert!(has_access_context(&e));
        e.circuit_id = None;
        assert!(!has_access_context(&e));
    }

    #[test]
    fn access_context_requires_nonempty_mac() {
        let mut e = event(MessageType::Request);
        e.mac = String::new();
        assert!(!has_access_context(&e));
    }

    #[test]
    fn idle_after_connect_grace_with_no_traffic_marks_idle() {
        let first_seen = Instant::now() - Duration::from_secs(100);
        let now = Instant::now();
        let eval = evaluate_idle(
            Status::Active,
            first_seen,
            None,
            None,
            0,
            0,
            0,
            0,
            now,
            Duration::from_secs(40),
            Duration::from_secs(20),
        );
        assert_eq!(eval.status, Status::Idle);
        assert!(eval.last_idle_ts.is_some());
    }

    #[test]
    fn traffic_before_connect_grace_keeps_active() {
        let first_seen = Instant::now() - Duration::from_secs(5);
        let now = Instant::now();
        let eval = evaluate_idle(
            Status::Active,
            first_seen,
            None,
            None,
            0,
            0,
            0,
            0,
            now,
            Duration::from_secs(40),
            Duration::from_secs(20),
        );
        assert_eq!(eval.status, Status::Active);
        assert!(eval.last_idle_ts.is_none());
    }

    #[test]
    fn counter_delta_marks_active_and_refreshes_traffic_seen() {
        let first_seen = Instant::now() - Duration::from_secs(200);
        let seen_long_ago = Instant::now() - Duration::from_secs(100);
        let now = Instant::now();
        let eval = evaluate_idle(
            Status::Idle,
            first_seen,
            Some(seen_long_ago),
            Some(seen_long_ago),
            1000,
            1000,
            2000,
            1000,
            now,
            Duration::from_secs(40),
            Duration::from_secs(20),
        );
        assert_eq!(eval.status, Status::Active);
        assert_eq!(eval.last_traffic_seen_ts, Some(now));
    }

    #[test]
    fn stalled_counters_past_mark_idle_grace_go_idle() {
        let first_seen = Instant::now() - Duration::from_secs(200);
        let seen = Instant::now() - Duration::from_secs(25);
        let now = Instant::now();
        let eval = evaluate_idle(
            Status::Active,
            first_seen,
            Some(seen),
            None,
            500,
            500,
            500,
            500,
            now,
            Duration::from_secs(40),
            Duration::from_secs(20),
        );
        assert_eq!(eval.status, Status::Idle);
        assert_eq!(eval.last_idle_ts, Some(now));
    }

    #[test]
    fn stalled_counters_within_mark_idle_grace_stay_put() {
        let first_seen = Instant::now() - Duration::from_secs(200);
        let seen = Instant::now() - Duration::from_secs(5);
        let now = Instant::now();
        let eval = evaluate_idle(
            Status::Active,
            first_seen,
            Some(seen),
            None,
            500,
            500,
            500,
            500,
            now,
            Duration::from_secs(40),
            Duration::from_secs(20),
        );
        assert_eq!(eval.status, Status::Active);
        assert!(eval.last_idle_ts.is_none());
    }
}
