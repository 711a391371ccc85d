//! Integration tests driving the full [`SessionEngine`] against fake
//! datapath/event-sink backends and loopback RADIUS test servers, covering
//! the end-to-end scenarios in `spec.md` §8 / `SPEC_FULL.md` §D.
//!
//! The RADIUS client always talks to `bng_radius::AUTH_PORT`/`ACCT_PORT`
//! (1812/1813), so these scenarios run sequentially inside one test
//! function rather than as independent `#[tokio::test]`s: two fake servers
//! bound to the same fixed ports would otherwise race across parallel test
//! threads.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use bng_core::coa::{CoaCommand, CoaReply, CoaRequest};
use bng_core::config::Config;
use bng_core::datapath::{Counters, RuleEngine, RuleHandle, TrafficShaper};
use bng_core::dhcp_event::{DhcpEvent, EventSeq, QueuedEvent};
use bng_core::dispatcher::{AccountingCounters, EventSink};
use bng_core::engine::{EngineCommand, TickKind};
use bng_core::error::{DatapathError, DispatcherError};
use bng_core::health::HealthReporter;
use bng_core::lease_service::LeaseService;
use bng_core::model::Session;
use bng_core::router_tracker::RouterTracker;
use bng_core::{EpochAnchor, SessionEngine};
use bng_dhcp::MessageType;

const RADIUS_SECRET: &[u8] = b"test-secret";

fn base_config() -> Config {
    Config {
        bng_id: "BNG-A".into(),
        subscriber_iface: "eth-sub".into(),
        uplink_iface: "eth-up".into(),
        subscriber_ip: Ipv4Addr::new(10, 0, 0, 1),
        nas_ip: Ipv4Addr::new(10, 0, 0, 1),
        dhcp_server: Ipv4Addr::new(192, 0, 2, 1),
        radius_server: Ipv4Addr::LOCALHOST,
        radius_secret: String::from_utf8(RADIUS_SECRET.to_vec()).unwrap(),
        lease_service_url: "http://127.0.0.1:1".into(),
        lease_service_user: "user".into(),
        lease_service_password: "pass".into(),
        redis_url: "redis://127.0.0.1/".into(),
        event_stream: "bng_events".into(),
        coa_sock_path: "/tmp/bng-test-unused.sock".into(),
        router_inventory_path: None,
        cgroup_root: "/nonexistent-cgroup-root-for-tests".into(),
        enable_idle_disconnect: true,
        idle_grace_after_connect: Duration::from_secs(40),
        mark_idle_grace: Duration::from_secs(20),
        mark_disconnect_grace: Duration::from_secs(10),
        tombstone_ttl: Duration::from_secs(600),
        tombstone_expiry_grace: Duration::from_secs(60),
        dhcp_nak_terminate_threshold: 3,
        ack_grace: Duration::from_secs(8),
        interim_interval: Duration::from_secs(10),
        auth_retry_interval: Duration::from_secs(15),
        disconnection_check_interval: Duration::from_secs(5),
        reconcile_interval: Duration::from_secs(30),
        router_ping_interval: Duration::from_secs(20),
        health_interval: Duration::from_secs(60),
        event_queue_size: 1000,
        command_queue_size: 2048,
        radius_timeout: Duration::from_secs(1),
        coa_read_timeout: Duration::from_secs(3),
        coa_reply_timeout: Duration::from_secs(5),
    }
}

// ---- Fake datapath backends ------------------------------------------------

#[derive(Default)]
struct RuleState {
    next_handle: RuleHandle,
    installed: Vec<(RuleHandle, RuleHandle, Ipv4Addr, String)>,
    deleted: Vec<RuleHandle>,
    allowed: Vec<Ipv4Addr>,
    revoked: Vec<Ipv4Addr>,
    counters: HashMap<RuleHandle, Counters>,
}

struct FakeRuleEngine {
    state: Mutex<RuleState>,
}

impl FakeRuleEngine {
    fn new() -> Self {
        Self {
            state: Mutex::new(RuleState::default()),
        }
    }
}

#[async_trait]
impl RuleEngine for FakeRuleEngine {
    async fn install_subscriber_rules(&self, ip: Ipv4Addr, mac: &str, _subscriber_iface: &str) -> Result<(RuleHandle, RuleHandle), DatapathError> {
        let mut s = self.state.lock().unwrap();
        s.next_handle += 1;
        let up = s.next_handle;
        s.next_handle += 1;
        let down = s.next_handle;
        s.installed.push((up, down, ip, mac.to_string()));
        s.counters.entry(up).or_default();
        s.counters.entry(down).or_default();
        Ok((up, down))
    }

    async fn delete_rule(&self, handle: RuleHandle) -> Result<(), DatapathError> {
        self.state.lock().unwrap().deleted.push(handle);
        Ok(())
    }

    async fn snapshot_counters(&self) -> Result<HashMap<RuleHandle, Counters>, DatapathError> {
        Ok(self.state.lock().unwrap().counters.clone())
    }

    async fn allow(&self, ip: Ipv4Addr) -> Result<(), DatapathError> {
        self.state.lock().unwrap().allowed.push(ip);
        Ok(())
    }

    async fn revoke(&self, ip: Ipv4Addr) -> Result<(), DatapathError> {
        self.state.lock().unwrap().revoked.push(ip);
        Ok(())
    }
}

struct FakeShaper;

#[async_trait]
impl TrafficShaper for FakeShaper {
    async fn add_shaping(
        &self,
        _ip: Ipv4Addr,
        _upload_kbit: u32,
        _download_kbit: u32,
        _upload_burst_kbit: Option<u32>,
        _download_burst_kbit: Option<u32>,
    ) -> Result<bool, DatapathError> {
        Ok(true)
    }

    async fn remove_shaping(&self, _ip: Ipv4Addr) -> Result<bool, DatapathError> {
        Ok(true)
    }
}

// ---- Fake event sink --------------------------------------------------------

#[derive(Debug, Clone)]
enum DispatchedEvent {
    Start { access_key: String, session_id: String },
    Update { access_key: String, counters: AccountingCounters },
    Stop { access_key: String, session_id: String, counters: AccountingCounters, cause: String },
    PolicyApply { access_key: String },
}

struct FakeSink {
    events: Arc<Mutex<Vec<DispatchedEvent>>>,
}

#[async_trait]
impl EventSink for FakeSink {
    async fn dispatch_session_start(&mut self, session: &Session) -> Result<(), DispatcherError> {
        self.events.lock().unwrap().push(DispatchedEvent::Start {
            access_key: session.access_key(),
            session_id: session.session_id.clone(),
        });
        Ok(())
    }

    async fn dispatch_session_update(&mut self, session: &Session, counters: AccountingCounters) -> Result<(), DispatcherError> {
        self.events.lock().unwrap().push(DispatchedEvent::Update {
            access_key: session.access_key(),
            counters,
        });
        Ok(())
    }

    async fn dispatch_session_stop(&mut self, session: &Session, counters: AccountingCounters, terminate_cause: &str) -> Result<(), DispatcherError> {
        self.events.lock().unwrap().push(DispatchedEvent::Stop {
            access_key: session.access_key(),
            session_id: session.session_id.clone(),
            counters,
            cause: terminate_cause.to_string(),
        });
        Ok(())
    }

    async fn dispatch_policy_apply(&mut self, session: &Session) -> Result<(), DispatcherError> {
        self.events.lock().unwrap().push(DispatchedEvent::PolicyApply {
            access_key: session.access_key(),
        });
        Ok(())
    }

    async fn dispatch_router_update(&mut self, _router_name: &str, _is_alive: bool, _last_seen_epoch: f64) -> Result<(), DispatcherError> {
        Ok(())
    }

    async fn dispatch_bng_health_update(&mut self, _cpu_usage: f64, _mem_usage: f64, _mem_max: f64, _first_seen: bool) -> Result<(), DispatcherError> {
        Ok(())
    }
}

// ---- Fake RADIUS servers ---------------------------------------------------
//
// The session engine's `RadiusClient` always targets `AUTH_PORT`/`ACCT_PORT`
// on `config.radius_server`, so these bind to the fixed ports on loopback;
// scenarios that need one run sequentially within a single test function.

fn encode_attrs(attrs: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (code, value) in attrs {
        out.push(*code);
        out.push((value.len() + 2) as u8);
        out.extend_from_slice(value);
    }
    out
}

/// Mirrors `bng_radius`'s private `md5_authenticator`: the RFC 2865 §3 /
/// RFC 2866 §3 Response Authenticator formula.
fn response_authenticator(code: u8, identifier: u8, len: usize, seed: &[u8; 16], attrs: &[u8], secret: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update([code, identifier, (len >> 8) as u8, len as u8]);
    hasher.update(seed);
    hasher.update(attrs);
    hasher.update(secret);
    hasher.finalize().into()
}

#[derive(Clone, Copy)]
enum AuthBehavior {
    Accept,
    Reject,
}

fn spawn_auth_server(behavior: AuthBehavior) -> (JoinHandle<()>, Arc<Mutex<Vec<bng_radius::Packet>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_task = received.clone();
    let handle = tokio::spawn(async move {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, bng_radius::AUTH_PORT))
            .await
            .expect("bind fake RADIUS auth server on 1812");
        let mut buf = [0u8; 4096];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let Ok(req) = bng_radius::Packet::decode(&buf[..n]) else { continue };
            received_task.lock().unwrap().push(req.clone());

            let code = match behavior {
                AuthBehavior::Accept => bng_radius::CODE_ACCESS_ACCEPT,
                AuthBehavior::Reject => bng_radius::CODE_ACCESS_REJECT,
            };
            let attrs = Vec::new();
            let len = 20 + attrs.len();
            let auth = response_authenticator(code, req.identifier, len, &req.authenticator, &attrs, RADIUS_SECRET);
            let reply = bng_radius::Packet::new(code, req.identifier, auth);
            let _ = socket.send_to(&reply.encode().unwrap(), from).await;
        }
    });
    (handle, received)
}

fn spawn_acct_server() -> (JoinHandle<()>, Arc<Mutex<Vec<bng_radius::Packet>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_task = received.clone();
    let handle = tokio::spawn(async move {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, bng_radius::ACCT_PORT))
            .await
            .expect("bind fake RADIUS acct server on 1813");
        let mut buf = [0u8; 4096];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => return,
            };
            let Ok(req) = bng_radius::Packet::decode(&buf[..n]) else { continue };
            received_task.lock().unwrap().push(req.clone());

            let attrs = Vec::new();
            let len = 20 + attrs.len();
            let auth = response_authenticator(bng_radius::CODE_ACCOUNTING_RESPONSE, req.identifier, len, &req.authenticator, &attrs, RADIUS_SECRET);
            let reply = bng_radius::Packet::new(bng_radius::CODE_ACCOUNTING_RESPONSE, req.identifier, auth);
            let _ = socket.send_to(&reply.encode().unwrap(), from).await;
        }
    });
    (handle, received)
}

// ---- DHCP event builders ----------------------------------------------------

fn request_event(circuit_id: &str, remote_id: &str, mac: &str) -> DhcpEvent {
    DhcpEvent {
        msg_type: MessageType::Request,
        xid: 1,
        circuit_id: Some(circuit_id.into()),
        remote_id: Some(remote_id.into()),
        relay_id: Some("BNG-A".into()),
        mac: mac.into(),
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

fn ack_event(circuit_id: &str, remote_id: &str, mac: &str, ip: Ipv4Addr) -> DhcpEvent {
    DhcpEvent {
        msg_type: MessageType::Ack,
        xid: 2,
        circuit_id: Some(circuit_id.into()),
        remote_id: Some(remote_id.into()),
        relay_id: Some("BNG-A".into()),
        mac: mac.into(),
        ip: Some(ip),
        requested_ip: Some(ip),
        lease_time_secs: Some(3600),
        expiry: Some(3_000_000_000),
        giaddr: Ipv4Addr::new(10, 0, 0, 254),
        src_port: 67,
        dst_port: 68,
        received_at: Instant::now(),
    }
}

async fn send_event(tx: &mpsc::Sender<QueuedEvent>, seq: u64, event: DhcpEvent) {
    tx.send(QueuedEvent { seq: EventSeq(seq), event }).await.unwrap();
}

async fn wait_until(events: &Arc<Mutex<Vec<DispatchedEvent>>>, min_len: usize) {
    for _ in 0..300 {
        if events.lock().unwrap().len() >= min_len {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {} dispatched events, got: {:?}", min_len, events.lock().unwrap());
}

// ---- Engine harness ---------------------------------------------------------

struct Harness {
    events_tx: mpsc::Sender<QueuedEvent>,
    commands_tx: mpsc::Sender<EngineCommand>,
    engine_task: JoinHandle<()>,
    dispatched: Arc<Mutex<Vec<DispatchedEvent>>>,
    rule_engine: Arc<FakeRuleEngine>,
}

fn build_harness(config: Config) -> Harness {
    let epoch_anchor = EpochAnchor::now();
    let rule_engine = Arc::new(FakeRuleEngine::new());
    let rule_engine_dyn: Arc<dyn RuleEngine> = rule_engine.clone();
    let shaper: Arc<dyn TrafficShaper> = Arc::new(FakeShaper);
    let lease_service = LeaseService::new(config.lease_service_url.clone(), config.lease_service_user.clone(), config.lease_service_password.clone());
    let dispatched = Arc::new(Mutex::new(Vec::new()));
    let sink: Box<dyn EventSink> = Box::new(FakeSink { events: dispatched.clone() });
    let router_tracker = RouterTracker::new(config.bng_id.clone(), Vec::new(), config.router_ping_interval);
    let health_reporter = HealthReporter::new(config.cgroup_root.clone());

    let engine = SessionEngine::new(config, epoch_anchor, rule_engine_dyn, shaper, lease_service, sink, router_tracker, health_reporter);

    let (events_tx, events_rx) = mpsc::channel::<QueuedEvent>(100);
    let (commands_tx, commands_rx) = mpsc::channel::<EngineCommand>(100);
    let engine_task = tokio::spawn(engine.run(events_rx, commands_rx));

    Harness {
        events_tx,
        commands_tx,
        engine_task,
        dispatched,
        rule_engine,
    }
}

async fn teardown(harness: Harness, radius_tasks: Vec<JoinHandle<()>>) {
    drop(harness.events_tx);
    drop(harness.commands_tx);
    let _ = tokio::time::timeout(Duration::from_millis(300), harness.engine_task).await;
    for task in radius_tasks {
        task.abort();
    }
    // Give the OS a moment to release the fixed RADIUS ports before the
    // next scenario's fake servers rebind them.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---- Scenarios, spec.md §8 ---------------------------------------------------

/// Scenario 1: REQUEST then ACK produces SESSION_START, an Access-Accept
/// installs datapath rules and sends Acct-Start, then POLICY_APPLY fires.
async fn scenario_happy_path() {
    let (auth_task, auth_received) = spawn_auth_server(AuthBehavior::Accept);
    let (acct_task, acct_received) = spawn_acct_server();
    let harness = build_harness(base_config());

    send_event(&harness.events_tx, 1, request_event("1/0/1", "R1", "00:11:22:33:44:55")).await;
    send_event(&harness.events_tx, 2, ack_event("1/0/1", "R1", "00:11:22:33:44:55", Ipv4Addr::new(10, 0, 0, 50))).await;

    wait_until(&harness.dispatched, 2).await;
    let events = harness.dispatched.lock().unwrap().clone();
    assert_eq!(events.len(), 2, "happy path emits exactly SESSION_START then POLICY_APPLY: {events:?}");
    let DispatchedEvent::Start { access_key, .. } = &events[0] else { panic!("expected Start, got {:?}", events[0]) };
    assert_eq!(access_key, "BNG-A/R1/1/0/1");
    assert!(matches!(&events[1], DispatchedEvent::PolicyApply { access_key } if access_key == "BNG-A/R1/1/0/1"));

    {
        let state = harness.rule_engine.state.lock().unwrap();
        assert_eq!(state.installed.len(), 1);
        assert_eq!(state.installed[0].2, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(state.installed[0].3, "00:11:22:33:44:55");
        assert_eq!(state.allowed, vec![Ipv4Addr::new(10, 0, 0, 50)]);
    }

    let auth_reqs = auth_received.lock().unwrap();
    assert_eq!(auth_reqs.len(), 1, "exactly one Access-Request sent");
    assert_eq!(auth_reqs[0].attr(bng_radius::ATTR_USER_NAME), Some(&b"BNG-A/R1/1/0/1"[..]));
    assert_eq!(auth_reqs[0].attr(bng_radius::ATTR_FRAMED_IP_ADDRESS), Some(&[10, 0, 0, 50][..]));
    drop(auth_reqs);

    let acct_reqs = acct_received.lock().unwrap();
    assert_eq!(acct_reqs.len(), 1, "exactly one Acct-Start sent");
    assert_eq!(acct_reqs[0].attr_u32(bng_radius::ATTR_ACCT_STATUS_TYPE), Some(bng_radius::ACCT_STATUS_START));
    drop(acct_reqs);

    teardown(harness, vec![auth_task, acct_task]).await;
}

/// Scenario 2: Access-Reject leaves the session unauthorized — no datapath
/// rules, no Acct-Start, no `allow`.
async fn scenario_radius_reject() {
    let (auth_task, auth_received) = spawn_auth_server(AuthBehavior::Reject);
    let (acct_task, acct_received) = spawn_acct_server();
    let harness = build_harness(base_config());

    send_event(&harness.events_tx, 1, request_event("1/0/2", "R1", "aa:aa:aa:aa:aa:aa")).await;
    send_event(&harness.events_tx, 2, ack_event("1/0/2", "R1", "aa:aa:aa:aa:aa:aa", Ipv4Addr::new(10, 0, 0, 51))).await;

    wait_until(&harness.dispatched, 2).await;
    assert_eq!(auth_received.lock().unwrap().len(), 1, "Access-Request was sent and rejected");
    assert!(acct_received.lock().unwrap().is_empty(), "no Acct-Start on Access-Reject");

    let state = harness.rule_engine.state.lock().unwrap();
    assert!(state.installed.is_empty(), "no datapath rules installed on Access-Reject");
    assert!(state.allowed.is_empty(), "no allow() on Access-Reject");
    drop(state);

    teardown(harness, vec![auth_task, acct_task]).await;
}

/// Scenario 4: an ACK with a changed `yiaddr` tears down the old
/// association (Acct-Stop cause `IP-change`) and starts a fresh one with a
/// distinct `session_id`.
async fn scenario_ip_change() {
    let (auth_task, _auth_received) = spawn_auth_server(AuthBehavior::Accept);
    let (acct_task, acct_received) = spawn_acct_server();
    let harness = build_harness(base_config());

    send_event(&harness.events_tx, 1, request_event("1/0/3", "R1", "bb:bb:bb:bb:bb:bb")).await;
    send_event(&harness.events_tx, 2, ack_event("1/0/3", "R1", "bb:bb:bb:bb:bb:bb", Ipv4Addr::new(10, 0, 0, 60))).await;
    wait_until(&harness.dispatched, 2).await;

    let first_session_id = {
        let events = harness.dispatched.lock().unwrap();
        let DispatchedEvent::Start { session_id, .. } = &events[0] else { panic!("expected Start") };
        session_id.clone()
    };

    send_event(&harness.events_tx, 3, ack_event("1/0/3", "R1", "bb:bb:bb:bb:bb:bb", Ipv4Addr::new(10, 0, 0, 61))).await;
    wait_until(&harness.dispatched, 5).await;

    let events = harness.dispatched.lock().unwrap().clone();
    assert_eq!(events.len(), 5, "IP change produces Stop then Start/PolicyApply for the new IP: {events:?}");

    let DispatchedEvent::Stop { session_id: stopped_sid, cause, .. } = &events[2] else {
        panic!("expected Stop at index 2, got {:?}", events[2])
    };
    assert_eq!(cause, "IP-change");
    assert_eq!(stopped_sid, &first_session_id);

    let DispatchedEvent::Start { session_id: new_sid, .. } = &events[3] else {
        panic!("expected Start at index 3, got {:?}", events[3])
    };
    assert_ne!(new_sid, &first_session_id, "IP change must mint a fresh session_id");
    assert!(matches!(&events[4], DispatchedEvent::PolicyApply { .. }));

    {
        let state = harness.rule_engine.state.lock().unwrap();
        assert_eq!(state.installed.len(), 2, "one rule pair per IP");
        assert_eq!(state.revoked, vec![Ipv4Addr::new(10, 0, 0, 60)], "old IP revoked on teardown");
        let (up1, down1, ..) = state.installed[0];
        assert!(state.deleted.contains(&up1) && state.deleted.contains(&down1), "old rule handles deleted");
    }

    assert!(acct_received.lock().unwrap().iter().any(|p| p.attr_u32(bng_radius::ATTR_ACCT_STATUS_TYPE) == Some(bng_radius::ACCT_STATUS_STOP)));

    teardown(harness, vec![auth_task, acct_task]).await;
}

/// Scenario 6: a CoA disconnect for an authorized session tears down the
/// datapath, sends Acct-Stop with cause `Admin-Reset`, and replies
/// `{"success":true}`; an unknown session_id replies with an error instead.
async fn scenario_coa_disconnect() {
    let (auth_task, _auth_received) = spawn_auth_server(AuthBehavior::Accept);
    let (acct_task, acct_received) = spawn_acct_server();
    let harness = build_harness(base_config());

    send_event(&harness.events_tx, 1, request_event("1/0/4", "R1", "cc:cc:cc:cc:cc:cc")).await;
    send_event(&harness.events_tx, 2, ack_event("1/0/4", "R1", "cc:cc:cc:cc:cc:cc", Ipv4Addr::new(10, 0, 0, 70))).await;
    wait_until(&harness.dispatched, 2).await;

    let session_id = {
        let events = harness.dispatched.lock().unwrap();
        let DispatchedEvent::Start { session_id, .. } = &events[0] else { panic!("expected Start") };
        session_id.clone()
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    harness
        .commands_tx
        .send(EngineCommand::Coa(CoaCommand {
            request: CoaRequest::Disconnect { session_id: session_id.clone() },
            reply_tx,
        }))
        .await
        .unwrap();
    let reply: CoaReply = reply_rx.await.unwrap();
    assert!(reply.success, "CoA disconnect for a known session must succeed");

    wait_until(&harness.dispatched, 3).await;
    let events = harness.dispatched.lock().unwrap().clone();
    let DispatchedEvent::Stop { session_id: stopped_sid, cause, .. } = &events[2] else {
        panic!("expected Stop at index 2, got {:?}", events[2])
    };
    assert_eq!(cause, "Admin-Reset");
    assert_eq!(stopped_sid, &session_id);

    {
        let state = harness.rule_engine.state.lock().unwrap();
        assert_eq!(state.revoked, vec![Ipv4Addr::new(10, 0, 0, 70)]);
        assert_eq!(state.deleted.len(), 2, "both counting rules deleted on disconnect");
    }
    assert!(acct_received.lock().unwrap().iter().any(|p| p.attr_u32(bng_radius::ATTR_ACCT_STATUS_TYPE) == Some(bng_radius::ACCT_STATUS_STOP)));

    let (reply_tx2, reply_rx2) = oneshot::channel();
    harness
        .commands_tx
        .send(EngineCommand::Coa(CoaCommand {
            request: CoaRequest::Disconnect { session_id: "not-a-real-session".into() },
            reply_tx: reply_tx2,
        }))
        .await
        .unwrap();
    let reply2: CoaReply = reply_rx2.await.unwrap();
    assert!(!reply2.success, "CoA disconnect for an unknown session must fail");

    teardown(harness, vec![auth_task, acct_task]).await;
}

/// Scenario 3: an interim tick reads datapath counters, sends an
/// Acct-Interim RADIUS packet carrying the delta against the
/// authorization-time baseline, and dispatches SESSION_UPDATE with the
/// same counters.
async fn scenario_interim_accounting() {
    let (auth_task, _auth_received) = spawn_auth_server(AuthBehavior::Accept);
    let (acct_task, acct_received) = spawn_acct_server();
    let harness = build_harness(base_config());

    send_event(&harness.events_tx, 1, request_event("1/0/5", "R1", "dd:dd:dd:dd:dd:dd")).await;
    send_event(&harness.events_tx, 2, ack_event("1/0/5", "R1", "dd:dd:dd:dd:dd:dd", Ipv4Addr::new(10, 0, 0, 80))).await;
    wait_until(&harness.dispatched, 2).await;
    acct_received.lock().unwrap().clear();

    let (up_handle, down_handle) = {
        let state = harness.rule_engine.state.lock().unwrap();
        let (up, down, ..) = *state.installed.last().expect("subscriber rules installed");
        (up, down)
    };
    {
        let mut state = harness.rule_engine.state.lock().unwrap();
        state.counters.insert(up_handle, Counters { bytes: 150_000, packets: 200 });
        state.counters.insert(down_handle, Counters { bytes: 900_000, packets: 700 });
    }

    harness.commands_tx.send(EngineCommand::Tick(TickKind::Interim)).await.unwrap();
    wait_until(&harness.dispatched, 3).await;

    let events = harness.dispatched.lock().unwrap().clone();
    let DispatchedEvent::Update { access_key, counters } = &events[2] else {
        panic!("expected Update at index 2, got {:?}", events[2])
    };
    assert_eq!(access_key, "BNG-A/R1/1/0/5");
    assert_eq!(counters.input_octets, 150_000, "input (upload) octets come from the up-direction handle");
    assert_eq!(counters.output_octets, 900_000, "output (download) octets come from the down-direction handle");
    assert_eq!(counters.input_packets, 200);
    assert_eq!(counters.output_packets, 700);

    let acct_reqs = acct_received.lock().unwrap();
    assert_eq!(acct_reqs.len(), 1, "exactly one Acct-Interim sent");
    let pkt = &acct_reqs[0];
    assert_eq!(pkt.attr_u32(bng_radius::ATTR_ACCT_STATUS_TYPE), Some(bng_radius::ACCT_STATUS_INTERIM_UPDATE));
    assert_eq!(pkt.attr_u32(bng_radius::ATTR_ACCT_INPUT_OCTETS), Some(150_000));
    assert_eq!(pkt.attr_u32(bng_radius::ATTR_ACCT_OUTPUT_OCTETS), Some(900_000));
    assert_eq!(pkt.attr_u32(bng_radius::ATTR_ACCT_INPUT_PACKETS), Some(200));
    assert_eq!(pkt.attr_u32(bng_radius::ATTR_ACCT_OUTPUT_PACKETS), Some(700));
    drop(acct_reqs);

    teardown(harness, vec![auth_task, acct_task]).await;
}

#[tokio::test]
async fn engine_end_to_end_scenarios() {
    scenario_happy_path().await;
    scenario_radius_reject().await;
    scenario_ip_change().await;
    scenario_interim_accounting().await;
    scenario_coa_disconnect().await;
}
