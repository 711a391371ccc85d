//! Process entry point: parses [`Config`], wires the sniffer, the
//! periodic tickers, the CoA bridge and every backing service into one
//! [`SessionEngine`], and runs it to completion, per `spec.md` §5/§6.
//!
//! Grounded on `examples/original_source/bng/bng_main.py`'s startup
//! sequence (construct backends, spawn the sniffer and the coad socket,
//! hand everything to the single-writer loop) and the teacher's own
//! `examples/*.rs` binaries for the `env_logger` init shape.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;

use bng_core::coa::{self, CoaCommand};
use bng_core::datapath::shell::{NftRuleEngine, TcTrafficShaper};
use bng_core::datapath::{RuleEngine, TrafficShaper};
use bng_core::dispatcher::EventDispatcher;
use bng_core::engine::{spawn_tickers, EngineCommand, SessionEngine};
use bng_core::health::HealthReporter;
use bng_core::lease_service::LeaseService;
use bng_core::router_tracker::{self, RouterTracker};
use bng_core::sniffer::{self, SnifferConfig};
use bng_core::{Config, EpochAnchor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"));

    let config = Config::parse();

    if let Err(e) = run(config).await {
        error!("bng: fatal startup error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    let epoch_anchor = EpochAnchor::now();

    let rule_engine: Arc<dyn RuleEngine> = Arc::new(NftRuleEngine::new(config.subscriber_iface.clone()));
    let shaper: Arc<dyn TrafficShaper> = Arc::new(TcTrafficShaper::new(config.subscriber_iface.clone(), config.uplink_iface.clone()));

    let lease_service = LeaseService::new(
        config.lease_service_url.clone(),
        config.lease_service_user.clone(),
        config.lease_service_password.clone(),
    );

    let dispatcher = EventDispatcher::connect(
        &config.redis_url,
        config.event_stream.clone(),
        config.bng_id.clone(),
        config.nas_ip.to_string(),
        epoch_anchor,
    )
    .await
    .context("failed to connect to the event stream")?;

    let inventory = match &config.router_inventory_path {
        Some(path) => router_tracker::load_inventory(path)
            .await
            .with_context(|| format!("failed to load router inventory from {path}"))?,
        None => {
            warn!("bng: no router inventory configured, access-router liveness tracking is disabled");
            Vec::new()
        }
    };
    let router_tracker = RouterTracker::new(config.bng_id.clone(), inventory, config.router_ping_interval);

    let health_reporter = HealthReporter::new(config.cgroup_root.clone());

    let engine = SessionEngine::new(
        config.clone(),
        epoch_anchor,
        rule_engine,
        shaper,
        lease_service,
        Box::new(dispatcher),
        router_tracker,
        health_reporter,
    );

    let (events_tx, events_rx) = mpsc::channel(config.event_queue_size);
    let (command_tx, command_rx) = mpsc::channel(config.command_queue_size);
    let (coa_tx, mut coa_rx) = mpsc::channel::<CoaCommand>(32);

    let sniffer_cfg = SnifferConfig {
        bng_id: config.bng_id.clone(),
        subscriber_iface: config.subscriber_iface.clone(),
        uplink_iface: config.uplink_iface.clone(),
        subscriber_ip: config.subscriber_ip,
        dhcp_server: config.dhcp_server,
    };
    tokio::spawn(sniffer::run(sniffer_cfg, events_tx));

    let tickers = spawn_tickers(command_tx.clone(), &config);

    // Bridges CoA requests onto the engine's single command queue so the
    // connection handler in `coa::run` never touches engine state itself.
    let coa_bridge_tx = command_tx.clone();
    tokio::spawn(async move {
        while let Some(cmd) = coa_rx.recv().await {
            if coa_bridge_tx.send(EngineCommand::Coa(cmd)).await.is_err() {
                return;
            }
        }
    });

    let coa_sock_path = config.coa_sock_path.clone();
    let coa_read_timeout = config.coa_read_timeout;
    let coa_reply_timeout = config.coa_reply_timeout;
    tokio::spawn(async move {
        if let Err(e) = coa::run(&coa_sock_path, coa_tx, coa_read_timeout, coa_reply_timeout).await {
            error!("bng: CoA bridge exited: {e}");
        }
    });

    info!("bng: {} starting on subscriber={} uplink={}", config.bng_id, config.subscriber_iface, config.uplink_iface);

    engine.run(events_rx, command_rx).await;

    for ticker in tickers {
        ticker.abort();
    }

    info!("bng: session engine exited, shutting down");
    Ok(())
}
