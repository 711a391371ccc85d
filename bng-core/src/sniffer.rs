//! The DHCP relay sniffer: observes relayed DHCPv4 on the subscriber- and
//! uplink-facing interfaces, normalizes Option 82, forwards between the
//! access relay and the upstream DHCP server, and emits a decoded
//! [`DhcpEvent`] per observed message, per `spec.md` §4.1.
//!
//! Grounded on `examples/original_source/bng/bng_dhcp_sniffer.py`'s
//! `relay_loop`: three receive paths (client-facing raw capture,
//! uplink-facing raw capture, and a UDP socket bound to the uplink's port
//! 67 for replies unicast directly to this BNG) and two send paths
//! (toward the server out the uplink, toward the access router/broadcast
//! out the subscriber interface). The original used `AF_PACKET` raw
//! sockets and `SO_BINDTODEVICE`; this rewrite uses `pnet`'s datalink
//! channel for capture (the closest-fit dependency in the retrieved
//! corpus, `other_examples/manifests/bluecatengineering-dora`) and
//! `socket2`-configured UDP sockets (same corpus entry) for the
//! device-bound send/reply sockets, since `tokio::net::UdpSocket` has no
//! `SO_BINDTODEVICE` of its own.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use pnet::datalink::{self, Channel, NetworkInterface};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use bng_dhcp::{relay, MessageType, Packet};

use crate::dhcp_event::{DhcpEvent, EventSeq, QueuedEvent};
use crate::model::EpochAnchor;

const ETHERTYPE_IPV4: [u8; 2] = [0x08, 0x00];
const ETH_HDR_LEN: usize = 14;
const DHCP_CLIENT_PORT: u16 = 68;
const DHCP_SERVER_PORT: u16 = 67;

/// Static configuration the sniffer task needs; cloned from [`crate::config::Config`]
/// at startup so the sniffer does not borrow the whole process config.
#[derive(Debug, Clone)]
pub struct SnifferConfig {
    pub bng_id: String,
    pub subscriber_iface: String,
    pub uplink_iface: String,
    pub subscriber_ip: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
}

fn find_interface(name: &str) -> Option<NetworkInterface> {
    datalink::interfaces().into_iter().find(|i| i.name == name)
}

/// Captures raw Ethernet frames off `iface` on a dedicated OS thread
/// (`pnet`'s datalink receiver is a blocking iterator) and forwards them
/// to the async side over a bounded channel.
fn spawn_capture_thread(iface: NetworkInterface, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let channel = match datalink::channel(&iface, Default::default()) {
            Ok(Channel::Ethernet(_, rx)) => rx,
            Ok(_) => {
                error!("sniffer: unsupported channel type on {}", iface.name);
                return;
            }
            Err(e) => {
                error!("sniffer: failed to open channel on {}: {e}", iface.name);
                return;
            }
        };
        let mut rx = channel;
        loop {
            match rx.next() {
                Ok(frame) => {
                    if tx.blocking_send(frame.to_vec()).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("sniffer: capture error on {}: {e}", iface.name),
            }
        }
    });
}

fn bound_udp_socket(iface: &str, port: u16, broadcast: bool) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind_device(Some(iface.as_bytes()))?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn port_pair_accepted(src_port: u16, dst_port: u16) -> bool {
    matches!(
        (src_port, dst_port),
        (DHCP_CLIENT_PORT, DHCP_SERVER_PORT) | (DHCP_SERVER_PORT, DHCP_CLIENT_PORT) | (DHCP_SERVER_PORT, DHCP_SERVER_PORT)
    )
}

fn mac_colon_lower(mac: [u8; 6]) -> String {
    mac.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

fn opt82_str(raw: Option<&[u8]>) -> Option<String> {
    raw.map(|b| String::from_utf8_lossy(b).into_owned())
}

fn to_event(packet: &Packet, src: SocketAddrV4, dst: SocketAddrV4, anchor: EpochAnchor, now: Instant) -> Option<DhcpEvent> {
    let msg_type = packet.message_type()?;
    let info = packet.relay_agent_info().unwrap_or_default();

    let ip = if packet.yiaddr != Ipv4Addr::UNSPECIFIED {
        Some(packet.yiaddr)
    } else if packet.ciaddr != Ipv4Addr::UNSPECIFIED {
        Some(packet.ciaddr)
    } else {
        None
    };

    let lease_time_secs = packet.lease_time_secs();
    let expiry = (msg_type == MessageType::Ack)
        .then_some(lease_time_secs)
        .flatten()
        .map(|secs| anchor.epoch_secs(now) + secs as u64);

    Some(DhcpEvent {
        msg_type,
        xid: packet.xid,
        circuit_id: opt82_str(info.circuit_id),
        remote_id: opt82_str(info.remote_id),
        relay_id: opt82_str(info.relay_id),
        mac: mac_colon_lower(packet.mac()),
        ip,
        requested_ip: packet.requested_ip(),
        lease_time_secs,
        expiry,
        giaddr: packet.giaddr,
        src_port: src.port(),
        dst_port: dst.port(),
        received_at: now,
    })
}

/// Decodes and forwards one client-facing raw Ethernet frame. Returns the
/// decoded event, if any, regardless of whether forwarding happened (the
/// event stream records every observed message; option-82 completeness
/// only gates relaying, per `spec.md` §4.1).
async fn handle_client_frame(
    frame: &[u8],
    cfg: &SnifferConfig,
    uplink_send: &UdpSocket,
    anchor: EpochAnchor,
) -> Option<DhcpEvent> {
    if frame.len() < ETH_HDR_LEN || frame[12..14] != ETHERTYPE_IPV4 {
        return None;
    }
    let (src, dst, packet) = match Packet::decode_raw(&frame[ETH_HDR_LEN..], None, None) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return None,
        Err(e) => {
            debug!("sniffer: drop client frame: {e}");
            return None;
        }
    };
    if !port_pair_accepted(src.port(), dst.port()) {
        return None;
    }
    if *src.ip() == cfg.dhcp_server {
        // Loop guard: a server response routed back out the subscriber
        // interface must never be re-relayed as if it were a client request.
        return None;
    }

    let now = Instant::now();
    let event = to_event(&packet, src, dst, anchor, now);

    let mut buf = [0u8; 576];
    match relay::rewrite_client_to_server(&packet, cfg.bng_id.as_bytes(), cfg.subscriber_ip, &mut buf) {
        Ok(Some(rewritten)) => {
            if let Err(e) = uplink_send.send_to(rewritten, (cfg.dhcp_server, DHCP_SERVER_PORT)).await {
                warn!("sniffer: failed to forward to server: {e}");
            }
        }
        Ok(None) => debug!("sniffer: drop client frame missing option 82"),
        Err(e) => warn!("sniffer: failed to rewrite client frame: {e}"),
    }

    event
}

async fn forward_downstream(packet: &Packet<'_>, downstream_send: &UdpSocket) {
    let mut buf = [0u8; 576];
    match packet.encode(&mut buf) {
        Ok(encoded) => {
            let dest = relay::reply_destination(packet);
            if let Err(e) = downstream_send.send_to(encoded, dest).await {
                warn!("sniffer: failed to forward downstream to {dest}: {e}");
            }
        }
        Err(e) => warn!("sniffer: failed to re-encode reply: {e}"),
    }
}

async fn handle_uplink_frame(frame: &[u8], downstream_send: &UdpSocket, anchor: EpochAnchor) -> Option<DhcpEvent> {
    if frame.len() < ETH_HDR_LEN || frame[12..14] != ETHERTYPE_IPV4 {
        return None;
    }
    let (src, dst, packet) = match Packet::decode_raw(&frame[ETH_HDR_LEN..], None, None) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return None,
        Err(e) => {
            debug!("sniffer: drop uplink frame: {e}");
            return None;
        }
    };
    if src.port() != DHCP_SERVER_PORT {
        return None;
    }

    let event = to_event(&packet, src, dst, anchor, Instant::now());
    forward_downstream(&packet, downstream_send).await;
    event
}

async fn handle_reply_datagram(data: &[u8], downstream_send: &UdpSocket, anchor: EpochAnchor) -> Option<DhcpEvent> {
    let packet = match Packet::decode(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("sniffer: drop reply datagram: {e}");
            return None;
        }
    };
    let src = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
    let dst = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
    let event = to_event(&packet, src, dst, anchor, Instant::now());
    forward_downstream(&packet, downstream_send).await;
    event
}

async fn push(tx: &mpsc::Sender<QueuedEvent>, seq: &mut u64, event: Option<DhcpEvent>) {
    let Some(event) = event else { return };
    *seq += 1;
    // Bounded channel send backpressures the whole sniffer loop rather
    // than dropping; per `spec.md` §4.2 "old events are not dropped
    // silently".
    if tx.send(QueuedEvent { seq: EventSeq(*seq), event }).await.is_err() {
        warn!("sniffer: event queue receiver gone, dropping further events");
    }
}

async fn run_once(cfg: &SnifferConfig, events_tx: &mpsc::Sender<QueuedEvent>) -> Result<(), crate::error::SnifferError> {
    let subscriber_if = find_interface(&cfg.subscriber_iface).ok_or_else(|| crate::error::SnifferError::InterfaceNotFound {
        iface: cfg.subscriber_iface.clone(),
    })?;
    let uplink_if = find_interface(&cfg.uplink_iface).ok_or_else(|| crate::error::SnifferError::InterfaceNotFound {
        iface: cfg.uplink_iface.clone(),
    })?;

    let (client_tx, mut client_rx) = mpsc::channel::<Vec<u8>>(256);
    let (uplink_tx, mut uplink_rx) = mpsc::channel::<Vec<u8>>(256);
    spawn_capture_thread(subscriber_if, client_tx);
    spawn_capture_thread(uplink_if, uplink_tx);

    let uplink_send = bound_udp_socket(&cfg.uplink_iface, 0, false)?;
    let downstream_send = bound_udp_socket(&cfg.subscriber_iface, DHCP_SERVER_PORT, true)?;
    let reply_sock = bound_udp_socket(&cfg.uplink_iface, DHCP_SERVER_PORT, false)?;

    let anchor = EpochAnchor::now();
    let mut seq = 0u64;
    let mut reply_buf = [0u8; 2048];

    loop {
        tokio::select! {
            frame = client_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                let event = handle_client_frame(&frame, cfg, &uplink_send, anchor).await;
                push(events_tx, &mut seq, event).await;
            }
            frame = uplink_rx.recv() => {
                let Some(frame) = frame else { return Ok(()) };
                let event = handle_uplink_frame(&frame, &downstream_send, anchor).await;
                push(events_tx, &mut seq, event).await;
            }
            result = reply_sock.recv_from(&mut reply_buf) => {
                match result {
                    Ok((n, _)) => {
                        let event = handle_reply_datagram(&reply_buf[..n], &downstream_send, anchor).await;
                        push(events_tx, &mut seq, event).await;
                    }
                    Err(e) => warn!("sniffer: reply socket error: {e}"),
                }
            }
        }
    }
}

/// Runs the sniffer forever, restarting after a short delay on any
/// process-level exit (socket setup failure, capture thread death), per
/// `spec.md` §4.1's "on process-level sniffer exit, restarted after a
/// short delay".
pub async fn run(cfg: SnifferConfig, events_tx: mpsc::Sender<QueuedEvent>) {
    loop {
        if let Err(e) = run_once(&cfg, &events_tx).await {
            error!("sniffer: exited with error, restarting in 2s: {e}");
            tokio::time::sleep(Duration::from_secs(2)).await;
            continue;
        }
        warn!("sniffer: event queue closed, restarting in 2s");
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}
