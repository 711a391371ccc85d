//! The decoded record the sniffer emits per observed DHCP message, and the
//! priority-queue envelope the session engine reads it through, per
//! `spec.md` §4.1/§4.2.

use std::net::Ipv4Addr;
use std::time::Instant;

use bng_dhcp::MessageType;

/// One decoded DHCPv4 message, carrying everything the session engine
/// needs to drive the state machine in `spec.md` §4.3. Fields are already
/// normalized (Option 82 sub-options decoded to owned strings) since the
/// sniffer's borrow of the wire buffer does not outlive a single capture.
#[derive(Debug, Clone)]
pub struct DhcpEvent {
    pub msg_type: MessageType,
    pub xid: u32,
    pub circuit_id: Option<String>,
    pub remote_id: Option<String>,
    pub relay_id: Option<String>,
    pub mac: String,
    pub ip: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
    pub lease_time_secs: Option<u32>,
    /// Absolute epoch-second lease expiry, computed by the sniffer as
    /// `now + lease_time_secs` for ACKs, per `spec.md` §4.1.
    pub expiry: Option<u64>,
    pub giaddr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub received_at: Instant,
}

/// Only priority band 1 (DHCP events) currently feeds the queue (`spec.md`
/// §4.2); periodic commands arrive on a separate channel entirely (§5), so
/// this is a single bounded `mpsc` channel rather than a multi-band
/// structure — the sequence number is kept for traceability in logs even
/// though channel order already preserves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventSeq(pub u64);

#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub seq: EventSeq,
    pub event: DhcpEvent,
}
