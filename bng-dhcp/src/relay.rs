//! Client<->server Option 82 rewrite and relay-direction addressing, per
//! the BNG's subscriber-facing relay role (RFC 3046 §2.1).

use std::net::{Ipv4Addr, SocketAddrV4};

use super::option82;
use super::{DhcpOption, Error, Options, Packet};

/// Rewrites a client-originated packet for forwarding toward the DHCP
/// server: preserves the access relay's Circuit-ID/Remote-ID, overwrites
/// Relay-ID with this BNG's identifier, and sets `giaddr` to the
/// subscriber-facing interface address when the access relay left it zero
/// (this BNG is then the gateway of record; an upstream relay's non-zero
/// `giaddr` is left untouched).
///
/// Returns `Ok(None)` when the packet lacks both Circuit-ID and Remote-ID
/// (no access-relay context to rewrite) per spec: such packets are dropped.
pub fn rewrite_client_to_server<'o>(
    packet: &Packet<'_>,
    relay_id: &[u8],
    subscriber_iface_ip: Ipv4Addr,
    buf: &'o mut [u8],
) -> Result<Option<&'o [u8]>, Error> {
    let info = packet.relay_agent_info().unwrap_or_default();

    if info.circuit_id.is_none() && info.remote_id.is_none() {
        return Ok(None);
    }

    let opt82 = option82::build(info.circuit_id, info.remote_id, relay_id);

    let mut options: Vec<DhcpOption> = packet
        .options
        .iter()
        .filter(|o| o.code() != option82::CODE)
        .collect();
    options.push(DhcpOption::Unrecognized(option82::CODE, &opt82));

    let rewritten = Packet {
        reply: packet.reply,
        hops: packet.hops,
        xid: packet.xid,
        secs: packet.secs,
        broadcast: packet.broadcast,
        ciaddr: packet.ciaddr,
        yiaddr: packet.yiaddr,
        siaddr: packet.siaddr,
        giaddr: if packet.giaddr == Ipv4Addr::UNSPECIFIED {
            subscriber_iface_ip
        } else {
            packet.giaddr
        },
        chaddr: packet.chaddr,
        options: Options::new(&options),
    };

    Ok(Some(rewritten.encode(buf)?))
}

/// Where a server reply should be sent on the subscriber side: unicast to
/// the relay that set `giaddr`, or broadcast when the client dealt with the
/// server directly through this BNG (`giaddr` unset).
pub fn reply_destination(packet: &Packet<'_>) -> SocketAddrV4 {
    if packet.giaddr != Ipv4Addr::UNSPECIFIED {
        SocketAddrV4::new(packet.giaddr, 67)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MessageType;

    fn packet_with_opt82<'a>(
        opts_buf: &'a mut Vec<DhcpOption<'a>>,
        opt82_data: &'a [u8],
        giaddr: Ipv4Addr,
    ) -> Packet<'a> {
        opts_buf.push(DhcpOption::MessageType(MessageType::Request));
        opts_buf.push(DhcpOption::Unrecognized(option82::CODE, opt82_data));

        Packet {
            reply: false,
            hops: 0,
            xid: 1,
            secs: 0,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr,
            chaddr: [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            options: Options::new(opts_buf.as_slice()),
        }
    }

    #[test]
    fn preserves_existing_circuit_and_remote_id_and_sets_giaddr() {
        let opt82 = option82::build(Some(b"1/0/1"), Some(b"R1"), b"");
        let mut opts = Vec::new();
        let packet = packet_with_opt82(&mut opts, &opt82, Ipv4Addr::UNSPECIFIED);

        let mut buf = [0u8; 576];
        let encoded =
            rewrite_client_to_server(&packet, b"BNG-A", Ipv4Addr::new(10, 0, 0, 1), &mut buf)
                .unwrap()
                .unwrap();

        let rewritten = Packet::decode(encoded).unwrap();
        assert_eq!(rewritten.giaddr, Ipv4Addr::new(10, 0, 0, 1));

        let info = rewritten.relay_agent_info().unwrap();
        assert_eq!(info.circuit_id, Some(&b"1/0/1"[..]));
        assert_eq!(info.remote_id, Some(&b"R1"[..]));
        assert_eq!(info.relay_id, Some(&b"BNG-A"[..]));
    }

    #[test]
    fn preserves_upstream_relay_giaddr() {
        let opt82 = option82::build(Some(b"1/0/1"), Some(b"R1"), b"");
        let mut opts = Vec::new();
        let packet = packet_with_opt82(&mut opts, &opt82, Ipv4Addr::new(192, 168, 1, 1));

        let mut buf = [0u8; 576];
        let encoded =
            rewrite_client_to_server(&packet, b"BNG-A", Ipv4Addr::new(10, 0, 0, 1), &mut buf)
                .unwrap()
                .unwrap();

        let rewritten = Packet::decode(encoded).unwrap();
        assert_eq!(rewritten.giaddr, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn drops_when_no_circuit_or_remote_id() {
        let mut opts = Vec::new();
        opts.push(DhcpOption::MessageType(MessageType::Request));
        let packet = Packet {
            reply: false,
            hops: 0,
            xid: 1,
            secs: 0,
            broadcast: false,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: [0; 16],
            options: Options::new(&opts),
        };

        let mut buf = [0u8; 576];
        let result =
            rewrite_client_to_server(&packet, b"BNG-A", Ipv4Addr::new(10, 0, 0, 1), &mut buf)
                .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn reply_destination_unicasts_to_giaddr() {
        let mut opts = Vec::new();
        let packet = packet_with_opt82(&mut opts, &[], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(
            reply_destination(&packet),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 1), 67)
        );
    }

    #[test]
    fn reply_destination_broadcasts_when_giaddr_unset() {
        let mut opts = Vec::new();
        let packet = packet_with_opt82(&mut opts, &[], Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply_destination(&packet),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
        );
    }
}
