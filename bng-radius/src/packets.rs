//! Builders for the RADIUS packets the BNG session engine sends, and the
//! vendor-attribute QoS policy parser described in `spec.md` §4.4.
//!
//! Field sets are grounded in
//! `examples/original_source/mininet/lib/radius/packet_builders.py`
//! (`build_access_request`/`build_acct_start`/`build_acct_stop`/
//! `build_acct_interim`), adapted to the `User-Name` convention `spec.md`
//! §4.4 specifies (`"{relay_id}/{remote_id}/{circuit_id}"` rather than the
//! original's `"mac:{mac}"`).

use std::net::Ipv4Addr;

use crate::{
    Packet, ACCT_STATUS_INTERIM_UPDATE, ACCT_STATUS_START, ACCT_STATUS_STOP,
    ATTR_ACCT_INPUT_GIGAWORDS, ATTR_ACCT_INPUT_OCTETS, ATTR_ACCT_INPUT_PACKETS,
    ATTR_ACCT_OUTPUT_GIGAWORDS, ATTR_ACCT_OUTPUT_OCTETS, ATTR_ACCT_OUTPUT_PACKETS,
    ATTR_ACCT_SESSION_ID, ATTR_ACCT_SESSION_TIME, ATTR_ACCT_STATUS_TYPE,
    ATTR_ACCT_TERMINATE_CAUSE, ATTR_CALLING_STATION_ID, ATTR_EVENT_TIMESTAMP,
    ATTR_FRAMED_IP_ADDRESS, ATTR_NAS_IP_ADDRESS, ATTR_NAS_PORT_ID, ATTR_NAS_PORT_TYPE,
    ATTR_USER_NAME, CODE_ACCESS_REQUEST, CODE_ACCOUNTING_REQUEST, NAS_PORT_TYPE_ETHERNET,
};

/// Everything a packet builder needs to know about the subscriber session;
/// deliberately narrow so `bng-radius` does not depend on `bng-core`'s
/// session type.
pub struct AccountingSubject<'a> {
    pub relay_id: &'a str,
    pub remote_id: &'a str,
    pub circuit_id: &'a str,
    pub mac: &'a str,
    pub ip: Ipv4Addr,
    pub acct_session_id: &'a str,
    pub session_time_secs: u32,
}

fn user_name(relay_id: &str, remote_id: &str, circuit_id: &str) -> String {
    format!("{relay_id}/{remote_id}/{circuit_id}")
}

/// Splits a byte counter into the RFC 2869 gigawords/octets pair (the low
/// 32 bits and the overflow count), per `spec.md` §6 and §8 scenario 3.
pub fn split_gigawords(total_bytes: u64) -> (u32, u32) {
    ((total_bytes >> 32) as u32, (total_bytes & 0xffff_ffff) as u32)
}

/// Builds an Access-Request per `spec.md` §4.4 step 1: `User-Name`,
/// `Framed-IP-Address`, `Calling-Station-Id`, `NAS-IP-Address`,
/// `NAS-Port-Id`.
pub fn access_request(
    identifier: u8,
    authenticator: [u8; 16],
    relay_id: &str,
    remote_id: &str,
    circuit_id: &str,
    mac: &str,
    ip: Ipv4Addr,
    nas_ip: Ipv4Addr,
    nas_port_id: &str,
) -> Packet {
    let mut pkt = Packet::new(CODE_ACCESS_REQUEST, identifier, authenticator);
    pkt.push_str(ATTR_USER_NAME, &user_name(relay_id, remote_id, circuit_id))
        .push_str(ATTR_CALLING_STATION_ID, mac)
        .push_ipv4(ATTR_FRAMED_IP_ADDRESS, ip)
        .push_ipv4(ATTR_NAS_IP_ADDRESS, nas_ip)
        .push_str(ATTR_NAS_PORT_ID, nas_port_id)
        .push_u32(ATTR_NAS_PORT_TYPE, NAS_PORT_TYPE_ETHERNET);
    pkt
}

fn accounting_base(
    identifier: u8,
    status: u32,
    subject: &AccountingSubject,
    nas_ip: Ipv4Addr,
    nas_port_id: &str,
    now_epoch: u64,
) -> Packet {
    let mut pkt = Packet::new(CODE_ACCOUNTING_REQUEST, identifier, [0u8; 16]);
    pkt.push_u32(ATTR_ACCT_STATUS_TYPE, status)
        .push_str(
            ATTR_USER_NAME,
            &user_name(subject.relay_id, subject.remote_id, subject.circuit_id),
        )
        .push_str(ATTR_ACCT_SESSION_ID, subject.acct_session_id)
        .push_ipv4(ATTR_FRAMED_IP_ADDRESS, subject.ip)
        .push_str(ATTR_CALLING_STATION_ID, subject.mac)
        .push_ipv4(ATTR_NAS_IP_ADDRESS, nas_ip)
        .push_str(ATTR_NAS_PORT_ID, nas_port_id)
        .push_u32(ATTR_NAS_PORT_TYPE, NAS_PORT_TYPE_ETHERNET)
        .push_u32(ATTR_EVENT_TIMESTAMP, now_epoch as u32);
    pkt
}

/// Builds an Accounting-Request with `Acct-Status-Type = Start`.
pub fn acct_start(
    identifier: u8,
    subject: &AccountingSubject,
    nas_ip: Ipv4Addr,
    nas_port_id: &str,
    now_epoch: u64,
) -> Packet {
    accounting_base(identifier, ACCT_STATUS_START, subject, nas_ip, nas_port_id, now_epoch)
}

/// Byte/packet deltas to report on an Interim-Update or a Stop, named per
/// RFC 2866 (input = traffic from the NAS's perspective, i.e. from the
/// subscriber = this BNG's upload/"up" counter, resolved per `spec.md` §9).
pub struct Counters {
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub input_packets: u64,
    pub output_packets: u64,
}

fn push_counters(pkt: &mut Packet, counters: &Counters) {
    let (in_gw, in_oct) = split_gigawords(counters.input_bytes);
    let (out_gw, out_oct) = split_gigawords(counters.output_bytes);

    pkt.push_u32(ATTR_ACCT_INPUT_OCTETS, in_oct)
        .push_u32(ATTR_ACCT_INPUT_GIGAWORDS, in_gw)
        .push_u32(ATTR_ACCT_OUTPUT_OCTETS, out_oct)
        .push_u32(ATTR_ACCT_OUTPUT_GIGAWORDS, out_gw)
        .push_u32(ATTR_ACCT_INPUT_PACKETS, counters.input_packets.min(u32::MAX as u64) as u32)
        .push_u32(ATTR_ACCT_OUTPUT_PACKETS, counters.output_packets.min(u32::MAX as u64) as u32);
}

/// Builds an Accounting-Request with `Acct-Status-Type = Interim-Update`.
#[allow(clippy::too_many_arguments)]
pub fn acct_interim(
    identifier: u8,
    subject: &AccountingSubject,
    nas_ip: Ipv4Addr,
    nas_port_id: &str,
    now_epoch: u64,
    counters: &Counters,
) -> Packet {
    let mut pkt = accounting_base(
        identifier,
        ACCT_STATUS_INTERIM_UPDATE,
        subject,
        nas_ip,
        nas_port_id,
        now_epoch,
    );
    pkt.push_u32(ATTR_ACCT_SESSION_TIME, subject.session_time_secs);
    push_counters(&mut pkt, counters);
    pkt
}

/// Builds an Accounting-Request with `Acct-Status-Type = Stop`, carrying
/// the terminate cause (`User-Request`, `IP-change`, `Idle-Timeout`,
/// `Admin-Reset`, `Reconcile-Timeout`, `Nak-Threshold`, ...).
#[allow(clippy::too_many_arguments)]
pub fn acct_stop(
    identifier: u8,
    subject: &AccountingSubject,
    nas_ip: Ipv4Addr,
    nas_port_id: &str,
    now_epoch: u64,
    counters: &Counters,
    cause: &str,
) -> Packet {
    let mut pkt = accounting_base(identifier, ACCT_STATUS_STOP, subject, nas_ip, nas_port_id, now_epoch);
    pkt.push_u32(ATTR_ACCT_SESSION_TIME, subject.session_time_secs)
        .push_str(ATTR_ACCT_TERMINATE_CAUSE, cause);
    push_counters(&mut pkt, counters);
    pkt
}

/// A QoS policy parsed out of an Access-Accept reply, per `spec.md` §4.4
/// step 3. Matches both the numeric vendor-specific-attribute encoding
/// (`Attr-26.43242.{1..4}`) and the text-named encoding
/// (`OSS-Download-Speed` et al.), per `SPEC_FULL.md` §C. A reply only
/// counts as carrying a policy when *both* speeds are present; burst
/// values are optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosPolicy {
    pub download_kbit: u32,
    pub upload_kbit: u32,
    pub download_burst_kbit: Option<u32>,
    pub upload_burst_kbit: Option<u32>,
}

/// The vendor-specific attribute's vendor ID and sub-attribute indices
/// this BNG's RADIUS dictionary assigns to upload/download speed/burst.
pub const OSS_VENDOR_ID: u32 = 43242;
pub const OSS_ATTR_DOWNLOAD_SPEED: u8 = 1;
pub const OSS_ATTR_UPLOAD_SPEED: u8 = 2;
pub const OSS_ATTR_DOWNLOAD_BURST: u8 = 3;
pub const OSS_ATTR_UPLOAD_BURST: u8 = 4;

fn parse_radius_int(token: &str) -> Option<u32> {
    let t = token.trim().trim_matches('"');
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        t.parse().ok()
    }
}

/// Parses a decoded vendor-specific attribute's payload: 4 bytes of vendor
/// ID followed by a stream of `(sub-type, sub-len, sub-value)` TLVs, the
/// wire shape of RFC 2865 §5.26.
fn parse_vsa(data: &[u8]) -> Option<(u32, Vec<(u8, &[u8])>)> {
    if data.len() < 4 {
        return None;
    }
    let vendor_id = u32::from_be_bytes(data[..4].try_into().ok()?);
    let mut subs = Vec::new();
    let mut offset = 4;
    while offset + 2 <= data.len() {
        let sub_type = data[offset];
        let sub_len = data[offset + 1] as usize;
        if sub_len < 2 || offset + sub_len > data.len() {
            break;
        }
        subs.push((sub_type, &data[offset + 2..offset + sub_len]));
        offset += sub_len;
    }
    Some((vendor_id, subs))
}

/// Extracts a QoS policy from an Access-Accept's attributes, trying the
/// numeric VSA form first and the named-attribute form second (this BNG's
/// RADIUS dictionary maps `OSS-Download-Speed` etc. onto the same VSA, so
/// in practice a server sends one or the other, never both).
pub fn parse_qos_policy(reply: &Packet) -> Option<QosPolicy> {
    let mut download_kbit = None;
    let mut upload_kbit = None;
    let mut download_burst_kbit = None;
    let mut upload_burst_kbit = None;

    for (code, value) in &reply.attributes {
        if *code != crate::ATTR_VENDOR_SPECIFIC {
            continue;
        }
        let Some((vendor_id, subs)) = parse_vsa(value) else {
            continue;
        };
        if vendor_id != OSS_VENDOR_ID {
            continue;
        }
        for (sub_type, sub_value) in subs {
            let text = std::str::from_utf8(sub_value).ok();
            let value = text.and_then(parse_radius_int).or_else(|| {
                (sub_value.len() == 4).then(|| u32::from_be_bytes(sub_value.try_into().unwrap()))
            });
            let Some(value) = value else { continue };
            match sub_type {
                OSS_ATTR_DOWNLOAD_SPEED => download_kbit = Some(value),
                OSS_ATTR_UPLOAD_SPEED => upload_kbit = Some(value),
                OSS_ATTR_DOWNLOAD_BURST => download_burst_kbit = Some(value),
                OSS_ATTR_UPLOAD_BURST => upload_burst_kbit = Some(value),
                _ => {}
            }
        }
    }

    // Named-attribute form travels as plain text attributes keyed by the
    // dictionary name; since this codec has no dictionary, a server using
    // this form is expected to carry it as a Reply-Message-style string
    // attribute that embeds "OSS-Download-Speed = <value>" per line, the
    // same shape `parse_radius_reply_result` in the original consumed.
    if download_kbit.is_none() || upload_kbit.is_none() {
        for (_, value) in &reply.attributes {
            let Ok(text) = std::str::from_utf8(value) else {
                continue;
            };
            for line in text.lines() {
                let Some((name, val)) = line.split_once(['=', ':']) else {
                    continue;
                };
                let name = name.trim();
                let Some(value) = parse_radius_int(val) else {
                    continue;
                };
                match name {
                    "OSS-Download-Speed" => download_kbit.get_or_insert(value),
                    "OSS-Upload-Speed" => upload_kbit.get_or_insert(value),
                    "OSS-Download-Burst" => download_burst_kbit.get_or_insert(value),
                    "OSS-Upload-Burst" => upload_burst_kbit.get_or_insert(value),
                    _ => continue,
                };
            }
        }
    }

    match (download_kbit, upload_kbit) {
        (Some(download_kbit), Some(upload_kbit)) => Some(QosPolicy {
            download_kbit,
            upload_kbit,
            download_burst_kbit,
            upload_burst_kbit,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::CODE_ACCESS_ACCEPT;

    fn subject() -> AccountingSubject<'static> {
        AccountingSubject {
            relay_id: "BNG-A",
            remote_id: "R1",
            circuit_id: "1/0/1",
            mac: "00:11:22:33:44:55",
            ip: Ipv4Addr::new(10, 0, 0, 50),
            acct_session_id: "00:11:22:33:44:55-10.0.0.50-100",
            session_time_secs: 60,
        }
    }

    #[test]
    fn access_request_carries_composite_username() {
        let pkt = access_request(
            1,
            [0; 16],
            "BNG-A",
            "R1",
            "1/0/1",
            "00:11:22:33:44:55",
            Ipv4Addr::new(10, 0, 0, 50),
            Ipv4Addr::new(10, 0, 0, 1),
            "eth1",
        );
        assert_eq!(pkt.attr(ATTR_USER_NAME).unwrap(), b"BNG-A/R1/1/0/1");
    }

    #[test]
    fn acct_stop_splits_gigawords() {
        let counters = Counters {
            input_bytes: 5_000_000_000,
            output_bytes: 10_000_000_000,
            input_packets: 4_000_000,
            output_packets: 8_000_000,
        };
        let pkt = acct_stop(2, &subject(), Ipv4Addr::new(10, 0, 0, 1), "eth1", 1000, &counters, "IP-change");

        assert_eq!(pkt.attr_u32(ATTR_ACCT_INPUT_OCTETS), Some(705_032_704));
        assert_eq!(pkt.attr_u32(ATTR_ACCT_INPUT_GIGAWORDS), Some(1));
        assert_eq!(pkt.attr_u32(ATTR_ACCT_OUTPUT_OCTETS), Some(1_410_065_408));
        assert_eq!(pkt.attr_u32(ATTR_ACCT_OUTPUT_GIGAWORDS), Some(2));
        assert_eq!(pkt.attr(ATTR_ACCT_TERMINATE_CAUSE).unwrap(), b"IP-change");
    }

    #[test]
    fn parses_numeric_vsa_qos() {
        let mut vsa = OSS_VENDOR_ID.to_be_bytes().to_vec();
        vsa.extend([OSS_ATTR_DOWNLOAD_SPEED, 6, 0, 0, 0x01, 0x86]);
        vsa.extend([OSS_ATTR_UPLOAD_SPEED, 6, 0, 0, 0x00, 0x0a]);

        let mut pkt = Packet::new(CODE_ACCESS_ACCEPT, 1, [0; 16]);
        pkt.push_bytes(crate::ATTR_VENDOR_SPECIFIC, &vsa);

        let qos = parse_qos_policy(&pkt).unwrap();
        assert_eq!(qos.download_kbit, 0x0186);
        assert_eq!(qos.upload_kbit, 0x0a);
        assert_eq!(qos.download_burst_kbit, None);
    }

    #[test]
    fn parses_named_qos_with_hex_and_decimal() {
        let mut pkt = Packet::new(CODE_ACCESS_ACCEPT, 1, [0; 16]);
        pkt.push_str(
            26,
            "OSS-Download-Speed = 0x000186a0\nOSS-Upload-Speed = 30000\nOSS-Download-Burst := 500",
        );

        let qos = parse_qos_policy(&pkt).unwrap();
        assert_eq!(qos.download_kbit, 100_000);
        assert_eq!(qos.upload_kbit, 30_000);
        assert_eq!(qos.download_burst_kbit, Some(500));
        assert_eq!(qos.upload_burst_kbit, None);
    }

    #[test]
    fn no_policy_when_only_one_speed_present() {
        let mut pkt = Packet::new(CODE_ACCESS_ACCEPT, 1, [0; 16]);
        pkt.push_str(26, "OSS-Download-Speed = 100000");
        assert!(parse_qos_policy(&pkt).is_none());
    }
}
