//! Lease service client: fetches the authoritative lease snapshot the
//! reconciler in `spec.md` §4.5 diffs against, from a Kea-style
//! JSON-RPC-over-HTTPS control agent.
//!
//! Grounded on `examples/original_source/bng/lib/dhcp/lease_service.py`'s
//! `KeaClient`/`KeaLeaseService`: a `POST {base_url}/leases` with body
//! `{"command":"lease4-get-all","service":["dhcp4"]}`, basic auth, and a
//! response shape of `[{"arguments":{"leases":[...]}}]`. Relay info lives
//! under `user-context.ISC.relay-agent-info.sub-options` as a hex-encoded
//! Option 82 TLV blob, decoded with the same TLV reader the sniffer uses
//! (`bng_dhcp::option82::RelayAgentInfo::parse`), so leases agree on
//! `SessionKey` with sniffer-observed sessions (`DESIGN.md`: circuit_id,
//! remote_id, and relay_id are all decoded UTF-8-lossy here, unlike the
//! original which hex-encoded `remote_id` only in this one path).

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use bng_dhcp::option82::RelayAgentInfo;

use crate::error::LeaseServiceError;
use crate::model::Lease;

#[derive(Debug, Deserialize)]
struct KeaEnvelope {
    arguments: Option<KeaArguments>,
}

#[derive(Debug, Deserialize)]
struct KeaArguments {
    leases: Option<Vec<KeaLease>>,
}

#[derive(Debug, Deserialize)]
struct KeaLease {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "hw-address")]
    hw_address: String,
    #[serde(default)]
    state: i32,
    cltt: u64,
    #[serde(rename = "valid-lft")]
    valid_lft: u64,
    #[serde(rename = "user-context", default)]
    user_context: Value,
}

/// Kea lease state `0` ("default") is the only state meaning "currently
/// assigned"; declined/reclaimed leases are skipped, per the original.
const KEA_STATE_DEFAULT: i32 = 0;

pub struct LeaseService {
    client: Client,
    base_url: String,
    user: String,
    password: String,
}

impl LeaseService {
    pub fn new(base_url: String, user: String, password: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            user,
            password,
        }
    }

    /// Fetches every currently-assigned lease carrying this BNG's Relay-ID,
    /// per `spec.md` §4.5 step 1.
    pub async fn get_all_leases(&self, relay_id: &str) -> Result<Vec<Lease>, LeaseServiceError> {
        let url = format!("{}/leases", self.base_url);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&serde_json::json!({
                "command": "lease4-get-all",
                "service": ["dhcp4"],
            }))
            .send()
            .await?
            .error_for_status()?;

        let envelopes: Vec<KeaEnvelope> = response.json().await?;
        let raw_leases = envelopes
            .into_iter()
            .next()
            .and_then(|e| e.arguments)
            .and_then(|a| a.leases)
            .unwrap_or_default();

        let mut leases = Vec::new();
        for raw in raw_leases {
            if raw.state != KEA_STATE_DEFAULT {
                continue;
            }
            let Some(sub_options) = extract_sub_options(&raw.user_context) else {
                continue;
            };
            let Some(tlv) = decode_hex(&sub_options) else {
                continue;
            };
            let Ok(info) = RelayAgentInfo::parse(&tlv) else {
                continue;
            };
            let (Some(circuit_id), Some(remote_id), Some(found_relay_id)) = (
                info.circuit_id.map(|b| String::from_utf8_lossy(b).into_owned()),
                info.remote_id.map(|b| String::from_utf8_lossy(b).into_owned()),
                info.relay_id.map(|b| String::from_utf8_lossy(b).into_owned()),
            ) else {
                continue;
            };
            if found_relay_id != relay_id {
                continue;
            }
            let Ok(ip) = raw.ip_address.parse() else { continue };

            leases.push(Lease {
                circuit_id,
                remote_id,
                relay_id: found_relay_id,
                mac: raw.hw_address,
                ip,
                expiry: raw.cltt + raw.valid_lft,
                last_state_update_ts: raw.cltt,
                is_active: true,
            });
        }
        Ok(leases)
    }
}

/// `user-context.ISC.relay-agent-info` is either a JSON object carrying a
/// `sub-options` string, or the sub-options string directly, depending on
/// Kea version.
fn extract_sub_options(user_context: &Value) -> Option<String> {
    let relay_info = user_context.get("ISC")?.get("relay-agent-info")?;
    match relay_info {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => relay_info.get("sub-options")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn decode_hex(hex_str: &str) -> Option<Vec<u8>> {
    let trimmed = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    if trimmed.len() % 2 != 0 {
        return None;
    }
    (0..trimmed.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&trimmed[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hex_strips_0x_prefix() {
        assert_eq!(decode_hex("0x0103313030"), Some(vec![0x01, 0x03, 0x31, 0x30, 0x30]));
        assert_eq!(decode_hex("0103313030"), Some(vec![0x01, 0x03, 0x31, 0x30, 0x30]));
    }

    #[test]
    fn decode_hex_rejects_odd_length() {
        assert_eq!(decode_hex("abc"), None);
    }

    #[test]
    fn extract_sub_options_handles_object_and_string_forms() {
        let obj = serde_json::json!({"ISC": {"relay-agent-info": {"sub-options": "0x0102ffff"}}});
        assert_eq!(extract_sub_options(&obj).as_deref(), Some("0x0102ffff"));

        let direct = serde_json::json!({"ISC": {"relay-agent-info": "0x0102ffff"}});
        assert_eq!(extract_sub_options(&direct).as_deref(), Some("0x0102ffff"));
    }

    #[test]
    fn parses_lease_with_decoded_relay_info() {
        let tlv = bng_dhcp::option82::build(Some(b"1/0/1"), Some(b"R1"), b"bng-a");
        let hex: String = tlv.iter().map(|b| format!("{b:02x}")).collect();
        let user_context = serde_json::json!({"ISC": {"relay-agent-info": {"sub-options": hex}}});
        let sub_options = extract_sub_options(&user_context).unwrap();
        let raw = decode_hex(&sub_options).unwrap();
        let info = RelayAgentInfo::parse(&raw).unwrap();
        assert_eq!(info.circuit_id, Some(&b"1/0/1"[..]));
        assert_eq!(info.remote_id, Some(&b"R1"[..]));
        assert_eq!(info.relay_id, Some(&b"bng-a"[..]));
    }
}
