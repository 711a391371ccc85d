//! RFC 3046 Relay Agent Information (Option 82) sub-option parsing and
//! construction: Circuit-ID (1), Remote-ID (2), Relay-ID (12).

use super::Error;

pub const CODE: u8 = 82;

pub const SUB_CIRCUIT_ID: u8 = 1;
pub const SUB_REMOTE_ID: u8 = 2;
pub const SUB_RELAY_ID: u8 = 12;

/// The maximum encoded length of a DHCP option's data, per the single
/// length byte in the TLV encoding.
const MAX_OPTION_LEN: usize = 255;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RelayAgentInfo<'a> {
    pub circuit_id: Option<&'a [u8]>,
    pub remote_id: Option<&'a [u8]>,
    pub relay_id: Option<&'a [u8]>,
}

impl<'a> RelayAgentInfo<'a> {
    /// Parses the sub-option TLV stream carried as the data of a code-82
    /// option. Unknown sub-option codes are skipped.
    pub fn parse(data: &'a [u8]) -> Result<Self, Error> {
        let mut info = Self::default();

        let mut offset = 0;
        while offset + 2 <= data.len() {
            let sub_code = data[offset];
            let sub_len = data[offset + 1] as usize;
            let start = offset + 2;
            let end = start + sub_len;

            if end > data.len() {
                return Err(Error::DataUnderflow);
            }

            let sub_data = &data[start..end];
            match sub_code {
                SUB_CIRCUIT_ID => info.circuit_id = Some(sub_data),
                SUB_REMOTE_ID => info.remote_id = Some(sub_data),
                SUB_RELAY_ID => info.relay_id = Some(sub_data),
                _ => {}
            }

            offset = end;
        }

        Ok(info)
    }
}

/// Builds a new Option 82 payload (the TLV stream that becomes the data of
/// the code-82 option), preserving `circuit_id`/`remote_id` verbatim from
/// the access relay and writing this BNG's `relay_id`.
///
/// The result is truncated to fit the 255-byte DHCP option length limit,
/// dropping whichever trailing sub-options do not fit; Relay-ID is written
/// last and is the first to be dropped under pressure, since Circuit-ID and
/// Remote-ID are the access relay's own context and must be preserved.
pub fn build(circuit_id: Option<&[u8]>, remote_id: Option<&[u8]>, relay_id: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();

    let mut push_sub = |out: &mut Vec<u8>, code: u8, data: &[u8]| {
        let budget = MAX_OPTION_LEN.saturating_sub(out.len() + 2);
        let data = &data[..data.len().min(budget)];

        if budget > 0 {
            out.push(code);
            out.push(data.len() as u8);
            out.extend_from_slice(data);
        }
    };

    if let Some(c) = circuit_id {
        push_sub(&mut out, SUB_CIRCUIT_ID, c);
    }
    if let Some(r) = remote_id {
        push_sub(&mut out, SUB_REMOTE_ID, r);
    }
    push_sub(&mut out, SUB_RELAY_ID, relay_id);

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_all_three_suboptions() {
        let mut data = Vec::new();
        data.extend_from_slice(&[SUB_CIRCUIT_ID, 3, b'1', b'/', b'0']);
        data.extend_from_slice(&[SUB_REMOTE_ID, 2, b'R', b'1']);
        data.extend_from_slice(&[SUB_RELAY_ID, 5, b'B', b'N', b'G', b'-', b'A']);

        let info = RelayAgentInfo::parse(&data).unwrap();
        assert_eq!(info.circuit_id, Some(&b"1/0"[..]));
        assert_eq!(info.remote_id, Some(&b"R1"[..]));
        assert_eq!(info.relay_id, Some(&b"BNG-A"[..]));
    }

    #[test]
    fn build_preserves_circuit_and_remote_overwrites_relay() {
        let built = build(Some(b"1/0/1"), Some(b"R1"), b"BNG-A");
        let info = RelayAgentInfo::parse(&built).unwrap();
        assert_eq!(info.circuit_id, Some(&b"1/0/1"[..]));
        assert_eq!(info.remote_id, Some(&b"R1"[..]));
        assert_eq!(info.relay_id, Some(&b"BNG-A"[..]));
    }

    #[test]
    fn build_truncates_at_255_bytes() {
        let big = vec![b'x'; 300];
        let built = build(Some(&big), None, b"BNG-A");
        assert!(built.len() <= MAX_OPTION_LEN);
    }
}
