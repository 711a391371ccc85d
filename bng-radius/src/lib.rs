//! RADIUS (RFC 2865/2866/5176) packet codec and an async UDP client, built
//! in the same cursor-based wire-codec style as `bng-dhcp`'s BOOTP codec.
//! No production RADIUS crate is available in the reference corpus, so
//! this is hand-rolled; the Authenticator hash uses the `md-5` crate.

use std::net::Ipv4Addr;

pub mod client;
pub mod packets;

pub use client::RadiusClient;

pub const AUTH_PORT: u16 = 1812;
pub const ACCT_PORT: u16 = 1813;
pub const COA_PORT: u16 = 3799;

pub const CODE_ACCESS_REQUEST: u8 = 1;
pub const CODE_ACCESS_ACCEPT: u8 = 2;
pub const CODE_ACCESS_REJECT: u8 = 3;
pub const CODE_ACCOUNTING_REQUEST: u8 = 4;
pub const CODE_ACCOUNTING_RESPONSE: u8 = 5;
pub const CODE_DISCONNECT_REQUEST: u8 = 40;
pub const CODE_DISCONNECT_ACK: u8 = 41;
pub const CODE_DISCONNECT_NAK: u8 = 42;
pub const CODE_COA_REQUEST: u8 = 43;
pub const CODE_COA_ACK: u8 = 44;
pub const CODE_COA_NAK: u8 = 45;

pub const ATTR_USER_NAME: u8 = 1;
pub const ATTR_NAS_IP_ADDRESS: u8 = 4;
pub const ATTR_FRAMED_IP_ADDRESS: u8 = 8;
pub const ATTR_CALLING_STATION_ID: u8 = 31;
pub const ATTR_ACCT_STATUS_TYPE: u8 = 40;
pub const ATTR_ACCT_DELAY_TIME: u8 = 41;
pub const ATTR_ACCT_INPUT_OCTETS: u8 = 42;
pub const ATTR_ACCT_OUTPUT_OCTETS: u8 = 43;
pub const ATTR_ACCT_SESSION_ID: u8 = 44;
pub const ATTR_ACCT_AUTHENTIC: u8 = 45;
pub const ATTR_ACCT_SESSION_TIME: u8 = 46;
pub const ATTR_ACCT_INPUT_PACKETS: u8 = 47;
pub const ATTR_ACCT_OUTPUT_PACKETS: u8 = 48;
pub const ATTR_ACCT_TERMINATE_CAUSE: u8 = 49;
pub const ATTR_EVENT_TIMESTAMP: u8 = 55;
pub const ATTR_NAS_PORT_TYPE: u8 = 61;
pub const ATTR_NAS_PORT_ID: u8 = 87;
pub const ATTR_VENDOR_SPECIFIC: u8 = 26;
pub const ATTR_ACCT_INPUT_GIGAWORDS: u8 = 52;
pub const ATTR_ACCT_OUTPUT_GIGAWORDS: u8 = 53;

pub const ACCT_STATUS_START: u32 = 1;
pub const ACCT_STATUS_STOP: u32 = 2;
pub const ACCT_STATUS_INTERIM_UPDATE: u32 = 3;

/// RFC 2865 NAS-Port-Type; this BNG's subscriber interfaces are Ethernet.
pub const NAS_PORT_TYPE_ETHERNET: u32 = 15;

#[derive(Debug)]
pub enum Error {
    TooShort,
    LengthMismatch,
    AttributeOverflow,
    BadAuthenticator,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooShort => write!(f, "packet shorter than RADIUS header"),
            Self::LengthMismatch => write!(f, "declared length does not match packet size"),
            Self::AttributeOverflow => write!(f, "attribute value exceeds 253 bytes"),
            Self::BadAuthenticator => write!(f, "response authenticator mismatch"),
        }
    }
}

impl std::error::Error for Error {}

/// A decoded or to-be-encoded RADIUS packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub code: u8,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<(u8, Vec<u8>)>,
}

impl Packet {
    pub fn new(code: u8, identifier: u8, authenticator: [u8; 16]) -> Self {
        Self {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn push_bytes(&mut self, code: u8, data: &[u8]) -> &mut Self {
        self.attributes.push((code, data.to_vec()));
        self
    }

    pub fn push_str(&mut self, code: u8, value: &str) -> &mut Self {
        self.push_bytes(code, value.as_bytes())
    }

    pub fn push_u32(&mut self, code: u8, value: u32) -> &mut Self {
        self.push_bytes(code, &value.to_be_bytes())
    }

    pub fn push_ipv4(&mut self, code: u8, value: Ipv4Addr) -> &mut Self {
        self.push_bytes(code, &value.octets())
    }

    pub fn attr(&self, code: u8) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn attr_u32(&self, code: u8) -> Option<u32> {
        self.attr(code)
            .filter(|v| v.len() == 4)
            .map(|v| u32::from_be_bytes(v.try_into().unwrap()))
    }

    fn encode_attributes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for (code, value) in &self.attributes {
            if value.len() > 253 {
                return Err(Error::AttributeOverflow);
            }
            out.push(*code);
            out.push((value.len() + 2) as u8);
            out.extend_from_slice(value);
        }
        Ok(out)
    }

    /// Encodes the full packet (header + attributes), using
    /// `self.authenticator` verbatim as the wire Authenticator field.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let attrs = self.encode_attributes()?;
        let len = 20 + attrs.len();

        let mut out = Vec::with_capacity(len);
        out.push(self.code);
        out.push(self.identifier);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&self.authenticator);
        out.extend_from_slice(&attrs);

        Ok(out)
    }

    /// Computes and sets the Request Authenticator for an
    /// Accounting-Request in place, per RFC 2866 §3. Must be called after
    /// all attributes are pushed and before `encode`.
    pub fn sign_accounting_request(&mut self, secret: &[u8]) -> Result<(), Error> {
        let attrs = self.encode_attributes()?;
        self.authenticator = accounting_request_authenticator(self.identifier, &attrs, secret);
        Ok(())
    }

    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 20 {
            return Err(Error::TooShort);
        }

        let code = data[0];
        let identifier = data[1];
        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if len > data.len() || len < 20 {
            return Err(Error::LengthMismatch);
        }

        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..20]);

        let mut attributes = Vec::new();
        let mut offset = 20;
        while offset + 2 <= len {
            let attr_code = data[offset];
            let attr_len = data[offset + 1] as usize;
            if attr_len < 2 || offset + attr_len > len {
                return Err(Error::LengthMismatch);
            }
            attributes.push((attr_code, data[offset + 2..offset + attr_len].to_vec()));
            offset += attr_len;
        }

        Ok(Self {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }
}

fn md5_authenticator(code: u8, identifier: u8, len: usize, seed: &[u8; 16], attrs: &[u8], secret: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update([code, identifier, (len >> 8) as u8, len as u8]);
    hasher.update(seed);
    hasher.update(attrs);
    hasher.update(secret);

    hasher.finalize().into()
}

/// A fresh, unpredictable Request Authenticator for an Access-Request.
pub fn request_authenticator() -> [u8; 16] {
    use rand::RngCore;

    let mut buf = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// The Request Authenticator for an Accounting-Request: RFC 2866 §3
/// specifies it as the MD5 hash computed as if it were a response, using
/// sixteen zero octets in place of the Response Authenticator.
pub fn accounting_request_authenticator(identifier: u8, attrs: &[u8], secret: &[u8]) -> [u8; 16] {
    let len = 20 + attrs.len();
    md5_authenticator(CODE_ACCOUNTING_REQUEST, identifier, len, &[0u8; 16], attrs, secret)
}

/// Verifies a server reply's Response Authenticator against the
/// Authenticator this client sent in the corresponding request.
pub fn verify_response(reply: &Packet, sent_authenticator: &[u8; 16], secret: &[u8]) -> Result<(), Error> {
    let attrs = reply.encode_attributes()?;
    let len = 20 + attrs.len();
    let expected = md5_authenticator(reply.code, reply.identifier, len, sent_authenticator, &attrs, secret);

    if expected == reply.authenticator {
        Ok(())
    } else {
        Err(Error::BadAuthenticator)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packet_round_trips() {
        let mut pkt = Packet::new(CODE_ACCESS_REQUEST, 7, request_authenticator());
        pkt.push_str(ATTR_USER_NAME, "BNG-A/R1/1/0/1");
        pkt.push_ipv4(ATTR_FRAMED_IP_ADDRESS, Ipv4Addr::new(10, 0, 0, 50));
        pkt.push_u32(ATTR_NAS_PORT_TYPE, NAS_PORT_TYPE_ETHERNET);

        let encoded = pkt.encode().unwrap();
        let decoded = Packet::decode(&encoded).unwrap();

        assert_eq!(decoded.code, CODE_ACCESS_REQUEST);
        assert_eq!(decoded.identifier, 7);
        assert_eq!(decoded.attr(ATTR_USER_NAME).unwrap(), b"BNG-A/R1/1/0/1");
        assert_eq!(decoded.attr_u32(ATTR_NAS_PORT_TYPE), Some(NAS_PORT_TYPE_ETHERNET));
    }

    #[test]
    fn accounting_request_authenticator_is_deterministic() {
        let mut pkt = Packet::new(CODE_ACCOUNTING_REQUEST, 3, [0u8; 16]);
        pkt.push_str(ATTR_ACCT_SESSION_ID, "aa:bb-10.0.0.50-100");
        let attrs = pkt.encode_attributes().unwrap();

        let a = accounting_request_authenticator(3, &attrs, b"secret");
        let b = accounting_request_authenticator(3, &attrs, b"secret");
        assert_eq!(a, b);

        let c = accounting_request_authenticator(3, &attrs, b"other-secret");
        assert_ne!(a, c);
    }

    #[test]
    fn verify_response_detects_tampering() {
        let secret = b"shared-secret";
        let sent_auth = request_authenticator();

        let mut reply = Packet::new(CODE_ACCESS_ACCEPT, 9, [0u8; 16]);
        reply.push_str(ATTR_USER_NAME, "whatever");
        let attrs = reply.encode_attributes().unwrap();
        let len = 20 + attrs.len();
        reply.authenticator = md5_authenticator(reply.code, reply.identifier, len, &sent_auth, &attrs, secret);

        assert!(verify_response(&reply, &sent_auth, secret).is_ok());

        reply.authenticator[0] ^= 0xff;
        assert!(verify_response(&reply, &sent_auth, secret).is_err());
    }
}
