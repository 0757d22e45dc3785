//! DNS label codec
//!
//! A sealed chunk rides in the QNAME of an A query:
//!
//! ```text
//! seq7.MFRGGZDFMZTWQ2LK...JV4Q.GEZDGNBVGY3TQOJQ.t.example.com
//! ^^^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^
//! seq  base32 packet, <=63 chars per label      tunnel domain
//! ```
//!
//! Base32 is RFC 4648, unpadded on the wire and case-insensitive on
//! receive. The reset control message is `seq-1.{domain}` with no
//! payload labels. Acknowledgments travel the other way as A-record
//! rdata shaped `1.2.A.B`.

use std::net::Ipv4Addr;

use data_encoding::BASE32_NOPAD;
use thiserror::Error;

use crate::crypto::Packet;

/// Maximum bytes per DNS label (RFC 1035).
pub const MAX_LABEL_LEN: usize = 63;

/// Maximum total QNAME length in presentation form.
pub const MAX_QNAME_LEN: usize = 255;

/// Sequence number of the reset control message.
pub const RESET_SEQ: i64 = -1;

/// Highest sequence value the `1.2.A.B` acknowledgment encoding can
/// carry. Also the hard ceiling on chunks per message.
pub const MAX_SEQ: u32 = u16::MAX as u32;

/// Answer rdata acknowledging a reset.
pub const RESET_ACK: Ipv4Addr = Ipv4Addr::new(1, 2, 0, 0);

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("QNAME does not end in the tunnel domain")]
    ForeignDomain,

    #[error("missing or malformed sequence label {0:?}")]
    BadSeqLabel(String),

    #[error("sequence {0} outside the acknowledgeable range")]
    SeqOutOfRange(i64),

    #[error("payload labels are not valid base32")]
    BadBase32,

    #[error("packet of {0} bytes is shorter than nonce, tag and one ciphertext byte")]
    ShortPacket(usize),

    #[error("QNAME would be {0} octets, over the {MAX_QNAME_LEN} limit")]
    NameTooLong(usize),
}

/// One parsed tunnel query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelQuery {
    /// `seq-1`: clear all receiver state.
    Reset,
    /// A sealed data chunk.
    Chunk { seq: u16, packet: Packet },
}

/// Encodes packets into tunnel QNAMEs under a fixed base domain, and back.
#[derive(Debug, Clone)]
pub struct LabelCodec {
    domain: String,
}

impl LabelCodec {
    pub fn new(domain: impl Into<String>) -> Self {
        let mut domain = domain.into();
        // Normalize away a trailing root dot so suffix checks are uniform.
        while domain.ends_with('.') {
            domain.pop();
        }
        Self { domain }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether a QNAME belongs to this tunnel. Case-insensitive, as DNS
    /// names are on the wire.
    pub fn matches_domain(&self, qname: &str) -> bool {
        let name = qname.strip_suffix('.').unwrap_or(qname);
        let name = name.to_ascii_lowercase();
        let domain = self.domain.to_ascii_lowercase();
        name == domain || name.ends_with(&format!(".{domain}"))
    }

    /// Compose the QNAME carrying `packet` under sequence `seq`.
    ///
    /// A name over 255 octets means the chunk size is misconfigured for
    /// this domain; that is surfaced as an error rather than truncated,
    /// and config validation makes it unreachable in normal operation.
    pub fn encode(&self, seq: i64, packet: &[u8]) -> Result<String, CodecError> {
        let mut name = format!("seq{seq}");
        let encoded = BASE32_NOPAD.encode(packet);
        for fragment in encoded.as_bytes().chunks(MAX_LABEL_LEN) {
            name.push('.');
            name.push_str(std::str::from_utf8(fragment).expect("base32 output is ASCII"));
        }
        name.push('.');
        name.push_str(&self.domain);

        if name.len() > MAX_QNAME_LEN {
            return Err(CodecError::NameTooLong(name.len()));
        }
        Ok(name)
    }

    /// The reset QNAME, `seq-1.{domain}`. Infallible: the domain length
    /// was validated at startup.
    pub fn reset_qname(&self) -> String {
        format!("seq{RESET_SEQ}.{}", self.domain)
    }

    /// Recover the sequence number and packet from a tunnel QNAME.
    pub fn decode(&self, qname: &str) -> Result<TunnelQuery, CodecError> {
        let name = qname.strip_suffix('.').unwrap_or(qname);
        let prefix = self.strip_domain(name)?;

        let mut labels = prefix.split('.');
        let seq_label = labels.next().unwrap_or("");
        let seq = parse_seq_label(seq_label)
            .ok_or_else(|| CodecError::BadSeqLabel(seq_label.to_string()))?;

        if seq == RESET_SEQ {
            // Reset carries no payload; any stray labels are ignored so a
            // replayed or padded reset still resets.
            return Ok(TunnelQuery::Reset);
        }
        if !(0..=i64::from(u16::MAX)).contains(&seq) {
            return Err(CodecError::SeqOutOfRange(seq));
        }

        let mut text = String::new();
        for label in labels {
            text.push_str(label);
        }
        let text = text.to_ascii_uppercase();
        let raw = BASE32_NOPAD
            .decode(text.as_bytes())
            .map_err(|_| CodecError::BadBase32)?;
        let packet = Packet::from_bytes(&raw).ok_or(CodecError::ShortPacket(raw.len()))?;

        Ok(TunnelQuery::Chunk {
            seq: seq as u16,
            packet,
        })
    }

    fn strip_domain<'a>(&self, name: &'a str) -> Result<&'a str, CodecError> {
        let lower = name.to_ascii_lowercase();
        let domain = self.domain.to_ascii_lowercase();
        if lower.len() <= domain.len() + 1 || !lower.ends_with(&format!(".{domain}")) {
            return Err(CodecError::ForeignDomain);
        }
        Ok(&name[..name.len() - domain.len() - 1])
    }
}

/// Match `seq-?\d+` exactly; `+5` or empty digits are not acceptable.
fn parse_seq_label(label: &str) -> Option<i64> {
    let digits = label.strip_prefix("seq")?;
    let unsigned = digits.strip_prefix('-').unwrap_or(digits);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Encode a cumulative acknowledgment as `1.2.A.B`. Values above the
/// 16-bit ceiling saturate; config caps messages so this never engages
/// against a well-behaved sender.
pub fn ack_to_addr(ack: u32) -> Ipv4Addr {
    let ack = ack.min(MAX_SEQ);
    Ipv4Addr::new(1, 2, (ack >> 8) as u8, (ack & 0xff) as u8)
}

/// Recover the acknowledgment value from answer rdata. `None` when the
/// address does not carry the fixed `1.2.` prefix.
pub fn addr_to_ack(addr: Ipv4Addr) -> Option<u32> {
    let o = addr.octets();
    if o[0] != 1 || o[1] != 2 {
        return None;
    }
    Some((u32::from(o[2]) << 8) | u32::from(o[3]))
}

/// Largest chunk size whose QNAME stays within limits for `domain`.
///
/// Accounts for the `seq{N}` label at its widest, the base32 expansion
/// of the sealed packet, and one separator dot per label.
pub fn max_chunk_size(domain: &str) -> usize {
    let domain_len = domain.trim_end_matches('.').len();
    let seq_label = "seq65535".len();
    let mut best = 0;
    for chunk in 1..=MAX_QNAME_LEN {
        let packet = chunk + crate::crypto::PACKET_OVERHEAD;
        let encoded = (packet * 8 + 4) / 5;
        let fragments = (encoded + MAX_LABEL_LEN - 1) / MAX_LABEL_LEN;
        let qname = seq_label + encoded + fragments + 1 + domain_len;
        if qname <= MAX_QNAME_LEN {
            best = chunk;
        } else {
            break;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PACKET_OVERHEAD;

    fn codec() -> LabelCodec {
        LabelCodec::new("t.example.com")
    }

    fn sample_packet(len: usize) -> Vec<u8> {
        (0..len as u8).map(|b| b.wrapping_mul(7)).collect()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let codec = codec();
        let packet = sample_packet(72);
        let qname = codec.encode(12, &packet).unwrap();
        assert!(qname.starts_with("seq12."));
        assert!(qname.ends_with(".t.example.com"));
        for label in qname.split('.') {
            assert!(label.len() <= MAX_LABEL_LEN);
        }

        match codec.decode(&qname).unwrap() {
            TunnelQuery::Chunk { seq, packet: p } => {
                assert_eq!(seq, 12);
                assert_eq!(p.to_bytes(), packet);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let codec = codec();
        let packet = sample_packet(40);
        let qname = codec.encode(3, &packet).unwrap().to_ascii_lowercase();
        match codec.decode(&qname).unwrap() {
            TunnelQuery::Chunk { seq, packet: p } => {
                assert_eq!(seq, 3);
                assert_eq!(p.to_bytes(), packet);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn test_reset_roundtrip() {
        let codec = codec();
        assert_eq!(codec.reset_qname(), "seq-1.t.example.com");
        assert_eq!(codec.decode("seq-1.t.example.com").unwrap(), TunnelQuery::Reset);
        // Trailing root dot is tolerated.
        assert_eq!(codec.decode("seq-1.t.example.com.").unwrap(), TunnelQuery::Reset);
    }

    #[test]
    fn test_foreign_and_bare_domains_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.decode("seq0.abc.other.example.com"),
            Err(CodecError::ForeignDomain)
        ));
        assert!(matches!(
            codec.decode("t.example.com"),
            Err(CodecError::ForeignDomain)
        ));
    }

    #[test]
    fn test_bad_sequence_labels_rejected() {
        let codec = codec();
        for name in [
            "nosuchlabel.t.example.com",
            "seq.t.example.com",
            "seq+5.t.example.com",
            "seq12x.t.example.com",
        ] {
            assert!(matches!(codec.decode(name), Err(CodecError::BadSeqLabel(_))), "{name}");
        }
        assert!(matches!(
            codec.decode("seq65536.AAAA.t.example.com"),
            Err(CodecError::SeqOutOfRange(65536))
        ));
    }

    #[test]
    fn test_bad_base32_and_short_packets_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.decode("seq0.!!!!.t.example.com"),
            Err(CodecError::BadBase32)
        ));
        // 32 bytes decodes fine but cannot hold any ciphertext.
        let qname = codec.encode(0, &sample_packet(PACKET_OVERHEAD)).unwrap();
        assert!(matches!(
            codec.decode(&qname),
            Err(CodecError::ShortPacket(32))
        ));
    }

    #[test]
    fn test_oversized_name_is_an_error_not_a_truncation() {
        let codec = codec();
        let too_big = sample_packet(200);
        assert!(matches!(
            codec.encode(0, &too_big),
            Err(CodecError::NameTooLong(_))
        ));
    }

    #[test]
    fn test_max_chunk_size_is_tight() {
        let codec = codec();
        let max = max_chunk_size(codec.domain());
        assert!(max >= 30, "expected room for typical chunk sizes, got {max}");

        let at_limit = sample_packet(max + PACKET_OVERHEAD);
        assert!(codec.encode(65535, &at_limit).is_ok());
        let over = sample_packet(max + 1 + PACKET_OVERHEAD);
        assert!(codec.encode(65535, &over).is_err());
    }

    #[test]
    fn test_ack_address_mapping() {
        assert_eq!(ack_to_addr(0), RESET_ACK);
        assert_eq!(ack_to_addr(1), Ipv4Addr::new(1, 2, 0, 1));
        assert_eq!(ack_to_addr(0x1234), Ipv4Addr::new(1, 2, 0x12, 0x34));
        assert_eq!(addr_to_ack(Ipv4Addr::new(1, 2, 0x12, 0x34)), Some(0x1234));
        assert_eq!(addr_to_ack(Ipv4Addr::new(9, 9, 0, 1)), None);
        // Saturates at the encoding ceiling instead of wrapping.
        assert_eq!(ack_to_addr(70_000), Ipv4Addr::new(1, 2, 0xff, 0xff));
    }
}
