//! Minimal DNS wire format
//!
//! Hand-rolled building and parsing of exactly the messages the tunnel
//! exchanges: A queries whose QNAME carries a sealed chunk, A answers
//! whose rdata carries the acknowledgment address, and NXDOMAIN for
//! anything that wanders in. Messages travel over TCP with the RFC 1035
//! two-byte length prefix.

use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::MAX_LABEL_LEN;

/// A record type.
pub const TYPE_A: u16 = 1;

/// IN class.
pub const CLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;

/// Flags: standard query, recursion desired.
const FLAGS_QUERY: u16 = 0x0100;

/// Flags: standard response, recursion available.
const FLAGS_RESPONSE: u16 = 0x8180;

/// Flags: response with RCODE 3 (name error).
const FLAGS_NXDOMAIN: u16 = 0x8183;

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("message truncated")]
    Truncated,

    #[error("name is not valid ASCII")]
    BadName,

    #[error("label of {0} bytes exceeds the 63-byte limit")]
    LabelTooLong(usize),

    #[error("compression pointer loop")]
    PointerLoop,

    #[error("no A record in answer")]
    NoAnswer,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn get_u16(packet: &[u8], pos: usize) -> Result<u16, DnsError> {
    let bytes = packet.get(pos..pos + 2).ok_or(DnsError::Truncated)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Append a dotted name in wire form: length-prefixed labels, null
/// terminated.
fn put_name(buf: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    if !name.is_ascii() {
        return Err(DnsError::BadName);
    }
    for label in name.trim_end_matches('.').split('.') {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong(label.len()));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
    Ok(())
}

/// Read a name starting at `pos`, following at most a handful of
/// compression pointers. Returns the dotted name and the offset just
/// past the name at `pos`, before any pointer jump.
fn get_name(packet: &[u8], pos: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut cursor = pos;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(cursor).ok_or(DnsError::Truncated)? as usize;
        if len == 0 {
            let after = end.unwrap_or(cursor + 1);
            return Ok((name, after));
        }
        if len & 0xc0 == 0xc0 {
            // Two-byte compression pointer.
            let target = ((len & 0x3f) << 8) | *packet.get(cursor + 1).ok_or(DnsError::Truncated)? as usize;
            end.get_or_insert(cursor + 2);
            jumps += 1;
            if jumps > 8 {
                return Err(DnsError::PointerLoop);
            }
            cursor = target;
            continue;
        }

        let label = packet
            .get(cursor + 1..cursor + 1 + len)
            .ok_or(DnsError::Truncated)?;
        let label = std::str::from_utf8(label).map_err(|_| DnsError::BadName)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(label);
        cursor += 1 + len;
    }
}

fn put_header(buf: &mut Vec<u8>, id: u16, flags: u16, qdcount: u16, ancount: u16) {
    put_u16(buf, id);
    put_u16(buf, flags);
    put_u16(buf, qdcount);
    put_u16(buf, ancount);
    put_u16(buf, 0); // NSCOUNT
    put_u16(buf, 0); // ARCOUNT
}

/// Build an A query for `qname`.
pub fn build_query(id: u16, qname: &str) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 6);
    put_header(&mut packet, id, FLAGS_QUERY, 1, 0);
    put_name(&mut packet, qname)?;
    put_u16(&mut packet, TYPE_A);
    put_u16(&mut packet, CLASS_IN);
    Ok(packet)
}

/// Extract the transaction ID and question name from a query.
pub fn parse_query(packet: &[u8]) -> Result<(u16, String), DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }
    let id = get_u16(packet, 0)?;
    if get_u16(packet, 4)? == 0 {
        return Err(DnsError::Truncated);
    }
    let (qname, _) = get_name(packet, HEADER_LEN)?;
    Ok((id, qname))
}

/// Build a response carrying one A record whose rdata is `addr`.
///
/// The answer name is a compression pointer back to the question and the
/// TTL is zero so resolvers never cache acknowledgment state.
pub fn build_answer(id: u16, qname: &str, addr: Ipv4Addr) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 22);
    put_header(&mut packet, id, FLAGS_RESPONSE, 1, 1);

    // Question echo
    put_name(&mut packet, qname)?;
    put_u16(&mut packet, TYPE_A);
    put_u16(&mut packet, CLASS_IN);

    // Answer
    packet.extend_from_slice(&[0xc0, HEADER_LEN as u8]); // NAME: pointer to question
    put_u16(&mut packet, TYPE_A);
    put_u16(&mut packet, CLASS_IN);
    packet.extend_from_slice(&[0, 0, 0, 0]); // TTL 0
    put_u16(&mut packet, 4); // RDLENGTH
    packet.extend_from_slice(&addr.octets());
    Ok(packet)
}

/// Build an NXDOMAIN response echoing the question.
pub fn build_nxdomain(id: u16, qname: &str) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 6);
    put_header(&mut packet, id, FLAGS_NXDOMAIN, 1, 0);
    put_name(&mut packet, qname)?;
    put_u16(&mut packet, TYPE_A);
    put_u16(&mut packet, CLASS_IN);
    Ok(packet)
}

/// Extract the transaction ID and the first A record's address from a
/// response. An answerless response (NXDOMAIN included) is `NoAnswer`.
pub fn parse_answer(packet: &[u8]) -> Result<(u16, Ipv4Addr), DnsError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }
    let id = get_u16(packet, 0)?;
    let qdcount = get_u16(packet, 4)?;
    let ancount = get_u16(packet, 6)?;
    if ancount == 0 {
        return Err(DnsError::NoAnswer);
    }

    // Skip question entries.
    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        let (_, after) = get_name(packet, pos)?;
        pos = after + 4; // QTYPE + QCLASS
    }

    for _ in 0..ancount {
        let (_, after) = get_name(packet, pos)?;
        pos = after;
        let rtype = get_u16(packet, pos)?;
        let rdlength = get_u16(packet, pos + 8)? as usize;
        let rdata_start = pos + 10;
        let rdata = packet
            .get(rdata_start..rdata_start + rdlength)
            .ok_or(DnsError::Truncated)?;
        if rtype == TYPE_A && rdlength == 4 {
            return Ok((id, Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])));
        }
        pos = rdata_start + rdlength;
    }
    Err(DnsError::NoAnswer)
}

/// Read one length-prefixed DNS message. `None` on a clean close at the
/// message boundary.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, DnsError> {
    let mut len_bytes = [0u8; 2];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u16::from_be_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one length-prefixed DNS message.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &[u8]) -> Result<(), DnsError> {
    writer.write_all(&(message.len() as u16).to_be_bytes()).await?;
    writer.write_all(message).await?;
    writer.flush().await?;
    Ok(())
}
