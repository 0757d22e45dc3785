//! dnsveil: covert message transport over DNS
//!
//! dnsveil moves a single byte message from an agent to a server by
//! hiding AES-256-GCM sealed chunks inside the QNAMEs of DNS A queries.
//! The server acknowledges cumulatively through the IPv4 address of the
//! A-record answer, and the agent drives a TCP-style reliability layer
//! (retransmission, duplicate-ACK fast retransmit, slow start and
//! congestion avoidance) on top of that one-bit-of-state-per-answer
//! channel.
//!
//! ## Architecture
//!
//! ```text
//! message ──▶ Sender ──▶ ChunkCipher ──▶ LabelCodec ──▶ DnsCarrier ─┐
//!             ▲  window, retransmit,                     TCP DNS    │
//!             │  congestion control                                 ▼
//!          ACK in A-record rdata ◀── Receiver ◀── DnsServer ◀── network
//!                                    expected_seq,
//!                                    buffered chunks
//! ```
//!
//! ## Wire format
//!
//! One chunk travels as `seq{N}.{base32 fragments}.{domain}` where the
//! base32 text encodes `nonce || tag || ciphertext`. The reset control
//! message is `seq-1.{domain}`; its acknowledgment is the literal
//! `1.2.0.0`, and a data acknowledgment of `n` is `1.2.{n>>8}.{n&0xff}`.
//!
//! ## Quick start
//!
//! ```bash
//! # Generate a shared key
//! dnsveil genkey > tunnel.key
//!
//! # Receiver
//! dnsveil serve --bind 127.0.0.1:5354 --domain t.example.com --key-file tunnel.key
//!
//! # Agent
//! echo "Hello, DNS." | dnsveil send --server 127.0.0.1:5354 \
//!     --domain t.example.com --key-file tunnel.key
//! ```

pub mod carrier;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod receiver;
pub mod sender;

// Re-export core types
pub use carrier::{AckTransport, CarrierError, DnsCarrier, DnsServer};
pub use codec::{CodecError, LabelCodec, TunnelQuery};
pub use config::{ConfigError, RawConfig, TunnelConfig};
pub use crypto::{ChunkCipher, CryptoError, Packet};
pub use receiver::{Reassembly, Receiver};
pub use sender::{Congestion, SendReport, Sender, SessionError};
