//! Receiver reliability layer
//!
//! The server side of the tunnel is purely reactive: it holds the
//! session state (`expected_seq` plus the buffered out-of-order chunks),
//! applies each incoming query to it, and answers with the cumulative
//! acknowledgment. State mutation and acknowledgment computation happen
//! inside one critical section per request, so the answered value can
//! never lag the state it was derived from. The receiver keeps no
//! per-sender identity and runs no timers; liveness is the sender's job.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tokio::sync::Mutex;

use crate::codec::{self, LabelCodec, TunnelQuery, MAX_SEQ};
use crate::crypto::ChunkCipher;

/// Session state. Everything lives behind one mutex.
#[derive(Default)]
struct SessionState {
    /// Lowest sequence not yet accepted; also the cumulative ACK value.
    expected_seq: u32,

    /// Decrypted chunks by sequence, including buffered out-of-order ones.
    received: HashMap<u16, Vec<u8>>,

    /// Chunks rejected for a bad tag since the last reset.
    auth_failures: u64,
}

impl SessionState {
    fn ack(&self) -> Ipv4Addr {
        codec::ack_to_addr(self.expected_seq)
    }
}

/// The server-side reliability endpoint for one tunnel session.
pub struct Receiver {
    codec: LabelCodec,
    cipher: ChunkCipher,
    state: Mutex<SessionState>,
}

/// Result of draining the session at shutdown.
#[derive(Debug)]
pub struct Reassembly {
    /// Concatenated plaintexts in ascending sequence order.
    pub message: Vec<u8>,

    /// Sequences present, sorted.
    pub received: Vec<u16>,

    /// Gaps below the highest sequence seen, sorted.
    pub missing: Vec<u16>,

    /// Chunks rejected for a bad tag since the last reset.
    pub auth_failures: u64,
}

impl Reassembly {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

impl Receiver {
    pub fn new(codec: LabelCodec, cipher: ChunkCipher) -> Self {
        Self {
            codec,
            cipher,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Whether a QNAME belongs to this tunnel's domain.
    pub fn matches_domain(&self, qname: &str) -> bool {
        self.codec.matches_domain(qname)
    }

    /// Apply one tunnel query and produce the answer address.
    ///
    /// This is total: malformed names, stale sequences, bad tags and
    /// duplicates all acknowledge the current state rather than failing,
    /// so the sender cannot tell corruption apart from loss.
    pub async fn handle_query(&self, qname: &str) -> Ipv4Addr {
        let mut state = self.state.lock().await;

        let query = match self.codec.decode(qname) {
            Ok(query) => query,
            Err(e) => {
                log::warn!("malformed tunnel query {qname:?}: {e}");
                return state.ack();
            }
        };

        match query {
            TunnelQuery::Reset => {
                if !state.received.is_empty() || state.expected_seq != 0 {
                    log::info!(
                        "reset: dropping {} chunks, expected_seq {}",
                        state.received.len(),
                        state.expected_seq
                    );
                }
                state.received.clear();
                state.expected_seq = 0;
                state.auth_failures = 0;
                codec::RESET_ACK
            }

            TunnelQuery::Chunk { seq, packet } => {
                if u32::from(seq) < state.expected_seq {
                    // Already absorbed into the cumulative ACK; not worth
                    // decrypting.
                    log::debug!("stale chunk {seq}, expecting {}", state.expected_seq);
                    return state.ack();
                }

                let plaintext = match self.cipher.open(&packet) {
                    Ok(plaintext) => plaintext,
                    Err(_) => {
                        state.auth_failures += 1;
                        log::warn!(
                            "chunk {seq} failed authentication ({} since reset)",
                            state.auth_failures
                        );
                        return state.ack();
                    }
                };

                if state.received.contains_key(&seq) {
                    log::debug!("duplicate chunk {seq}");
                    return state.ack();
                }

                state.received.insert(seq, plaintext);
                while state.expected_seq <= MAX_SEQ
                    && state.received.contains_key(&(state.expected_seq as u16))
                {
                    state.expected_seq += 1;
                }
                log::debug!(
                    "stored chunk {seq}, expecting {} ({} buffered)",
                    state.expected_seq,
                    state.received.len()
                );
                state.ack()
            }
        }
    }

    /// Current cumulative acknowledgment value.
    pub async fn expected_seq(&self) -> u32 {
        self.state.lock().await.expected_seq
    }

    /// Drain the session into its reassembled message and gap report.
    /// Never waits for missing chunks.
    pub async fn reassemble(&self) -> Reassembly {
        let state = self.state.lock().await;

        let mut received: Vec<u16> = state.received.keys().copied().collect();
        received.sort_unstable();

        let mut message = Vec::new();
        for seq in &received {
            message.extend_from_slice(&state.received[seq]);
        }

        let missing = match received.last() {
            Some(&highest) => (0..=highest)
                .filter(|seq| !state.received.contains_key(seq))
                .collect(),
            None => Vec::new(),
        };

        Reassembly {
            message,
            received,
            missing,
            auth_failures: state.auth_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RESET_ACK;

    const DOMAIN: &str = "t.example.com";
    const KEY: [u8; 32] = [0x42; 32];

    fn receiver() -> Receiver {
        Receiver::new(LabelCodec::new(DOMAIN), ChunkCipher::new(&KEY))
    }

    fn chunk_qname(seq: i64, plaintext: &[u8]) -> String {
        let cipher = ChunkCipher::new(&KEY);
        let packet = cipher.seal(plaintext);
        LabelCodec::new(DOMAIN)
            .encode(seq, &packet.to_bytes())
            .unwrap()
    }

    fn ack(expected: u32) -> Ipv4Addr {
        codec::ack_to_addr(expected)
    }

    #[tokio::test]
    async fn test_in_order_delivery_advances_ack() {
        let receiver = receiver();
        assert_eq!(receiver.handle_query(&chunk_qname(0, b"aaa")).await, ack(1));
        assert_eq!(receiver.handle_query(&chunk_qname(1, b"bbb")).await, ack(2));
        assert_eq!(receiver.handle_query(&chunk_qname(2, b"ccc")).await, ack(3));

        let result = receiver.reassemble().await;
        assert!(result.is_complete());
        assert_eq!(result.message, b"aaabbbccc");
        assert_eq!(result.received, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_are_buffered() {
        let receiver = receiver();
        // 1 and 2 arrive before 0: held, ACK stays at 0.
        assert_eq!(receiver.handle_query(&chunk_qname(1, b"mid")).await, ack(0));
        assert_eq!(receiver.handle_query(&chunk_qname(2, b"end")).await, ack(0));
        // 0 fills the gap and the ACK jumps over the buffered run.
        assert_eq!(receiver.handle_query(&chunk_qname(0, b"top")).await, ack(3));

        let result = receiver.reassemble().await;
        assert_eq!(result.message, b"topmidend");
        assert!(result.missing.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_never_decreases_ack_or_duplicates_bytes() {
        let receiver = receiver();
        let first = chunk_qname(0, b"once");
        assert_eq!(receiver.handle_query(&first).await, ack(1));
        // Replay of the same transmission and a fresh re-encryption both
        // leave the state alone.
        assert_eq!(receiver.handle_query(&first).await, ack(1));
        assert_eq!(receiver.handle_query(&chunk_qname(0, b"once")).await, ack(1));

        let result = receiver.reassemble().await;
        assert_eq!(result.message, b"once");
    }

    #[tokio::test]
    async fn test_stale_chunk_is_not_decrypted() {
        let receiver = receiver();
        receiver.handle_query(&chunk_qname(0, b"a")).await;
        receiver.handle_query(&chunk_qname(1, b"b")).await;

        // Garbage that would never authenticate; the stale path answers
        // before any decryption is attempted.
        let garbage = LabelCodec::new(DOMAIN).encode(0, &[0u8; 40]).unwrap();
        assert_eq!(receiver.handle_query(&garbage).await, ack(2));
        assert_eq!(receiver.reassemble().await.auth_failures, 0);
    }

    #[tokio::test]
    async fn test_auth_failure_changes_nothing() {
        let receiver = receiver();
        receiver.handle_query(&chunk_qname(0, b"good")).await;

        let mut tampered = ChunkCipher::new(&KEY).seal(b"evil");
        tampered.ciphertext[0] ^= 0x01;
        let qname = LabelCodec::new(DOMAIN)
            .encode(1, &tampered.to_bytes())
            .unwrap();
        assert_eq!(receiver.handle_query(&qname).await, ack(1));

        let result = receiver.reassemble().await;
        assert_eq!(result.received, vec![0]);
        assert_eq!(result.auth_failures, 1);
    }

    #[tokio::test]
    async fn test_malformed_query_acks_current_state() {
        let receiver = receiver();
        receiver.handle_query(&chunk_qname(0, b"x")).await;
        assert_eq!(receiver.handle_query("seqqq.t.example.com").await, ack(1));
        assert_eq!(receiver.handle_query("seq1.!!.t.example.com").await, ack(1));
        assert_eq!(receiver.expected_seq().await, 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let receiver = receiver();
        receiver.handle_query(&chunk_qname(0, b"old")).await;
        receiver.handle_query(&chunk_qname(1, b"old")).await;

        assert_eq!(receiver.handle_query("seq-1.t.example.com").await, RESET_ACK);
        assert_eq!(receiver.expected_seq().await, 0);
        assert_eq!(receiver.handle_query("seq-1.t.example.com").await, RESET_ACK);
        assert_eq!(receiver.expected_seq().await, 0);

        let result = receiver.reassemble().await;
        assert!(result.message.is_empty());
        assert!(result.received.is_empty());
    }

    #[tokio::test]
    async fn test_reassembly_reports_missing_sequences() {
        let receiver = receiver();
        receiver.handle_query(&chunk_qname(0, b"a")).await;
        receiver.handle_query(&chunk_qname(2, b"c")).await;
        receiver.handle_query(&chunk_qname(5, b"f")).await;

        let result = receiver.reassemble().await;
        assert!(!result.is_complete());
        assert_eq!(result.received, vec![0, 2, 5]);
        assert_eq!(result.missing, vec![1, 3, 4]);
        assert_eq!(result.message, b"acf");
    }
}
