//! Sender reliability layer and congestion controller
//!
//! The sender drives the whole protocol. The message is chunked up
//! front; a window of chunks is kept in flight, each transmission
//! handled by a short-lived worker task that performs one query/answer
//! exchange and reports back over a queue. The driver processes those
//! outcomes in the order they arrived from the network, which is what
//! gives duplicate-ACK detection its meaning.
//!
//! Window management is TCP shaped: slow start doubles the window every
//! round trip until it crosses `ssthresh`, congestion avoidance adds
//! roughly one chunk per round trip after that, a timeout collapses the
//! window to one, and three duplicate ACKs trigger fast retransmit and
//! fast recovery. The controller itself is pure state with no I/O, so
//! every transition is unit-testable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::carrier::AckTransport;
use crate::codec::{self, LabelCodec};
use crate::config::{ConfigError, TunnelConfig};
use crate::crypto::ChunkCipher;

/// Window on session start, in chunks.
pub const INITIAL_CWND: f64 = 2.0;

/// Slow-start threshold on session start, in chunks.
pub const INITIAL_SSTHRESH: f64 = 8.0;

/// Duplicate ACKs needed to trigger fast retransmit.
const DUP_ACK_THRESHOLD: u32 = 3;

/// Driver sleep when no outcome is pending.
const PACING: Duration = Duration::from_millis(10);

/// Extra slack before the driver-side scan declares a transmission lost.
/// The worker's own timeout normally fires first; the scan is a backstop
/// for outcomes that never land.
const SCAN_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum SessionError {
    /// The receiver never acknowledged the reset handshake.
    #[error("no peer: reset handshake failed after {attempts} attempts")]
    NoPeer { attempts: u32 },

    /// One chunk exhausted its retransmission budget.
    #[error("permanent loss: chunk {seq} exceeded {max_retx} retransmissions")]
    PermanentLoss { seq: u16, max_retx: u32 },
}

/// TCP-style congestion controller state. Pure logic; the driver feeds
/// it ACK and timeout events and reads the admission window back.
#[derive(Debug, Clone)]
pub struct Congestion {
    cwnd: f64,
    ssthresh: f64,
    dup_ack_count: u32,
    in_fast_recovery: bool,
}

impl Default for Congestion {
    fn default() -> Self {
        Self::new()
    }
}

impl Congestion {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            dup_ack_count: 0,
            in_fast_recovery: false,
        }
    }

    /// Chunks the window admits in flight right now.
    pub fn window(&self) -> u32 {
        self.cwnd as u32
    }

    pub fn cwnd(&self) -> f64 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> f64 {
        self.ssthresh
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.in_fast_recovery
    }

    pub fn dup_ack_count(&self) -> u32 {
        self.dup_ack_count
    }

    /// A cumulative ACK advanced the base.
    pub fn on_new_ack(&mut self) {
        self.dup_ack_count = 0;
        if self.in_fast_recovery {
            // Recovery ends; deflate back to the threshold.
            self.cwnd = self.ssthresh;
            self.in_fast_recovery = false;
        } else if self.cwnd < self.ssthresh {
            // Slow start: one chunk per ACK doubles cwnd each round trip.
            self.cwnd += 1.0;
        } else {
            // Congestion avoidance: about one chunk per round trip.
            self.cwnd += 1.0 / self.cwnd;
        }
    }

    /// Duplicate ACK for the current base. Returns true when this one
    /// triggers fast retransmit.
    pub fn on_duplicate_ack(&mut self) -> bool {
        if self.in_fast_recovery {
            // Each further duplicate means another chunk left the network.
            self.cwnd += 1.0;
            return false;
        }
        self.dup_ack_count += 1;
        if self.dup_ack_count == DUP_ACK_THRESHOLD {
            self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
            self.cwnd = self.ssthresh + f64::from(DUP_ACK_THRESHOLD);
            self.in_fast_recovery = true;
            return true;
        }
        false
    }

    /// Retransmission timeout: collapse the window and restart slow start.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2.0).floor().max(2.0);
        self.cwnd = 1.0;
        self.in_fast_recovery = false;
        self.dup_ack_count = 0;
    }
}

/// Outcome of one transmission's query/answer exchange.
#[derive(Debug)]
enum Outcome {
    Ack(u32),
    /// Timeout or any carrier failure; both mean the answer is not coming.
    Loss,
}

#[derive(Debug)]
struct QueryEvent {
    seq: u16,
    /// Retransmission count at the time this transmission left.
    attempt: u32,
    outcome: Outcome,
}

/// Bookkeeping for one unacknowledged chunk.
struct Flight {
    send_time: Instant,
    retransmits: u32,
}

/// Summary of a completed session.
#[derive(Debug)]
pub struct SendReport {
    pub chunks: usize,
    pub retransmissions: u32,
    pub fast_retransmits: u32,
    pub elapsed: Duration,
}

/// The sending endpoint for one message.
pub struct Sender<T: AckTransport + 'static> {
    carrier: Arc<T>,
    cipher: ChunkCipher,
    codec: LabelCodec,
    chunks: Vec<Vec<u8>>,
    timeout: Duration,
    max_retx: u32,

    base: u32,
    next_seq: u32,
    congestion: Congestion,
    last_ack: i64,
    in_flight: HashMap<u16, Flight>,

    retransmissions: u32,
    fast_retransmits: u32,

    events_tx: mpsc::UnboundedSender<QueryEvent>,
    events_rx: mpsc::UnboundedReceiver<QueryEvent>,
}

impl<T: AckTransport + 'static> Sender<T> {
    /// Chunk `message` and prepare a session. The only rejection here is
    /// a message too large for the acknowledgment encoding.
    pub fn new(config: &TunnelConfig, carrier: Arc<T>, message: &[u8]) -> Result<Self, ConfigError> {
        config.check_message(message.len())?;
        let chunks = message
            .chunks(config.chunk_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            carrier,
            cipher: ChunkCipher::new(&config.key),
            codec: LabelCodec::new(config.domain.clone()),
            chunks,
            timeout: config.timeout,
            max_retx: config.max_retries,
            base: 0,
            next_seq: 0,
            congestion: Congestion::new(),
            last_ack: -1,
            in_flight: HashMap::new(),
            retransmissions: 0,
            fast_retransmits: 0,
            events_tx,
            events_rx,
        })
    }

    /// Run the session to completion: reset handshake, then the window
    /// loop until every chunk is cumulatively acknowledged.
    pub async fn run(mut self) -> Result<SendReport, SessionError> {
        let started = Instant::now();
        self.reset_handshake().await?;

        let total = self.chunks.len() as u32;
        log::info!(
            "sending {} chunks ({} bytes, window {})",
            total,
            self.chunks.iter().map(Vec::len).sum::<usize>(),
            self.congestion.window()
        );

        while self.base < total {
            self.admit(total);
            self.scan_timeouts()?;
            self.pump_events().await?;
        }

        let report = SendReport {
            chunks: self.chunks.len(),
            retransmissions: self.retransmissions,
            fast_retransmits: self.fast_retransmits,
            elapsed: started.elapsed(),
        };
        log::info!(
            "delivered {} chunks with {} retransmissions in {:?}",
            report.chunks,
            report.retransmissions,
            report.elapsed
        );
        Ok(report)
    }

    /// Clear any receiver state left over from a previous session. The
    /// receiver must answer `1.2.0.0` before any payload moves.
    async fn reset_handshake(&self) -> Result<(), SessionError> {
        let qname = self.codec.reset_qname();
        let attempts = self.max_retx + 1;

        for attempt in 1..=attempts {
            match self.carrier.exchange(&qname).await {
                Ok(addr) if addr == codec::RESET_ACK => {
                    log::info!("reset acknowledged on attempt {attempt}");
                    return Ok(());
                }
                Ok(addr) => log::warn!("unexpected reset answer {addr}"),
                Err(e) => log::debug!("reset attempt {attempt}/{attempts}: {e}"),
            }
        }
        Err(SessionError::NoPeer { attempts })
    }

    /// Admission: transmit fresh chunks while the window has room.
    fn admit(&mut self, total: u32) {
        while self.next_seq < total
            && u64::from(self.next_seq) < u64::from(self.base) + u64::from(self.congestion.window())
        {
            let seq = self.next_seq as u16;
            self.in_flight.insert(
                seq,
                Flight {
                    send_time: Instant::now(),
                    retransmits: 0,
                },
            );
            self.transmit(seq, 0);
            log::debug!(
                "sent chunk {seq} (window {}, in flight {})",
                self.congestion.window(),
                self.in_flight.len()
            );
            self.next_seq += 1;
        }
    }

    /// Spawn one worker to exchange this transmission for its ACK.
    fn transmit(&self, seq: u16, attempt: u32) {
        let packet = self.cipher.seal(&self.chunks[seq as usize]);
        let qname = match self.codec.encode(i64::from(seq), &packet.to_bytes()) {
            Ok(qname) => qname,
            Err(e) => {
                // Unreachable with a validated config; report it as loss so
                // the retransmission cap ends the session with a clear cause.
                log::error!("cannot encode chunk {seq}: {e}");
                let _ = self.events_tx.send(QueryEvent {
                    seq,
                    attempt,
                    outcome: Outcome::Loss,
                });
                return;
            }
        };

        let carrier = Arc::clone(&self.carrier);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = match carrier.exchange(&qname).await {
                Ok(addr) => match codec::addr_to_ack(addr) {
                    Some(ack) => Outcome::Ack(ack),
                    None => {
                        log::warn!("chunk {seq}: answer {addr} is not an acknowledgment");
                        Outcome::Loss
                    }
                },
                Err(e) => {
                    log::debug!("chunk {seq} attempt {attempt}: {e}");
                    Outcome::Loss
                }
            };
            // The driver may already have exited on a fatal error.
            let _ = events.send(QueryEvent {
                seq,
                attempt,
                outcome,
            });
        });
    }

    /// Backstop for transmissions whose worker outcome never arrived:
    /// anything older than the query timeout plus slack is treated as a
    /// timeout here.
    fn scan_timeouts(&mut self) -> Result<(), SessionError> {
        let now = Instant::now();
        let deadline = self.timeout + SCAN_GRACE;
        let overdue: Vec<u16> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| now.duration_since(flight.send_time) >= deadline)
            .map(|(seq, _)| *seq)
            .collect();

        for seq in overdue {
            log::debug!("scan: chunk {seq} overdue");
            self.congestion.on_timeout();
            self.retransmit(seq)?;
        }
        Ok(())
    }

    /// Wait for the next outcome (or one pacing interval), then drain
    /// whatever else has queued, in arrival order.
    async fn pump_events(&mut self) -> Result<(), SessionError> {
        let first = tokio::select! {
            event = self.events_rx.recv() => event,
            _ = tokio::time::sleep(PACING) => None,
        };
        let Some(first) = first else {
            return Ok(());
        };

        self.handle_event(first)?;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    fn handle_event(&mut self, event: QueryEvent) -> Result<(), SessionError> {
        match event.outcome {
            Outcome::Ack(ack) => self.handle_ack(ack),
            Outcome::Loss => self.handle_loss(event.seq, event.attempt),
        }
    }

    /// Ingest one acknowledgment value, whichever transmission it
    /// answered. A late ACK for an already-retransmitted chunk is still
    /// authoritative and cumulative.
    fn handle_ack(&mut self, ack: u32) -> Result<(), SessionError> {
        let ack = ack.min(self.chunks.len() as u32);

        if ack < self.base {
            // Stale; the cumulative ACK already moved past it.
            log::debug!("stale ack {ack} (base {})", self.base);
            return Ok(());
        }

        if ack > self.base {
            for seq in self.base..ack {
                self.in_flight.remove(&(seq as u16));
            }
            self.base = ack;
            self.congestion.on_new_ack();
            self.last_ack = i64::from(ack);
            log::debug!(
                "ack {ack}, window {:.2} ({})",
                self.congestion.cwnd(),
                if self.congestion.cwnd() < self.congestion.ssthresh() {
                    "slow start"
                } else {
                    "congestion avoidance"
                }
            );
            return Ok(());
        }

        // ack == base: the receiver is still waiting for the base chunk.
        if i64::from(ack) == self.last_ack && self.congestion.on_duplicate_ack() {
            log::info!("fast retransmit of chunk {} after {DUP_ACK_THRESHOLD} duplicate acks", self.base);
            self.fast_retransmits += 1;
            let base = self.base as u16;
            self.retransmit(base)?;
        }
        self.last_ack = i64::from(ack);
        Ok(())
    }

    /// React to a lost transmission: collapse the window and resend,
    /// unless a newer transmission of the same chunk superseded this one.
    fn handle_loss(&mut self, seq: u16, attempt: u32) -> Result<(), SessionError> {
        let Some(flight) = self.in_flight.get(&seq) else {
            // Acknowledged while the loss report was in the queue.
            return Ok(());
        };
        if flight.retransmits != attempt {
            log::debug!("ignoring stale loss report for chunk {seq} attempt {attempt}");
            return Ok(());
        }

        log::debug!("timeout on chunk {seq}");
        self.congestion.on_timeout();
        self.retransmit(seq)
    }

    /// Resend one in-flight chunk, enforcing the retransmission budget.
    fn retransmit(&mut self, seq: u16) -> Result<(), SessionError> {
        let Some(flight) = self.in_flight.get_mut(&seq) else {
            return Ok(());
        };
        if flight.retransmits >= self.max_retx {
            return Err(SessionError::PermanentLoss {
                seq,
                max_retx: self.max_retx,
            });
        }
        flight.retransmits += 1;
        flight.send_time = Instant::now();
        let attempt = flight.retransmits;

        self.retransmissions += 1;
        log::debug!("retransmitting chunk {seq} (attempt {attempt})");
        self.transmit(seq, attempt);
        Ok(())
    }
}
