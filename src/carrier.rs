//! DNS carrier
//!
//! Moves tunnel queries and acknowledgment answers over TCP DNS
//! (RFC 1035 length-prefixed messages). TCP keeps each query paired
//! with its answer and ordered, which matters because the answer
//! carries reliability state the sender must not miss; the sender opens
//! one connection per query so the carrier itself holds no state.
//!
//! The sender talks through the [`AckTransport`] trait so tests can
//! substitute an in-process carrier with scripted loss.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

use crate::dns;
use crate::receiver::Receiver;

#[derive(Error, Debug)]
pub enum CarrierError {
    /// No answer within the per-query timeout.
    #[error("query timed out")]
    Timeout,

    /// The peer closed the connection before answering.
    #[error("connection closed before an answer arrived")]
    Closed,

    /// The answer did not match the query.
    #[error("answer id {got:#06x} does not match query id {sent:#06x}")]
    IdMismatch { sent: u16, got: u16 },

    #[error("dns: {0}")]
    Dns(#[from] dns::DnsError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// One query/answer exchange with the tunnel server.
#[async_trait]
pub trait AckTransport: Send + Sync {
    async fn exchange(&self, qname: &str) -> Result<Ipv4Addr, CarrierError>;
}

/// Sender-side carrier: one TCP DNS query per call.
pub struct DnsCarrier {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsCarrier {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    async fn exchange_inner(&self, qname: &str) -> Result<Ipv4Addr, CarrierError> {
        let mut stream = TcpStream::connect(self.server).await?;

        let id = rand::random::<u16>();
        let query = dns::build_query(id, qname)?;
        dns::write_message(&mut stream, &query).await?;

        let answer = dns::read_message(&mut stream)
            .await?
            .ok_or(CarrierError::Closed)?;
        let (answer_id, addr) = dns::parse_answer(&answer)?;
        if answer_id != id {
            return Err(CarrierError::IdMismatch {
                sent: id,
                got: answer_id,
            });
        }

        log::debug!("query {qname} answered {addr}");
        Ok(addr)
    }
}

#[async_trait]
impl AckTransport for DnsCarrier {
    async fn exchange(&self, qname: &str) -> Result<Ipv4Addr, CarrierError> {
        match tokio::time::timeout(self.timeout, self.exchange_inner(qname)).await {
            Ok(result) => result,
            Err(_) => Err(CarrierError::Timeout),
        }
    }
}

/// Receiver-side carrier: accepts TCP DNS connections and dispatches
/// tunnel-domain queries to the reliability layer. Anything else is
/// answered NXDOMAIN so a probing resolver sees a conventional server.
pub struct DnsServer {
    listener: TcpListener,
    receiver: Arc<Receiver>,
}

impl DnsServer {
    pub async fn bind(addr: SocketAddr, receiver: Arc<Receiver>) -> Result<Self, CarrierError> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("tunnel server listening on tcp {}", listener.local_addr()?);
        Ok(Self { listener, receiver })
    }

    /// Actual bound address; useful when configured with port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, CarrierError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Runs until the surrounding task is dropped.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let receiver = Arc::clone(&self.receiver);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, receiver).await {
                            log::debug!("connection from {peer} ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    log::warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Answer framed queries on one connection until the client closes it.
async fn serve_connection(
    mut stream: TcpStream,
    receiver: Arc<Receiver>,
) -> Result<(), CarrierError> {
    while let Some(query) = dns::read_message(&mut stream).await? {
        let (id, qname) = match dns::parse_query(&query) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Not even DNS-shaped; nothing useful to answer.
                log::debug!("dropping unparseable message: {e}");
                continue;
            }
        };

        let reply = if receiver.matches_domain(&qname) {
            let ack = receiver.handle_query(&qname).await;
            dns::build_answer(id, &qname, ack)?
        } else {
            log::debug!("non-tunnel query for {qname:?}");
            dns::build_nxdomain(id, &qname)?
        };
        dns::write_message(&mut stream, &reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ack_to_addr, LabelCodec, RESET_ACK};
    use crate::crypto::ChunkCipher;

    const DOMAIN: &str = "t.example.com";
    const KEY: [u8; 32] = [0x24; 32];

    async fn spawn_server() -> (SocketAddr, Arc<Receiver>, tokio::task::JoinHandle<()>) {
        let receiver = Arc::new(Receiver::new(LabelCodec::new(DOMAIN), ChunkCipher::new(&KEY)));
        let server = DnsServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&receiver))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move { server.run().await });
        (addr, receiver, handle)
    }

    #[tokio::test]
    async fn test_exchange_delivers_chunk_and_ack() {
        let (addr, receiver, server) = spawn_server().await;
        let carrier = DnsCarrier::new(addr, Duration::from_secs(2));

        let packet = ChunkCipher::new(&KEY).seal(b"over the wire");
        let qname = LabelCodec::new(DOMAIN).encode(0, &packet.to_bytes()).unwrap();
        let answer = carrier.exchange(&qname).await.unwrap();
        assert_eq!(answer, ack_to_addr(1));
        assert_eq!(receiver.expected_seq().await, 1);

        server.abort();
    }

    #[tokio::test]
    async fn test_reset_over_the_wire() {
        let (addr, _receiver, server) = spawn_server().await;
        let carrier = DnsCarrier::new(addr, Duration::from_secs(2));

        let answer = carrier.exchange("seq-1.t.example.com").await.unwrap();
        assert_eq!(answer, RESET_ACK);

        server.abort();
    }

    #[tokio::test]
    async fn test_foreign_query_gets_no_answer() {
        let (addr, _receiver, server) = spawn_server().await;
        let carrier = DnsCarrier::new(addr, Duration::from_secs(2));

        let result = carrier.exchange("www.example.org").await;
        assert!(matches!(
            result,
            Err(CarrierError::Dns(dns::DnsError::NoAnswer))
        ));

        server.abort();
    }

    #[tokio::test]
    async fn test_timeout_when_nobody_listens() {
        // Bind a listener that never accepts reads, then let it queue the
        // connection: the exchange must give up on its own clock.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let carrier = DnsCarrier::new(addr, Duration::from_millis(200));
        let started = std::time::Instant::now();
        let result = carrier.exchange("seq-1.t.example.com").await;
        assert!(matches!(result, Err(CarrierError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(200));
        drop(listener);
    }
}
