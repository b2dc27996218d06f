//! Packet transport for framed voice payloads
//!
//! Outbound sends are fire-and-forget and never block the capture thread.
//! Inbound datagrams are handed to the jitter buffer by a delivery task.
//! Loss, duplication and reordering are all expected; nothing here retries.

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::voice::jitter::{InsertOutcome, SharedJitterBuffer};

/// Largest datagram the receive loop accepts
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// Outbound half of a transport
pub trait Transport: Send + Sync + 'static {
    type Destination: Clone + Send + Sync + Debug + 'static;

    /// Hand one framed payload to the network. Must not block.
    fn send(&self, destination: &Self::Destination, frame: Bytes) -> Result<(), TransportError>;
}

/// Inbound half of a transport: feeds the jitter buffer until cancelled
pub trait Delivery: Send + 'static {
    /// Returns the number of datagrams delivered
    fn deliver_into(
        self,
        buffer: Arc<SharedJitterBuffer>,
        cancel: CancellationToken,
    ) -> impl Future<Output = u64> + Send;
}

fn deliver_datagram(buffer: &SharedJitterBuffer, datagram: &[u8]) {
    match buffer.deliver(datagram) {
        Ok(InsertOutcome::Appended | InsertOutcome::Reordered) => {}
        Ok(outcome) => trace!("Inbound frame dropped: {:?}", outcome),
        Err(e) => debug!("Discarding malformed datagram: {}", e),
    }
}

/// UDP socket shared between the send path and the receive loop
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("Voice transport bound to {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Wrap an already-bound socket
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive side sharing this socket
    pub fn inbound(&self) -> UdpInbound {
        UdpInbound {
            socket: Arc::clone(&self.socket),
        }
    }
}

impl Transport for UdpTransport {
    type Destination = SocketAddr;

    fn send(&self, destination: &SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        // A full socket buffer is just another lost frame
        self.socket.try_send_to(&frame, *destination)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct UdpInbound {
    socket: Arc<UdpSocket>,
}

impl Delivery for UdpInbound {
    async fn deliver_into(self, buffer: Arc<SharedJitterBuffer>, cancel: CancellationToken) -> u64 {
        let mut buf = [0u8; MAX_DATAGRAM];
        let mut delivered = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("UDP delivery cancelled after {} datagrams", delivered);
                    return delivered;
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        if delivered == 0 {
                            info!("First voice datagram from {}", from);
                        }
                        delivered += 1;
                        deliver_datagram(&buffer, &buf[..len]);
                    }
                    // ICMP unreachable surfaces here on some platforms
                    Err(e) => warn!("UDP receive error: {}", e),
                },
            }
        }
    }
}

/// Network impairments applied by [`LoopbackTransport`], as probabilities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Impairment {
    pub loss: f64,
    pub duplicate: f64,
    pub reorder: f64,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Impairment {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_clean(&self) -> bool {
        self.loss <= 0.0 && self.duplicate <= 0.0 && self.reorder <= 0.0
    }
}

#[derive(Debug)]
struct ImpairmentState {
    impairment: Impairment,
    rng: StdRng,
    /// Frame held back to be released after the next one
    held: Option<Bytes>,
}

impl ImpairmentState {
    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }

    /// Frames to put on the wire, in order, for one send
    fn apply(&mut self, frame: Bytes) -> Vec<Bytes> {
        if self.roll(self.impairment.loss) {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(3);
        if self.held.is_none() && self.roll(self.impairment.reorder) {
            self.held = Some(frame);
            return out;
        }

        out.push(frame.clone());
        if self.roll(self.impairment.duplicate) {
            out.push(frame);
        }
        if let Some(held) = self.held.take() {
            out.push(held);
        }
        out
    }
}

/// In-process transport for local testing and demos
#[derive(Debug)]
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    state: Mutex<ImpairmentState>,
}

/// Receive side of a [`LoopbackTransport`]
#[derive(Debug)]
pub struct LoopbackInbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected loopback pair
pub fn loopback(impairment: Impairment) -> (LoopbackTransport, LoopbackInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let rng = match impairment.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    if !impairment.is_clean() {
        info!(
            "Loopback impairment: loss={:.2} duplicate={:.2} reorder={:.2}",
            impairment.loss, impairment.duplicate, impairment.reorder
        );
    }
    (
        LoopbackTransport {
            tx,
            state: Mutex::new(ImpairmentState {
                impairment,
                rng,
                held: None,
            }),
        },
        LoopbackInbox { rx },
    )
}

impl Transport for LoopbackTransport {
    type Destination = ();

    fn send(&self, _destination: &(), frame: Bytes) -> Result<(), TransportError> {
        let frames = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(frame);
        for frame in frames {
            self.tx.send(frame).map_err(|_| TransportError::Closed)?;
        }
        Ok(())
    }
}

impl LoopbackInbox {
    /// Next frame without waiting, for tests
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

impl Delivery for LoopbackInbox {
    async fn deliver_into(mut self, buffer: Arc<SharedJitterBuffer>, cancel: CancellationToken) -> u64 {
        let mut delivered = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return delivered,
                frame = self.rx.recv() => match frame {
                    Some(frame) => {
                        delivered += 1;
                        deliver_datagram(&buffer, &frame);
                    }
                    None => {
                        debug!("Loopback sender dropped after {} frames", delivered);
                        return delivered;
                    }
                },
            }
        }
    }
}
