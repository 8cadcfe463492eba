//! Reliable-channel wrapper around a KCP endpoint.
//!
//! One `ReliableChannel` exists per conversation direction: the client
//! endpoint (we speak, the remote answers) and the server endpoint (the
//! remote speaks, we answer). The endpoint's MTU is pinned to the DNS
//! label budget and every packet KCP emits lands, copied, on the owning
//! side's segment queue, where the DNS adapter picks it up.

use std::io;
use std::time::Instant;

use kcp::{Kcp, KcpResult};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::MTU;

/// Output adapter handed to KCP at construction.
///
/// KCP invokes `write` with a reused internal buffer, so the bytes are
/// copied before they are enqueued. A full queue drops the segment; the
/// ARQ layer retransmits it on a later tick.
pub(crate) struct SegmentSink {
    queue: mpsc::Sender<Vec<u8>>,
}

impl io::Write for SegmentSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !buf.is_empty() {
            match self.queue.try_send(buf.to_vec()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("segment queue full, dropping {} bytes", buf.len());
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("segment queue closed, dropping {} bytes", buf.len());
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reliable sequenced-datagram endpoint.
///
/// All calls must happen under the owning side's mutex; the module's tick
/// task drives `update` roughly every 15 ms.
pub struct ReliableChannel {
    kcp: Kcp<SegmentSink>,
    epoch: Instant,
}

impl ReliableChannel {
    /// Build an endpoint for conversation `conv`, wiring its output to
    /// `queue`. The nodelay profile is fixed: 20 ms internal interval, no
    /// fast resend, congestion window off.
    pub fn new(conv: u32, queue: mpsc::Sender<Vec<u8>>) -> KcpResult<Self> {
        let mut kcp = Kcp::new(conv, SegmentSink { queue });
        kcp.set_mtu(MTU)?;
        kcp.set_nodelay(false, 20, 0, true);
        Ok(Self {
            kcp,
            epoch: Instant::now(),
        })
    }

    fn clock_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    /// Advance timers, flush pending output and retransmissions.
    pub fn update(&mut self) -> KcpResult<()> {
        self.kcp.update(self.clock_ms())
    }

    /// Feed one packet received from the wire into the endpoint.
    pub fn input(&mut self, data: &[u8]) -> KcpResult<()> {
        self.kcp.input(data).map(|_| ())
    }

    /// Queue one user message for reliable delivery.
    pub fn send(&mut self, data: &[u8]) -> KcpResult<()> {
        self.kcp.send(data).map(|_| ())
    }

    /// Size of the next reassembled message, 0 when nothing is pending.
    pub fn peek_size(&self) -> usize {
        self.kcp.peeksize().unwrap_or(0)
    }

    /// Push pending output and ACKs out through the sink immediately,
    /// without waiting for the next timer interval.
    pub fn flush(&mut self) -> KcpResult<()> {
        self.kcp.flush()
    }

    /// Drain one reassembled user message into `buf`.
    ///
    /// Returns `Ok(0)` when nothing is ready — including while a
    /// fragmented message is still reassembling — mirroring a
    /// non-blocking read.
    pub fn recv(&mut self, buf: &mut [u8]) -> KcpResult<usize> {
        match self.kcp.recv(buf) {
            Ok(n) => Ok(n),
            Err(kcp::Error::RecvQueueEmpty) | Err(kcp::Error::ExpectingFragment) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MAX_MSG_SIZE;

    /// Shuttle every queued segment from `from`'s output into `to`.
    async fn pump(
        rx: &mut mpsc::Receiver<Vec<u8>>,
        to: &mut ReliableChannel,
    ) -> usize {
        let mut moved = 0;
        while let Ok(segment) = rx.try_recv() {
            assert!(segment.len() <= MTU, "segment exceeds mtu: {}", segment.len());
            to.input(&segment).unwrap();
            moved += 1;
        }
        moved
    }

    #[tokio::test]
    async fn message_crosses_two_endpoints() {
        let (tx_a, mut rx_a) = mpsc::channel(200);
        let (tx_b, mut rx_b) = mpsc::channel(200);
        let mut a = ReliableChannel::new(0x11223344, tx_a).unwrap();
        let mut b = ReliableChannel::new(0x11223344, tx_b).unwrap();

        let message = b"reliable across an unreliable carrier";
        a.send(message).unwrap();
        a.update().unwrap();

        assert!(pump(&mut rx_a, &mut b).await > 0);
        b.update().unwrap();

        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], message);

        // the ACKs flow back without surfacing as user data
        pump(&mut rx_b, &mut a).await;
        a.update().unwrap();
        assert_eq!(a.recv(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn large_message_fragments_to_mtu() {
        let (tx_a, mut rx_a) = mpsc::channel(200);
        let (tx_b, _rx_b) = mpsc::channel(200);
        let mut a = ReliableChannel::new(7, tx_a).unwrap();
        let mut b = ReliableChannel::new(7, tx_b).unwrap();

        let message = vec![0xA5u8; 1000];
        a.send(&message).unwrap();
        a.update().unwrap();

        assert!(pump(&mut rx_a, &mut b).await > 1);
        b.update().unwrap();

        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let n = b.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &message[..]);
    }

    #[tokio::test]
    async fn retransmission_survives_packet_loss() {
        let (tx_a, mut rx_a) = mpsc::channel(200);
        let (tx_b, mut rx_b) = mpsc::channel(200);
        let mut a = ReliableChannel::new(9, tx_a).unwrap();
        let mut b = ReliableChannel::new(9, tx_b).unwrap();

        let message = vec![0x3Cu8; 600];
        a.send(&message).unwrap();

        let mut buf = vec![0u8; MAX_MSG_SIZE];
        let mut drop_forward = false;
        let mut drop_backward = true;
        for _ in 0..400 {
            a.update().unwrap();
            b.update().unwrap();
            while let Ok(segment) = rx_a.try_recv() {
                drop_forward = !drop_forward;
                if drop_forward {
                    continue; // the carrier ate this one
                }
                b.input(&segment).unwrap();
            }
            while let Ok(segment) = rx_b.try_recv() {
                drop_backward = !drop_backward;
                if drop_backward {
                    continue;
                }
                a.input(&segment).unwrap();
            }
            let n = b.recv(&mut buf).unwrap();
            if n > 0 {
                assert_eq!(&buf[..n], &message[..]);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("message never arrived through the lossy carrier");
    }

    #[tokio::test]
    async fn recv_is_empty_before_input() {
        let (tx, _rx) = mpsc::channel(200);
        let mut ch = ReliableChannel::new(1, tx).unwrap();
        let mut buf = vec![0u8; MAX_MSG_SIZE];
        assert_eq!(ch.recv(&mut buf).unwrap(), 0);
    }
}
