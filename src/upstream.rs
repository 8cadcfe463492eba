//! Client direction: from this module outbound to a remote listener.
//!
//! The DNS conversation is strictly request/response, so the remote can
//! never push. While the client runs, the feed loop keeps one query in
//! the air at all times — a data query when a segment is waiting,
//! otherwise an MX probe for `mail.` that exists only to give the server
//! a reply to hang its own segments on.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use log::{debug, error, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::timeout;

use crate::api::RemoteResponse;
use crate::dotify::{dotify, undotify};
use crate::module::Module;
use crate::{TransportError, MAX_MSG_SIZE};

/// Budget for one full DNS exchange, send to receive.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(4);

/// QNAME of the keep-alive probe. The probe is the only query whose name
/// carries no payload.
pub(crate) const PROBE_QNAME: &str = "mail.";

impl Module {
    /// Send one outbound segment as a DNS query — or, when the queue is
    /// idle and `send_empty` is set, the probe — then feed whatever rode
    /// back in the answer records into the client endpoint.
    ///
    /// Returns `false` once the queue is empty and probes are disabled;
    /// the shutdown flush uses that as its done signal.
    pub(crate) async fn feed_upstream(&self, send_empty: bool) -> bool {
        let segment = self.inner.upstream_rx.lock().await.try_recv().ok();

        let mut request = Message::new();
        request
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);

        match &segment {
            Some(bytes) => {
                let label = match dotify(bytes) {
                    Ok(label) => label,
                    Err(e) => {
                        error!("cannot encode outbound segment: {e}");
                        return false;
                    }
                };
                let qname = match Name::from_ascii(&label) {
                    Ok(name) => name,
                    Err(e) => {
                        error!("encoded segment does not form a dns name: {e}");
                        return false;
                    }
                };
                request.add_query(Query::query(qname, RecordType::CNAME));
                self.inner.client_metrics.raw_out(bytes.len());
            }
            None => {
                if !send_empty {
                    return false;
                }
                let qname = Name::from_ascii(PROBE_QNAME).expect("static probe name");
                request.add_query(Query::query(qname, RecordType::MX));
            }
        }

        match self.dns_exchange(&request).await {
            Ok(reply) => {
                for answer in reply.answers() {
                    match undotify(&answer.name().to_ascii()) {
                        Ok(data) => {
                            self.inner.client_metrics.raw_in(data.len());
                            if let Some(endpoint) = self.client_endpoint() {
                                let mut channel = endpoint.lock().await;
                                if let Err(e) = channel.input(&data) {
                                    warn!("client endpoint rejected segment: {e}");
                                }
                            }
                        }
                        Err(e) => warn!("skipping answer with undecodable name: {e}"),
                    }
                }
            }
            Err(e) => warn!("dns exchange with {} failed: {e}", self.upstream_str()),
        }

        self.inner.debounced_client_update.trigger();
        true
    }

    /// One query/answer exchange with the upstream server over a fresh
    /// connected socket.
    async fn dns_exchange(&self, request: &Message) -> Result<Message, TransportError> {
        let upstream = self.upstream_str();
        let server: SocketAddr = upstream
            .parse()
            .map_err(|e| TransportError::DnsExchange(format!("bad upstream {upstream}: {e}")))?;
        let wire = request
            .to_vec()
            .map_err(|e| TransportError::DnsExchange(e.to_string()))?;

        let reply = timeout(EXCHANGE_TIMEOUT, async {
            let socket = UdpSocket::bind(local_bind_addr(&server))
                .await
                .map_err(|e| TransportError::DnsExchange(e.to_string()))?;
            socket
                .connect(server)
                .await
                .map_err(|e| TransportError::DnsExchange(e.to_string()))?;
            socket
                .send(&wire)
                .await
                .map_err(|e| TransportError::DnsExchange(e.to_string()))?;
            let mut buf = vec![0u8; 4096];
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| TransportError::DnsExchange(e.to_string()))?;
            Message::from_vec(&buf[..n]).map_err(|e| TransportError::DnsExchange(e.to_string()))
        })
        .await
        .map_err(|_| TransportError::DnsExchange("exchange timed out".to_string()))??;

        if reply.id() != request.id() {
            return Err(TransportError::DnsExchange(
                "transaction id mismatch".to_string(),
            ));
        }
        Ok(reply)
    }

    /// Drain the client endpoint's receive side into the response inbox.
    pub(crate) async fn client_update(&self) {
        let Some(endpoint) = self.client_endpoint() else {
            return;
        };
        let mut buffer = vec![0u8; MAX_MSG_SIZE];
        let received = {
            let mut channel = endpoint.lock().await;
            // oversize messages are tolerated, not truncated
            let pending = channel.peek_size();
            if pending > buffer.len() {
                buffer.resize(pending, 0);
            }
            channel.recv(&mut buffer)
        };
        let n = match received {
            Ok(n) => n,
            Err(e) => {
                warn!("client endpoint recv: {e}");
                return;
            }
        };
        if n == 0 {
            return;
        }

        let response = match RemoteResponse::from_bytes(&buffer[..n]) {
            Ok(response) => response,
            Err(e) => {
                warn!("rpc response decode failed: {e}");
                return;
            }
        };
        self.inner.client_metrics.recv(n);
        debug!("response arrived, err={}", response.is_err());

        match self.inner.resp_tx.try_send(response) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                // a full inbox means overlapping calls on one module,
                // which the single-consumer design does not support
                error!("response inbox full");
                panic!("response inbox full: overlapping rpc calls on a single module");
            }
            Err(TrySendError::Closed(_)) => warn!("response inbox closed"),
        }
    }
}

/// Pick a local bind address in the server's family, staying on loopback
/// for loopback peers so the exchange works without a default route.
fn local_bind_addr(server: &SocketAddr) -> SocketAddr {
    let ip: IpAddr = match server.ip() {
        IpAddr::V4(v4) if v4.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addr_tracks_server_family() {
        let loopback: SocketAddr = "127.0.0.1:53".parse().unwrap();
        assert_eq!(local_bind_addr(&loopback).ip(), Ipv4Addr::LOCALHOST);

        let remote: SocketAddr = "192.0.2.7:53".parse().unwrap();
        assert_eq!(local_bind_addr(&remote).ip(), Ipv4Addr::UNSPECIFIED);

        let v6: SocketAddr = "[::1]:53".parse().unwrap();
        assert_eq!(local_bind_addr(&v6).ip(), Ipv6Addr::LOCALHOST);
    }

    #[test]
    fn probe_name_is_a_valid_fqdn() {
        let name = Name::from_ascii(PROBE_QNAME).unwrap();
        assert!(name.is_fqdn());
        assert_eq!(name.to_ascii(), PROBE_QNAME);
    }
}
