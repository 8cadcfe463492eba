//! Server direction: from this listener outbound to a remote client.
//!
//! Incoming questions feed the server endpoint; queued outbound segments
//! ride back as answer records. A reply holds the line briefly when
//! nothing is ready, so a response produced moments after the query
//! arrives still catches the same exchange.

use std::sync::atomic::Ordering;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::{debug, error, warn};
use tokio::time::timeout;

use crate::api::{RemoteCall, RemoteResponse};
use crate::dotify::{dotify, undotify};
use crate::module::Module;
use crate::upstream::PROBE_QNAME;
use crate::{MAX_MSG_SIZE, MTU};

/// How long a reply waits for the first outbound segment before going
/// out empty.
const FIRST_SEGMENT_WAIT: Duration = Duration::from_secs(3);

/// Hard cap on a reply's wire size.
const MAX_REPLY_LEN: usize = 512;

/// Per-answer budget: base32 expansion of an MTU-sized segment plus
/// per-record overhead.
const MAX_ANSWER_LEN: usize = (MTU * 8).div_ceil(5) + 15;

/// Most answers one reply will carry.
const MAX_ANSWERS: usize = 10;

impl Module {
    /// Build the reply to one incoming query message.
    pub(crate) async fn handle_dns(&self, request: &Message) -> Message {
        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.recursion_desired())
            .set_response_code(ResponseCode::NoError);

        for question in request.queries() {
            if question.query_type() == RecordType::MX {
                debug!("probe query, nothing to ingest");
                continue;
            }
            match undotify(&question.name().to_ascii()) {
                Ok(data) => {
                    self.inner.server_metrics.raw_in(data.len());
                    if let Some(endpoint) = self.server_endpoint() {
                        let mut channel = endpoint.lock().await;
                        if let Err(e) = channel.input(&data) {
                            warn!("server endpoint rejected segment: {e}");
                        }
                    }
                }
                Err(e) => error!("skipping question with undecodable name: {e}"),
            }
        }

        // scrub the original name to save reply bytes; the client pairs
        // replies by transaction id alone
        let original_qtype = request
            .queries()
            .first()
            .map(|q| q.query_type())
            .unwrap_or(RecordType::MX);
        reply.add_query(Query::query(
            Name::from_ascii(PROBE_QNAME).expect("static probe name"),
            original_qtype,
        ));

        let first = timeout(FIRST_SEGMENT_WAIT, async {
            self.inner.downstream_rx.lock().await.recv().await
        })
        .await;

        if let Ok(Some(segment)) = first {
            self.push_answer(&mut reply, &segment);

            // opportunistically piggyback a few more, within the budget;
            // in practice this grabs one or two
            for _ in 1..MAX_ANSWERS {
                let used = reply
                    .to_vec()
                    .map(|wire| wire.len())
                    .unwrap_or(MAX_REPLY_LEN);
                if MAX_REPLY_LEN.saturating_sub(used) < MAX_ANSWER_LEN {
                    break;
                }
                let Ok(segment) = self.inner.downstream_rx.lock().await.try_recv() else {
                    break;
                };
                self.push_answer(&mut reply, &segment);
            }
        }

        debug!("reply packed {} answers", reply.answers().len());
        reply
    }

    /// Attach one segment to the reply as a type-A record. The address is
    /// filler; the payload lives entirely in the record name.
    fn push_answer(&self, reply: &mut Message, segment: &[u8]) {
        let label = match dotify(segment) {
            Ok(label) => label,
            Err(e) => {
                error!("dropping outbound segment: {e}");
                return;
            }
        };
        let name = match Name::from_ascii(&label) {
            Ok(name) => name,
            Err(e) => {
                error!("dropping outbound segment: {e}");
                return;
            }
        };
        reply.add_answer(Record::from_rdata(name, 0, RData::A(A::new(192, 168, 1, 1))));
        self.inner.server_metrics.raw_out(segment.len());
    }

    /// Drain one decoded call from the server endpoint, dispatch it into
    /// the node, and queue the response for the trip back.
    pub(crate) async fn server_update(&self) {
        let Some(endpoint) = self.server_endpoint() else {
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
                warn!("server endpoint recv: {e}");
                return;
            }
        };
        if n == 0 {
            return;
        }

        let call = match RemoteCall::from_bytes(&buffer[..n]) {
            Ok(call) => call,
            Err(e) => {
                warn!("rpc call decode failed: {e}");
                return;
            }
        };
        self.inner.server_metrics.recv(n);
        debug!("dispatching {:?} with {} args", call.action, call.args.len());

        let result = if self.inner.admin_mode.load(Ordering::SeqCst) {
            self.inner.node.admin_rpc(self, call).await
        } else {
            self.inner.node.public_rpc(self, call).await
        };

        let response = match result {
            Ok(value) => RemoteResponse {
                error: String::new(),
                value,
            },
            Err(e) => RemoteResponse {
                error: e.to_string(),
                value: None,
            },
        };

        let wire = response.to_bytes();
        let mut channel = endpoint.lock().await;
        match channel.send(&wire) {
            Ok(()) => self.inner.server_metrics.sent(wire.len()),
            Err(e) => warn!("queueing response failed: {e}"),
        }
    }
}
