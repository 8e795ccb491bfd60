use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::cache::{fingerprint, ResponseCache};
use crate::policy::{Entry, Policy};
use crate::singleflight::SingleFlight;
use crate::upstream::{Transaction, UpstreamClient, ATTEMPT_TIMEOUT};

/// Payload size advertised in the OPT record of upstream queries.
const EDNS_PAYLOAD: u16 = 4096;

/// The per-request state machine: cache, then policy, then either a local
/// answer or a single-flight upstream fetch.
#[derive(Clone)]
pub struct Engine {
    policy: Arc<Policy>,
    cache: Arc<ResponseCache>,
    upstream: Arc<UpstreamClient>,
    flights: Arc<SingleFlight>,
}

impl Engine {
    pub fn new(policy: Arc<Policy>, cache: Arc<ResponseCache>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            policy,
            cache,
            upstream,
            flights: Arc::new(SingleFlight::new()),
        }
    }

    /// Decode, dispatch, encode. `None` means nothing goes back downstream
    /// and the client is left to retry.
    pub async fn handle_packet(&self, packet: &[u8]) -> Option<Bytes> {
        let req = Message::from_bytes(packet).ok()?;
        let resp = self.handle_query(req).await?;
        match resp.to_vec() {
            Ok(buf) => Some(Bytes::from(buf)),
            Err(err) => {
                warn!(event = "encode_response", error = %err, "response encoding failed");
                None
            }
        }
    }

    pub async fn handle_query(&self, req: Message) -> Option<Message> {
        // only queries with at least one question are served
        if req.message_type() != MessageType::Query || req.queries().is_empty() {
            return None;
        }
        let start = Instant::now();

        if let Some(mut hit) = self.cache.get(&req) {
            hit.set_id(req.id());
            debug!(
                event = "dns_response",
                qname = %req.queries()[0].name(),
                source = "cache",
                latency_ms = start.elapsed().as_millis() as u64,
                "cache hit"
            );
            return Some(hit);
        }

        let qname = req.queries()[0].name().to_lowercase().to_string();
        let entry = self.policy.find(&qname);
        if self.policy.is_disabled(&entry) {
            info!(event = "refused", qname = %qname, "disabled prefix");
            return Some(server_failure(&req));
        }
        if let Some(resp) = entry.answer_static(&req) {
            debug!(event = "dns_response", qname = %qname, source = "static", "local zone answer");
            return Some(resp);
        }

        let key = fingerprint(&req)?;
        let question = req.queries()[0].clone();
        let (result, original) = self
            .flights
            .call(key, self.fetch_upstream(entry, question))
            .await;

        match result {
            Some(mut msg) => {
                // followers share the original's value and must not re-cache;
                // synthetic (question-less) results are not cacheable either
                if original && !msg.queries().is_empty() {
                    self.cache.set(&msg, 0);
                }
                msg.set_id(req.id());
                Some(msg)
            }
            None => {
                info!(
                    event = "no_response",
                    qname = %qname,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "all backends exhausted"
                );
                None
            }
        }
    }

    /// Build the upstream request and walk the entry's backends in order.
    /// Every attempt shares one capacity-1 result channel, so a slow answer
    /// from an earlier backend can still satisfy a later wait.
    async fn fetch_upstream(&self, entry: Arc<Entry>, question: Query) -> Option<Message> {
        let mut next_req = Message::new();
        next_req.set_id(rand::thread_rng().gen());
        next_req.set_message_type(MessageType::Query);
        next_req.set_op_code(OpCode::Query);
        next_req.set_recursion_desired(true);
        next_req.set_authentic_data(true);
        next_req.add_query(question);
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        next_req.set_edns(edns);

        let (result_tx, mut result_rx) = mpsc::channel(1);
        for be in &entry.backends {
            let tx = Arc::new(Transaction::new(
                next_req.clone(),
                entry.filters.clone(),
                result_tx.clone(),
            ));
            self.upstream.query(be, tx).await;
            match timeout(ATTEMPT_TIMEOUT, result_rx.recv()).await {
                Ok(Some(Some(msg))) => return Some(msg),
                // answer filtered away, or the channel somehow closed
                Ok(Some(None)) => continue,
                Ok(None) => return None,
                // timed out, next backend
                Err(_) => continue,
            }
        }
        None
    }
}

fn server_failure(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_response_code(ResponseCode::ServFail);
    for q in req.queries() {
        resp.add_query(q.clone());
    }
    resp
}
