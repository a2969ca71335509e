//! Authoritative DNS over UDP, answered from the local copy of the store.

use std::io;
use std::sync::Arc;

use dnsraft_storage::{Shutdown, Store};
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::Record;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::zone::{record_key, ZoneRecord};

/// Largest datagram we accept.
const MAX_PACKET: usize = 4096;

/// Stateless query handler; every answer comes from `Store::get`, so any
/// node can serve queries regardless of leadership.
pub struct DnsHandler {
    store: Arc<Store>,
}

impl DnsHandler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Decodes a query packet and encodes the answer. Packets too short to
    /// carry a message id get no reply.
    pub fn handle_packet(&self, packet: &[u8]) -> Option<Vec<u8>> {
        let response = match Message::from_vec(packet) {
            Ok(request) => self.answer(&request),
            Err(err) => {
                debug!(error = %err, "malformed DNS query");
                if packet.len() < 2 {
                    return None;
                }
                let mut response = Message::new();
                response
                    .set_id(u16::from_be_bytes([packet[0], packet[1]]))
                    .set_message_type(MessageType::Response)
                    .set_authoritative(true)
                    .set_response_code(ResponseCode::FormErr);
                response
            }
        };
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "failed to encode DNS response");
                None
            }
        }
    }

    pub fn answer(&self, request: &Message) -> Message {
        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .set_authoritative(true);
        response.add_queries(request.queries().iter().cloned());

        if request.message_type() != MessageType::Query {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        }
        if request.op_code() != OpCode::Query {
            response.set_response_code(ResponseCode::NotImp);
            return response;
        }
        let Some(question) = request.queries().first() else {
            response.set_response_code(ResponseCode::FormErr);
            return response;
        };

        let key = record_key(&question.name().to_ascii(), question.query_type());
        if let Some(record) = self.lookup(&key) {
            response.add_answer(record);
        }
        response
    }

    fn lookup(&self, key: &str) -> Option<Record> {
        let text = self.store.get(key)?;
        match ZoneRecord::from_text(&text).and_then(|r| r.to_record()) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(key = %key, error = %err, "stored record is not valid");
                None
            }
        }
    }
}

/// Answers queries on `socket` until `cancel` fires.
pub async fn serve_udp(
    socket: UdpSocket,
    handler: Arc<DnsHandler>,
    cancel: Shutdown,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let (len, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };
        if let Some(reply) = handler.handle_packet(&buf[..len]) {
            if let Err(err) = socket.send_to(&reply, peer).await {
                debug!(peer = %peer, error = %err, "failed to send DNS reply");
            }
        }
    }
}
