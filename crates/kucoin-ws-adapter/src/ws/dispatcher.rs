/*
[INPUT]:  Decoded inbound frames of the current connection
[OUTPUT]: Routing decisions (bookkeeping vs. subscriber delivery) and the PendingAck table
[POS]:    WebSocket layer - protocol state machine for request/ack correlation
[UPDATE]: When adding frame kinds or changing ack correlation
*/

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::http::{Result, WsError};
use crate::ws::message::{MessageType, WsMessage};

/// Caller waiting for a subscribe ack
#[derive(Debug)]
pub(crate) struct Waiter {
    pub subscription_id: String,
    pub reply: oneshot::Sender<Result<String>>,
}

impl Waiter {
    pub(crate) fn resolve(self, outcome: Result<String>) {
        if self.reply.send(outcome).is_err() {
            debug!(subscription_id = %self.subscription_id, "subscribe caller went away");
        }
    }
}

#[derive(Debug)]
pub(crate) enum AckKind {
    Subscribe {
        topic: String,
        /// Sent while resynchronizing after a reconnect
        replay: bool,
    },
    Unsubscribe {
        topic: String,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
}

impl AckKind {
    pub(crate) fn topic(&self) -> &str {
        match self {
            AckKind::Subscribe { topic, .. } | AckKind::Unsubscribe { topic, .. } => topic,
        }
    }
}

/// An in-flight subscribe/unsubscribe request
#[derive(Debug)]
pub(crate) struct PendingAck {
    pub request_id: String,
    pub kind: AckKind,
    pub deadline: Instant,
    pub waiters: Vec<Waiter>,
}

/// Outstanding requests keyed by request id; each entry leaves exactly once
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    entries: HashMap<String, PendingAck>,
}

impl PendingAcks {
    pub(crate) fn insert(&mut self, ack: PendingAck) {
        self.entries.insert(ack.request_id.clone(), ack);
    }

    pub(crate) fn take(&mut self, request_id: &str) -> Option<PendingAck> {
        self.entries.remove(request_id)
    }

    /// Attach another caller to an outstanding subscribe
    pub(crate) fn attach(&mut self, request_id: &str, waiter: Waiter) -> std::result::Result<(), Waiter> {
        match self.entries.get_mut(request_id) {
            Some(ack) => {
                ack.waiters.push(waiter);
                Ok(())
            }
            None => Err(waiter),
        }
    }

    /// Remove and return every entry whose deadline has passed
    pub(crate) fn expire(&mut self, now: Instant) -> Vec<PendingAck> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, ack)| ack.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<PendingAck> {
        self.entries.drain().map(|(_, ack)| ack).collect()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|ack| ack.deadline).min()
    }
}

/// What the engine must do with one inbound frame
#[derive(Debug)]
pub(crate) enum Route {
    Welcome,
    /// Server-initiated ping, answer with a pong carrying the same id
    Ping { id: Option<String> },
    Pong { id: Option<String> },
    Ack(PendingAck),
    /// Error frame matching an outstanding request
    Rejected {
        ack: PendingAck,
        code: String,
        message: String,
    },
    /// Error frame nobody is waiting for
    ServerError { code: String, message: String },
    Message {
        topic: String,
        subject: String,
        sn: Option<u64>,
        data: serde_json::Value,
    },
    /// Ack or error for a request that already timed out or belongs to an old connection
    Late { id: Option<String> },
    Ignored(MessageType),
}

/// Classify a frame, resolving it against the PendingAck table
pub(crate) fn route(frame: WsMessage, pending: &mut PendingAcks) -> Route {
    match frame.kind {
        MessageType::Welcome => Route::Welcome,
        MessageType::Ping => Route::Ping { id: frame.id },
        MessageType::Pong => Route::Pong { id: frame.id },
        MessageType::Ack => match frame.id.as_deref().and_then(|id| pending.take(id)) {
            Some(ack) => Route::Ack(ack),
            None => Route::Late { id: frame.id },
        },
        MessageType::Error => {
            let (code, message) = frame.error_detail();
            match frame.id.as_deref().and_then(|id| pending.take(id)) {
                Some(ack) => Route::Rejected { ack, code, message },
                None => Route::ServerError { code, message },
            }
        }
        MessageType::Message => match frame.topic {
            Some(topic) => Route::Message {
                topic,
                subject: frame.subject.unwrap_or_default(),
                sn: frame.sn,
                data: frame.data.unwrap_or(serde_json::Value::Null),
            },
            None => Route::Ignored(MessageType::Message),
        },
        kind => Route::Ignored(kind),
    }
}

/// Build the error delivered to callers of a rejected request
pub(crate) fn server_error(code: &str, message: &str) -> WsError {
    WsError::Server {
        code: code.to_string(),
        message: message.to_string(),
    }
}
