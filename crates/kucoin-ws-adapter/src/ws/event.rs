/*
[INPUT]:  Engine lifecycle transitions
[OUTPUT]: WsEvent notifications on a broadcast channel
[POS]:    WebSocket layer - observable lifecycle events
[UPDATE]: When adding lifecycle transitions worth surfacing to callers
*/

use tokio::sync::broadcast;
use tracing::trace;

pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle notifications emitted by an engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    /// Connection established (initial or after reconnect)
    Connected,
    /// Current connection went away
    Disconnected { reason: String },
    /// About to try reconnect attempt number `attempt` (1-based)
    TryReconnect { attempt: u32 },
    /// Server error frame with no matching request, or a protocol error
    ErrorReceived { message: String },
    /// A subscription callback returned an error or panicked
    CallbackError { subscription_id: String, message: String },
    /// A topic was subscribed again on a new connection
    ResubscribeOk { topic: String },
    /// A topic could not be subscribed again; its subscriptions were dropped
    ResubscribeError { topic: String, message: String },
    /// Fatal failure, the engine is closed
    ClientFail { message: String },
    /// Engine stopped on request
    ClientShutdown,
}

/// Sending half shared by the engine worker and delivery tasks
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<WsEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WsEvent> {
        self.tx.subscribe()
    }

    /// Publish without blocking; no receivers is not an error
    pub(crate) fn emit(&self, event: WsEvent) {
        if self.tx.send(event).is_err() {
            trace!("ws event dropped, no listeners");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_all_listeners() {
        let sink = EventSink::new();
        let mut first = sink.subscribe();
        let mut second = sink.subscribe();

        sink.emit(WsEvent::Connected);

        assert_eq!(first.recv().await.unwrap(), WsEvent::Connected);
        assert_eq!(second.recv().await.unwrap(), WsEvent::Connected);
    }

    #[test]
    fn test_emit_without_listeners_is_silent() {
        let sink = EventSink::new();
        sink.emit(WsEvent::ClientShutdown);
    }
}
