/*
[INPUT]:  Caller subscriptions (topic + handler) and inbound push messages
[OUTPUT]: Topic-level wire dedup decisions and per-subscription delivery
[POS]:    WebSocket layer - subscription registry and fan-out
[UPDATE]: When changing dedup rules, delivery queues or replay semantics
*/

use std::collections::{BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::http::WsError;
use crate::ws::event::{EventSink, WsEvent};
use crate::ws::handler::SubscriptionHandler;
use crate::ws::message::TopicMessage;

/// Item queued for one subscription's delivery task
#[derive(Debug)]
pub(crate) enum Delivery {
    Message(TopicMessage),
    Error(Arc<WsError>),
}

/// Wire status of a topic on the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WireState {
    /// Desired but not on the wire (new topic while disconnected, or after a drop)
    Idle,
    /// Subscribe frame sent with this request id, ack outstanding
    Pending(String),
    Subscribed,
}

pub(crate) struct Subscription {
    pub topic: String,
    pub private_channel: bool,
    queue: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
pub(crate) struct TopicEntry {
    pub private_channel: bool,
    pub subscriber_ids: BTreeSet<String>,
    pub wire: WireState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AddOutcome {
    pub id: String,
    /// First subscriber for the topic; a wire subscribe is needed
    pub wire_subscribe_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoveOutcome {
    pub topic: String,
    pub private_channel: bool,
    /// Last subscriber left; a wire unsubscribe is needed if the topic was on the wire
    pub wire_unsubscribe_required: bool,
    /// Wire state the topic had before removal
    pub wire: WireState,
}

/// Maps topics to the subscriptions interested in them
pub(crate) struct SubscriptionRegistry {
    subscriptions: HashMap<String, Subscription>,
    topics: HashMap<String, TopicEntry>,
    queue_capacity: usize,
    events: EventSink,
}

impl SubscriptionRegistry {
    pub(crate) fn new(queue_capacity: usize, events: EventSink) -> Self {
        Self {
            subscriptions: HashMap::new(),
            topics: HashMap::new(),
            queue_capacity: queue_capacity.max(1),
            events,
        }
    }

    /// Register a subscription and spawn its delivery task
    pub(crate) fn add(
        &mut self,
        topic: &str,
        private_channel: bool,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> AddOutcome {
        let mut id = Uuid::new_v4().to_string();
        while self.subscriptions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let (queue, rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(run_delivery(id.clone(), handler, rx, self.events.clone()));

        let wire_subscribe_required = !self.topics.contains_key(topic);
        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicEntry {
                private_channel,
                subscriber_ids: BTreeSet::new(),
                wire: WireState::Idle,
            });
        entry.subscriber_ids.insert(id.clone());

        self.subscriptions.insert(
            id.clone(),
            Subscription {
                topic: topic.to_string(),
                private_channel,
                queue,
            },
        );

        debug!(
            subscription_id = %id,
            topic,
            wire_subscribe_required,
            "subscription registered"
        );
        AddOutcome {
            id,
            wire_subscribe_required,
        }
    }

    /// Remove a subscription; its delivery task ends once its queue drains
    pub(crate) fn remove(&mut self, id: &str) -> Option<RemoveOutcome> {
        let subscription = self.subscriptions.remove(id)?;
        let topic = subscription.topic;

        let Some(entry) = self.topics.get_mut(&topic) else {
            return Some(RemoveOutcome {
                topic,
                private_channel: subscription.private_channel,
                wire_unsubscribe_required: false,
                wire: WireState::Idle,
            });
        };

        entry.subscriber_ids.remove(id);
        let wire = entry.wire.clone();
        let private_channel = entry.private_channel;
        let wire_unsubscribe_required = entry.subscriber_ids.is_empty();
        if wire_unsubscribe_required {
            self.topics.remove(&topic);
        }

        debug!(
            subscription_id = %id,
            %topic,
            wire_unsubscribe_required,
            "subscription removed"
        );
        Some(RemoveOutcome {
            topic,
            private_channel,
            wire_unsubscribe_required,
            wire,
        })
    }

    /// Fan a push message out to every subscription on `topic`
    pub(crate) fn dispatch(
        &self,
        topic: &str,
        subject: &str,
        sn: Option<u64>,
        data: serde_json::Value,
    ) -> usize {
        let Some(entry) = self.topics.get(topic) else {
            debug!(topic, subject, "push message for topic without subscribers");
            return 0;
        };

        let data = Arc::new(data);
        let mut delivered = 0;
        for id in &entry.subscriber_ids {
            let Some(subscription) = self.subscriptions.get(id) else {
                continue;
            };
            let message = TopicMessage {
                subscription_id: id.clone(),
                topic: topic.to_string(),
                subject: subject.to_string(),
                sn,
                data: data.clone(),
            };
            match subscription.queue.try_send(Delivery::Message(message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscription_id = %id,
                        topic,
                        capacity = self.queue_capacity,
                        "subscription queue full, push message dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscription_id = %id, topic, "subscription queue closed");
                }
            }
        }
        delivered
    }

    /// Route an error to one subscription's `on_error`; never dropped
    pub(crate) fn notify(&self, id: &str, error: Arc<WsError>) {
        if let Some(subscription) = self.subscriptions.get(id) {
            push_error(&subscription.queue, error);
        }
    }

    /// Notify every subscription, then forget them all
    pub(crate) fn fail_all(&mut self, error: Arc<WsError>) -> usize {
        let count = self.subscriptions.len();
        for subscription in self.subscriptions.values() {
            push_error(&subscription.queue, error.clone());
        }
        self.clear();
        count
    }

    pub(crate) fn clear(&mut self) {
        self.subscriptions.clear();
        self.topics.clear();
    }

    /// Declarative set of topics that must be on the wire
    pub(crate) fn snapshot(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn entry(&self, topic: &str) -> Option<&TopicEntry> {
        self.topics.get(topic)
    }

    pub(crate) fn set_wire(&mut self, topic: &str, wire: WireState) {
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.wire = wire;
        }
    }

    /// Connection dropped: nothing is on the wire any more
    pub(crate) fn mark_all_idle(&mut self) {
        for entry in self.topics.values_mut() {
            entry.wire = WireState::Idle;
        }
    }

    pub(crate) fn subscriber_ids(&self, topic: &str) -> Vec<String> {
        self.topics
            .get(topic)
            .map(|entry| entry.subscriber_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.subscriptions.contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions.len()
    }
}

fn push_error(queue: &mpsc::Sender<Delivery>, error: Arc<WsError>) {
    match queue.try_send(Delivery::Error(error)) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(delivery)) => {
            let queue = queue.clone();
            tokio::spawn(async move {
                let _ = queue.send(delivery).await;
            });
        }
    }
}

async fn run_delivery(
    id: String,
    handler: Arc<dyn SubscriptionHandler>,
    mut rx: mpsc::Receiver<Delivery>,
    events: EventSink,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Message(message) => {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.on_message(message)));
                let failure = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(payload) => Some(format!("callback panicked: {}", panic_message(&payload))),
                };
                if let Some(message) = failure {
                    warn!(subscription_id = %id, error = %message, "subscription callback failed");
                    events.emit(WsEvent::CallbackError {
                        subscription_id: id.clone(),
                        message: message.clone(),
                    });
                    let error = WsError::Callback(message);
                    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(&error))).is_err() {
                        warn!(subscription_id = %id, "error callback panicked");
                    }
                }
            }
            Delivery::Error(error) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(&error))).is_err() {
                    warn!(subscription_id = %id, "error callback panicked");
                }
            }
        }
    }
    debug!(subscription_id = %id, "delivery task finished");
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}
