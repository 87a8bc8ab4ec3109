/*
[INPUT]:  Connection tokens, topics and subscription handlers
[OUTPUT]: Push engine with deduplicated subscriptions and transparent reconnects
[POS]:    WebSocket layer - real-time push feed
[UPDATE]: When adding engine capabilities or changing module layout
*/

pub mod config;
pub(crate) mod connection;
pub(crate) mod dispatcher;
pub mod engine;
pub mod event;
pub mod handler;
pub mod message;
pub(crate) mod reconnect;
pub(crate) mod registry;

pub use config::{BackoffStrategy, UNLIMITED_ATTEMPTS, WsClientConfig};
pub use engine::WsEngine;
pub use event::WsEvent;
pub use handler::{
    FnHandler, HandlerError, SubscriptionHandler, TypedEvent, TypedHandler, handler_fn,
};
pub use message::{MessageType, TopicMessage, WsMessage};
