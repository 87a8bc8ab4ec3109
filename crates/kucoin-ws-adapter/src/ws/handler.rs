/*
[INPUT]:  Push messages and errors for one subscription
[OUTPUT]: Caller callbacks, optionally with the payload decoded into a typed event
[POS]:    WebSocket layer - callback capability that market facades plug into
[UPDATE]: When changing callback signatures or decode behavior
*/

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::http::WsError;
use crate::ws::message::TopicMessage;

/// Error a callback may return; routed to the same subscription's `on_error`
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver side of one subscription.
///
/// Callbacks run on the subscription's own delivery task. A returned error or
/// a panic is reported to `on_error` and never reaches sibling subscriptions.
pub trait SubscriptionHandler: Send + Sync + 'static {
    fn on_message(&self, message: TopicMessage) -> Result<(), HandlerError>;

    fn on_error(&self, error: &WsError) {
        warn!(error = %error, "subscription error (no error callback set)");
    }
}

fn log_error(error: &WsError) {
    warn!(error = %error, "subscription error (no error callback set)");
}

/// Closure-backed handler
pub struct FnHandler<M, E = fn(&WsError)> {
    on_message: M,
    on_error: E,
}

impl<M> FnHandler<M>
where
    M: Fn(TopicMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    pub fn new(on_message: M) -> Self {
        Self {
            on_message,
            on_error: log_error,
        }
    }
}

impl<M, E> FnHandler<M, E> {
    /// Replace the error callback
    pub fn with_error<E2>(self, on_error: E2) -> FnHandler<M, E2>
    where
        E2: Fn(&WsError) + Send + Sync + 'static,
    {
        FnHandler {
            on_message: self.on_message,
            on_error,
        }
    }
}

impl<M, E> SubscriptionHandler for FnHandler<M, E>
where
    M: Fn(TopicMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    E: Fn(&WsError) + Send + Sync + 'static,
{
    fn on_message(&self, message: TopicMessage) -> Result<(), HandlerError> {
        (self.on_message)(message)
    }

    fn on_error(&self, error: &WsError) {
        (self.on_error)(error)
    }
}

/// Shorthand for [`FnHandler::new`]
pub fn handler_fn<M>(on_message: M) -> FnHandler<M>
where
    M: Fn(TopicMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    FnHandler::new(on_message)
}

/// Push message with `data` decoded into `T`
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent<T> {
    pub subscription_id: String,
    pub topic: String,
    pub subject: String,
    pub sn: Option<u64>,
    pub data: T,
}

/// Handler that decodes each payload before calling the business callback
pub struct TypedHandler<T, F, E = fn(&WsError)> {
    on_event: F,
    on_error: E,
    _event: PhantomData<fn() -> T>,
}

impl<T, F> TypedHandler<T, F>
where
    T: DeserializeOwned + 'static,
    F: Fn(TypedEvent<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    pub fn new(on_event: F) -> Self {
        Self {
            on_event,
            on_error: log_error,
            _event: PhantomData,
        }
    }
}

impl<T, F, E> TypedHandler<T, F, E> {
    pub fn with_error<E2>(self, on_error: E2) -> TypedHandler<T, F, E2>
    where
        E2: Fn(&WsError) + Send + Sync + 'static,
    {
        TypedHandler {
            on_event: self.on_event,
            on_error,
            _event: PhantomData,
        }
    }
}

impl<T, F, E> SubscriptionHandler for TypedHandler<T, F, E>
where
    T: DeserializeOwned + 'static,
    F: Fn(TypedEvent<T>) -> Result<(), HandlerError> + Send + Sync + 'static,
    E: Fn(&WsError) + Send + Sync + 'static,
{
    fn on_message(&self, message: TopicMessage) -> Result<(), HandlerError> {
        let data = T::deserialize(&*message.data).map_err(|err| {
            format!(
                "decode {} payload for {}: {err}",
                std::any::type_name::<T>(),
                message.topic
            )
        })?;

        (self.on_event)(TypedEvent {
            subscription_id: message.subscription_id,
            topic: message.topic,
            subject: message.subject,
            sn: message.sn,
            data,
        })
    }

    fn on_error(&self, error: &WsError) {
        (self.on_error)(error)
    }
}
