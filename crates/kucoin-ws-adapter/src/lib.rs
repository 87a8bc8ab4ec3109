/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public KuCoin push feed adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod http;
pub mod service;
pub mod types;
pub mod ws;

// Re-export commonly used types from http
pub use http::{
    ClientConfig,
    Endpoint,
    RequestSigner,
    RestClient,
    RestTokenProvider,
    Result,
    StaticHeaderSigner,
    TokenProvider,
    WsError,
    WsToken,
};

pub use service::WsService;

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    BackoffStrategy,
    FnHandler,
    HandlerError,
    SubscriptionHandler,
    TopicMessage,
    TypedEvent,
    TypedHandler,
    WsClientConfig,
    WsEngine,
    WsEvent,
    handler_fn,
};
