/*
[INPUT]:  HTTP client configuration and token endpoints
[OUTPUT]: Connection tokens and typed REST results
[POS]:    HTTP layer - REST collaborator of the push engine
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod error;
pub mod signature;
pub mod token;

pub use error::{Result, WsError};
pub use signature::{RequestSigner, StaticHeaderSigner};

pub use client::{ClientConfig, RestClient};
pub use token::{Endpoint, RestTokenProvider, TokenProvider, WsToken};
