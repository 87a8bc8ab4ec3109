/*
[INPUT]:  Public API exports for kucoin-ws-tail crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod config;
pub mod tail;

pub use config::{FeedConfig, TailConfig, WsSettings};
pub use tail::{FeedReport, FeedRuntimeStatus, FeedStats, TailManager};
