//! Transport layer for affinity-queue.
//!
//! Transports consume [`ProcessingService`](crate::ProcessingService) only;
//! the core knows nothing about them.

pub mod http;

pub use http::{ServerConfig, serve};
