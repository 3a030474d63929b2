//! HTTP transport (axum).

pub mod routes;
pub mod server;

pub use routes::routes;
pub use server::{ServerConfig, serve};
