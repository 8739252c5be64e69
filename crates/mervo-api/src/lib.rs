//! mervo HTTP API.
//!
//! Inbound challenge and signed-receive endpoints, the producer enqueue
//! endpoint, delivery status and operator controls, plus configuration
//! loading for the service binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dedupe;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use dedupe::{DedupeConfig, DedupeStore};
pub use server::{create_router, shutdown_signal, start_server, AppState};
