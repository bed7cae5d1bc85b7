//! conquer-core: reliable coordinator protocol and work scheduler
//!
//! This crate splits a test suite across CI workers with the help of a
//! remote coordinator. Workers pull batches of work and push results; the
//! coordinator decides who runs what.
//!
//! # Architecture
//!
//! ```text
//! worker threads ──next()/report()──► Scheduler ──► BridgeQueue
//!                                                      │
//!                       event loop thread:  report loop ┘
//!                                               │
//!                                     Client (websocket, acks, reconnect)
//!                                               │
//!                                          coordinator
//! ```
//!
//! # Modules
//!
//! - `codec`: wire envelope, message types, ack classification
//! - `bridge`: FIFO with blocking and async faces
//! - `serializer`: domain entities to and from wire payloads
//! - `client`: websocket transport with reconnect and URL fail-over
//! - `scheduler`: protocol state machine and worker-facing surface
//! - `settings` / `env`: settings resolution and CI provider detection
//! - `http` / `heartbeat`: legacy HTTP endpoints
//! - `retry`: backoff and retry policies
//! - `diagnostic`: boxed fatal error output
//! - `model`: suite, schedule and report entities
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod codec;
pub mod diagnostic;
pub mod env;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod logging;
pub mod model;
pub mod retry;
pub mod scheduler;
pub mod serializer;
pub mod settings;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
