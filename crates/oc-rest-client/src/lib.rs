//! Resilient client for the opencode server
//!
//! Two channels to the server share one configuration:
//!
//! - [`RestClient`] for ordinary request/response calls. Requests flow through
//!   [`AuthenticatingTransport`] (bearer credential) and [`RetryingTransport`]
//!   (exponential backoff on transport errors and 5xx responses).
//! - [`EventStreamClient`] for the server-pushed event feed, with its own
//!   connection lifecycle and reconnect backoff.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;
pub mod sse;
pub mod transport;

pub use auth::*;
pub use backoff::ReconnectPolicy;
pub use client::*;
pub use config::{ClientConfig, SseConfig};
pub use error::*;
pub use retry::{RetryPolicy, RetryingTransport};
pub use sse::{ConnectionState, ErrorReceiver, Event, EventReceiver, EventStreamClient};
pub use transport::{HttpTransport, Transport};

pub use tokio_util::sync::CancellationToken;
