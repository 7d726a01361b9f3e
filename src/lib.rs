//! Mail relay over a durable AMQP queue.
//!
//! Sent mail is persisted to the message store first and then published,
//! best-effort, to a durable queue. A long-lived consumer processes the queue
//! with one message in flight, and a filtered drain lets a request path pull
//! the messages addressed to one receiver without blocking.
//!
//! - [`messaging`]: envelope codec, broker transports, publisher, consumer, drain
//! - [`mail`]: request-path boundary composing storage and the queue
//! - [`state`]: user directory and message store collaborators
//! - [`config`], [`error`], [`metrics`]: ambient plumbing

pub mod config;
pub mod error;
pub mod mail;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod state;

pub use config::Config;
pub use error::{AppError, Result};
