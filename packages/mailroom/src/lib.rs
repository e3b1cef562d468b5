// Mailroom - persistent, prioritized, retryable email dispatch engine
//
// Producers submit validated job descriptors through the queue facade; the
// engine durably stores each request, dispatches by priority and schedule,
// delivers over SMTP with bounded retries, records history, and exposes
// health and metrics.

pub mod common;
pub mod config;
pub mod email;
pub mod engine;
pub mod monitor;
pub mod queue;
pub mod store;

pub use config::{Config, SmtpConfig};
