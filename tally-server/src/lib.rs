//! The Tally server.
//!
//! The server receives metrics from agents and stores them. Its main entry point is [`run`],
//! which opens the storage backend, spawns the audit broadcaster and serves HTTP until a
//! shutdown is triggered.
//!
//! # Ingestion
//!
//! ```text
//! request ─> NormalizePath ─> router ─> SignedBody ─> decode ─> UpsertEngine ─> store
//!                                        (verify,                  │
//!                                         gunzip)                  └─> AuditLogger ─> sinks
//! ```
//!
//! A request is verified against the shared key over its raw body before anything else happens,
//! so a rejected signature never mutates storage. The [`UpsertEngine`](services::engine::UpsertEngine)
//! serializes concurrent writers to the same metric name and applies every batch atomically:
//! counters accumulate, gauges are replaced, and a batch that conflicts with the type of a stored
//! metric is rejected as a whole.
//!
//! # Storage
//!
//! Two backends implement [`MetricStore`](store::MetricStore): an in-memory map persisted to a
//! JSON snapshot, and a SQLite database. See the [`store`] module.
//!
//! # Audit
//!
//! After a successful update, an [`AuditEvent`](services::audit::AuditEvent) naming all updated
//! metrics and the client address is handed to the audit broadcaster without waiting. See the
//! [`audit`](services::audit) module.

#![warn(missing_docs)]

use std::sync::Arc;

use tally_config::Config;
use tally_system::ShutdownHandle;

mod endpoints;
mod extractors;
mod middlewares;
mod service;
mod utils;

pub mod services;
pub mod store;

pub use self::endpoints::{BadUpdate, Status};
pub use self::extractors::{ClientIp, PayloadError, SignedBody};
pub use self::service::*;
pub use self::services::server::{HttpServer, ServerError};
pub use self::utils::ApiErrorResponse;

/// Runs the server until `shutdown` resolves.
///
/// Pending audit events are written for at most the configured shutdown timeout.
pub async fn run(config: Arc<Config>, shutdown: ShutdownHandle) -> Result<(), ServerError> {
    let (service, audit) = ServiceState::start(config.clone()).await?;
    let server = HttpServer::new(config.clone(), service)?;
    let result = server.run(shutdown).await;

    audit.finish(config.shutdown_timeout()).await;
    result
}
