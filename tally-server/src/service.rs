use std::sync::Arc;

use tally_auth::SharedKey;
use tally_config::Config;

use crate::services::audit::{AuditBroadcaster, AuditError, AuditHandle, AuditLogger};
use crate::services::engine::UpsertEngine;
use crate::store::{Storage, StoreError};

/// Indicates the type of failure of the server.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The storage backend could not be opened.
    #[error("could not initialize the storage backend")]
    Storage(#[from] StoreError),

    /// An audit sink could not be created.
    #[error("could not initialize the audit sinks")]
    Audit(#[from] AuditError),
}

/// Server state shared by all request handlers.
#[derive(Clone, Debug)]
pub struct ServiceState {
    config: Arc<Config>,
    engine: Arc<UpsertEngine<Storage>>,
    audit: AuditLogger,
    key: Option<Arc<SharedKey>>,
}

impl ServiceState {
    /// Opens the storage backend and spawns the audit broadcaster.
    ///
    /// The returned [`AuditHandle`] waits for pending audit events once all clones of the state
    /// are dropped.
    pub async fn start(config: Arc<Config>) -> Result<(Self, AuditHandle), ServiceError> {
        let storage = Storage::prepare(&config).await?;
        tally_log::info!("using {} storage", storage.name());

        let (audit, handle) = AuditBroadcaster::from_config(&config)?.start();
        let state = Self::new(config, UpsertEngine::new(storage), audit);

        Ok((state, handle))
    }

    /// Creates a state from already constructed parts.
    pub fn new(config: Arc<Config>, engine: UpsertEngine<Storage>, audit: AuditLogger) -> Self {
        let key = config.shared_key().map(Arc::new);
        Self {
            config,
            engine: Arc::new(engine),
            audit,
            key,
        }
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the upsert engine.
    pub fn engine(&self) -> &UpsertEngine<Storage> {
        &self.engine
    }

    /// Returns the handle to submit audit events.
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Returns the key for payload signatures, if signing is enabled.
    pub fn shared_key(&self) -> Option<&SharedKey> {
        self.key.as_deref()
    }
}
