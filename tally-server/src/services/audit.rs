//! Fan-out of audit events to subscribers.
//!
//! Request handlers hold an [`AuditLogger`] and never wait for audit delivery. Events pass through
//! a small source channel to a single broadcaster task, which forwards a copy into the bounded
//! channel of every subscriber. If a subscriber's channel is full, that subscriber misses the
//! event while all others still receive it. Each subscriber drains its channel in order and writes
//! events to its [`AuditSink`].

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_config::Config;
use tally_log::LogError;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

/// Capacity of the channel between request handlers and the broadcaster.
const SOURCE_CAPACITY: usize = 16;

/// Records which metrics a client updated.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AuditEvent {
    /// Time the update was applied.
    pub ts: DateTime<Utc>,
    /// Names of all metrics in the update.
    pub metrics: Vec<String>,
    /// IP address of the client.
    pub ip_address: String,
}

impl AuditEvent {
    /// Creates an event for the current time.
    pub fn new(metrics: Vec<String>, ip_address: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            metrics,
            ip_address: ip_address.into(),
        }
    }
}

/// An error raised by an [`AuditSink`].
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Writing to the audit file failed.
    #[error("failed to write audit file")]
    Io(#[from] io::Error),
    /// Serializing the event failed.
    #[error("failed to serialize audit event")]
    Json(#[from] serde_json::Error),
    /// Sending the event to the audit URL failed.
    #[error("failed to send audit event")]
    Http(#[from] reqwest::Error),
}

/// A destination for audit events.
pub trait AuditSink: Send + 'static {
    /// Returns a name for logging.
    fn name(&self) -> String;

    /// Delivers a single event.
    fn write(&mut self, event: &AuditEvent) -> impl Future<Output = Result<(), AuditError>> + Send;
}

/// Appends one JSON line per event to a file.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    /// Creates a sink appending to the file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the path of the audit file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileSink {
    fn name(&self) -> String {
        format!("file {}", self.path.display())
    }

    async fn write(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// POSTs every event as JSON to a URL.
#[derive(Debug)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// Creates a sink posting to `url`.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AuditError> {
        let client = reqwest::ClientBuilder::new().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AuditSink for HttpSink {
    fn name(&self) -> String {
        format!("url {}", self.url)
    }

    async fn write(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        self.client
            .post(&self.url)
            .json(event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Handle to submit audit events without blocking.
///
/// A logger without subscribers discards all events.
#[derive(Clone, Debug, Default)]
pub struct AuditLogger {
    sender: Option<mpsc::Sender<AuditEvent>>,
}

impl AuditLogger {
    /// Creates a logger that discards all events.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Returns `true` if events are forwarded to at least one subscriber.
    pub fn is_enabled(&self) -> bool {
        self.sender.is_some()
    }

    /// Submits an event. If the broadcaster is behind, the event is dropped.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref sender) = self.sender else {
            return;
        };

        match sender.try_send(event) {
            Ok(()) => (),
            Err(TrySendError::Full(_)) => tally_log::debug!("audit queue full, dropping event"),
            Err(TrySendError::Closed(_)) => tally_log::debug!("audit broadcaster stopped"),
        }
    }
}

/// Distributes audit events to all subscribers.
#[derive(Debug, Default)]
pub struct AuditBroadcaster {
    subscribers: Vec<mpsc::Sender<Arc<AuditEvent>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AuditBroadcaster {
    /// Creates a broadcaster without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broadcaster with the sinks configured in the `audit` section.
    pub fn from_config(config: &Config) -> Result<Self, AuditError> {
        let mut broadcaster = Self::new();
        let capacity = config.audit_buffer_size();

        if let Some(path) = config.audit_file() {
            broadcaster.subscribe(FileSink::new(path), capacity);
        }

        if let Some(url) = config.audit_url() {
            broadcaster.subscribe(HttpSink::new(url, config.http_timeout())?, capacity);
        }

        Ok(broadcaster)
    }

    /// Returns the number of subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Returns `true` if there are no subscribers.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Adds a subscriber with a buffer of `capacity` events and spawns its drain task.
    pub fn subscribe<S: AuditSink>(&mut self, mut sink: S, capacity: usize) {
        let (sender, mut receiver) = mpsc::channel::<Arc<AuditEvent>>(capacity.max(1));

        let name = sink.name();
        tally_log::info!("writing audit events to {name}");

        self.subscribers.push(sender);
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(error) = sink.write(&event).await {
                    tally_log::error!("failed to write audit event to {name}: {}", LogError(&error));
                }
            }
        }));
    }

    /// Forwards an event to every subscriber whose buffer has room.
    ///
    /// Returns the number of subscribers that received the event.
    pub fn broadcast(&self, event: AuditEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;

        for (index, subscriber) in self.subscribers.iter().enumerate() {
            match subscriber.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tally_log::debug!("audit subscriber {index} is full, dropping event")
                }
                Err(TrySendError::Closed(_)) => {
                    tally_log::debug!("audit subscriber {index} stopped, dropping event")
                }
            }
        }

        delivered
    }

    /// Spawns the broadcaster task and returns the logger feeding it.
    ///
    /// Without subscribers, nothing is spawned and the logger discards events.
    pub fn start(self) -> (AuditLogger, AuditHandle) {
        if self.is_empty() {
            return (AuditLogger::disabled(), AuditHandle { tasks: Vec::new() });
        }

        let (sender, mut receiver) = mpsc::channel::<AuditEvent>(SOURCE_CAPACITY);
        let Self {
            subscribers,
            mut tasks,
        } = self;

        let broadcaster = Self {
            subscribers,
            tasks: Vec::new(),
        };

        tasks.push(tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                broadcaster.broadcast(event);
            }
        }));

        let logger = AuditLogger {
            sender: Some(sender),
        };
        (logger, AuditHandle { tasks })
    }
}

/// Waits for audit tasks to finish after all loggers are dropped.
#[derive(Debug)]
pub struct AuditHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl AuditHandle {
    /// Waits until pending events are written, at most for `timeout`.
    pub async fn finish(self, timeout: Duration) {
        let aborts = self
            .tasks
            .iter()
            .map(|task| task.abort_handle())
            .collect::<Vec<_>>();

        let join = futures::future::join_all(self.tasks);
        if tokio::time::timeout(timeout, join).await.is_err() {
            tally_log::warn!("audit sinks did not finish in time");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}
