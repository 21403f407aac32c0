use std::env;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tally_auth::SharedKey;

/// Defines the source of a config error
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    inner: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: None,
        }
    }

    #[inline]
    fn wrap<E>(inner: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            inner: Some(Box::new(inner)),
        }
    }

    #[inline]
    fn for_field<E>(inner: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(inner, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.inner.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Indicates config related errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value
    #[error("invalid config value")]
    InvalidValue,
}

/// Structure used to hold information about configuration overrides via
/// CLI parameters or environment variables
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The `host:port` the server listens on and the agent sends to.
    pub address: Option<String>,
    /// The shared key used for payload signing. An empty key disables signing.
    pub key: Option<String>,
    /// Seconds between snapshot flushes of the memory store, `0` for synchronous flushes.
    pub store_interval: Option<String>,
    /// Path of the memory store snapshot file.
    pub file_storage_path: Option<String>,
    /// `"true"` to restore the memory store from its snapshot on startup.
    pub restore: Option<String>,
    /// The database to use instead of the memory store.
    pub database_dsn: Option<String>,
    /// File that receives audit events.
    pub audit_file: Option<String>,
    /// URL that receives audit events.
    pub audit_url: Option<String>,
    /// Seconds between two polls of the sampler.
    pub poll_interval: Option<String>,
    /// Seconds between two reports to the server.
    pub report_interval: Option<String>,
    /// Maximum number of concurrent deliveries.
    pub rate_limit: Option<String>,
    /// Shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Server {
    /// The `host:port` the server binds to.
    address: String,
    /// Seconds between flushes of the memory store snapshot.
    ///
    /// `0` flushes synchronously after every update.
    store_interval: u64,
    /// Path of the memory store snapshot. `None` disables persistence.
    file_storage_path: Option<PathBuf>,
    /// Restore the memory store from the snapshot on startup.
    restore: bool,
    /// Path of a SQLite database. When set, the database replaces the memory store.
    database_path: Option<PathBuf>,
    /// Maximum number of connections to the database.
    database_max_connections: u32,
}

impl Default for Server {
    fn default() -> Self {
        Server {
            address: "localhost:8080".to_owned(),
            store_interval: 300,
            file_storage_path: Some(PathBuf::from("metrics-db.json")),
            restore: false,
            database_path: None,
            database_max_connections: 10,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Agent {
    /// The `host:port` of the server receiving the metrics.
    address: String,
    /// Seconds between two polls of the sampler.
    poll_interval: u64,
    /// Seconds between two reports.
    report_interval: u64,
    /// Number of delivery workers, which is the maximum number of concurrent requests.
    rate_limit: usize,
    /// Capacity of the delivery queue.
    ///
    /// When the queue is full, the report loop waits for a free slot.
    queue_size: usize,
}

impl Default for Agent {
    fn default() -> Self {
        Agent {
            address: "localhost:8080".to_owned(),
            poll_interval: 2,
            report_interval: 10,
            rate_limit: 5,
            queue_size: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct Auth {
    /// Shared secret for payload signatures.
    key: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Audit {
    /// File receiving one JSON line per audit event.
    file: Option<PathBuf>,
    /// URL receiving audit events as JSON.
    url: Option<String>,
    /// Capacity of each subscriber's event buffer.
    buffer_size: usize,
}

impl Default for Audit {
    fn default() -> Self {
        Audit {
            file: None,
            url: None,
            buffer_size: 100,
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Http {
    /// Total timeout of a single request in seconds.
    timeout: u32,
    /// Timeout for establishing connections in seconds.
    connection_timeout: u32,
    /// Maximum number of attempts per delivery, including the first one.
    max_attempts: usize,
    /// Delays between consecutive attempts in milliseconds.
    ///
    /// If there are more retries than delays, the last delay is repeated.
    retry_delays_ms: Vec<u64>,
}

impl Default for Http {
    fn default() -> Self {
        Http {
            timeout: 5,
            connection_timeout: 3,
            max_attempts: 4,
            retry_delays_ms: vec![1000, 3000, 5000],
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// Maximum number of seconds a request may take on the server.
    request_timeout: u64,
    /// The maximum number of seconds to wait for pending work after a shutdown signal.
    shutdown_timeout: u64,
    /// The maximum body size of ingestion requests in bytes.
    max_body_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            request_timeout: 15,
            shutdown_timeout: 10,
            max_body_size: 10 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    server: Server,
    #[serde(default)]
    agent: Agent,
    #[serde(default)]
    auth: Auth,
    #[serde(default)]
    audit: Audit,
    #[serde(default)]
    http: Http,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    logging: tally_log::LogConfig,
}

fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let f = fs::File::open(path)
        .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(path))?;

    serde_yaml::from_reader(io::BufReader::new(f))
        .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(path))
}

/// Resolves a `host:port` string to the first matching socket address.
fn resolve_address(address: &str) -> io::Result<SocketAddr> {
    address.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address found for {address}"),
        )
    })
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Config {
    /// Name of the config file within the config folder.
    pub const FILE_NAME: &'static str = "config.yml";

    /// Loads a config from a given config folder.
    ///
    /// A missing config file is not an error, the defaults apply in that case.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        let file = path.join(Self::FILE_NAME);
        let values = if file.exists() {
            load_yaml(&file)?
        } else {
            ConfigValues::default()
        };

        Ok(Config { values, path })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters)
    ///
    /// The address applies to both the server and the agent section, since a process only ever
    /// runs one of them.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(address) = overrides.address {
            resolve_address(&address).map_err(|err| ConfigError::for_field(err, "address"))?;
            self.values.server.address = address.clone();
            self.values.agent.address = address;
        }

        if let Some(key) = overrides.key {
            self.values.auth.key = Some(key);
        }

        let server = &mut self.values.server;
        if let Some(store_interval) = overrides.store_interval {
            server.store_interval = store_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "store_interval"))?;
        }

        if let Some(file_storage_path) = overrides.file_storage_path {
            server.file_storage_path = match file_storage_path.as_str() {
                "" => None,
                path => Some(PathBuf::from(path)),
            };
        }

        if let Some(restore) = overrides.restore {
            server.restore = parse_bool(&restore)
                .ok_or_else(|| ConfigError::new(ConfigErrorKind::InvalidValue).field("restore"))?;
        }

        if let Some(dsn) = overrides.database_dsn {
            let path = dsn
                .strip_prefix("sqlite://")
                .or_else(|| dsn.strip_prefix("sqlite:"))
                .unwrap_or(&dsn);

            server.database_path = match path {
                "" => None,
                path => Some(PathBuf::from(path)),
            };
        }

        let audit = &mut self.values.audit;
        if let Some(file) = overrides.audit_file {
            audit.file = Some(file).filter(|f| !f.is_empty()).map(PathBuf::from);
        }

        if let Some(url) = overrides.audit_url {
            audit.url = Some(url).filter(|u| !u.is_empty());
        }

        let agent = &mut self.values.agent;
        if let Some(poll_interval) = overrides.poll_interval {
            agent.poll_interval = poll_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "poll_interval"))?;
        }

        if let Some(report_interval) = overrides.report_interval {
            agent.report_interval = report_interval
                .parse()
                .map_err(|err| ConfigError::for_field(err, "report_interval"))?;
        }

        if let Some(rate_limit) = overrides.rate_limit {
            agent.rate_limit = rate_limit
                .parse()
                .map_err(|err| ConfigError::for_field(err, "rate_limit"))?;
        }

        let limits = &mut self.values.limits;
        if let Some(shutdown_timeout) = overrides.shutdown_timeout
            && let Ok(shutdown_timeout) = shutdown_timeout.parse::<u64>()
        {
            limits.shutdown_timeout = shutdown_timeout;
        }

        Ok(self)
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dumps out a YAML string of the values.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadYaml))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &tally_log::LogConfig {
        &self.values.logging
    }

    /// Returns the shared key for payload signatures, if signing is enabled.
    pub fn shared_key(&self) -> Option<SharedKey> {
        self.values.auth.key.as_deref().and_then(SharedKey::new)
    }

    /// Returns the socket address the server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve_address(&self.values.server.address)
            .map_err(|err| ConfigError::for_field(err, "server.address"))
    }

    /// Returns the interval for flushing the memory store snapshot.
    ///
    /// `None` means every update is flushed synchronously.
    pub fn store_interval(&self) -> Option<Duration> {
        match self.values.server.store_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the path of the memory store snapshot.
    pub fn file_storage_path(&self) -> Option<&Path> {
        self.values.server.file_storage_path.as_deref()
    }

    /// Returns `true` if the memory store should load its snapshot on startup.
    pub fn restore(&self) -> bool {
        self.values.server.restore
    }

    /// Returns the path of the SQLite database, if configured.
    pub fn database_path(&self) -> Option<&Path> {
        self.values.server.database_path.as_deref()
    }

    /// Returns the maximum number of database connections.
    pub fn database_max_connections(&self) -> u32 {
        self.values.server.database_max_connections
    }

    /// Returns the file receiving audit events.
    pub fn audit_file(&self) -> Option<&Path> {
        self.values.audit.file.as_deref()
    }

    /// Returns the URL receiving audit events.
    pub fn audit_url(&self) -> Option<&str> {
        self.values.audit.url.as_deref()
    }

    /// Returns the capacity of each audit subscriber's buffer.
    pub fn audit_buffer_size(&self) -> usize {
        self.values.audit.buffer_size.max(1)
    }

    /// Returns the `host:port` the agent sends metrics to.
    pub fn upstream_address(&self) -> &str {
        &self.values.agent.address
    }

    /// Returns the interval between two polls of the sampler.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.values.agent.poll_interval.max(1))
    }

    /// Returns the interval between two reports.
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.values.agent.report_interval.max(1))
    }

    /// Returns the number of concurrent delivery workers.
    pub fn rate_limit(&self) -> usize {
        self.values.agent.rate_limit.max(1)
    }

    /// Returns the capacity of the delivery queue.
    ///
    /// The queue is never smaller than the number of workers.
    pub fn queue_size(&self) -> usize {
        self.values.agent.queue_size.max(self.rate_limit())
    }

    /// Returns the total timeout of a single HTTP request.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout.into())
    }

    /// Returns the connection timeout for HTTP requests.
    pub fn http_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.connection_timeout.into())
    }

    /// Returns the maximum number of delivery attempts.
    pub fn http_max_attempts(&self) -> usize {
        self.values.http.max_attempts.max(1)
    }

    /// Returns the delays between delivery attempts.
    pub fn http_retry_delays(&self) -> Vec<Duration> {
        self.values
            .http
            .retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Returns the timeout for processing a single request on the server.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.request_timeout)
    }

    /// Returns the maximum time to wait for pending work on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the maximum body size of ingestion requests.
    pub fn max_body_size(&self) -> usize {
        self.values.limits.max_body_size
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}
