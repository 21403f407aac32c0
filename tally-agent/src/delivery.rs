use std::sync::Arc;
use std::time::Duration;

use tally_auth::SharedKey;
use tally_config::Config;
use tally_log::LogError;
use tally_metrics::{Batch, EncodedBatch};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::client::{SendError, UpstreamClient};

/// Controls how often and how fast failed deliveries are retried.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
    max_attempts: usize,
}

impl RetryPolicy {
    /// Creates a policy with explicit delays.
    ///
    /// The delay before attempt `n + 1` is `delays[n - 1]`. Once the delays are used up, the last
    /// one repeats. `max_attempts` includes the first attempt and is at least one.
    pub fn new(delays: Vec<Duration>, max_attempts: usize) -> Self {
        Self {
            delays,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Creates the policy from the `http` section of the config.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.http_retry_delays(), config.http_max_attempts())
    }

    /// Returns the maximum number of attempts per delivery.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns the delay after the given number of failed attempts.
    fn delay(&self, failed_attempts: usize) -> Duration {
        let index = failed_attempts.saturating_sub(1);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
            4,
        )
    }
}

/// Raised when a delivery ultimately failed.
#[derive(Debug, thiserror::Error)]
#[error("delivery failed after {attempts} attempt(s)")]
pub struct DeliveryError {
    /// Number of attempts made, including the first one.
    pub attempts: usize,
    /// The error of the last attempt.
    #[source]
    pub error: SendError,
}

/// Sends an encoded batch, retrying network and server errors according to the policy.
///
/// Returns the number of attempts on success.
pub async fn deliver(
    client: &UpstreamClient,
    policy: &RetryPolicy,
    batch: &EncodedBatch,
) -> Result<usize, DeliveryError> {
    let mut attempts = 0;

    loop {
        attempts += 1;

        let error = match client.send(batch).await {
            Ok(()) => return Ok(attempts),
            Err(error) => error,
        };

        if !error.is_retryable() || attempts >= policy.max_attempts() {
            return Err(DeliveryError { attempts, error });
        }

        let delay = policy.delay(attempts);
        tally_log::debug!(
            "delivery attempt {attempts} failed, retrying in {delay:?}: {}",
            LogError(&error)
        );
        tokio::time::sleep(delay).await;
    }
}

/// A batch waiting for delivery.
#[derive(Debug)]
pub struct DeliveryJob {
    /// The metrics to deliver.
    pub batch: Batch,
}

/// Raised when submitting to a pool that is shutting down.
#[derive(Debug, thiserror::Error)]
#[error("delivery queue closed")]
pub struct QueueClosed(pub DeliveryJob);

/// A fixed number of workers delivering jobs from a bounded queue.
///
/// The number of workers caps the number of concurrent requests. When the queue is full,
/// [`submit`](Self::submit) waits for a free slot instead of dropping the job.
#[derive(Debug)]
pub struct DeliveryPool {
    sender: mpsc::Sender<DeliveryJob>,
    workers: Vec<JoinHandle<()>>,
}

struct Worker {
    id: usize,
    client: Arc<UpstreamClient>,
    policy: Arc<RetryPolicy>,
    key: Option<Arc<SharedKey>>,
    receiver: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
}

impl Worker {
    async fn run(self) {
        loop {
            // Hold the lock only while waiting, so other workers can pick up jobs while this one
            // is delivering.
            let job = self.receiver.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };

            self.handle_job(job).await;
        }

        tally_log::trace!("delivery worker {} stopped", self.id);
    }

    async fn handle_job(&self, job: DeliveryJob) {
        let encoded = match tally_metrics::encode(&job.batch, self.key.as_deref()) {
            Ok(encoded) => encoded,
            Err(error) => {
                tally_log::error!("failed to encode batch: {}", LogError(&error));
                return;
            }
        };

        match deliver(&self.client, &self.policy, &encoded).await {
            Ok(attempts) => tally_log::debug!(
                "delivered {} metrics in {attempts} attempt(s)",
                job.batch.len()
            ),
            Err(error) => tally_log::warn!(
                "dropping batch of {} metrics: {}",
                job.batch.len(),
                LogError(&error)
            ),
        }
    }
}

impl DeliveryPool {
    /// Spawns `workers` delivery tasks sharing a queue of `queue_size` jobs.
    pub fn start(
        client: UpstreamClient,
        policy: RetryPolicy,
        key: Option<SharedKey>,
        workers: usize,
        queue_size: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let client = Arc::new(client);
        let policy = Arc::new(policy);
        let key = key.map(Arc::new);

        let workers = (0..workers.max(1))
            .map(|id| {
                let worker = Worker {
                    id,
                    client: client.clone(),
                    policy: policy.clone(),
                    key: key.clone(),
                    receiver: receiver.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { sender, workers }
    }

    /// Enqueues a job, waiting while the queue is full.
    pub async fn submit(&self, job: DeliveryJob) -> Result<(), QueueClosed> {
        self.sender
            .send(job)
            .await
            .map_err(|mpsc::error::SendError(job)| QueueClosed(job))
    }

    /// Returns the number of jobs that can be enqueued without waiting.
    pub fn free_capacity(&self) -> usize {
        self.sender.capacity()
    }

    /// Closes the queue and waits for workers to drain it.
    ///
    /// Workers finish the jobs they hold, including pending retries. Without a timeout, or once
    /// the timeout elapses, remaining workers are aborted.
    pub async fn shutdown(self, timeout: Option<Duration>) {
        let Self { sender, workers } = self;
        drop(sender);

        let aborts = workers.iter().map(|w| w.abort_handle()).collect::<Vec<_>>();
        let drained = match timeout {
            Some(timeout) => {
                tokio::time::timeout(timeout, futures::future::join_all(workers))
                    .await
                    .is_ok()
            }
            None => false,
        };

        if !drained {
            tally_log::warn!("delivery queue not drained, dropping pending batches");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use tally_metrics::Metric;

    use super::*;

    #[derive(Clone)]
    struct Upstream {
        attempts: Arc<AtomicUsize>,
        statuses: Arc<Vec<StatusCode>>,
        bodies: Arc<parking_lot::Mutex<Vec<(HeaderMap, Bytes)>>>,
    }

    async fn handle_updates(
        State(upstream): State<Upstream>,
        headers: HeaderMap,
        body: Bytes,
    ) -> StatusCode {
        let attempt = upstream.attempts.fetch_add(1, Ordering::SeqCst);
        upstream.bodies.lock().push((headers, body));
        upstream
            .statuses
            .get(attempt)
            .or(upstream.statuses.last())
            .copied()
            .unwrap_or(StatusCode::OK)
    }

    /// Starts a server answering `/updates` with the given status codes in order.
    async fn start_upstream(statuses: Vec<StatusCode>) -> (String, Upstream) {
        let upstream = Upstream {
            attempts: Arc::new(AtomicUsize::new(0)),
            statuses: Arc::new(statuses),
            bodies: Arc::default(),
        };

        let app = Router::new()
            .route("/updates", post(handle_updates))
            .with_state(upstream.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        (addr.to_string(), upstream)
    }

    fn client(address: &str) -> UpstreamClient {
        let config = Config::from_json_value(serde_json::json!({
            "agent": {"address": address},
            "http": {"timeout": 2, "connection_timeout": 1}
        }))
        .unwrap();
        UpstreamClient::new(&config).unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(vec![Duration::from_millis(10); 3], 4)
    }

    fn encoded() -> EncodedBatch {
        tally_metrics::encode(&[Metric::counter("Requests", 5)], None).unwrap()
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(3));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_from_config() {
        assert_eq!(
            RetryPolicy::from_config(&Config::default()),
            RetryPolicy::default()
        );
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let (address, upstream) = start_upstream(vec![StatusCode::OK]).await;

        let attempts = deliver(&client(&address), &fast_policy(), &encoded())
            .await
            .unwrap();
        assert_eq!(attempts, 1);
        assert_eq!(upstream.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_retried() {
        let statuses = vec![
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::OK,
        ];
        let (address, upstream) = start_upstream(statuses).await;

        let attempts = deliver(&client(&address), &fast_policy(), &encoded())
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(upstream.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_terminal() {
        let (address, upstream) = start_upstream(vec![StatusCode::BAD_REQUEST]).await;

        let error = deliver(&client(&address), &fast_policy(), &encoded())
            .await
            .unwrap_err();
        assert_eq!(error.attempts, 1);
        assert!(matches!(
            error.error,
            SendError::ResponseError(StatusCode::BAD_REQUEST)
        ));
        assert_eq!(upstream.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_error_exhausts_attempts() {
        let (address, upstream) = start_upstream(vec![StatusCode::BAD_GATEWAY]).await;

        let error = deliver(&client(&address), &fast_policy(), &encoded())
            .await
            .unwrap_err();
        assert_eq!(error.attempts, 4);
        assert_eq!(upstream.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_connection_refused_four_attempts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let error = deliver(&client(&address), &fast_policy(), &encoded())
            .await
            .unwrap_err();
        assert_eq!(error.attempts, 4);
        assert!(matches!(error.error, SendError::SendFailed(_)));
    }

    #[tokio::test]
    async fn test_request_headers() {
        let (address, upstream) = start_upstream(vec![StatusCode::OK]).await;
        let key = SharedKey::new("secret").unwrap();
        let batch = tally_metrics::encode(&[Metric::gauge("Temp", 3.14)], Some(&key)).unwrap();

        deliver(&client(&address), &fast_policy(), &batch)
            .await
            .unwrap();

        let bodies = upstream.bodies.lock();
        let (headers, body) = &bodies[0];
        assert_eq!(headers["content-encoding"], "gzip");
        assert_eq!(headers["content-type"], "application/json");
        assert!(key.verify(body, headers["hashsha256"].to_str().unwrap()).is_ok());
        assert_eq!(body.as_ref(), batch.payload.as_slice());
    }

    #[tokio::test]
    async fn test_pool_delivers_and_drains() {
        tally_log::init_test!();
        let (address, upstream) = start_upstream(vec![StatusCode::OK]).await;

        let pool = DeliveryPool::start(client(&address), fast_policy(), None, 2, 4);
        for delta in 0..10 {
            let job = DeliveryJob {
                batch: vec![Metric::counter("Requests", delta)],
            };
            pool.submit(job).await.unwrap();
        }

        pool.shutdown(Some(Duration::from_secs(5))).await;
        assert_eq!(upstream.attempts.load(Ordering::SeqCst), 10);

        let bodies = upstream.bodies.lock();
        let mut total = 0;
        for (_, body) in bodies.iter() {
            let batch = tally_metrics::decode(body, None, None, 1024).unwrap();
            total += batch
                .iter()
                .map(|metric| match metric.value {
                    tally_metrics::MetricValue::Counter(delta) => delta,
                    tally_metrics::MetricValue::Gauge(_) => 0,
                })
                .sum::<i64>();
        }
        assert_eq!(total, 45);
    }
}
