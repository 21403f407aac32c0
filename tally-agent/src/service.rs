use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tally_config::Config;
use tally_metrics::Sampler;
use tally_system::ShutdownHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::client::{HttpError, UpstreamClient};
use crate::delivery::{DeliveryJob, DeliveryPool, RetryPolicy};

/// Indicates the type of failure of the agent.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The HTTP client could not be created.
    #[error("could not create upstream client")]
    Client(#[from] HttpError),
}

/// Samples metrics periodically and delivers them to the server.
///
/// A poll loop refreshes the sampler every `poll_interval`. A report loop takes a batch every
/// `report_interval` and hands it to the [`DeliveryPool`].
#[derive(Debug)]
pub struct AgentService {
    config: Arc<Config>,
    client: UpstreamClient,
}

impl AgentService {
    /// Creates the agent from the config.
    pub fn new(config: Arc<Config>) -> Result<Self, AgentError> {
        let client = UpstreamClient::new(&config)?;
        Ok(Self { config, client })
    }

    /// Runs the agent until shutdown.
    ///
    /// On shutdown, the report loop stops enqueueing and the pool drains pending jobs within the
    /// shutdown timeout.
    pub async fn run(self, mut shutdown: ShutdownHandle) {
        let Self { config, client } = self;

        tally_log::info!(
            "reporting metrics to {} every {}s",
            client.url(),
            config.report_interval().as_secs()
        );

        let pool = DeliveryPool::start(
            client,
            RetryPolicy::from_config(&config),
            config.shared_key(),
            config.rate_limit(),
            config.queue_size(),
        );

        let sampler = Arc::new(Mutex::new(Sampler::new()));
        let poller = tokio::spawn(poll_loop(
            sampler.clone(),
            config.poll_interval(),
            shutdown.clone(),
        ));

        report_loop(&sampler, &pool, config.report_interval(), &mut shutdown).await;
        poller.abort();

        let timeout = shutdown.get().and_then(|s| s.timeout);
        pool.shutdown(timeout).await;
        tally_log::info!("agent stopped");
    }
}

async fn poll_loop(sampler: Arc<Mutex<Sampler>>, period: Duration, mut shutdown: ShutdownHandle) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                sampler.lock().poll();
                tally_log::trace!("polled metrics");
            }
        }
    }
}

async fn report_loop(
    sampler: &Mutex<Sampler>,
    pool: &DeliveryPool,
    period: Duration,
    shutdown: &mut ShutdownHandle,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => return,
            _ = ticker.tick() => (),
        }

        let batch = sampler.lock().take_batch();
        if pool.free_capacity() == 0 {
            tally_log::debug!("delivery queue full, waiting for a free slot");
        }

        tokio::select! {
            biased;

            _ = shutdown.notified() => return,
            result = pool.submit(DeliveryJob { batch }) => {
                if result.is_err() {
                    return;
                }
            }
        }
    }
}
