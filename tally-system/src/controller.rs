use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Shutdown request sent by the [`Controller`] to its subscribers.
///
/// A subscriber has to ensure that it doesn't take longer than `timeout` to finish its open work.
/// Ideally, open work is finished in an orderly manner but no new work is accepted anymore.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Shutdown {
    /// The timeout for this shutdown. `None` indicates an immediate forced shutdown.
    pub timeout: Option<Duration>,
}

/// Notifies a service about an upcoming shutdown.
///
/// Obtain a handle from [`Controller::shutdown_handle`].
#[derive(Clone, Debug)]
pub struct ShutdownHandle(watch::Receiver<Option<Shutdown>>);

impl ShutdownHandle {
    /// Waits until a shutdown has been triggered.
    ///
    /// Resolves immediately if the shutdown was triggered before this call. If the controller is
    /// dropped without ever triggering, this resolves with an immediate shutdown.
    pub async fn notified(&mut self) -> Shutdown {
        match self.0.wait_for(Option::is_some).await {
            Ok(shutdown) => (*shutdown).unwrap_or(Shutdown { timeout: None }),
            Err(_) => Shutdown { timeout: None },
        }
    }

    /// Returns the shutdown if one has been triggered already.
    pub fn get(&self) -> Option<Shutdown> {
        *self.0.borrow()
    }
}

/// Turns process signals into [`Shutdown`] notifications.
///
/// SIGINT and SIGQUIT request an immediate shutdown. SIGTERM requests a graceful shutdown with the
/// configured timeout.
///
/// ### Example
///
/// ```
/// use std::time::Duration;
/// use tally_system::{Controller, Shutdown};
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() {
/// let controller = Controller::new();
/// let mut handle = controller.shutdown_handle();
///
/// controller.trigger_shutdown(Some(Duration::from_secs(1)));
/// assert_eq!(handle.notified().await.timeout, Some(Duration::from_secs(1)));
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct Controller {
    sender: Arc<watch::Sender<Option<Shutdown>>>,
}

impl Controller {
    /// Creates a controller that has not been triggered yet.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Starts listening for process signals on the current runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, shutdown_timeout: Duration) {
        let controller = self.clone();
        tokio::spawn(async move {
            if let Err(error) = controller.monitor_signals(shutdown_timeout).await {
                tally_log::error!("failed to register signal handlers: {error}");
            }
        });
    }

    /// Returns a handle to wait for the shutdown notification.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.sender.subscribe())
    }

    /// Triggers a shutdown programmatically.
    ///
    /// Only the first trigger is recorded, later calls keep the original shutdown.
    pub fn trigger_shutdown(&self, timeout: Option<Duration>) {
        self.sender.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }

            *state = Some(Shutdown { timeout });
            true
        });
    }

    #[cfg(unix)]
    async fn monitor_signals(&self, timeout: Duration) -> io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sig_int = signal(SignalKind::interrupt())?;
        let mut sig_quit = signal(SignalKind::quit())?;
        let mut sig_term = signal(SignalKind::terminate())?;

        tokio::select! {
            biased;

            Some(()) = sig_int.recv() => {
                tally_log::info!("SIGINT received, exiting");
                self.trigger_shutdown(None);
            }
            Some(()) = sig_quit.recv() => {
                tally_log::info!("SIGQUIT received, exiting");
                self.trigger_shutdown(None);
            }
            Some(()) = sig_term.recv() => {
                tally_log::info!("SIGTERM received, stopping in {}s", timeout.as_secs());
                self.trigger_shutdown(Some(timeout));
            }
        }

        Ok(())
    }

    #[cfg(not(unix))]
    async fn monitor_signals(&self, timeout: Duration) -> io::Result<()> {
        tokio::signal::ctrl_c().await?;
        tally_log::info!("ctrl-c received, stopping in {}s", timeout.as_secs());
        self.trigger_shutdown(Some(timeout));
        Ok(())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_sees_earlier_trigger() {
        let controller = Controller::new();
        controller.trigger_shutdown(None);

        let mut handle = controller.shutdown_handle();
        assert_eq!(handle.notified().await, Shutdown { timeout: None });
    }

    #[tokio::test]
    async fn test_first_trigger_wins() {
        let controller = Controller::new();
        let handle = controller.shutdown_handle();

        controller.trigger_shutdown(Some(Duration::from_secs(3)));
        controller.trigger_shutdown(None);

        assert_eq!(
            handle.get(),
            Some(Shutdown {
                timeout: Some(Duration::from_secs(3))
            })
        );
    }

    #[tokio::test]
    async fn test_dropped_controller_releases_waiters() {
        let controller = Controller::new();
        let mut handle = controller.shutdown_handle();
        drop(controller);

        assert_eq!(handle.notified().await.timeout, None);
    }
}
