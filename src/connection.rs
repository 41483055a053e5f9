//! Resilient broker connection.
//!
//! The [`ConnectionManager`] owns the single broker session of the service. It
//! keeps an ordered list of setup callbacks (topology declaration, one per
//! consumer binding) and runs them against a fresh channel after every
//! successful connect. When the connection drops, a supervisor task backs off
//! and reconnects, so consumers come back without any handler noticing.
//!
//! A channel can also fail on its own while the connection stays up (a refused
//! ack, a cancelled consumer). Consumers report that through a
//! [`FaultReporter`]; the supervisor then closes the channel, opens a fresh one
//! on the same connection and replays the setups, falling back to a full
//! reconnect if that fails.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(transport, uri, ConnectOptions::default(), policy);
//! manager.add_setup(topology.into_setup()).await?;
//! manager.start().await?;
//!
//! let mut state = manager.subscribe();
//! while state.changed().await.is_ok() {
//!     println!("broker is {:?}", *state.borrow());
//! }
//! ```

use crate::broker::{BrokerError, Channel, ConnectOptions, Connection, Transport};
use crate::shutdown::ShutdownSignal;
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// An idempotent callback run against every fresh channel.
pub type Setup =
    Arc<dyn Fn(Arc<dyn Channel>) -> BoxFuture<'static, Result<(), BrokerError>> + Send + Sync>;

/// Wrap an async closure as a [`Setup`].
pub fn setup_fn<F, Fut>(f: F) -> Setup
where
    F: Fn(Arc<dyn Channel>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BrokerError>> + Send + 'static,
{
    Arc::new(move |channel| Box::pin(f(channel)))
}

/// Broker connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Backoff settings for connecting and reconnecting.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts made by [`ConnectionManager::start`] before giving up
    pub initial_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            initial_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Tells the [`ConnectionManager`] that a channel stopped delivering.
#[derive(Clone)]
pub struct FaultReporter {
    sender: mpsc::UnboundedSender<Arc<dyn Channel>>,
}

impl FaultReporter {
    /// Report `channel` as failed. Reports about a channel that has already
    /// been replaced are ignored.
    pub fn channel_failed(&self, channel: Arc<dyn Channel>) {
        // No receiver means the manager is gone
        let _ = self.sender.send(channel);
    }
}

fn same_channel(a: &Arc<dyn Channel>, b: &Arc<dyn Channel>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

enum Interruption {
    ConnectionLost,
    ChannelFailed,
    /// Fault reported by a channel that was already replaced
    Stale,
    Stopping,
}

struct Session {
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

#[derive(Default)]
struct Inner {
    setups: Vec<Setup>,
    session: Option<Session>,
}

enum SessionError {
    Connect(BrokerError),
    Setup(BrokerError),
}

/// Owns the broker session and keeps it alive.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    uri: String,
    options: ConnectOptions,
    policy: ReconnectPolicy,
    /// Held across a whole connect + setup pass so a callback added meanwhile
    /// is neither lost nor run twice
    inner: Mutex<Inner>,
    state: watch::Sender<ConnectionState>,
    stopping: ShutdownSignal,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    faults: FaultReporter,
    fault_events: Mutex<Option<mpsc::UnboundedReceiver<Arc<dyn Channel>>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        uri: impl Into<String>,
        options: ConnectOptions,
        policy: ReconnectPolicy,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (sender, fault_events) = mpsc::unbounded_channel();
        Arc::new(Self {
            transport,
            uri: uri.into(),
            options,
            policy,
            inner: Mutex::new(Inner::default()),
            state,
            stopping: ShutdownSignal::new(),
            supervisor: Mutex::new(None),
            faults: FaultReporter { sender },
            fault_events: Mutex::new(Some(fault_events)),
        })
    }

    /// Handle for consumers to report a failed channel.
    pub fn fault_reporter(&self) -> FaultReporter {
        self.faults.clone()
    }

    /// Register a setup callback. Runs immediately if a session is live.
    pub async fn add_setup(&self, setup: Setup) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        inner.setups.push(setup.clone());

        if let Some(session) = &inner.session {
            setup(session.channel.clone()).await?;
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connectivity changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Establish the first session and start supervising it.
    ///
    /// Transport failures are retried with backoff up to
    /// `initial_attempts`; a failing setup callback is returned immediately.
    pub async fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        let attempts = self.policy.initial_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self.establish().await {
                Ok(()) => break,
                Err(SessionError::Setup(e)) => {
                    error!(error = %e, "Broker setup failed");
                    return Err(e);
                }
                Err(SessionError::Connect(e)) if attempt + 1 < attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Broker connection failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stopping.triggered() => return Err(BrokerError::Closed),
                    }
                    attempt += 1;
                }
                Err(SessionError::Connect(e)) => {
                    error!(attempts = attempts, error = %e, "Giving up connecting to broker");
                    return Err(e);
                }
            }
        }

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move { manager.supervise().await });
        *self.supervisor.lock().await = Some(handle);
        Ok(())
    }

    /// Stop supervising and close the live connection.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.stopping.trigger();
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }

        let session = self.inner.lock().await.session.take();
        self.state.send_replace(ConnectionState::Disconnected);

        match session {
            Some(session) => {
                info!("Closing broker connection");
                session.connection.close().await
            }
            None => Ok(()),
        }
    }

    /// Connect, open a channel and run every setup callback in order.
    async fn establish(&self) -> Result<(), SessionError> {
        let mut inner = self.inner.lock().await;

        let connection = self
            .transport
            .connect(&self.uri, &self.options)
            .await
            .map_err(SessionError::Connect)?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close().await;
                return Err(SessionError::Connect(e));
            }
        };

        for (index, setup) in inner.setups.iter().enumerate() {
            if let Err(e) = setup(channel.clone()).await {
                debug!(setup = index, error = %e, "Setup callback failed");
                let _ = connection.close().await;
                return Err(SessionError::Setup(e));
            }
        }

        inner.session = Some(Session {
            connection,
            channel,
        });
        self.state.send_replace(ConnectionState::Connected);
        info!(setups = inner.setups.len(), "Connected to broker");
        Ok(())
    }

    async fn supervise(self: Arc<Self>) {
        let Some(mut faults) = self.fault_events.lock().await.take() else {
            error!("Broker supervisor already running");
            return;
        };

        loop {
            let session = self
                .inner
                .lock()
                .await
                .session
                .as_ref()
                .map(|s| (s.connection.clone(), s.channel.clone()));

            if let Some((connection, channel)) = session {
                let interruption = tokio::select! {
                    _ = connection.closed() => Interruption::ConnectionLost,
                    Some(failed) = faults.recv() => {
                        if same_channel(&failed, &channel) {
                            Interruption::ChannelFailed
                        } else {
                            Interruption::Stale
                        }
                    }
                    _ = self.stopping.triggered() => Interruption::Stopping,
                };

                match interruption {
                    Interruption::Stopping => return,
                    Interruption::Stale => {
                        debug!("Ignoring fault from a replaced channel");
                        continue;
                    }
                    Interruption::ConnectionLost => warn!("Broker connection lost"),
                    Interruption::ChannelFailed => {
                        warn!("Broker channel failed, reopening");
                        match self.reopen_channel(&connection, &channel).await {
                            Ok(()) => continue,
                            Err(e) => {
                                warn!(error = %e, "Channel recovery failed, reconnecting");
                                let _ = connection.close().await;
                            }
                        }
                    }
                }
            }

            self.inner.lock().await.session = None;
            self.state.send_replace(ConnectionState::Disconnected);

            let mut attempt = 0u32;
            loop {
                let delay = self.policy.backoff(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stopping.triggered() => return,
                }

                match self.establish().await {
                    Ok(()) => {
                        info!(attempts = attempt + 1, "Reconnected to broker");
                        break;
                    }
                    Err(SessionError::Connect(e)) | Err(SessionError::Setup(e)) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = self.policy.backoff(attempt + 1).as_millis() as u64,
                            error = %e,
                            "Reconnect failed"
                        );
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        }
    }

    /// Replace a failed channel on a live connection and replay the setups.
    async fn reopen_channel(
        &self,
        connection: &Arc<dyn Connection>,
        failed: &Arc<dyn Channel>,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        self.state.send_replace(ConnectionState::Disconnected);

        // Consumers still running on the old channel would double up
        if let Err(e) = failed.close().await {
            debug!(error = %e, "Closing failed channel");
        }

        let channel = connection.open_channel().await?;
        for setup in &inner.setups {
            setup(channel.clone()).await?;
        }

        inner.session = Some(Session {
            connection: connection.clone(),
            channel,
        });
        self.state.send_replace(ConnectionState::Connected);
        info!(setups = inner.setups.len(), "Broker channel reopened");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, QueueOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(initial_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            initial_attempts,
        }
    }

    fn manager(broker: &MemoryBroker, initial_attempts: u32) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            Arc::new(broker.clone()),
            "memory://",
            ConnectOptions::default(),
            fast_policy(initial_attempts),
        )
    }

    fn counting_setup(counter: Arc<AtomicUsize>) -> Setup {
        setup_fn(move |_channel| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BrokerError>(())
            }
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[test]
    fn test_backoff() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            initial_attempts: 3,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_secs(1));
        assert_eq!(policy.backoff(60), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_setups_run_in_order() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 1);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for name in ["topology", "consumer"] {
            let order = order.clone();
            manager
                .add_setup(setup_fn(move |_channel| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok::<(), BrokerError>(())
                    }
                }))
                .await
                .unwrap();
        }

        manager.start().await.unwrap();
        assert!(manager.is_connected());
        assert_eq!(*order.lock().unwrap(), vec!["topology", "consumer"]);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_added_while_connected_runs_immediately() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 1);
        manager.start().await.unwrap();

        manager
            .add_setup(setup_fn(|channel: Arc<dyn Channel>| async move {
                channel
                    .declare_queue("late", &QueueOptions::default())
                    .await
                    .map(|_| ())
            }))
            .await
            .unwrap();

        assert!(broker.has_queue("late").await);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_connect_retries() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(2).await;
        let manager = manager(&broker, 5);

        manager.start().await.unwrap();
        assert!(manager.is_connected());
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_connect_gives_up() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(10).await;
        let manager = manager(&broker, 3);

        let result = manager.start().await;
        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_setup_failure_is_fatal() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 5);
        manager
            .add_setup(setup_fn(|channel: Arc<dyn Channel>| async move {
                channel.bind_queue("missing", "amq.topic", "#").await
            }))
            .await
            .unwrap();

        let result = manager.start().await;
        assert!(matches!(result, Err(BrokerError::NotFound { .. })));
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_reconnect_reruns_setups() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 1);
        let runs = Arc::new(AtomicUsize::new(0));
        manager.add_setup(counting_setup(runs.clone())).await.unwrap();
        manager.start().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let state = manager.subscribe();
        broker.sever_connections().await;

        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2).await);
        assert!(wait_until(|| manager.is_connected()).await);

        assert!(state.has_changed().unwrap());

        manager.close().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
