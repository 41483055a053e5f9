//! Sync service lifecycle.
//!
//! [`SyncServer`] ties the pieces together: the static topology becomes the
//! first setup callback, each queue binding from the registry becomes one
//! consumer setup, and the [`ConnectionManager`] replays them all on every
//! (re)connect.

use crate::broker::BrokerError;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::consumer::{Dispatcher, MetricsSnapshot};
use crate::subscription::{QueueBinding, SubscriptionRegistry};
use crate::topology::Topology;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("sync service already started")]
    AlreadyStarted,

    #[error("no subscriptions registered")]
    NoSubscriptions,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct SyncServer {
    manager: Arc<ConnectionManager>,
    dispatcher: Arc<Dispatcher>,
    topology: Topology,
    bindings: Vec<QueueBinding>,
    consumer_tag: String,
    started: AtomicBool,
}

impl SyncServer {
    pub fn new(
        manager: Arc<ConnectionManager>,
        dispatcher: Arc<Dispatcher>,
        topology: Topology,
        registry: &SubscriptionRegistry,
        consumer_tag: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            topology,
            bindings: registry.bindings(),
            consumer_tag: consumer_tag.into(),
            started: AtomicBool::new(false),
        }
    }

    /// Register the setup callbacks and connect.
    ///
    /// Fails if the broker stays unreachable or any declaration is refused.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.bindings.is_empty() {
            return Err(ServiceError::NoSubscriptions);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyStarted);
        }

        if !self.topology.is_empty() {
            self.manager.add_setup(self.topology.clone().into_setup()).await?;
        }
        for (index, binding) in self.bindings.iter().enumerate() {
            let tag = format!("{}-{}", self.consumer_tag, index);
            let faults = self.manager.fault_reporter();
            let setup = self.dispatcher.setup_for(binding.clone(), tag, faults);
            self.manager.add_setup(setup).await?;
        }

        self.manager.start().await?;
        info!(
            queues = self.bindings.len(),
            consumer_tag = %self.consumer_tag,
            "Sync service started"
        );
        Ok(())
    }

    /// Close the broker connection. Consumers stop with it.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.manager.close().await?;
        info!("Sync service stopped");
        Ok(())
    }

    /// Whether a broker session is live.
    pub fn listening(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics().snapshot()
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }
}
