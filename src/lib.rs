//! # catalog-sync
//!
//! Keeps a read-optimized catalog store in step with the domain events that
//! upstream services publish on an AMQP topic exchange.
//!
//! ## Architecture
//!
//! ```text
//! Broker -> ConnectionManager -> Topology -> Consumer loop -> Handler -> Sync engine -> Store
//!                                                  |
//!                                                  +-> Dead-letter policy (on failure) -> ack / nack
//! ```
//!
//! ## Modules
//!
//! - [`broker`]: transport abstraction, AMQP (lapin) and in-memory brokers
//! - [`connection`]: resilient connection with replayed setup callbacks
//! - [`topology`]: static exchange / queue declarations
//! - [`subscription`]: handler registration and per-queue bindings
//! - [`consumer`]: consumer loop and dispatch
//! - [`dlq`]: `x-death` based retry ceiling
//! - [`sync`]: event reconciliation and relation merges
//! - [`store`]: entity stores (memory, Redis)
//! - [`catalog`]: the catalog models and their sync services

pub mod broker;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod health;
pub mod schema;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod subscription;
pub mod sync;
pub mod topology;
pub mod validation;

// Re-export commonly used types at crate root
pub use envelope::{Envelope, Message};
pub use service::{ServiceError, SyncServer};
pub use store::{Record, Store, StoreError};
pub use subscription::{MessageHandler, Outcome, Subscriber, SubscriptionDescriptor};
pub use sync::{SyncError, SyncEvent};
