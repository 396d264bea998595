//! Building blocks shared by the booking saga services: the event catalogue,
//! the outbox and inventory stores, queue transport and the retrying worker.

pub mod config;
pub mod db;
pub mod events;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod worker;

pub use events::{AggregateType, DomainEvent, EventError, EventKind};
pub use queue::{Job, JobPublisher, Queue, Route};
pub use retry::RetryPolicy;
pub use store::{BookingStore, InventoryStore, OutboxStore, StoreError};
pub use worker::{permanent, JobHandler, JobOutcome, Worker};
