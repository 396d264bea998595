pub mod api;
pub mod handlers;
pub mod outbox;
pub mod reaper;

pub use handlers::BookingSaga;
pub use outbox::{DispatcherConfig, OutboxDispatcher, SweepReport, TickOutcome};
pub use reaper::BookingReaper;
