pub mod handlers;

pub use handlers::TicketSaga;
