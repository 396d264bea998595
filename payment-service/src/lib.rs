pub mod gateway;
pub mod handlers;

pub use gateway::{GatewayError, PaymentGateway, SimulatedGateway};
pub use handlers::PaymentSaga;
