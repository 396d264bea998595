pub mod handlers;
pub mod mailer;

pub use handlers::{BookingConfirmedMailer, DeadLetterAlert};
pub use mailer::{MailError, MailMessage, MailSender, SimulatedMailer};
