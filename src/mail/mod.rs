pub mod service;

pub use service::{MailService, OutgoingMail, SendReceipt};
