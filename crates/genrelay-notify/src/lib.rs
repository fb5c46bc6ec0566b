//! Outbound side effects of a job: user notifications and status callbacks.

pub mod outbox;
pub mod sink;
pub mod status;
pub mod telegram;

pub use outbox::Outbox;
pub use sink::{NoopStatusSink, Notifier, StatusSink};
pub use status::HttpStatusSink;
pub use telegram::TelegramNotifier;
