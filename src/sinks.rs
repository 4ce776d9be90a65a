mod influx;
mod sqlite;
mod store;

pub use influx::InfluxSink;
pub use sqlite::SqliteSink;

use crate::telegram::Telegram;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("{failed_writes} of {attempted_writes} writes and {failed_commits} commits failed")]
    Partial {
        attempted_writes: usize,
        failed_writes: usize,
        failed_commits: usize,
    },
    #[error("point queue full; dropped {0} points")]
    QueueFull(usize),
    #[error("point queue closed; writer task is gone")]
    QueueClosed,
}

/// A persistence destination fed with every telegram.
///
/// Activation is decided when the sink is built; an inactive sink must treat
/// `process` as a no-op. Errors are reported to the caller and never affect
/// other sinks.
pub trait Sink {
    fn name(&self) -> &'static str;

    fn is_active(&self) -> bool;

    fn process(&mut self, timestamp: i64, telegram: &Telegram) -> Result<(), SinkError>;

    /// Stops accepting telegrams. Sinks that write from a background task
    /// return its handle so the caller can wait for the final flush.
    fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        None
    }
}
