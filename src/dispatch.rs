use crate::sinks::Sink;
use crate::telegram::{FieldId, FieldValue, Telegram};
use chrono::Utc;
use std::time::{Duration, Instant};

/// Wall-clock source used when a telegram carries no timestamp.
pub trait Clock {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Hands every decoded telegram to each registered sink in registration
/// order. A failing sink is logged and skipped; the others still run.
pub struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
    clock: Box<dyn Clock>,
}

impl Dispatcher {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            sinks: Vec::new(),
            clock,
        }
    }

    pub fn register(&mut self, sink: Box<dyn Sink>) {
        tracing::info!(sink = sink.name(), active = sink.is_active(), "registered sink");
        self.sinks.push(sink);
    }

    pub fn sinks(&self) -> impl Iterator<Item = &dyn Sink> {
        self.sinks.iter().map(|sink| sink.as_ref())
    }

    pub fn timestamp_for(&self, telegram: &Telegram) -> i64 {
        match telegram.get(FieldId::P1MessageTimestamp) {
            Some(FieldValue::Timestamp(ts)) => ts.timestamp(),
            _ => self.clock.now_unix(),
        }
    }

    /// Returns the number of sinks that reported an error.
    pub fn dispatch(&mut self, telegram: &Telegram) -> usize {
        let started = Instant::now();
        let timestamp = self.timestamp_for(telegram);
        let mut failed = 0;
        for sink in &mut self.sinks {
            if let Err(err) = sink.process(timestamp, telegram) {
                failed += 1;
                tracing::error!(sink = sink.name(), timestamp, error = %err, "sink failed to process telegram");
            }
        }
        tracing::debug!(
            timestamp,
            fields = telegram.len(),
            failed,
            elapsed_us = started.elapsed().as_micros() as u64,
            "dispatched telegram"
        );
        failed
    }

    /// Shuts every sink down and waits up to `grace` for each background
    /// writer to drain.
    pub async fn shutdown(&mut self, grace: Duration) {
        for sink in &mut self.sinks {
            let Some(handle) = sink.shutdown() else {
                continue;
            };
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => tracing::info!(sink = sink.name(), "sink drained"),
                Ok(Err(err)) => {
                    tracing::warn!(sink = sink.name(), error = %err, "sink writer task failed")
                }
                Err(_) => tracing::warn!(
                    sink = sink.name(),
                    grace_ms = grace.as_millis() as u64,
                    "sink did not drain before shutdown"
                ),
            }
        }
    }
}
