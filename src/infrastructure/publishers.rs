use crate::domain::event::PublishedEvent;
use crate::domain::ports::EventPublisher;
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Keeps every published event in memory. `fail_next` makes the following
/// calls fail, which is how tests exercise the dead-letter path.
#[derive(Default, Clone)]
pub struct RecordingPublisher {
    published: Arc<Mutex<Vec<PublishedEvent>>>,
    failures: Arc<Mutex<usize>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next(&self, count: usize) {
        *self.failures.lock().await = count;
    }

    pub async fn published(&self) -> Vec<PublishedEvent> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: &PublishedEvent) -> Result<()> {
        {
            let mut failures = self.failures.lock().await;
            if *failures > 0 {
                *failures -= 1;
                return Err(LedgerError::Publish("bus unavailable".to_string()));
            }
        }
        self.published.lock().await.push(event.clone());
        Ok(())
    }
}

/// Emits each committed event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, event: &PublishedEvent) -> Result<()> {
        tracing::info!(
            target: "lease_ledger::events",
            lease_id = %event.aggregate_id,
            sequence_no = event.sequence_no,
            event_type = %event.event_type,
            payload = %event.payload,
            "event"
        );
        Ok(())
    }
}
