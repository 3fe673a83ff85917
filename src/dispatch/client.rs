use anyhow::{Result, anyhow};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{BatchDispatcher, BatchRequest};
use crate::telemetry::TelemetryEvent;

/// How one batch invocation ended
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: u32,
    pub result: Result<()>,
    pub duration: Duration,
}

/// A mapped batch, not yet joined
pub struct MappedBatch {
    pub batch_id: u32,
    handle: JoinHandle<BatchOutcome>,
}

/// Submits batches through a dispatcher, keeping at most `scale` of them
/// running at once
pub struct Client {
    dispatcher: Arc<dyn BatchDispatcher>,
    slots: Arc<Semaphore>,
    workers: usize,
    telemetry_tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl Client {
    pub fn new(dispatcher: Arc<dyn BatchDispatcher>) -> Self {
        Self {
            dispatcher,
            slots: Arc::new(Semaphore::new(1)),
            workers: 1,
            telemetry_tx: None,
        }
    }

    /// Allow `workers` concurrent batch invocations (at least one)
    pub fn scale(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self.slots = Arc::new(Semaphore::new(self.workers));
        self
    }

    pub fn with_telemetry(mut self, telemetry_tx: mpsc::UnboundedSender<TelemetryEvent>) -> Self {
        self.telemetry_tx = Some(telemetry_tx);
        self
    }

    /// Start every request; each waits for a free slot before being submitted
    pub fn map(&self, requests: Vec<BatchRequest>) -> Vec<MappedBatch> {
        info!(
            "Mapping {} batches over {} workers",
            requests.len(),
            self.workers
        );

        requests
            .into_iter()
            .map(|request| {
                let batch_id = request.batch_id;
                let shots = request.shot_count;
                let dispatcher = Arc::clone(&self.dispatcher);
                let slots = Arc::clone(&self.slots);
                let telemetry_tx = self.telemetry_tx.clone();

                let handle = tokio::spawn(async move {
                    let start = Instant::now();
                    let result = match slots.acquire_owned().await {
                        Ok(_permit) => {
                            send(&telemetry_tx, TelemetryEvent::BatchSubmitted { batch_id });
                            match dispatcher.submit(&request).await {
                                Ok(handle) => dispatcher.join(handle).await,
                                Err(e) => Err(e),
                            }
                        }
                        Err(e) => Err(anyhow!("Dispatch slots closed: {}", e)),
                    };

                    let duration = start.elapsed();
                    let duration_ms = duration.as_millis() as u64;
                    match &result {
                        Ok(()) => send(
                            &telemetry_tx,
                            TelemetryEvent::BatchCompleted {
                                batch_id,
                                shots,
                                duration_ms,
                            },
                        ),
                        Err(e) => {
                            warn!("Batch {} failed: {:#}", batch_id, e);
                            send(
                                &telemetry_tx,
                                TelemetryEvent::BatchFailed {
                                    batch_id,
                                    duration_ms,
                                },
                            );
                        }
                    }

                    BatchOutcome {
                        batch_id,
                        result,
                        duration,
                    }
                });

                MappedBatch { batch_id, handle }
            })
            .collect()
    }

    /// Wait for every mapped batch, in map order
    pub async fn gather(mapped: Vec<MappedBatch>) -> Vec<BatchOutcome> {
        let ids: Vec<u32> = mapped.iter().map(|m| m.batch_id).collect();
        let joined = futures::future::join_all(mapped.into_iter().map(|m| m.handle)).await;

        joined
            .into_iter()
            .zip(ids)
            .map(|(joined, batch_id)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Batch {} panicked: {:#}", batch_id, e);
                    BatchOutcome {
                        batch_id,
                        result: Err(anyhow!("Batch task panicked: {}", e)),
                        duration: Duration::ZERO,
                    }
                }
            })
            .collect()
    }
}

fn send(telemetry_tx: &Option<mpsc::UnboundedSender<TelemetryEvent>>, event: TelemetryEvent) {
    if let Some(tx) = telemetry_tx {
        let _ = tx.send(event);
    }
}
