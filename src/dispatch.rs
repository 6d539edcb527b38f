//! Transform dispatch: one entry point per classified event.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::files::{remove_output, write_output_async};
use crate::queue::{AssetRequest, RequestQueue, Ticket};
use crate::role::{AssetKey, EventKind, FileDescriptor, TransformEvent};
use crate::stats::QueueSummary;
use crate::transform::{CompiledArtifact, Transforms};

/// What happened to one event
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Requests were handed to the queue, one ticket per destination
    Enqueued {
        kind: EventKind,
        key: AssetKey,
        tickets: Vec<Ticket>,
    },
    /// The cycle for this file ended before anything was enqueued
    Failed { key: AssetKey, error: SyncError },
}

impl DispatchOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, DispatchOutcome::Enqueued { .. })
    }

    pub fn key(&self) -> &AssetKey {
        match self {
            DispatchOutcome::Enqueued { key, .. } | DispatchOutcome::Failed { key, .. } => key,
        }
    }
}

/// Runs transforms and feeds the request queue
pub struct Dispatcher {
    transforms: Arc<Transforms>,
    queue: RequestQueue,
}

impl Dispatcher {
    pub fn new(transforms: Arc<Transforms>, queue: RequestQueue) -> Self {
        Self { transforms, queue }
    }

    pub fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    /// Handle one event. Errors are logged here and never propagate
    pub async fn dispatch(&self, event: TransformEvent) -> DispatchOutcome {
        let TransformEvent { kind, descriptor } = event;
        let key = descriptor.key.clone();
        let observed = descriptor.observed_path.clone();

        let result = match kind {
            EventKind::Delete => Ok(self.delete(&descriptor).await),
            EventKind::Update => self.update(descriptor).await,
        };

        match result {
            Ok(tickets) => DispatchOutcome::Enqueued { kind, key, tickets },
            Err(error) => {
                error!(path = %observed.display(), key = %key, error = %error, "transform failed");
                DispatchOutcome::Failed { key, error }
            }
        }
    }

    /// No read, no transform: one delete per destination
    async fn delete(&self, descriptor: &FileDescriptor) -> Vec<Ticket> {
        match remove_output(&descriptor.output_path).await {
            Ok(removed) => {
                debug!(path = %descriptor.output_path.display(), removed, "output removed")
            }
            Err(e) => warn!(error = %e, "could not remove compiled output"),
        }

        let tickets = self.queue.broadcast(AssetRequest::Delete {
            key: descriptor.key.clone(),
        });
        info!(key = %descriptor.key, destinations = tickets.len(), "queued delete");
        tickets
    }

    async fn update(&self, descriptor: FileDescriptor) -> Result<Vec<Ticket>, SyncError> {
        let source = if Transforms::reads_source(&descriptor) {
            tokio::fs::read(&descriptor.source_path)
                .await
                .map_err(|source| SyncError::Read {
                    path: descriptor.source_path.clone(),
                    source,
                })?
        } else {
            Vec::new()
        };

        let transforms = Arc::clone(&self.transforms);
        let job = descriptor.clone();
        let bytes = tokio::task::spawn_blocking(move || transforms.apply(&job, &source))
            .await
            .map_err(|e| {
                SyncError::compile(&descriptor.source_path, format!("transform task failed: {}", e))
            })??;

        write_output_async(&descriptor.output_path, &bytes).await?;

        let artifact = CompiledArtifact::new(descriptor.key.clone(), bytes);
        let tickets = self.queue.broadcast(artifact.request());
        info!(
            key = %artifact.key,
            bytes = artifact.bytes.len(),
            destinations = tickets.len(),
            "queued upload"
        );
        Ok(tickets)
    }

    /// Close the queue and wait for queued deliveries
    pub async fn drain(self) -> QueueSummary {
        self.queue.drain().await
    }
}
