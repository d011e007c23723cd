//! Deferred dispatch — sends a held reply after a delay, then frees the slot.
//!
//! Each pending dispatch is a spawned task tracked in a registry keyed by
//! destination. Whatever happens to the send, the admission queue is purged
//! once the timer fires. Timer state lives in memory only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::Responder;
use crate::error::{FailureKind, PipelineError};
use crate::queue::AdmissionQueue;

/// Tracked dispatch task.
struct PendingDispatch {
    id: Uuid,
    origin: String,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Snapshot of a pending dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDispatchInfo {
    pub id: Uuid,
    pub destination: String,
    pub origin: String,
    pub fire_at: DateTime<Utc>,
}

type Registry = Arc<Mutex<HashMap<String, PendingDispatch>>>;

pub struct DeferredDispatcher {
    queue: Arc<dyn AdmissionQueue>,
    queue_name: String,
    responder: Arc<dyn Responder>,
    pending: Registry,
}

impl DeferredDispatcher {
    pub fn new(
        queue: Arc<dyn AdmissionQueue>,
        queue_name: impl Into<String>,
        responder: Arc<dyn Responder>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            responder,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Arm a one-shot send of `body` to `destination` after `after`.
    ///
    /// The queue must already hold an entry. A pending dispatch for the same
    /// destination is aborted and replaced; the slot stays occupied.
    pub async fn schedule_deferred(
        &self,
        destination: &str,
        origin: &str,
        body: &str,
        after: Duration,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let fire_at = chrono::Duration::from_std(after)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut pending = self.pending.lock().await;
        if let Some(previous) = pending.remove(destination) {
            previous.handle.abort();
            info!(
                destination,
                replaced = %previous.id,
                "Replacing pending deferred dispatch"
            );
        }

        let handle = tokio::spawn(run_dispatch(
            id,
            destination.to_string(),
            origin.to_string(),
            body.to_string(),
            after,
            Arc::clone(&self.queue),
            self.queue_name.clone(),
            Arc::clone(&self.responder),
            Arc::clone(&self.pending),
        ));

        pending.insert(
            destination.to_string(),
            PendingDispatch {
                id,
                origin: origin.to_string(),
                fire_at,
                handle,
            },
        );

        info!(
            dispatch_id = %id,
            destination,
            delay_secs = after.as_secs(),
            "Deferred dispatch armed"
        );
        id
    }

    /// Abort the pending dispatch for `destination` and free the slot.
    ///
    /// Returns false when nothing was pending.
    pub async fn cancel(&self, destination: &str) -> bool {
        let Some(dispatch) = self.pending.lock().await.remove(destination) else {
            return false;
        };
        dispatch.handle.abort();
        info!(dispatch_id = %dispatch.id, destination, "Deferred dispatch cancelled");
        purge(&*self.queue, &self.queue_name).await;
        true
    }

    /// Pending dispatches, soonest first.
    pub async fn pending(&self) -> Vec<PendingDispatchInfo> {
        let mut list: Vec<PendingDispatchInfo> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(destination, d)| PendingDispatchInfo {
                id: d.id,
                destination: destination.clone(),
                origin: d.origin.clone(),
                fire_at: d.fire_at,
            })
            .collect();
        list.sort_by_key(|info| info.fire_at);
        list
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Abort every pending dispatch. Their sends are dropped.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, PendingDispatch)> =
            self.pending.lock().await.drain().collect();
        if drained.is_empty() {
            return;
        }

        for (destination, dispatch) in &drained {
            dispatch.handle.abort();
            warn!(
                dispatch_id = %dispatch.id,
                destination = %destination,
                fire_at = %dispatch.fire_at,
                "Dropping pending deferred dispatch on shutdown"
            );
        }
        purge(&*self.queue, &self.queue_name).await;
        info!(dropped = drained.len(), "Deferred dispatcher shut down");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_dispatch(
    id: Uuid,
    destination: String,
    origin: String,
    body: String,
    after: Duration,
    queue: Arc<dyn AdmissionQueue>,
    queue_name: String,
    responder: Arc<dyn Responder>,
    pending: Registry,
) {
    tokio::time::sleep(after).await;

    match responder.send(&destination, &origin, &body).await {
        Ok(()) => info!(dispatch_id = %id, destination = %destination, "Deferred reply sent"),
        Err(e) => {
            let e = PipelineError::Dispatch(e);
            warn!(
                dispatch_id = %id,
                destination = %destination,
                cause = %FailureKind::DispatchError,
                error = %e,
                "Deferred reply failed"
            );
        }
    }

    // Deregister before purging so a concurrent cancel cannot abort the purge.
    {
        let mut pending = pending.lock().await;
        if pending.get(&destination).is_some_and(|d| d.id == id) {
            pending.remove(&destination);
        }
    }
    purge(&*queue, &queue_name).await;
}

async fn purge(queue: &dyn AdmissionQueue, queue_name: &str) {
    match queue.purge_all(queue_name).await {
        Ok(removed) => debug!(queue = queue_name, removed, "Slot released"),
        Err(e) => warn!(queue = queue_name, error = %e, "Failed to release slot"),
    }
}
