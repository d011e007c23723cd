//! In-process admission queue.
//!
//! Suitable for a single-process deployment where the slot only has to be
//! shared between tasks. Depth does not survive a restart.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{AdmissionQueue, ClaimOutcome, QueueEntry};
use crate::error::QueueError;

/// Named in-memory queues behind one async mutex.
#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<QueueEntry>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdmissionQueue for InMemoryQueue {
    async fn declare(&self, name: &str) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if !queues.contains_key(name) {
            queues.insert(name.to_string(), VecDeque::new());
            info!(queue = name, "Queue declared");
        }
        Ok(())
    }

    async fn depth(&self, name: &str) -> Result<u64, QueueError> {
        let queues = self.queues.lock().await;
        let depth = queues.get(name).map_or(0, |q| q.len() as u64);
        debug!(queue = name, depth, "Queue depth");
        Ok(depth)
    }

    async fn publish(&self, name: &str, payload: &QueueEntry) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(name.to_string())
            .or_default()
            .push_back(payload.clone());
        debug!(queue = name, kind = ?payload.kind, "Entry published");
        Ok(())
    }

    async fn purge_all(&self, name: &str) -> Result<u64, QueueError> {
        let mut queues = self.queues.lock().await;
        let removed = queues.get_mut(name).map_or(0, |q| {
            let n = q.len() as u64;
            q.clear();
            n
        });
        info!(queue = name, removed, "Queue purged");
        Ok(removed)
    }

    async fn try_claim(
        &self,
        name: &str,
        payload: &QueueEntry,
    ) -> Result<ClaimOutcome, QueueError> {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(name.to_string()).or_default();
        if queue.is_empty() {
            queue.push_back(payload.clone());
            debug!(queue = name, "Slot claimed");
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::Occupied {
                depth: queue.len() as u64,
            })
        }
    }
}
