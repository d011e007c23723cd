//! Message processor — admits inbound SMS and decides what goes back.
//!
//! Flow:
//! 1. Admission controller → Claimed / Skipped / Failed
//! 2. Claimed with no delay → reply inline with the body, free the slot
//! 3. Claimed with a delay → hold the slot, arm a deferred dispatch
//!
//! A claim is freed if processing is abandoned before step 2 or 3 finishes.
//! 4. Skipped or Failed → inline fallback reply

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Error, PipelineError};
use crate::pipeline::admission::{AdmissionController, GateMode};
use crate::pipeline::dispatch::DeferredDispatcher;
use crate::pipeline::fallback::FallbackReplier;
use crate::pipeline::types::{AdmissionResult, DeferredInfo, InboundMessage, ProcessedMessage};
use crate::queue::{EntryKind, QueueEntry};

pub struct MessageProcessor {
    admission: AdmissionController,
    dispatcher: Arc<DeferredDispatcher>,
    fallback: FallbackReplier,
}

impl MessageProcessor {
    pub fn new(
        admission: AdmissionController,
        dispatcher: Arc<DeferredDispatcher>,
        fallback: FallbackReplier,
    ) -> Self {
        Self {
            admission,
            dispatcher,
            fallback,
        }
    }

    pub fn dispatcher(&self) -> &Arc<DeferredDispatcher> {
        &self.dispatcher
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Declare the queue and optionally wipe leftover state.
    ///
    /// A durable queue may still hold the marker of a deferred dispatch that
    /// died with the previous process; that marker would block every message.
    pub async fn startup(&self, reset_queue: bool, clear_log: bool) -> Result<(), Error> {
        let queue_name = self.admission.queue_name();
        self.admission.queue().declare(queue_name).await?;

        if reset_queue {
            let removed = self.admission.release().await?;
            info!(queue = queue_name, removed, "Admission queue reset");
        }
        if clear_log {
            let deleted = self.admission.log().clear_all().await?;
            info!(deleted, "Message log cleared on startup");
        }
        Ok(())
    }

    /// Process one inbound message. Never fails: every path yields a reply
    /// decision.
    pub async fn process(&self, message: InboundMessage) -> ProcessedMessage {
        info!(
            sender = %message.sender,
            correlation_id = message.correlation_id.as_deref().unwrap_or("-"),
            "Processing inbound SMS"
        );

        let (admission, guard) = self.admission.admit_guarded(&message).await;
        let (reply, deferred) = match &admission {
            AdmissionResult::Claimed { decision, .. } if decision.is_deferred() => {
                match self.defer(&message, decision.duration()).await {
                    Some(info) => {
                        // The dispatcher frees the slot once it fires.
                        if let Some(guard) = guard {
                            guard.hand_off();
                        }
                        (None, Some(info))
                    }
                    None => {
                        if let Some(guard) = guard {
                            guard.release().await;
                        }
                        (Some(message.body.clone()), None)
                    }
                }
            }
            AdmissionResult::Claimed { .. } => {
                if let Some(guard) = guard {
                    guard.release().await;
                }
                (Some(message.body.clone()), None)
            }
            AdmissionResult::Skipped { .. } | AdmissionResult::Failed { .. } => {
                (Some(self.fallback.reply(&message.body).await), None)
            }
        };

        info!(
            sender = %message.sender,
            outcome = admission.label(),
            deferred = deferred.is_some(),
            "Inbound SMS processed"
        );
        ProcessedMessage {
            admission,
            reply,
            deferred,
            processed_at: Utc::now(),
        }
    }

    /// Arm the deferred dispatch. Returns `None` if the slot could not be
    /// marked, in which case the caller answers right away.
    async fn defer(
        &self,
        message: &InboundMessage,
        after: std::time::Duration,
    ) -> Option<DeferredInfo> {
        if self.admission.gate() == GateMode::Advisory {
            let entry = QueueEntry::for_message(EntryKind::Deferred, message);
            if let Err(e) = self
                .admission
                .queue()
                .publish(self.admission.queue_name(), &entry)
                .await
            {
                let e = PipelineError::SlotMark(e);
                warn!(cause = %e.kind(), error = %e, "Failed to mark slot, replying now instead");
                return None;
            }
        }

        let dispatch_id = self
            .dispatcher
            .schedule_deferred(&message.sender, &message.recipient, &message.body, after)
            .await;
        Some(DeferredInfo {
            dispatch_id,
            destination: message.sender.clone(),
            after,
        })
    }

    /// Abort pending deferred dispatches.
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }
}
