//! Admission controller — the single gate in front of the message log.
//!
//! At most one processing pass holds the slot at a time. The slot is the
//! admission queue's depth: empty means free.
//!
//! Flow for one message:
//! 1. Check the slot (atomic claim, or a depth read in advisory mode)
//! 2. Append to the log
//! 3. Read the whole log back and hand it to the analyzer
//! 4. Extract the delay decision

use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ConfigError, PipelineError, QueueError};
use crate::pipeline::analyzer::Analyzer;
use crate::pipeline::decision::{Decision, extract_delay};
use crate::pipeline::types::{AdmissionResult, InboundMessage};
use crate::queue::{AdmissionQueue, ClaimOutcome, EntryKind, QueueEntry};
use crate::store::MessageLog;

/// How the slot is tested and taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GateMode {
    /// Publish-if-empty in one step. The slot is held from the check on.
    #[default]
    Atomic,
    /// Read depth, act later. Two messages can both see a free slot.
    Advisory,
}

impl FromStr for GateMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(Self::Atomic),
            "advisory" => Ok(Self::Advisory),
            other => Err(ConfigError::InvalidValue {
                key: "PIGEON_GATE_MODE".to_string(),
                message: format!("expected 'atomic' or 'advisory', got '{other}'"),
            }),
        }
    }
}

/// Slot check result.
enum Slot {
    Free,
    Occupied(u64),
}

/// An atomic claim that has not been handed off yet.
///
/// Dropping an armed guard (the admission future was cancelled mid-flight)
/// purges the queue on a background task so the slot cannot stay taken.
pub(crate) struct SlotGuard {
    queue: Arc<dyn AdmissionQueue>,
    queue_name: String,
    armed: bool,
}

impl SlotGuard {
    fn new(queue: Arc<dyn AdmissionQueue>, queue_name: &str) -> Self {
        Self {
            queue,
            queue_name: queue_name.to_string(),
            armed: true,
        }
    }

    /// Keep the slot held. Whoever owns it now is responsible for freeing it.
    pub(crate) fn hand_off(mut self) {
        self.armed = false;
    }

    /// Free the slot now.
    pub(crate) async fn release(mut self) {
        if let Err(e) = self.queue.purge_all(&self.queue_name).await {
            warn!(queue = %self.queue_name, error = %e, "Failed to release slot");
        }
        self.armed = false;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(queue = %self.queue_name, "Abandoned claim left in queue, no runtime");
            return;
        };
        warn!(queue = %self.queue_name, "Admission abandoned while holding the slot, releasing");
        let queue = Arc::clone(&self.queue);
        let queue_name = std::mem::take(&mut self.queue_name);
        runtime.spawn(async move {
            if let Err(e) = queue.purge_all(&queue_name).await {
                warn!(queue = %queue_name, error = %e, "Failed to release abandoned slot");
            }
        });
    }
}

pub struct AdmissionController {
    log: Arc<dyn MessageLog>,
    queue: Arc<dyn AdmissionQueue>,
    analyzer: Arc<dyn Analyzer>,
    queue_name: String,
    gate: GateMode,
}

impl AdmissionController {
    pub fn new(
        log: Arc<dyn MessageLog>,
        queue: Arc<dyn AdmissionQueue>,
        analyzer: Arc<dyn Analyzer>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            log,
            queue,
            analyzer,
            queue_name: queue_name.into(),
            gate: GateMode::default(),
        }
    }

    pub fn with_gate(mut self, gate: GateMode) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> GateMode {
        self.gate
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn queue(&self) -> &Arc<dyn AdmissionQueue> {
        &self.queue
    }

    pub fn log(&self) -> &Arc<dyn MessageLog> {
        &self.log
    }

    /// Try to admit `message`. Never panics, never returns an error.
    ///
    /// In atomic mode a `Claimed` result leaves the slot held; the caller
    /// either arms a deferred dispatch or calls [`release`](Self::release).
    pub async fn admit(&self, message: &InboundMessage) -> AdmissionResult {
        let (result, guard) = self.admit_guarded(message).await;
        if let Some(guard) = guard {
            guard.hand_off();
        }
        result
    }

    /// Like [`admit`](Self::admit), but a claim taken in atomic mode comes
    /// back as a [`SlotGuard`]. The guard is only ever `Some` alongside
    /// `Claimed`.
    pub(crate) async fn admit_guarded(
        &self,
        message: &InboundMessage,
    ) -> (AdmissionResult, Option<SlotGuard>) {
        match self.check_slot(message).await {
            Ok(Slot::Free) => {}
            Ok(Slot::Occupied(depth)) => {
                info!(
                    sender = %message.sender,
                    depth,
                    "Slot occupied, skipping admission"
                );
                let skipped = AdmissionResult::Skipped {
                    current_depth: depth,
                };
                return (skipped, None);
            }
            Err(e) => return (self.failed(e), None),
        }

        let guard = (self.gate == GateMode::Atomic)
            .then(|| SlotGuard::new(Arc::clone(&self.queue), &self.queue_name));

        match self.persist_and_analyze(message).await {
            Ok((total_in_log, decision)) => {
                info!(
                    sender = %message.sender,
                    total_in_log,
                    delay = %decision.delay,
                    "Message admitted"
                );
                let claimed = AdmissionResult::Claimed {
                    total_in_log,
                    decision,
                };
                (claimed, guard)
            }
            Err(e) => {
                if let Some(guard) = guard {
                    guard.release().await;
                }
                (self.failed(e), None)
            }
        }
    }

    /// Free the slot. Returns how many entries were purged.
    pub async fn release(&self) -> Result<u64, QueueError> {
        self.queue.purge_all(&self.queue_name).await
    }

    async fn check_slot(&self, message: &InboundMessage) -> Result<Slot, PipelineError> {
        match self.gate {
            GateMode::Atomic => {
                let entry = QueueEntry::for_message(EntryKind::Claim, message);
                match self
                    .queue
                    .try_claim(&self.queue_name, &entry)
                    .await
                    .map_err(PipelineError::QueueCheck)?
                {
                    ClaimOutcome::Claimed => Ok(Slot::Free),
                    ClaimOutcome::Occupied { depth } => Ok(Slot::Occupied(depth)),
                }
            }
            GateMode::Advisory => {
                let depth = self
                    .queue
                    .depth(&self.queue_name)
                    .await
                    .map_err(PipelineError::QueueCheck)?;
                if depth == 0 {
                    Ok(Slot::Free)
                } else {
                    Ok(Slot::Occupied(depth))
                }
            }
        }
    }

    async fn persist_and_analyze(
        &self,
        message: &InboundMessage,
    ) -> Result<(u64, Decision), PipelineError> {
        let record = self.log.append(message).await?;
        debug!(id = %record.id, "Message persisted");

        let transcript = self.log.read_all().await?;
        let decision = match self.analyzer.analyze(&transcript).await {
            Ok(text) => extract_delay(&text),
            Err(e) => {
                warn!(error = %e, "Analyzer call failed, responding now");
                Decision::respond_now()
            }
        };

        Ok((transcript.len() as u64, decision))
    }

    fn failed(&self, e: PipelineError) -> AdmissionResult {
        let cause = e.kind();
        warn!(cause = %cause, error = %e, "Admission failed");
        AdmissionResult::Failed {
            cause,
            detail: e.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{DatabaseError, FailureKind, LlmError};
    use crate::pipeline::types::MessageRecord;
    use crate::queue::InMemoryQueue;
    use crate::store::LibSqlBackend;

    const QUEUE: &str = "sms";

    /// Analyzer returning a fixed reply, optionally after a pause.
    pub(crate) struct StubAnalyzer {
        pub reply: Result<String, ()>,
        pub pause: Duration,
        pub calls: AtomicUsize,
        pub last_transcript_len: AtomicUsize,
    }

    impl StubAnalyzer {
        pub fn replying(text: &str) -> Self {
            Self {
                reply: Ok(text.to_string()),
                pause: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_transcript_len: AtomicUsize::new(0),
            }
        }

        pub fn failing() -> Self {
            Self {
                reply: Err(()),
                ..Self::replying("")
            }
        }

        pub fn with_pause(mut self, pause: Duration) -> Self {
            self.pause = pause;
            self
        }
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        async fn analyze(&self, transcript: &[MessageRecord]) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.last_transcript_len
                .store(transcript.len(), Ordering::SeqCst);
            if !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
            self.reply.clone().map_err(|_| LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "offline".into(),
            })
        }
    }

    /// Log whose connection is gone.
    struct UnreachableLog;

    #[async_trait]
    impl MessageLog for UnreachableLog {
        async fn append(&self, _: &InboundMessage) -> Result<MessageRecord, DatabaseError> {
            Err(DatabaseError::Pool("connection refused".into()))
        }
        async fn read_all(&self) -> Result<Vec<MessageRecord>, DatabaseError> {
            Err(DatabaseError::Pool("connection refused".into()))
        }
        async fn count(&self) -> Result<u64, DatabaseError> {
            Err(DatabaseError::Pool("connection refused".into()))
        }
        async fn clear_all(&self) -> Result<u64, DatabaseError> {
            Err(DatabaseError::Pool("connection refused".into()))
        }
    }

    /// Queue whose broker is gone.
    struct UnreachableQueue;

    #[async_trait]
    impl AdmissionQueue for UnreachableQueue {
        async fn declare(&self, _: &str) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
        async fn depth(&self, _: &str) -> Result<u64, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
        async fn publish(&self, _: &str, _: &QueueEntry) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
        async fn purge_all(&self, _: &str) -> Result<u64, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
        async fn try_claim(&self, _: &str, _: &QueueEntry) -> Result<ClaimOutcome, QueueError> {
            Err(QueueError::Unavailable("broker down".into()))
        }
    }

    fn inbound(body: &str) -> InboundMessage {
        InboundMessage::new("+15550001", "+15550002", body)
    }

    async fn controller(
        gate: GateMode,
        analyzer: StubAnalyzer,
    ) -> (AdmissionController, Arc<LibSqlBackend>, Arc<InMemoryQueue>) {
        let log = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(InMemoryQueue::new());
        let controller =
            AdmissionController::new(log.clone(), queue.clone(), Arc::new(analyzer), QUEUE)
                .with_gate(gate);
        (controller, log, queue)
    }

    #[test]
    fn gate_mode_parses() {
        assert_eq!("atomic".parse::<GateMode>().unwrap(), GateMode::Atomic);
        assert_eq!(" Advisory ".parse::<GateMode>().unwrap(), GateMode::Advisory);
        assert!("optimistic".parse::<GateMode>().is_err());
        assert_eq!(GateMode::default(), GateMode::Atomic);
    }

    #[tokio::test]
    async fn free_slot_claims_and_responds_now() {
        let (controller, log, _queue) =
            controller(GateMode::Advisory, StubAnalyzer::replying("{\"delay\":\"0\"}")).await;

        let result = controller.admit(&inbound("hey")).await;
        assert_eq!(
            result,
            AdmissionResult::Claimed {
                total_in_log: 1,
                decision: Decision::respond_now(),
            }
        );
        assert_eq!(log.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn analyzer_sees_whole_log() {
        let analyzer = Arc::new(StubAnalyzer::replying(
            "On it.\n{\"delay\":\"2 hours\"}\nThanks!",
        ));
        let log = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = Arc::new(InMemoryQueue::new());
        let controller = AdmissionController::new(log.clone(), queue, analyzer.clone(), QUEUE)
            .with_gate(GateMode::Advisory);

        log.append(&inbound("movie at 7?")).await.unwrap();
        log.append(&inbound("yes, booked")).await.unwrap();

        let result = controller.admit(&inbound("ETA?")).await;
        match result {
            AdmissionResult::Claimed {
                total_in_log,
                decision,
            } => {
                assert_eq!(total_in_log, 3);
                assert_eq!(decision.delay, "2 hours");
            }
            other => panic!("expected Claimed, got {other:?}"),
        }
        assert_eq!(analyzer.last_transcript_len.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn occupied_slot_skips_without_touching_log() {
        let analyzer = StubAnalyzer::replying("{\"delay\":\"0\"}");
        let (controller, log, queue) = controller(GateMode::Advisory, analyzer).await;

        for _ in 0..3 {
            queue
                .publish(QUEUE, &QueueEntry::for_message(EntryKind::Deferred, &inbound("x")))
                .await
                .unwrap();
        }

        let result = controller.admit(&inbound("hello?")).await;
        assert_eq!(result, AdmissionResult::Skipped { current_depth: 3 });
        assert_eq!(log.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn occupied_slot_skips_in_atomic_mode() {
        let (controller, log, queue) =
            controller(GateMode::Atomic, StubAnalyzer::replying("{\"delay\":\"0\"}")).await;
        queue
            .publish(QUEUE, &QueueEntry::for_message(EntryKind::Deferred, &inbound("x")))
            .await
            .unwrap();

        let result = controller.admit(&inbound("hello?")).await;
        assert_eq!(result, AdmissionResult::Skipped { current_depth: 1 });
        assert_eq!(log.count().await.unwrap(), 0);
        assert_eq!(queue.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn atomic_claim_holds_slot_until_released() {
        let (controller, _log, queue) =
            controller(GateMode::Atomic, StubAnalyzer::replying("{\"delay\":\"0\"}")).await;

        assert!(matches!(
            controller.admit(&inbound("a")).await,
            AdmissionResult::Claimed { .. }
        ));
        assert_eq!(queue.depth(QUEUE).await.unwrap(), 1);
        assert!(matches!(
            controller.admit(&inbound("b")).await,
            AdmissionResult::Skipped { .. }
        ));

        assert_eq!(controller.release().await.unwrap(), 1);
        assert!(matches!(
            controller.admit(&inbound("c")).await,
            AdmissionResult::Claimed { total_in_log: 2, .. }
        ));
    }

    #[tokio::test]
    async fn store_failure_reports_persistence_error() {
        let queue = Arc::new(InMemoryQueue::new());
        let controller = AdmissionController::new(
            Arc::new(UnreachableLog),
            queue.clone(),
            Arc::new(StubAnalyzer::replying("{\"delay\":\"0\"}")),
            QUEUE,
        );

        match controller.admit(&inbound("x")).await {
            AdmissionResult::Failed { cause, .. } => {
                assert_eq!(cause, FailureKind::PersistenceError)
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        // Atomic mode gives the slot back on failure.
        assert_eq!(queue.depth(QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_failure_reports_transport_error() {
        let log = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for gate in [GateMode::Atomic, GateMode::Advisory] {
            let controller = AdmissionController::new(
                log.clone(),
                Arc::new(UnreachableQueue),
                Arc::new(StubAnalyzer::replying("{\"delay\":\"0\"}")),
                QUEUE,
            )
            .with_gate(gate);

            match controller.admit(&inbound("x")).await {
                AdmissionResult::Failed { cause, .. } => {
                    assert_eq!(cause, FailureKind::TransportError)
                }
                other => panic!("expected Failed, got {other:?}"),
            }
        }
        assert_eq!(log.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn analyzer_failure_defaults_to_respond_now() {
        let (controller, log, _queue) =
            controller(GateMode::Atomic, StubAnalyzer::failing()).await;

        let result = controller.admit(&inbound("x")).await;
        assert_eq!(
            result,
            AdmissionResult::Claimed {
                total_in_log: 1,
                decision: Decision::respond_now(),
            }
        );
        assert_eq!(log.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn garbage_analysis_defaults_to_respond_now() {
        let (controller, _log, _queue) =
            controller(GateMode::Advisory, StubAnalyzer::replying("I cannot help")).await;
        match controller.admit(&inbound("x")).await {
            AdmissionResult::Claimed { decision, .. } => {
                assert_eq!(decision, Decision::respond_now())
            }
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_insert_per_claim() {
        let (controller, log, _queue) =
            controller(GateMode::Advisory, StubAnalyzer::replying("{\"delay\":\"0\"}")).await;
        for i in 1..=5u64 {
            match controller.admit(&inbound(&i.to_string())).await {
                AdmissionResult::Claimed { total_in_log, .. } => assert_eq!(total_in_log, i),
                other => panic!("expected Claimed, got {other:?}"),
            }
        }
        assert_eq!(log.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn concurrent_atomic_admits_claim_once() {
        let analyzer = StubAnalyzer::replying("{\"delay\":\"0\"}")
            .with_pause(Duration::from_millis(100));
        let (controller, log, _queue) = controller(GateMode::Atomic, analyzer).await;
        let controller = Arc::new(controller);

        let mut handles = Vec::new();
        for i in 0..8 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.admit(&inbound(&format!("msg {i}"))).await
            }));
        }

        let mut claimed = 0;
        let mut skipped = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AdmissionResult::Claimed { .. } => claimed += 1,
                AdmissionResult::Skipped { .. } => skipped += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(skipped, 7);
        assert_eq!(log.count().await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_atomic_admits_on_durable_queue() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let analyzer = StubAnalyzer::replying("{\"delay\":\"0\"}")
            .with_pause(Duration::from_millis(100));
        let controller = Arc::new(AdmissionController::new(
            db.clone(),
            db.clone(),
            Arc::new(analyzer),
            QUEUE,
        ));

        let mut handles = Vec::new();
        for i in 0..8 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller.admit(&inbound(&format!("msg {i}"))).await
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                AdmissionResult::Claimed { .. } => claimed += 1,
                AdmissionResult::Skipped { current_depth } => assert_eq!(current_depth, 1),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(db.count().await.unwrap(), 1);
        assert_eq!(db.depth(QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_admit_frees_claim() {
        let analyzer =
            StubAnalyzer::replying("{\"delay\":\"0\"}").with_pause(Duration::from_millis(500));
        let (controller, log, queue) = controller(GateMode::Atomic, analyzer).await;

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), controller.admit(&inbound("hi"))).await;
        assert!(cancelled.is_err());
        assert_eq!(log.count().await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.depth(QUEUE).await.unwrap() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("claim purged");
    }

    #[tokio::test]
    async fn completed_admit_keeps_claim() {
        let (controller, _log, queue) =
            controller(GateMode::Atomic, StubAnalyzer::replying("{\"delay\":\"1 hour\"}")).await;
        let result = controller.admit(&inbound("ETA?")).await;
        assert!(matches!(result, AdmissionResult::Claimed { .. }));

        tokio::task::yield_now().await;
        assert_eq!(queue.depth(QUEUE).await.unwrap(), 1);
    }
}
