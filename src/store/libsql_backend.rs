//! libSQL backend — `MessageLog` and `AdmissionQueue` over one connection.
//!
//! Supports local file and in-memory databases. The message log is scoped by
//! a collection name so several logs can share one database file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, QueueError};
use crate::pipeline::types::{InboundMessage, MessageRecord};
use crate::queue::{AdmissionQueue, ClaimOutcome, QueueEntry};
use crate::store::migrations;
use crate::store::traits::MessageLog;

/// Collection used when none is configured.
pub const DEFAULT_COLLECTION: &str = "sms_messages";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    collection: String,
    /// Last `received_at` handed out, loaded lazily from the table.
    last_received: Mutex<Option<DateTime<Utc>>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and the memory-only profile).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            collection: DEFAULT_COLLECTION.to_string(),
            last_received: Mutex::new(None),
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Scope the message log to `collection`.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self.last_received = Mutex::new(None);
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Next insertion timestamp, never earlier than the previous one.
    ///
    /// The caller must hold `last` for the whole insert.
    async fn next_received_at(
        &self,
        last: &mut Option<DateTime<Utc>>,
    ) -> Result<DateTime<Utc>, DatabaseError> {
        if last.is_none() {
            *last = self.latest_received_at().await?;
        }
        let now = Utc::now();
        Ok(match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        })
    }

    async fn latest_received_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(received_at) FROM messages WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_received_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<String>(0).ok().map(|s| parse_datetime(&s))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_received_at: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

const MESSAGE_COLUMNS: &str =
    "id, sender, recipient, body, correlation_id, account_id, received_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Fixed-width UTC so the text column sorts like the timestamp.
fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Map a libsql Row to a MessageRecord.
fn row_to_record(row: &libsql::Row) -> Result<MessageRecord, libsql::Error> {
    let received_str: String = row.get(6)?;
    Ok(MessageRecord {
        id: row.get(0)?,
        sender: row.get(1)?,
        recipient: row.get(2)?,
        body: row.get(3)?,
        correlation_id: row.get(4).ok(),
        account_id: row.get(5).ok(),
        received_at: parse_datetime(&received_str),
    })
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn queue_err(queue: &str, op: &'static str, e: impl std::fmt::Display) -> QueueError {
    QueueError::OperationFailed {
        queue: queue.to_string(),
        op,
        reason: e.to_string(),
    }
}

// ── Message log ─────────────────────────────────────────────────────

#[async_trait]
impl MessageLog for LibSqlBackend {
    async fn append(&self, message: &InboundMessage) -> Result<MessageRecord, DatabaseError> {
        let mut last = self.last_received.lock().await;
        let received_at = self.next_received_at(&mut last).await?;
        let id = Uuid::new_v4().to_string();

        self.conn()
            .execute(
                "INSERT INTO messages (id, collection, sender, recipient, body,
                    correlation_id, account_id, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id.clone(),
                    self.collection.as_str(),
                    message.sender.as_str(),
                    message.recipient.as_str(),
                    message.body.as_str(),
                    opt_text(message.correlation_id.as_deref()),
                    opt_text(message.account_id.as_deref()),
                    format_datetime(received_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append: {e}")))?;
        *last = Some(received_at);

        debug!(id = %id, collection = %self.collection, "Message appended to log");
        Ok(MessageRecord {
            id,
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            body: message.body.clone(),
            correlation_id: message.correlation_id.clone(),
            account_id: message.account_id.clone(),
            received_at,
        })
    }

    async fn read_all(&self) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE collection = ?1 ORDER BY seq ASC"
                ),
                params![self.collection.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("read_all: {e}")))?;

        let mut records = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let record = row_to_record(&row)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                    records.push(record);
                }
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("read_all: {e}"))),
            }
        }
        Ok(records)
    }

    async fn count(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM messages WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count parse: {e}")))?;
                Ok(count as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count: {e}"))),
        }
    }

    async fn clear_all(&self) -> Result<u64, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM messages WHERE collection = ?1",
                params![self.collection.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("clear_all: {e}")))?;

        info!(deleted, collection = %self.collection, "Message log cleared");
        Ok(deleted)
    }
}

// ── Admission queue ─────────────────────────────────────────────────

#[async_trait]
impl AdmissionQueue for LibSqlBackend {
    async fn declare(&self, name: &str) -> Result<(), QueueError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO admission_queues (name, declared_at) VALUES (?1, ?2)",
                params![name, format_datetime(Utc::now())],
            )
            .await
            .map_err(|e| queue_err(name, "declare", e))?;

        if inserted > 0 {
            info!(queue = name, "Queue declared");
        }
        Ok(())
    }

    async fn depth(&self, name: &str) -> Result<u64, QueueError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM admission_entries WHERE queue_name = ?1",
                params![name],
            )
            .await
            .map_err(|e| queue_err(name, "depth", e))?;

        let depth = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| queue_err(name, "depth", e))? as u64,
            Ok(None) => 0,
            Err(e) => return Err(queue_err(name, "depth", e)),
        };
        debug!(queue = name, depth, "Queue depth");
        Ok(depth)
    }

    async fn publish(&self, name: &str, payload: &QueueEntry) -> Result<(), QueueError> {
        self.declare(name).await?;
        self.conn()
            .execute(
                "INSERT INTO admission_entries (queue_name, payload, published_at)
                 VALUES (?1, ?2, ?3)",
                params![name, payload.to_json()?, format_datetime(Utc::now())],
            )
            .await
            .map_err(|e| queue_err(name, "publish", e))?;

        debug!(queue = name, kind = ?payload.kind, "Entry published");
        Ok(())
    }

    async fn purge_all(&self, name: &str) -> Result<u64, QueueError> {
        let removed = self
            .conn()
            .execute(
                "DELETE FROM admission_entries WHERE queue_name = ?1",
                params![name],
            )
            .await
            .map_err(|e| queue_err(name, "purge", e))?;

        info!(queue = name, removed, "Queue purged");
        Ok(removed)
    }

    async fn try_claim(
        &self,
        name: &str,
        payload: &QueueEntry,
    ) -> Result<ClaimOutcome, QueueError> {
        self.declare(name).await?;
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO admission_entries (queue_name, payload, published_at)
                 SELECT ?1, ?2, ?3
                 WHERE NOT EXISTS (SELECT 1 FROM admission_entries WHERE queue_name = ?1)",
                params![name, payload.to_json()?, format_datetime(Utc::now())],
            )
            .await
            .map_err(|e| queue_err(name, "try_claim", e))?;

        if inserted == 1 {
            debug!(queue = name, "Slot claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        // The holder may have purged in between; the claim still lost.
        let depth = self.depth(name).await?;
        Ok(ClaimOutcome::Occupied {
            depth: depth.max(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EntryKind;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn inbound(body: &str) -> InboundMessage {
        InboundMessage::new("+15550001", "+15550002", body)
    }

    fn entry(kind: EntryKind) -> QueueEntry {
        QueueEntry::for_message(kind, &inbound("hello"))
    }

    // ── Log tests ───────────────────────────────────────────────────

    #[tokio::test]
    async fn append_and_read_back_in_order() {
        let db = test_db().await;
        for body in ["first", "second", "third"] {
            db.append(&inbound(body)).await.unwrap();
        }

        let records = db.read_all().await.unwrap();
        let bodies: Vec<&str> = records.iter().map(|r| r.body.as_str()).collect();
        assert_eq!(bodies, ["first", "second", "third"]);
        assert_eq!(db.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn append_keeps_optional_fields() {
        let db = test_db().await;
        let message = inbound("").with_correlation_id("SM123").with_account_id("AC9");
        let stored = db.append(&message).await.unwrap();

        let records = db.read_all().await.unwrap();
        assert_eq!(records, vec![stored]);
        assert_eq!(records[0].body, "");
        assert_eq!(records[0].correlation_id.as_deref(), Some("SM123"));
        assert_eq!(records[0].account_id.as_deref(), Some("AC9"));
    }

    #[tokio::test]
    async fn missing_optional_fields_read_as_none() {
        let db = test_db().await;
        db.append(&inbound("plain")).await.unwrap();
        let record = &db.read_all().await.unwrap()[0];
        assert!(record.correlation_id.is_none());
        assert!(record.account_id.is_none());
    }

    #[tokio::test]
    async fn received_at_is_non_decreasing() {
        let db = test_db().await;
        for i in 0..20 {
            db.append(&inbound(&i.to_string())).await.unwrap();
        }
        let records = db.read_all().await.unwrap();
        assert!(
            records
                .windows(2)
                .all(|pair| pair[0].received_at <= pair[1].received_at)
        );
    }

    #[tokio::test]
    async fn received_at_never_goes_behind_stored_rows() {
        let db = test_db().await;
        let future = Utc::now() + chrono::Duration::hours(1);
        db.conn()
            .execute(
                "INSERT INTO messages (id, collection, sender, recipient, body, received_at)
                 VALUES ('old', ?1, 'a', 'b', 'c', ?2)",
                params![DEFAULT_COLLECTION, format_datetime(future)],
            )
            .await
            .unwrap();

        let record = db.append(&inbound("later")).await.unwrap();
        assert!(record.received_at >= parse_datetime(&format_datetime(future)));
    }

    #[tokio::test]
    async fn clear_all_is_idempotent() {
        let db = test_db().await;
        db.append(&inbound("a")).await.unwrap();
        db.append(&inbound("b")).await.unwrap();

        assert_eq!(db.clear_all().await.unwrap(), 2);
        assert_eq!(db.count().await.unwrap(), 0);
        assert_eq!(db.clear_all().await.unwrap(), 0);
        assert_eq!(db.count().await.unwrap(), 0);
        assert!(db.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn collections_are_isolated() {
        let db = test_db().await.with_collection("other");
        db.append(&inbound("x")).await.unwrap();
        assert_eq!(db.collection(), "other");
        assert_eq!(db.count().await.unwrap(), 1);

        let default = db.with_collection(DEFAULT_COLLECTION);
        assert_eq!(default.count().await.unwrap(), 0);
        assert_eq!(default.clear_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn log_survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("pigeon.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.append(&inbound("persisted")).await.unwrap();
            db.publish("sms", &entry(EntryKind::Deferred)).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let records = db.read_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body, "persisted");
        assert_eq!(db.depth("sms").await.unwrap(), 1);
    }

    // ── Queue tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn queue_declare_is_idempotent() {
        let db = test_db().await;
        db.declare("sms").await.unwrap();
        db.publish("sms", &entry(EntryKind::Deferred)).await.unwrap();
        db.declare("sms").await.unwrap();
        assert_eq!(db.depth("sms").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_depth_publish_purge() {
        let db = test_db().await;
        assert_eq!(db.depth("sms").await.unwrap(), 0);

        db.publish("sms", &entry(EntryKind::Deferred)).await.unwrap();
        db.publish("sms", &entry(EntryKind::Deferred)).await.unwrap();
        db.publish("other", &entry(EntryKind::Deferred)).await.unwrap();
        assert_eq!(db.depth("sms").await.unwrap(), 2);

        assert_eq!(db.purge_all("sms").await.unwrap(), 2);
        assert_eq!(db.depth("sms").await.unwrap(), 0);
        assert_eq!(db.depth("other").await.unwrap(), 1);
        assert_eq!(db.purge_all("sms").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queue_try_claim_only_when_empty() {
        let db = test_db().await;
        assert_eq!(
            db.try_claim("sms", &entry(EntryKind::Claim)).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            db.try_claim("sms", &entry(EntryKind::Claim)).await.unwrap(),
            ClaimOutcome::Occupied { depth: 1 }
        );

        db.purge_all("sms").await.unwrap();
        assert_eq!(
            db.try_claim("sms", &entry(EntryKind::Claim)).await.unwrap(),
            ClaimOutcome::Claimed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_try_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        db.declare("sms").await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.try_claim("sms", &entry(EntryKind::Claim)).await.unwrap()
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed => claimed += 1,
                ClaimOutcome::Occupied { depth } => assert_eq!(depth, 1),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(db.depth("sms").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn queue_payload_is_json() {
        let db = test_db().await;
        db.publish("sms", &entry(EntryKind::Deferred)).await.unwrap();

        let mut rows = db
            .conn()
            .query("SELECT payload FROM admission_entries", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let payload: String = row.get(0).unwrap();
        let parsed: QueueEntry = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.kind, EntryKind::Deferred);
        assert_eq!(parsed.body, "hello");
    }
}
