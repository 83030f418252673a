//! Storage traits for the stats pipeline, with in-memory and Postgres backends.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sasp_core::{AttemptRecord, Certificate, RawAttempt, RawUserStats, StudentStats};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sasp-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("record not found: {0}")]
    NotFound(Uuid),
    #[error("decoding stored value: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable staging area for unvalidated payloads from the assessment service.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Append-only: every fetch inserts a fresh snapshot row.
    async fn insert_user_stats(&self, student_id: Uuid, payload: Value) -> Result<RawUserStats>;

    /// Upsert by `external_attempt_id`. A conflicting re-fetch overwrites
    /// payload/received_at and re-queues the record (`processed = false`)
    /// but never touches `processing_attempts`.
    async fn upsert_attempt(
        &self,
        external_attempt_id: Uuid,
        student_id: Uuid,
        test_id: Option<Uuid>,
        payload: Value,
    ) -> Result<RawAttempt>;

    /// Oldest-received-first, bounded by `limit`.
    async fn unprocessed_user_stats(&self, limit: i64) -> Result<Vec<RawUserStats>>;
    async fn unprocessed_attempts(&self, limit: i64) -> Result<Vec<RawAttempt>>;

    async fn mark_user_stats_processed(&self, id: Uuid, error: Option<String>) -> Result<()>;
    async fn mark_attempt_processed(&self, id: Uuid, error: Option<String>) -> Result<()>;

    /// Returns the new counter value.
    async fn increment_processing_attempts(&self, id: Uuid) -> Result<i32>;

    async fn user_stats_for_student(&self, student_id: Uuid, limit: i64)
        -> Result<Vec<RawUserStats>>;
    async fn attempts_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<RawAttempt>>;
}

/// Canonical attempt table: the single source of truth for aggregation and
/// certificate eligibility.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Last-write-wins upsert keyed by attempt id.
    async fn upsert(&self, record: &AttemptRecord) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<AttemptRecord>>;

    /// Full recompute of the per-student aggregate from canonical rows.
    async fn compute_stats(&self, student_id: Uuid) -> Result<StudentStats>;

    /// Most recent attempts first.
    async fn recent_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<AttemptRecord>>;

    /// Passed and completed attempts that have no certificate yet, optionally
    /// scoped to one student.
    async fn uncertified_passed(&self, student_id: Option<Uuid>) -> Result<Vec<AttemptRecord>>;

    async fn set_certificate(&self, attempt_id: Uuid, certificate_id: Uuid) -> Result<()>;
}

/// Durable per-student aggregate, overwritten wholesale on every recompute.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn get(&self, student_id: Uuid) -> Result<Option<StudentStats>>;
    async fn upsert(&self, stats: &StudentStats) -> Result<()>;
}

#[async_trait]
pub trait CertificateStore: Send + Sync {
    async fn insert(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        test_attempt_id: Uuid,
        storage_key: Option<String>,
    ) -> Result<Certificate>;
    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>>;
}

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn exists(&self, student_id: Uuid) -> Result<bool>;
    /// 1-based pages, stable order.
    async fn list_page(&self, page: i64, per_page: i64) -> Result<Vec<Uuid>>;
}

// ---------------------------------------------------------------------------
// TTL cache
// ---------------------------------------------------------------------------

/// TTL-bound key/value cache for derived stats. Values are JSON blobs so the
/// cache stays agnostic of what the aggregator puts in it.
#[derive(Clone)]
pub struct StatsCache {
    inner: moka::future::Cache<String, Arc<Value>>,
}

impl StatsCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: moka::future::Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn stats_key(student_id: Uuid) -> String {
        format!("user_stats:{student_id}")
    }

    pub fn full_data_key(student_id: Uuid) -> String {
        format!("user_full_data:{student_id}")
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Value>> {
        self.inner.get(key).await
    }

    pub async fn put(&self, key: String, value: Value) {
        self.inner.insert(key, Arc::new(value)).await;
    }

    pub async fn remove(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

impl std::fmt::Debug for StatsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryInner {
    raw_user_stats: Vec<RawUserStats>,
    raw_attempts: Vec<RawAttempt>,
    attempts: HashMap<Uuid, AttemptRecord>,
    aggregates: HashMap<Uuid, StudentStats>,
    certificates: Vec<Certificate>,
    students: Vec<Uuid>,
}

/// Single-process backend implementing every storage trait. Used by tests
/// and local runs without Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_student(&self, student_id: Uuid) {
        let mut inner = self.inner.lock().await;
        if !inner.students.contains(&student_id) {
            inner.students.push(student_id);
        }
    }

    /// Re-queue a raw attempt for processing, keeping its retry counter.
    pub async fn requeue_attempt(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let raw = inner
            .raw_attempts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        raw.processed = false;
        raw.error_message = None;
        Ok(())
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn insert_user_stats(&self, student_id: Uuid, payload: Value) -> Result<RawUserStats> {
        let record = RawUserStats {
            id: Uuid::new_v4(),
            student_id,
            payload,
            received_at: Utc::now(),
            processed: false,
            error_message: None,
        };
        self.inner.lock().await.raw_user_stats.push(record.clone());
        Ok(record)
    }

    async fn upsert_attempt(
        &self,
        external_attempt_id: Uuid,
        student_id: Uuid,
        test_id: Option<Uuid>,
        payload: Value,
    ) -> Result<RawAttempt> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .raw_attempts
            .iter_mut()
            .find(|r| r.external_attempt_id == external_attempt_id)
        {
            existing.student_id = student_id;
            existing.test_id = test_id;
            existing.payload = payload;
            existing.received_at = Utc::now();
            existing.processed = false;
            existing.error_message = None;
            return Ok(existing.clone());
        }

        let record = RawAttempt {
            id: Uuid::new_v4(),
            external_attempt_id,
            student_id,
            test_id,
            payload,
            received_at: Utc::now(),
            processed: false,
            processing_attempts: 0,
            error_message: None,
        };
        inner.raw_attempts.push(record.clone());
        Ok(record)
    }

    async fn unprocessed_user_stats(&self, limit: i64) -> Result<Vec<RawUserStats>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .raw_user_stats
            .iter()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.received_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn unprocessed_attempts(&self, limit: i64) -> Result<Vec<RawAttempt>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .raw_attempts
            .iter()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.received_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_user_stats_processed(&self, id: Uuid, error: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let raw = inner
            .raw_user_stats
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        raw.processed = true;
        raw.error_message = error;
        Ok(())
    }

    async fn mark_attempt_processed(&self, id: Uuid, error: Option<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let raw = inner
            .raw_attempts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        raw.processed = true;
        raw.error_message = error;
        Ok(())
    }

    async fn increment_processing_attempts(&self, id: Uuid) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let raw = inner
            .raw_attempts
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        raw.processing_attempts += 1;
        Ok(raw.processing_attempts)
    }

    async fn user_stats_for_student(
        &self,
        student_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RawUserStats>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .raw_user_stats
            .iter()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn attempts_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<RawAttempt>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .raw_attempts
            .iter()
            .filter(|r| r.student_id == student_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl AttemptStore for MemoryStore {
    async fn upsert(&self, record: &AttemptRecord) -> Result<()> {
        self.inner
            .lock()
            .await
            .attempts
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AttemptRecord>> {
        Ok(self.inner.lock().await.attempts.get(&id).cloned())
    }

    async fn compute_stats(&self, student_id: Uuid) -> Result<StudentStats> {
        let inner = self.inner.lock().await;
        let rows: Vec<_> = inner
            .attempts
            .values()
            .filter(|a| a.student_id == student_id)
            .collect();

        let mut stats = StudentStats::empty(student_id);
        stats.total_attempts = rows.len() as i64;
        stats.passed_attempts = rows.iter().filter(|a| a.passed).count() as i64;
        stats.failed_attempts = rows.iter().filter(|a| !a.passed).count() as i64;

        let points: Vec<f64> = rows.iter().filter_map(|a| a.point).collect();
        if !points.is_empty() {
            stats.avg_score = points.iter().sum::<f64>() / points.len() as f64;
        }

        let mut tests: Vec<Uuid> = rows.iter().filter_map(|a| a.test_id).collect();
        tests.sort();
        tests.dedup();
        stats.total_tests_taken = tests.len() as i64;
        stats.last_attempt_at = rows.iter().map(|a| a.date_of_attempt).max();
        Ok(stats)
    }

    async fn recent_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<AttemptRecord>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .attempts
            .values()
            .filter(|a| a.student_id == student_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.date_of_attempt.cmp(&a.date_of_attempt));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn uncertified_passed(&self, student_id: Option<Uuid>) -> Result<Vec<AttemptRecord>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .attempts
            .values()
            .filter(|a| a.passed && a.completed && a.certificate_id.is_none())
            .filter(|a| student_id.map_or(true, |id| a.student_id == id))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.date_of_attempt);
        Ok(rows)
    }

    async fn set_certificate(&self, attempt_id: Uuid, certificate_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let attempt = inner
            .attempts
            .get_mut(&attempt_id)
            .ok_or(StoreError::NotFound(attempt_id))?;
        attempt.certificate_id = Some(certificate_id);
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for MemoryStore {
    async fn get(&self, student_id: Uuid) -> Result<Option<StudentStats>> {
        Ok(self.inner.lock().await.aggregates.get(&student_id).cloned())
    }

    async fn upsert(&self, stats: &StudentStats) -> Result<()> {
        self.inner
            .lock()
            .await
            .aggregates
            .insert(stats.student_id, stats.clone());
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn insert(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        test_attempt_id: Uuid,
        storage_key: Option<String>,
    ) -> Result<Certificate> {
        let certificate = Certificate {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            test_attempt_id,
            storage_key,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .await
            .certificates
            .push(certificate.clone());
        Ok(certificate)
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        Ok(self
            .inner
            .lock()
            .await
            .certificates
            .iter()
            .filter(|c| c.student_id == student_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StudentDirectory for MemoryStore {
    async fn exists(&self, student_id: Uuid) -> Result<bool> {
        Ok(self.inner.lock().await.students.contains(&student_id))
    }

    async fn list_page(&self, page: i64, per_page: i64) -> Result<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        let start = ((page.max(1) - 1) * per_page).max(0) as usize;
        Ok(inner
            .students
            .iter()
            .skip(start)
            .take(per_page.max(0) as usize)
            .copied()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        debug!("migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn raw_user_stats_from_row(row: &PgRow) -> Result<RawUserStats> {
    Ok(RawUserStats {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        payload: row.try_get("payload")?,
        received_at: row.try_get("received_at")?,
        processed: row.try_get("processed")?,
        error_message: row.try_get("error_message")?,
    })
}

fn raw_attempt_from_row(row: &PgRow) -> Result<RawAttempt> {
    Ok(RawAttempt {
        id: row.try_get("id")?,
        external_attempt_id: row.try_get("external_attempt_id")?,
        student_id: row.try_get("student_id")?,
        test_id: row.try_get("test_id")?,
        payload: row.try_get("payload")?,
        received_at: row.try_get("received_at")?,
        processed: row.try_get("processed")?,
        processing_attempts: row.try_get("processing_attempts")?,
        error_message: row.try_get("error_message")?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<AttemptRecord> {
    Ok(AttemptRecord {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        test_id: row.try_get("test_id")?,
        date_of_attempt: row.try_get("date_of_attempt")?,
        point: row.try_get("point")?,
        result: row.try_get("result")?,
        completed: row.try_get("completed")?,
        passed: row.try_get("passed")?,
        certificate_id: row.try_get("certificate_id")?,
        snapshot_ref: row.try_get("snapshot_ref")?,
        version: row.try_get("version")?,
        meta: row.try_get("meta")?,
    })
}

#[async_trait]
impl RawStore for PgStore {
    async fn insert_user_stats(&self, student_id: Uuid, payload: Value) -> Result<RawUserStats> {
        let record = RawUserStats {
            id: Uuid::new_v4(),
            student_id,
            payload,
            received_at: Utc::now(),
            processed: false,
            error_message: None,
        };
        sqlx::query(
            r#"
            INSERT INTO raw_user_stats (id, student_id, payload, received_at, processed)
            VALUES ($1, $2, $3, $4, FALSE)
            "#,
        )
        .bind(record.id)
        .bind(record.student_id)
        .bind(&record.payload)
        .bind(record.received_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_attempt(
        &self,
        external_attempt_id: Uuid,
        student_id: Uuid,
        test_id: Option<Uuid>,
        payload: Value,
    ) -> Result<RawAttempt> {
        let row = sqlx::query(
            r#"
            INSERT INTO raw_attempts
                (id, external_attempt_id, student_id, test_id, payload, received_at,
                 processed, processing_attempts)
            VALUES ($1, $2, $3, $4, $5, $6, FALSE, 0)
            ON CONFLICT (external_attempt_id) DO UPDATE SET
                student_id = EXCLUDED.student_id,
                test_id = EXCLUDED.test_id,
                payload = EXCLUDED.payload,
                received_at = EXCLUDED.received_at,
                processed = FALSE,
                error_message = NULL,
                processing_attempts = raw_attempts.processing_attempts
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(external_attempt_id)
        .bind(student_id)
        .bind(test_id)
        .bind(&payload)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        raw_attempt_from_row(&row)
    }

    async fn unprocessed_user_stats(&self, limit: i64) -> Result<Vec<RawUserStats>> {
        let rows = sqlx::query(
            "SELECT * FROM raw_user_stats WHERE processed = FALSE ORDER BY received_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_user_stats_from_row).collect()
    }

    async fn unprocessed_attempts(&self, limit: i64) -> Result<Vec<RawAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM raw_attempts WHERE processed = FALSE ORDER BY received_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_attempt_from_row).collect()
    }

    async fn mark_user_stats_processed(&self, id: Uuid, error: Option<String>) -> Result<()> {
        sqlx::query("UPDATE raw_user_stats SET processed = TRUE, error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_attempt_processed(&self, id: Uuid, error: Option<String>) -> Result<()> {
        sqlx::query("UPDATE raw_attempts SET processed = TRUE, error_message = $2 WHERE id = $1")
            .bind(id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_processing_attempts(&self, id: Uuid) -> Result<i32> {
        let row = sqlx::query(
            r#"
            UPDATE raw_attempts
               SET processing_attempts = processing_attempts + 1
             WHERE id = $1
            RETURNING processing_attempts
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;
        Ok(row.try_get("processing_attempts")?)
    }

    async fn user_stats_for_student(
        &self,
        student_id: Uuid,
        limit: i64,
    ) -> Result<Vec<RawUserStats>> {
        let rows = sqlx::query(
            "SELECT * FROM raw_user_stats WHERE student_id = $1 ORDER BY received_at DESC LIMIT $2",
        )
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_user_stats_from_row).collect()
    }

    async fn attempts_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<RawAttempt>> {
        let rows = sqlx::query(
            "SELECT * FROM raw_attempts WHERE student_id = $1 ORDER BY received_at DESC LIMIT $2",
        )
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_attempt_from_row).collect()
    }
}

#[async_trait]
impl AttemptStore for PgStore {
    async fn upsert(&self, record: &AttemptRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO test_attempts
                (id, student_id, test_id, date_of_attempt, point, result, completed,
                 passed, certificate_id, snapshot_ref, version, meta)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                student_id = EXCLUDED.student_id,
                test_id = EXCLUDED.test_id,
                date_of_attempt = EXCLUDED.date_of_attempt,
                point = EXCLUDED.point,
                result = EXCLUDED.result,
                completed = EXCLUDED.completed,
                passed = EXCLUDED.passed,
                certificate_id = EXCLUDED.certificate_id,
                snapshot_ref = EXCLUDED.snapshot_ref,
                version = EXCLUDED.version,
                meta = EXCLUDED.meta,
                updated_at = NOW()
            "#,
        )
        .bind(record.id)
        .bind(record.student_id)
        .bind(record.test_id)
        .bind(record.date_of_attempt)
        .bind(record.point)
        .bind(&record.result)
        .bind(record.completed)
        .bind(record.passed)
        .bind(record.certificate_id)
        .bind(&record.snapshot_ref)
        .bind(&record.version)
        .bind(&record.meta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<AttemptRecord>> {
        let row = sqlx::query("SELECT * FROM test_attempts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(attempt_from_row).transpose()
    }

    async fn compute_stats(&self, student_id: Uuid) -> Result<StudentStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_attempts,
                   COUNT(*) FILTER (WHERE passed) AS passed_attempts,
                   COUNT(*) FILTER (WHERE NOT passed) AS failed_attempts,
                   COALESCE(AVG(point), 0) AS avg_score,
                   COUNT(DISTINCT test_id) AS total_tests_taken,
                   MAX(date_of_attempt) AS last_attempt_at
              FROM test_attempts
             WHERE student_id = $1
            "#,
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(StudentStats {
            student_id,
            total_attempts: row.try_get("total_attempts")?,
            passed_attempts: row.try_get("passed_attempts")?,
            failed_attempts: row.try_get("failed_attempts")?,
            avg_score: row.try_get("avg_score")?,
            total_tests_taken: row.try_get("total_tests_taken")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
        })
    }

    async fn recent_for_student(&self, student_id: Uuid, limit: i64) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM test_attempts
             WHERE student_id = $1
             ORDER BY date_of_attempt DESC
             LIMIT $2
            "#,
        )
        .bind(student_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn uncertified_passed(&self, student_id: Option<Uuid>) -> Result<Vec<AttemptRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM test_attempts
             WHERE passed AND completed AND certificate_id IS NULL
               AND ($1::uuid IS NULL OR student_id = $1)
             ORDER BY date_of_attempt ASC
            "#,
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn set_certificate(&self, attempt_id: Uuid, certificate_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE test_attempts SET certificate_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(attempt_id)
        .bind(certificate_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AggregateStore for PgStore {
    async fn get(&self, student_id: Uuid) -> Result<Option<StudentStats>> {
        let row = sqlx::query("SELECT * FROM student_stats_aggregated WHERE student_id = $1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(StudentStats {
            student_id,
            total_attempts: row.try_get("total_attempts")?,
            passed_attempts: row.try_get("passed_attempts")?,
            failed_attempts: row.try_get("failed_attempts")?,
            avg_score: row.try_get("avg_score")?,
            total_tests_taken: row.try_get("total_tests_taken")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
        }))
    }

    async fn upsert(&self, stats: &StudentStats) -> Result<()> {
        let blob = serde_json::to_value(stats)?;
        sqlx::query(
            r#"
            INSERT INTO student_stats_aggregated
                (student_id, total_attempts, passed_attempts, failed_attempts,
                 avg_score, total_tests_taken, last_attempt_at, stats_blob)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (student_id) DO UPDATE SET
                total_attempts = EXCLUDED.total_attempts,
                passed_attempts = EXCLUDED.passed_attempts,
                failed_attempts = EXCLUDED.failed_attempts,
                avg_score = EXCLUDED.avg_score,
                total_tests_taken = EXCLUDED.total_tests_taken,
                last_attempt_at = EXCLUDED.last_attempt_at,
                stats_blob = EXCLUDED.stats_blob,
                updated_at = NOW()
            "#,
        )
        .bind(stats.student_id)
        .bind(stats.total_attempts)
        .bind(stats.passed_attempts)
        .bind(stats.failed_attempts)
        .bind(stats.avg_score)
        .bind(stats.total_tests_taken)
        .bind(stats.last_attempt_at)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CertificateStore for PgStore {
    async fn insert(
        &self,
        student_id: Uuid,
        course_id: Option<Uuid>,
        test_attempt_id: Uuid,
        storage_key: Option<String>,
    ) -> Result<Certificate> {
        let certificate = Certificate {
            id: Uuid::new_v4(),
            student_id,
            course_id,
            test_attempt_id,
            storage_key,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO certificates
                (id, student_id, course_id, test_attempt_id, storage_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(certificate.id)
        .bind(certificate.student_id)
        .bind(certificate.course_id)
        .bind(certificate.test_attempt_id)
        .bind(&certificate.storage_key)
        .bind(certificate.created_at)
        .execute(&self.pool)
        .await?;
        Ok(certificate)
    }

    async fn for_student(&self, student_id: Uuid) -> Result<Vec<Certificate>> {
        let rows = sqlx::query(
            "SELECT * FROM certificates WHERE student_id = $1 ORDER BY created_at DESC",
        )
        .bind(student_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(Certificate {
                    id: row.try_get("id")?,
                    student_id: row.try_get("student_id")?,
                    course_id: row.try_get("course_id")?,
                    test_attempt_id: row.try_get("test_attempt_id")?,
                    storage_key: row.try_get("storage_key")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StudentDirectory for PgStore {
    async fn exists(&self, student_id: Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM students WHERE id = $1 LIMIT 1")
            .bind(student_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_page(&self, page: i64, per_page: i64) -> Result<Vec<Uuid>> {
        let offset = (page.max(1) - 1) * per_page;
        let rows = sqlx::query("SELECT id FROM students ORDER BY created_at LIMIT $1 OFFSET $2")
            .bind(per_page)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get("id")?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attempt(student_id: Uuid, test_id: Uuid, point: f64, passed: bool) -> AttemptRecord {
        AttemptRecord {
            id: Uuid::new_v4(),
            student_id,
            test_id: Some(test_id),
            date_of_attempt: "2026-03-01".parse().unwrap(),
            point: Some(point),
            result: json!({}),
            completed: true,
            passed,
            certificate_id: None,
            snapshot_ref: None,
            version: None,
            meta: json!({}),
        }
    }

    #[tokio::test]
    async fn upsert_attempt_is_idempotent_and_keeps_retry_counter() {
        let store = MemoryStore::new();
        let external = Uuid::new_v4();
        let student = Uuid::new_v4();

        let first = store
            .upsert_attempt(external, student, None, json!({"rev": 1}))
            .await
            .unwrap();
        store
            .increment_processing_attempts(first.id)
            .await
            .unwrap();
        store
            .mark_attempt_processed(first.id, None)
            .await
            .unwrap();

        let second = store
            .upsert_attempt(external, student, None, json!({"rev": 2}))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.payload, json!({"rev": 2}));
        assert_eq!(second.processing_attempts, 1);
        assert!(!second.processed, "re-fetch re-queues the record");

        let unprocessed = store.unprocessed_attempts(10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
    }

    #[tokio::test]
    async fn unprocessed_attempts_are_oldest_first_and_bounded() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..5 {
            let raw = store
                .upsert_attempt(Uuid::new_v4(), student, None, json!({"seq": i}))
                .await
                .unwrap();
            ids.push(raw.id);
        }

        let batch = store.unprocessed_attempts(3).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.iter().map(|r| r.id).collect::<Vec<_>>(),
            ids[..3].to_vec()
        );
    }

    #[tokio::test]
    async fn mark_processed_records_error_message() {
        let store = MemoryStore::new();
        let raw = store
            .upsert_attempt(Uuid::new_v4(), Uuid::new_v4(), None, json!({}))
            .await
            .unwrap();
        store
            .mark_attempt_processed(raw.id, Some("student missing".to_string()))
            .await
            .unwrap();

        assert!(store.unprocessed_attempts(10).await.unwrap().is_empty());
        let history = store.attempts_for_student(raw.student_id, 10).await.unwrap();
        assert_eq!(
            history[0].error_message.as_deref(),
            Some("student missing")
        );
    }

    #[tokio::test]
    async fn compute_stats_aggregates_canonical_rows() {
        let store = MemoryStore::new();
        let student = Uuid::new_v4();
        let test_a = Uuid::new_v4();
        let test_b = Uuid::new_v4();

        AttemptStore::upsert(&store, &attempt(student, test_a, 90.0, true))
            .await
            .unwrap();
        AttemptStore::upsert(&store, &attempt(student, test_b, 40.0, false))
            .await
            .unwrap();
        AttemptStore::upsert(&store, &attempt(student, test_a, 70.0, true))
            .await
            .unwrap();

        let stats = store.compute_stats(student).await.unwrap();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.passed_attempts, 2);
        assert_eq!(stats.failed_attempts, 1);
        assert!((stats.avg_score - 66.666).abs() < 0.01);
        assert_eq!(stats.total_tests_taken, 2);
        assert_eq!(stats.last_attempt_at, Some("2026-03-01".parse().unwrap()));
    }

    #[tokio::test]
    async fn compute_stats_defaults_to_zero_for_unknown_student() {
        let store = MemoryStore::new();
        let stats = store.compute_stats(Uuid::new_v4()).await.unwrap();
        assert_eq!(stats.total_attempts, 0);
        assert_eq!(stats.avg_score, 0.0);
        assert!(stats.last_attempt_at.is_none());
    }

    #[tokio::test]
    async fn uncertified_passed_scan_honours_scope_and_certificates() {
        let store = MemoryStore::new();
        let student_a = Uuid::new_v4();
        let student_b = Uuid::new_v4();

        let winning = attempt(student_a, Uuid::new_v4(), 95.0, true);
        AttemptStore::upsert(&store, &winning).await.unwrap();
        AttemptStore::upsert(&store, &attempt(student_a, Uuid::new_v4(), 30.0, false))
            .await
            .unwrap();
        AttemptStore::upsert(&store, &attempt(student_b, Uuid::new_v4(), 88.0, true))
            .await
            .unwrap();

        assert_eq!(store.uncertified_passed(None).await.unwrap().len(), 2);
        assert_eq!(
            store
                .uncertified_passed(Some(student_a))
                .await
                .unwrap()
                .len(),
            1
        );

        store
            .set_certificate(winning.id, Uuid::new_v4())
            .await
            .unwrap();
        assert!(store
            .uncertified_passed(Some(student_a))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stats_cache_round_trip_and_invalidate() {
        let cache = StatsCache::new(64, Duration::from_secs(60));
        let student = Uuid::new_v4();
        let key = StatsCache::stats_key(student);

        assert!(cache.get(&key).await.is_none());
        cache.put(key.clone(), json!({"total_attempts": 3})).await;
        let hit = cache.get(&key).await.expect("cache hit");
        assert_eq!(hit["total_attempts"], 3);

        cache.remove(&key).await;
        assert!(cache.get(&key).await.is_none());
    }
}
