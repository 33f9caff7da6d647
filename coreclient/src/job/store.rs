// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable storage of job queues.
//!
//! A queue is stored as a unit: saving replaces the whole list of jobs of a type.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::warn;

use super::{JobRecord, JobType};

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Storage(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Loads the queue of the given type in persisted order.
    ///
    /// Records which can't be decoded are dropped.
    async fn load(&self, job_type: JobType) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Replaces the queue of the given type.
    async fn save(&self, job_type: JobType, jobs: &[JobRecord]) -> Result<(), JobStoreError>;
}

/// Decodes the elements of a persisted queue one by one.
fn decode_records(job_type: JobType, values: Vec<serde_json::Value>) -> Vec<JobRecord> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<JobRecord>(value) {
            Ok(record) if record.job_type == job_type => Some(record),
            Ok(record) => {
                warn!(
                    %job_type,
                    actual = %record.job_type,
                    identifier = %record.identifier,
                    "Dropping job record of a different type"
                );
                None
            }
            Err(error) => {
                warn!(%job_type, %error, "Dropping malformed job record");
                None
            }
        })
        .collect()
}

fn decode_queue(job_type: JobType, jobs: &str) -> Vec<JobRecord> {
    match serde_json::from_str::<Vec<serde_json::Value>>(jobs) {
        Ok(values) => decode_records(job_type, values),
        Err(error) => {
            warn!(%job_type, %error, "Persisted job queue is not a list; ignoring it");
            Vec::new()
        }
    }
}

/// Job store backed by the client database.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn load(&self, job_type: JobType) -> Result<Vec<JobRecord>, JobStoreError> {
        let Some(jobs) = Self::load_queue(&self.pool, job_type).await? else {
            return Ok(Vec::new());
        };
        Ok(decode_queue(job_type, &jobs))
    }

    async fn save(&self, job_type: JobType, jobs: &[JobRecord]) -> Result<(), JobStoreError> {
        let jobs = serde_json::to_string(jobs)?;
        let mut txn = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        Self::store_queue(&mut *txn, job_type, &jobs).await?;
        txn.commit().await?;
        Ok(())
    }
}

mod persistence {
    use chrono::Utc;
    use sqlx::{SqliteExecutor, query, query_scalar};

    use super::*;

    impl SqliteJobStore {
        pub(super) async fn load_queue(
            executor: impl SqliteExecutor<'_>,
            job_type: JobType,
        ) -> sqlx::Result<Option<String>> {
            query_scalar(
                "SELECT jobs
                FROM job_queue
                WHERE job_type = ?",
            )
            .bind(job_type.as_str())
            .fetch_optional(executor)
            .await
        }

        pub(super) async fn store_queue(
            executor: impl SqliteExecutor<'_>,
            job_type: JobType,
            jobs: &str,
        ) -> sqlx::Result<()> {
            let now = Utc::now();
            query(
                "INSERT INTO job_queue (job_type, jobs, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (job_type) DO UPDATE
                SET jobs = excluded.jobs, updated_at = excluded.updated_at",
            )
            .bind(job_type.as_str())
            .bind(jobs)
            .bind(now)
            .execute(executor)
            .await?;
            Ok(())
        }
    }
}

/// Job store keeping queues in memory.
///
/// Queues are still kept in their serialized form, so that loading goes through the same
/// decoding as with a database.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    queues: Arc<Mutex<HashMap<JobType, String>>>,
    saves: Arc<Mutex<HashMap<JobType, usize>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the queue of the given type was saved.
    pub fn save_count(&self, job_type: JobType) -> usize {
        lock(&self.saves)
            .get(&job_type)
            .copied()
            .unwrap_or_default()
    }

    /// Replaces the serialized queue of the given type, bypassing validation.
    pub fn insert_raw(&self, job_type: JobType, jobs: impl Into<String>) {
        lock(&self.queues).insert(job_type, jobs.into());
    }
}

/// The maps stay consistent when a holder panics: every update is a single insert.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self, job_type: JobType) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = lock(&self.queues).get(&job_type).cloned();
        Ok(jobs
            .map(|jobs| decode_queue(job_type, &jobs))
            .unwrap_or_default())
    }

    async fn save(&self, job_type: JobType, jobs: &[JobRecord]) -> Result<(), JobStoreError> {
        let jobs = serde_json::to_string(jobs)?;
        lock(&self.queues).insert(job_type, jobs);
        *lock(&self.saves).entry(job_type).or_default() += 1;
        Ok(())
    }
}
