// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persisted background jobs.
//!
//! A job is a unit of scheduled work identified by its [`JobType`] and an identifier. All jobs of
//! one type are kept in a single queue which is persisted as a whole after every change, see
//! [`runner::JobRunner`]. Jobs are executed at least once: after a crash, the queue is reloaded
//! and jobs run again. Therefore, jobs must be idempotent and compute their work from the
//! persisted state when they run, instead of carrying precomputed work with them.

use std::{fmt, future::Future, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod runner;
pub mod runners;
pub mod store;

#[cfg(any(test, feature = "test_utils"))]
pub mod fake_jobs;

/// Tag of a job kind.
///
/// The serialized name is stable and part of the persisted queue format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "GroupSyncJobType")]
    GroupSync,
    #[cfg(any(test, feature = "test_utils"))]
    #[serde(rename = "FakeSleepForJobType")]
    FakeSleepFor,
    #[cfg(any(test, feature = "test_utils"))]
    #[serde(rename = "FakeSleepForMultiJobType")]
    FakeSleepForMulti,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::GroupSync => "GroupSyncJobType",
            #[cfg(any(test, feature = "test_utils"))]
            JobType::FakeSleepFor => "FakeSleepForJobType",
            #[cfg(any(test, feature = "test_utils"))]
            JobType::FakeSleepForMulti => "FakeSleepForMultiJobType",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted part of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_type: JobType,
    pub identifier: String,
    pub scheduled_for: DateTime<Utc>,
    pub retry_count: u32,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub delay_between_retries: Duration,
    #[serde(default)]
    pub last_tick: Option<DateTime<Utc>>,
    /// Data specific to the job kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl JobRecord {
    pub fn new(
        job_type: JobType,
        identifier: impl Into<String>,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
        delay_between_retries: Duration,
    ) -> Self {
        Self {
            job_type,
            identifier: identifier.into(),
            scheduled_for,
            retry_count: 0,
            max_attempts,
            delay_between_retries,
            last_tick: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn is_same_job(&self, other: &JobRecord) -> bool {
        self.job_type == other.job_type && self.identifier == other.identifier
    }
}

/// Result of a single run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunJobResult {
    Success,
    RetryJobIfPossible,
    PermanentFailure,
}

/// Decision of a job about whether it should be added to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddJobCheck {
    Add,
    SkipSameJobPresent,
}

/// Outcome of adding a job to a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddJobOutcome {
    /// An equivalent job is already queued; the new job was dropped.
    TypeExists,
    /// A job with the same identifier is already queued; the new job was dropped.
    IdentifierExists,
    /// The job was queued and will run later.
    JobDeferred,
    /// The job was queued and is due now on an idle, started runner.
    JobStarted,
}

/// Errors a job run can end with, besides its [`RunJobResult`].
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Local state is inconsistent. The job is dropped and the error is surfaced.
    #[error("Invariant violation: {0}")]
    InvariantViolation(anyhow::Error),
    /// Treated as [`RunJobResult::RetryJobIfPossible`].
    #[error("Recoverable error: {0}")]
    Recoverable(anyhow::Error),
}

impl JobError {
    pub fn invariant(error: impl Into<anyhow::Error>) -> Self {
        Self::InvariantViolation(error.into())
    }

    pub fn recoverable(error: impl Into<anyhow::Error>) -> Self {
        Self::Recoverable(error.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::Recoverable(error)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobRecordError {
    #[error("Record of type {actual} cannot be loaded as {expected}")]
    WrongType { expected: JobType, actual: JobType },
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
    #[error("Missing payload")]
    MissingPayload,
}

/// A job kind which can be stored in a job queue and executed by a [`runner::JobRunner`].
pub trait PersistedJob: Sized + Send + Sync + 'static {
    const JOB_TYPE: JobType;

    /// Shared state the job needs to run.
    type Context: Send + Sync + 'static;

    /// Reconstructs a job from its persisted record.
    fn from_record(record: JobRecord) -> Result<Self, JobRecordError>;

    fn record(&self) -> &JobRecord;

    fn record_mut(&mut self) -> &mut JobRecord;

    fn run(
        &self,
        context: &Self::Context,
    ) -> impl Future<Output = Result<RunJobResult, JobError>> + Send;

    /// Upper bound of a single run; an expired run is retried if possible.
    fn job_timeout(&self, context: &Self::Context) -> Duration;

    /// Decides whether this job is added given the jobs which are already queued.
    ///
    /// By default, a job is skipped when a job of the same type and identifier is queued. This
    /// includes the job which is currently running.
    fn add_job_check(&self, queued: &[JobRecord]) -> AddJobCheck {
        if queued.iter().any(|job| job.is_same_job(self.record())) {
            AddJobCheck::SkipSameJobPresent
        } else {
            AddJobCheck::Add
        }
    }

    /// Queued jobs which are made obsolete by adding this job.
    ///
    /// Only called with jobs that are not running.
    fn non_running_jobs_to_remove(&self, _queued: &[JobRecord]) -> Vec<String> {
        Vec::new()
    }

    fn identifier(&self) -> &str {
        &self.record().identifier
    }

    fn check_type(record: &JobRecord) -> Result<(), JobRecordError> {
        if record.job_type == Self::JOB_TYPE {
            Ok(())
        } else {
            Err(JobRecordError::WrongType {
                expected: Self::JOB_TYPE,
                actual: record.job_type,
            })
        }
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis: u64 = duration
            .as_millis()
            .try_into()
            .map_err(|_| serde::ser::Error::custom("out of range"))?;
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: u64 = Deserialize::deserialize(d).map_err(de::Error::custom)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn record() -> JobRecord {
        JobRecord::new(
            JobType::GroupSync,
            "id",
            Utc.timestamp_millis_opt(1_000).unwrap(),
            2,
            Duration::from_secs(15),
        )
    }

    #[test]
    fn record_serialization_format() {
        let value = serde_json::to_value(record()).unwrap();
        assert_eq!(value["jobType"], "GroupSyncJobType");
        assert_eq!(value["identifier"], "id");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["maxAttempts"], 2);
        assert_eq!(value["delayBetweenRetries"], 15_000);
        assert!(value["lastTick"].is_null());
        assert!(value.get("payload").is_none());

        let decoded: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record());
    }

    #[test]
    fn unknown_job_type_is_rejected() {
        let mut value = serde_json::to_value(record()).unwrap();
        value["jobType"] = "AvatarDownloadJobType".into();
        assert!(serde_json::from_value::<JobRecord>(value).is_err());
    }

    #[test]
    fn same_job_requires_type_and_identifier() {
        let a = record();
        let mut b = record();
        assert!(a.is_same_job(&b));
        b.identifier = "other".to_owned();
        assert!(!a.is_same_job(&b));
        b = record();
        b.job_type = JobType::FakeSleepFor;
        assert!(!a.is_same_job(&b));
    }
}
