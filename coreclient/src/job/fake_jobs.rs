// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job kinds which only sleep, for exercising runners independently of any domain.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    AddJobCheck, JobError, JobRecord, JobRecordError, JobType, PersistedJob, RunJobResult,
};

/// How a fake job run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FakeJobResult {
    Success,
    Retry,
    PermanentFailure,
    RecoverableError,
    InvariantViolation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FakeJobPayload {
    pub sleep_ms: u64,
    pub result: FakeJobResult,
    /// Identifiers of queued jobs this job makes obsolete
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<String>,
}

/// Observations shared by all fake jobs running with this context.
#[derive(Debug, Clone, Default)]
pub struct FakeJobContext {
    runs: Arc<Mutex<Vec<String>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
    pub job_timeout: Duration,
}

impl FakeJobContext {
    pub fn new(job_timeout: Duration) -> Self {
        Self {
            job_timeout,
            ..Default::default()
        }
    }

    /// Identifiers of the jobs which started to run, in order.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().unwrap().clone()
    }

    /// Highest number of jobs that were running at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        identifier: &str,
        payload: &FakeJobPayload,
    ) -> Result<RunJobResult, JobError> {
        self.runs.lock().unwrap().push(identifier.to_owned());
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        let _guard = RunningGuard(&self.running);
        tokio::time::sleep(Duration::from_millis(payload.sleep_ms)).await;

        match payload.result {
            FakeJobResult::Success => Ok(RunJobResult::Success),
            FakeJobResult::Retry => Ok(RunJobResult::RetryJobIfPossible),
            FakeJobResult::PermanentFailure => Ok(RunJobResult::PermanentFailure),
            FakeJobResult::RecoverableError => {
                Err(JobError::recoverable(anyhow::anyhow!("fake recoverable error")))
            }
            FakeJobResult::InvariantViolation => {
                Err(JobError::invariant(anyhow::anyhow!("fake invariant violation")))
            }
        }
    }
}

/// Decrements the running counter also when the run is cancelled by a timeout.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn fake_record(
    job_type: JobType,
    identifier: &str,
    scheduled_for: DateTime<Utc>,
    payload: &FakeJobPayload,
) -> JobRecord {
    let record = JobRecord::new(
        job_type,
        identifier,
        scheduled_for,
        3,
        Duration::from_millis(100),
    );
    match serde_json::to_value(payload) {
        Ok(value) => record.with_payload(value),
        Err(_) => record,
    }
}

fn decode_payload(record: &JobRecord) -> Result<FakeJobPayload, JobRecordError> {
    let payload = record.payload.clone().ok_or(JobRecordError::MissingPayload)?;
    Ok(serde_json::from_value(payload)?)
}

/// Sleeps and then ends with a preset result. Deduplicated by identifier.
#[derive(Debug, Clone)]
pub struct FakeSleepForJob {
    record: JobRecord,
    payload: FakeJobPayload,
}

impl FakeSleepForJob {
    pub fn new(identifier: &str, scheduled_for: DateTime<Utc>, payload: FakeJobPayload) -> Self {
        Self {
            record: fake_record(Self::JOB_TYPE, identifier, scheduled_for, &payload),
            payload,
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32, delay_between_retries: Duration) -> Self {
        self.record.max_attempts = max_attempts;
        self.record.delay_between_retries = delay_between_retries;
        self
    }
}

impl PersistedJob for FakeSleepForJob {
    const JOB_TYPE: JobType = JobType::FakeSleepFor;

    type Context = FakeJobContext;

    fn from_record(record: JobRecord) -> Result<Self, JobRecordError> {
        Self::check_type(&record)?;
        let payload = decode_payload(&record)?;
        Ok(Self { record, payload })
    }

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    async fn run(&self, context: &FakeJobContext) -> Result<RunJobResult, JobError> {
        context.run(self.identifier(), &self.payload).await
    }

    fn job_timeout(&self, context: &FakeJobContext) -> Duration {
        context.job_timeout
    }

    fn non_running_jobs_to_remove(&self, queued: &[JobRecord]) -> Vec<String> {
        queued
            .iter()
            .filter(|record| self.payload.supersedes.contains(&record.identifier))
            .map(|record| record.identifier.clone())
            .collect()
    }
}

/// Like [`FakeSleepForJob`], but never considers itself a duplicate.
#[derive(Debug, Clone)]
pub struct FakeSleepForMultiJob {
    record: JobRecord,
    payload: FakeJobPayload,
}

impl FakeSleepForMultiJob {
    pub fn new(identifier: &str, scheduled_for: DateTime<Utc>, payload: FakeJobPayload) -> Self {
        Self {
            record: fake_record(Self::JOB_TYPE, identifier, scheduled_for, &payload),
            payload,
        }
    }
}

impl PersistedJob for FakeSleepForMultiJob {
    const JOB_TYPE: JobType = JobType::FakeSleepForMulti;

    type Context = FakeJobContext;

    fn from_record(record: JobRecord) -> Result<Self, JobRecordError> {
        Self::check_type(&record)?;
        let payload = decode_payload(&record)?;
        Ok(Self { record, payload })
    }

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    async fn run(&self, context: &FakeJobContext) -> Result<RunJobResult, JobError> {
        context.run(self.identifier(), &self.payload).await
    }

    fn job_timeout(&self, context: &FakeJobContext) -> Duration {
        context.job_timeout
    }

    fn add_job_check(&self, _queued: &[JobRecord]) -> AddJobCheck {
        AddJobCheck::Add
    }
}

/// Payload of a job which sleeps for `sleep_ms` and then ends with `result`.
pub fn sleep_for(sleep_ms: u64, result: FakeJobResult) -> FakeJobPayload {
    FakeJobPayload {
        sleep_ms,
        result,
        supersedes: Vec::new(),
    }
}
