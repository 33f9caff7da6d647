// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Execution of the queue of one job type.

use std::{
    sync::{Arc, Mutex as StdMutex},
    time::Instant,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;

use super::{
    AddJobCheck, AddJobOutcome, JobError, JobRecord, JobType, PersistedJob, RunJobResult,
    store::{JobStore, JobStoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum JobRunnerError {
    #[error("Failed to persist the {job_type} queue: {source}")]
    Store {
        job_type: JobType,
        #[source]
        source: JobStoreError,
    },
    #[error("Job {identifier} of type {job_type} violated an invariant: {source}")]
    InvariantViolation {
        job_type: JobType,
        identifier: String,
        #[source]
        source: anyhow::Error,
    },
}

/// What happened to a job after it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded {
        identifier: String,
    },
    Retrying {
        identifier: String,
        retry_count: u32,
        next_attempt: DateTime<Utc>,
    },
    PermanentlyFailed {
        identifier: String,
    },
}

/// Result of [`JobRunner::start_processing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartProcessing {
    AlreadyStarted,
    JobInProgress,
    JobDeferred,
    JobStarted,
    NoJob,
}

/// Executes the jobs of one type, one at a time.
///
/// The queue is persisted after every change before the call causing it returns: when a job is
/// added, and after every run. The job which is running stays part of the persisted queue until
/// it finished, so that it is run again after a crash.
///
/// Jobs are either run step by step with [`JobRunner::run_next_due_job`], or by a background
/// task started with [`JobRunner::start_processing`] which runs each job when it is due.
pub struct JobRunner<J: PersistedJob> {
    inner: Arc<RunnerInner<J>>,
}

impl<J: PersistedJob> std::fmt::Debug for JobRunner<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl<J: PersistedJob> Clone for JobRunner<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct RunnerInner<J: PersistedJob> {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    context: J::Context,
    state: Mutex<RunnerState<J>>,
    /// Held while a job runs
    run_lock: Mutex<()>,
    /// Wakes up the background task when the queue changed
    wake: Notify,
    background: StdMutex<Option<BackgroundTask>>,
}

impl<J: PersistedJob> std::fmt::Debug for RunnerInner<J> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerInner")
            .field("job_type", &J::JOB_TYPE)
            .finish_non_exhaustive()
    }
}

struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct RunnerState<J> {
    /// Jobs waiting to run, ordered by due time
    queued: Vec<J>,
    /// Snapshot of the running job
    current: Option<JobRecord>,
}

impl<J: PersistedJob> RunnerState<J> {
    /// All jobs including the running one, ordered by due time.
    fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .current
            .iter()
            .cloned()
            .chain(self.queued.iter().map(|job| job.record().clone()))
            .collect();
        records.sort_by_key(|record| record.scheduled_for);
        records
    }

    fn insert(&mut self, job: J) {
        // stable: a job is placed after jobs with the same due time
        let index = self
            .queued
            .partition_point(|queued| queued.record().scheduled_for <= job.record().scheduled_for);
        self.queued.insert(index, job);
    }

    fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.queued.first().map(|job| job.record().scheduled_for)
    }
}

enum Disposition {
    Succeeded,
    Failed,
    Retry,
    InvariantViolation(anyhow::Error),
}

impl<J: PersistedJob> JobRunner<J> {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, context: J::Context) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                clock,
                context,
                state: Mutex::new(RunnerState {
                    queued: Vec::new(),
                    current: None,
                }),
                run_lock: Mutex::new(()),
                wake: Notify::new(),
                background: StdMutex::new(None),
            }),
        }
    }

    pub fn job_type(&self) -> JobType {
        J::JOB_TYPE
    }

    pub fn context(&self) -> &J::Context {
        &self.inner.context
    }

    /// Replaces the in-memory queue with the persisted one.
    ///
    /// Records that can't be turned into jobs are dropped, as are later duplicates of a job.
    pub async fn load_jobs_from_store(&self) -> Result<usize, JobRunnerError> {
        let records = self
            .inner
            .store
            .load(J::JOB_TYPE)
            .await
            .map_err(|source| self.store_error(source))?;

        let mut state = self.inner.state.lock().await;
        state.queued.clear();
        state.current = None;
        for record in records {
            let identifier = record.identifier.clone();
            if state
                .queued
                .iter()
                .any(|job| job.identifier() == identifier)
            {
                warn!(job_type = %J::JOB_TYPE, %identifier, "Dropping duplicate persisted job");
                continue;
            }
            match J::from_record(record) {
                Ok(job) => state.insert(job),
                Err(error) => {
                    warn!(job_type = %J::JOB_TYPE, %identifier, %error, "Dropping persisted job");
                }
            }
        }
        let loaded = state.queued.len();
        drop(state);

        info!(job_type = %J::JOB_TYPE, loaded, "Loaded jobs");
        self.inner.wake.notify_one();
        Ok(loaded)
    }

    /// Adds a job to the queue, unless an equivalent job is already queued.
    ///
    /// The running job counts as queued. When a job is skipped, the queued one will pick up the
    /// latest state once it runs.
    pub async fn add_job(&self, job: J) -> Result<AddJobOutcome, JobRunnerError> {
        let mut state = self.inner.state.lock().await;
        let records = state.records();
        let identifier = job.identifier().to_owned();

        if job.add_job_check(&records) == AddJobCheck::SkipSameJobPresent {
            debug!(job_type = %J::JOB_TYPE, %identifier, "Same job already queued; skipping");
            return Ok(AddJobOutcome::TypeExists);
        }
        if records.iter().any(|record| record.identifier == identifier) {
            debug!(job_type = %J::JOB_TYPE, %identifier, "Identifier already queued; skipping");
            return Ok(AddJobOutcome::IdentifierExists);
        }

        let queued_records: Vec<JobRecord> =
            state.queued.iter().map(|job| job.record().clone()).collect();
        let to_remove = job.non_running_jobs_to_remove(&queued_records);

        // persist the resulting queue before changing the in-memory one
        let mut new_records: Vec<JobRecord> = records
            .into_iter()
            .filter(|record| !to_remove.contains(&record.identifier))
            .chain(Some(job.record().clone()))
            .collect();
        new_records.sort_by_key(|record| record.scheduled_for);
        self.save(&new_records).await?;

        if !to_remove.is_empty() {
            debug!(job_type = %J::JOB_TYPE, ?to_remove, "Removing obsolete jobs");
            state
                .queued
                .retain(|queued| !to_remove.iter().any(|id| id == queued.identifier()));
        }
        let scheduled_for = job.record().scheduled_for;
        state.insert(job);

        let is_idle = state.current.is_none();
        drop(state);

        info!(job_type = %J::JOB_TYPE, %identifier, %scheduled_for, "Job added");
        self.inner.wake.notify_one();

        let is_due = scheduled_for <= self.inner.clock.now();
        if is_due && is_idle && self.is_started() {
            Ok(AddJobOutcome::JobStarted)
        } else {
            Ok(AddJobOutcome::JobDeferred)
        }
    }

    /// Runs the job due next, if there is one.
    ///
    /// Returns `None` if no job is due. Jobs of this runner never run concurrently: when another
    /// job is running, waits until it finished.
    pub async fn run_next_due_job(&self) -> Result<Option<JobOutcome>, JobRunnerError> {
        let _run_guard = self.inner.run_lock.lock().await;

        let job = {
            let mut state = self.inner.state.lock().await;
            let now = self.inner.clock.now();
            match state.next_due_at() {
                Some(due_at) if due_at <= now => (),
                _ => return Ok(None),
            }
            let job = state.queued.remove(0);
            state.current = Some(job.record().clone());
            job
        };

        let identifier = job.identifier().to_owned();
        let retry_count = job.record().retry_count;
        info!(job_type = %J::JOB_TYPE, %identifier, retry_count, "Running job");

        let job_timeout = job.job_timeout(&self.inner.context);
        let started = Instant::now();
        let result = timeout(job_timeout, job.run(&self.inner.context)).await;
        let elapsed_ms = started.elapsed().as_millis();

        let mut job = job;
        let now = self.inner.clock.now();
        job.record_mut().last_tick = Some(now);

        let disposition = match result {
            Ok(Ok(RunJobResult::Success)) => {
                info!(job_type = %J::JOB_TYPE, %identifier, elapsed_ms, "Job succeeded");
                Disposition::Succeeded
            }
            Ok(Ok(RunJobResult::PermanentFailure)) => {
                warn!(job_type = %J::JOB_TYPE, %identifier, elapsed_ms, "Job failed permanently");
                Disposition::Failed
            }
            Ok(Ok(RunJobResult::RetryJobIfPossible)) => {
                info!(job_type = %J::JOB_TYPE, %identifier, elapsed_ms, "Job failed");
                Disposition::Retry
            }
            Ok(Err(JobError::Recoverable(error))) => {
                warn!(job_type = %J::JOB_TYPE, %identifier, %error, "Job failed with an error");
                Disposition::Retry
            }
            Ok(Err(JobError::InvariantViolation(error))) => {
                error!(job_type = %J::JOB_TYPE, %identifier, %error, "Job violated an invariant");
                Disposition::InvariantViolation(error)
            }
            Err(_elapsed) => {
                warn!(
                    job_type = %J::JOB_TYPE,
                    %identifier,
                    timeout_ms = job_timeout.as_millis(),
                    "Job timed out"
                );
                Disposition::Retry
            }
        };

        let mut state = self.inner.state.lock().await;
        state.current = None;

        let mut invariant_violation = None;
        let outcome = match disposition {
            Disposition::Succeeded => JobOutcome::Succeeded {
                identifier: identifier.clone(),
            },
            Disposition::Failed => JobOutcome::PermanentlyFailed {
                identifier: identifier.clone(),
            },
            Disposition::InvariantViolation(error) => {
                invariant_violation = Some(error);
                JobOutcome::PermanentlyFailed {
                    identifier: identifier.clone(),
                }
            }
            Disposition::Retry => {
                let record = job.record_mut();
                record.retry_count += 1;
                if record.retry_count >= record.max_attempts {
                    warn!(
                        job_type = %J::JOB_TYPE,
                        %identifier,
                        attempts = record.retry_count,
                        "Job attempts exhausted; dropping it"
                    );
                    JobOutcome::PermanentlyFailed {
                        identifier: identifier.clone(),
                    }
                } else {
                    let next_attempt = chrono::Duration::from_std(record.delay_between_retries)
                        .ok()
                        .and_then(|delay| now.checked_add_signed(delay))
                        .unwrap_or(now);
                    record.scheduled_for = next_attempt;
                    let retry_count = record.retry_count;
                    info!(
                        job_type = %J::JOB_TYPE,
                        %identifier,
                        retry_count,
                        %next_attempt,
                        "Job will be retried"
                    );
                    state.insert(job);
                    JobOutcome::Retrying {
                        identifier: identifier.clone(),
                        retry_count,
                        next_attempt,
                    }
                }
            }
        };

        let records = state.records();
        drop(state);
        self.save(&records).await?;

        if let Some(source) = invariant_violation {
            return Err(JobRunnerError::InvariantViolation {
                job_type: J::JOB_TYPE,
                identifier,
                source,
            });
        }
        Ok(Some(outcome))
    }

    /// Starts the background task which runs jobs when they are due.
    pub async fn start_processing(&self) -> StartProcessing {
        if self.is_started() {
            return StartProcessing::AlreadyStarted;
        }

        let status = {
            let state = self.inner.state.lock().await;
            if state.current.is_some() {
                StartProcessing::JobInProgress
            } else {
                match state.next_due_at() {
                    None => StartProcessing::NoJob,
                    Some(due_at) if due_at <= self.inner.clock.now() => {
                        StartProcessing::JobStarted
                    }
                    Some(_) => StartProcessing::JobDeferred,
                }
            }
        };

        {
            let Ok(mut background) = self.inner.background.lock() else {
                error!(job_type = %J::JOB_TYPE, "Runner state poisoned");
                return StartProcessing::AlreadyStarted;
            };
            if background.is_some() {
                return StartProcessing::AlreadyStarted;
            }
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(self.clone().process_jobs(cancel.clone()));
            *background = Some(BackgroundTask { cancel, handle });
        }

        debug!(job_type = %J::JOB_TYPE, ?status, "Started processing");
        status
    }

    /// Stops the background task.
    ///
    /// A job which is running is not interrupted; this waits until it finished.
    pub async fn stop_and_wait_current_job(&self) {
        let task = self
            .inner
            .background
            .lock()
            .ok()
            .and_then(|mut background| background.take());
        let Some(task) = task else {
            return;
        };
        task.cancel.cancel();
        if let Err(error) = task.handle.await {
            error!(job_type = %J::JOB_TYPE, %error, "Background task failed");
        }
        debug!(job_type = %J::JOB_TYPE, "Stopped processing");
    }

    pub fn is_started(&self) -> bool {
        self.inner
            .background
            .lock()
            .map(|background| background.is_some())
            .unwrap_or_default()
    }

    /// Snapshot of the queue, including the running job.
    pub async fn job_records(&self) -> Vec<JobRecord> {
        self.inner.state.lock().await.records()
    }

    pub async fn current_job_identifier(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.current.as_ref().map(|record| record.identifier.clone())
    }

    pub async fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().await.next_due_at()
    }

    async fn process_jobs(self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(due_at) = self.next_due_at().await else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.wake.notified() => continue,
                }
            };

            let wait = (due_at - self.inner.clock.now())
                .to_std()
                .unwrap_or_default();
            if !wait.is_zero() {
                debug!(job_type = %J::JOB_TYPE, wait_ms = wait.as_millis(), "Next job deferred");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.wake.notified() => continue,
                    _ = sleep(wait) => (),
                }
            }

            match self.run_next_due_job().await {
                Ok(Some(outcome)) => debug!(job_type = %J::JOB_TYPE, ?outcome, "Job finished"),
                Ok(None) => (),
                Err(error) => error!(job_type = %J::JOB_TYPE, %error, "Failed to run job"),
            }
        }
    }

    async fn save(&self, records: &[JobRecord]) -> Result<(), JobRunnerError> {
        self.inner
            .store
            .save(J::JOB_TYPE, records)
            .await
            .map_err(|source| self.store_error(source))
    }

    fn store_error(&self, source: JobStoreError) -> JobRunnerError {
        JobRunnerError::Store {
            job_type: J::JOB_TYPE,
            source,
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use crate::{
        clock::ManualClock,
        job::{
            fake_jobs::{
                FakeJobContext, FakeJobResult, FakeSleepForJob, FakeSleepForMultiJob, sleep_for,
            },
            store::{MemoryJobStore, SqliteJobStore},
        },
        open_db,
        utils::init_test_tracing,
    };

    use super::*;

    const NOW: i64 = 1_000_000;

    fn setup(job_timeout: Duration) -> (JobRunner<FakeSleepForJob>, MemoryJobStore, ManualClock) {
        let store = MemoryJobStore::new();
        let clock = ManualClock::at_millis(NOW);
        let runner = JobRunner::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            FakeJobContext::new(job_timeout),
        );
        (runner, store, clock)
    }

    fn at(clock: &ManualClock, offset_ms: i64) -> DateTime<Utc> {
        clock.now() + chrono::Duration::milliseconds(offset_ms)
    }

    fn identifiers(records: &[JobRecord]) -> Vec<&str> {
        records
            .iter()
            .map(|record| record.identifier.as_str())
            .collect()
    }

    async fn wait_until_idle<J: PersistedJob>(runner: &JobRunner<J>) {
        timeout(Duration::from_secs(5), async {
            while !runner.job_records().await.is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not finish");
    }

    #[tokio::test]
    async fn add_job_deduplicates_by_identifier() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(0, FakeJobResult::Success));
        assert_eq!(runner.add_job(job.clone()).await?, AddJobOutcome::JobDeferred);
        assert_eq!(runner.add_job(job).await?, AddJobOutcome::TypeExists);

        let records = runner.job_records().await;
        assert_eq!(identifiers(&records), ["a"]);
        // persisted before returning, and only once
        assert_eq!(store.load(JobType::FakeSleepFor).await?, records);
        assert_eq!(store.save_count(JobType::FakeSleepFor), 1);
        Ok(())
    }

    #[tokio::test]
    async fn add_job_without_dedup_policy_still_rejects_same_identifier() -> anyhow::Result<()> {
        let store = MemoryJobStore::new();
        let clock = ManualClock::at_millis(NOW);
        let runner = JobRunner::<FakeSleepForMultiJob>::new(
            Arc::new(store),
            Arc::new(clock.clone()),
            FakeJobContext::new(Duration::from_secs(1)),
        );

        let payload = sleep_for(0, FakeJobResult::Success);
        let job = FakeSleepForMultiJob::new("a", at(&clock, 0), payload.clone());
        assert_eq!(runner.add_job(job).await?, AddJobOutcome::JobDeferred);
        let job = FakeSleepForMultiJob::new("a", at(&clock, 0), payload);
        assert_eq!(runner.add_job(job).await?, AddJobOutcome::IdentifierExists);
        assert_eq!(runner.job_records().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn obsolete_jobs_are_removed_when_adding() -> anyhow::Result<()> {
        let (runner, store, clock) = setup(Duration::from_secs(1));

        for identifier in ["a", "b"] {
            let job = FakeSleepForJob::new(
                identifier,
                at(&clock, 1_000),
                sleep_for(0, FakeJobResult::Success),
            );
            runner.add_job(job).await?;
        }
        let mut payload = sleep_for(0, FakeJobResult::Success);
        payload.supersedes = vec!["a".to_owned()];
        runner
            .add_job(FakeSleepForJob::new("c", at(&clock, 2_000), payload))
            .await?;

        let records = runner.job_records().await;
        assert_eq!(identifiers(&records), ["b", "c"]);
        assert_eq!(store.load(JobType::FakeSleepFor).await?, records);
        Ok(())
    }

    #[tokio::test]
    async fn jobs_run_when_due_in_order() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let success = sleep_for(0, FakeJobResult::Success);
        runner
            .add_job(FakeSleepForJob::new("late", at(&clock, 2_000), success.clone()))
            .await?;
        runner
            .add_job(FakeSleepForJob::new("early", at(&clock, 1_000), success))
            .await?;

        assert_eq!(runner.run_next_due_job().await?, None);

        clock.advance(chrono::Duration::milliseconds(1_000));
        assert_eq!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Succeeded {
                identifier: "early".to_owned()
            })
        );
        assert_eq!(runner.run_next_due_job().await?, None);

        clock.advance(chrono::Duration::milliseconds(1_000));
        assert_eq!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Succeeded {
                identifier: "late".to_owned()
            })
        );

        assert!(runner.job_records().await.is_empty());
        assert!(store.load(JobType::FakeSleepFor).await?.is_empty());
        assert_eq!(runner.context().runs(), ["early", "late"]);
        Ok(())
    }

    #[tokio::test]
    async fn retryable_job_is_dropped_after_max_attempts() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(0, FakeJobResult::Retry))
            .with_attempts(3, Duration::from_millis(500));
        runner.add_job(job).await?;

        assert_eq!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Retrying {
                identifier: "a".to_owned(),
                retry_count: 1,
                next_attempt: at(&clock, 500),
            })
        );
        let persisted = store.load(JobType::FakeSleepFor).await?;
        assert_eq!(persisted[0].retry_count, 1);
        assert_eq!(persisted[0].scheduled_for, at(&clock, 500));
        assert_eq!(persisted[0].last_tick, Some(clock.now()));

        // not due before the retry delay passed
        assert_eq!(runner.run_next_due_job().await?, None);

        clock.advance(chrono::Duration::milliseconds(500));
        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Retrying { retry_count: 2, .. })
        ));

        clock.advance(chrono::Duration::milliseconds(500));
        assert_eq!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::PermanentlyFailed {
                identifier: "a".to_owned()
            })
        );

        clock.advance(chrono::Duration::milliseconds(500));
        assert_eq!(runner.run_next_due_job().await?, None);
        assert_eq!(runner.context().runs().len(), 3);
        assert!(store.load(JobType::FakeSleepFor).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn recoverable_error_is_retried() -> anyhow::Result<()> {
        let (runner, _store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new(
            "a",
            at(&clock, 0),
            sleep_for(0, FakeJobResult::RecoverableError),
        );
        runner.add_job(job).await?;

        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Retrying { retry_count: 1, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() -> anyhow::Result<()> {
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new(
            "a",
            at(&clock, 0),
            sleep_for(0, FakeJobResult::PermanentFailure),
        );
        runner.add_job(job).await?;

        assert_eq!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::PermanentlyFailed {
                identifier: "a".to_owned()
            })
        );
        assert!(store.load(JobType::FakeSleepFor).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn timeout_is_retried() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, _store, clock) = setup(Duration::from_millis(20));

        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(5_000, FakeJobResult::Success))
            .with_attempts(2, Duration::from_millis(100));
        runner.add_job(job).await?;

        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Retrying { retry_count: 1, .. })
        ));

        // attempts exhausted on the second timeout
        clock.advance(chrono::Duration::milliseconds(100));
        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::PermanentlyFailed { .. })
        ));
        assert!(runner.job_records().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn invariant_violation_is_surfaced_and_job_dropped() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new(
            "a",
            at(&clock, 0),
            sleep_for(0, FakeJobResult::InvariantViolation),
        );
        runner.add_job(job).await?;

        let error = runner.run_next_due_job().await.unwrap_err();
        assert!(matches!(
            error,
            JobRunnerError::InvariantViolation { ref identifier, .. } if identifier == "a"
        ));
        assert!(runner.job_records().await.is_empty());
        assert!(store.load(JobType::FakeSleepFor).await?.is_empty());
        assert_eq!(runner.context().runs().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn running_job_stays_queued_and_blocks_duplicates() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, store, clock) = setup(Duration::from_secs(5));

        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(300, FakeJobResult::Success));
        runner.add_job(job.clone()).await?;

        let run = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run_next_due_job().await }
        });
        timeout(Duration::from_secs(5), async {
            while runner.current_job_identifier().await.is_none() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        assert_eq!(identifiers(&runner.job_records().await), ["a"]);
        assert_eq!(identifiers(&store.load(JobType::FakeSleepFor).await?), ["a"]);
        assert_eq!(runner.add_job(job).await?, AddJobOutcome::TypeExists);

        assert!(matches!(
            run.await??,
            Some(JobOutcome::Succeeded { .. })
        ));
        assert_eq!(runner.current_job_identifier().await, None);
        assert!(runner.job_records().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reload_after_restart_resumes_queue() -> anyhow::Result<()> {
        init_test_tracing();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("client.db");
        let clock = ManualClock::at_millis(NOW);

        let pool = open_db(Some(&path)).await?;
        let runner = JobRunner::<FakeSleepForJob>::new(
            Arc::new(SqliteJobStore::new(pool.clone())),
            Arc::new(clock.clone()),
            FakeJobContext::new(Duration::from_secs(1)),
        );
        let retry = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(0, FakeJobResult::Retry))
            .with_attempts(3, Duration::from_secs(15));
        runner.add_job(retry).await?;
        runner
            .add_job(FakeSleepForJob::new(
                "b",
                at(&clock, 60_000),
                sleep_for(0, FakeJobResult::Success),
            ))
            .await?;
        runner.run_next_due_job().await?;
        let before = runner.job_records().await;
        drop(runner);
        pool.close().await;

        let pool = open_db(Some(&path)).await?;
        let runner = JobRunner::<FakeSleepForJob>::new(
            Arc::new(SqliteJobStore::new(pool)),
            Arc::new(clock.clone()),
            FakeJobContext::new(Duration::from_secs(1)),
        );
        assert_eq!(runner.load_jobs_from_store().await?, 2);

        let after = runner.job_records().await;
        assert_eq!(after, before);
        assert_eq!(identifiers(&after), ["a", "b"]);
        assert_eq!(after[0].retry_count, 1);
        assert_eq!(after[0].scheduled_for, at(&clock, 15_000));
        assert_eq!(after[1].retry_count, 0);
        assert_eq!(after[1].scheduled_for, at(&clock, 60_000));
        Ok(())
    }

    #[tokio::test]
    async fn load_drops_duplicate_identifiers() -> anyhow::Result<()> {
        let (runner, store, clock) = setup(Duration::from_secs(1));

        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(0, FakeJobResult::Success));
        let record = job.record().clone();
        store
            .save(JobType::FakeSleepFor, &[record.clone(), record])
            .await?;

        assert_eq!(runner.load_jobs_from_store().await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn background_processing_runs_jobs_serially() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, _store, clock) = setup(Duration::from_secs(5));

        assert_eq!(runner.start_processing().await, StartProcessing::NoJob);
        assert_eq!(runner.start_processing().await, StartProcessing::AlreadyStarted);

        for identifier in ["a", "b", "c"] {
            let job = FakeSleepForJob::new(
                identifier,
                at(&clock, 0),
                sleep_for(50, FakeJobResult::Success),
            );
            runner.add_job(job).await?;
        }
        wait_until_idle(&runner).await;
        runner.stop_and_wait_current_job().await;

        assert_eq!(runner.context().runs(), ["a", "b", "c"]);
        assert_eq!(runner.context().max_running(), 1);
        assert!(!runner.is_started());
        Ok(())
    }

    #[tokio::test]
    async fn start_processing_reports_due_and_deferred_jobs() -> anyhow::Result<()> {
        let (runner, _store, clock) = setup(Duration::from_secs(5));

        let job = FakeSleepForJob::new(
            "later",
            at(&clock, 60_000),
            sleep_for(0, FakeJobResult::Success),
        );
        runner.add_job(job).await?;
        assert_eq!(runner.start_processing().await, StartProcessing::JobDeferred);

        let job = FakeSleepForJob::new("now", at(&clock, 0), sleep_for(0, FakeJobResult::Success));
        assert_eq!(runner.add_job(job).await?, AddJobOutcome::JobStarted);
        runner.stop_and_wait_current_job().await;

        let (runner, _store, clock) = setup(Duration::from_secs(5));
        let job = FakeSleepForJob::new("now", at(&clock, 0), sleep_for(0, FakeJobResult::Success));
        runner.add_job(job).await?;
        assert_eq!(runner.start_processing().await, StartProcessing::JobStarted);
        wait_until_idle(&runner).await;
        runner.stop_and_wait_current_job().await;
        Ok(())
    }

    #[tokio::test]
    async fn stop_waits_for_running_job() -> anyhow::Result<()> {
        init_test_tracing();
        let (runner, _store, clock) = setup(Duration::from_secs(5));

        runner.start_processing().await;
        let job = FakeSleepForJob::new("a", at(&clock, 0), sleep_for(200, FakeJobResult::Success));
        runner.add_job(job).await?;
        timeout(Duration::from_secs(5), async {
            while runner.current_job_identifier().await.is_none() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;

        runner.stop_and_wait_current_job().await;
        assert_eq!(runner.current_job_identifier().await, None);
        assert!(runner.job_records().await.is_empty());
        assert_eq!(runner.context().runs(), ["a"]);
        Ok(())
    }

    #[tokio::test]
    async fn runners_of_distinct_types_run_concurrently() -> anyhow::Result<()> {
        init_test_tracing();
        let store = MemoryJobStore::new();
        let clock = ManualClock::at_millis(NOW);
        let context = FakeJobContext::new(Duration::from_secs(5));
        let single = JobRunner::<FakeSleepForJob>::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            context.clone(),
        );
        let multi = JobRunner::<FakeSleepForMultiJob>::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            context.clone(),
        );

        let payload = sleep_for(300, FakeJobResult::Success);
        single
            .add_job(FakeSleepForJob::new("a", at(&clock, 0), payload.clone()))
            .await?;
        multi
            .add_job(FakeSleepForMultiJob::new("b", at(&clock, 0), payload))
            .await?;
        single.start_processing().await;
        multi.start_processing().await;

        wait_until_idle(&single).await;
        wait_until_idle(&multi).await;
        single.stop_and_wait_current_job().await;
        multi.stop_and_wait_current_job().await;

        assert_eq!(context.max_running(), 2);
        Ok(())
    }
}
