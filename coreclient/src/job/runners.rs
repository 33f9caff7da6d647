// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::{
    clock::{Clock, SystemClock},
    configurations::Settings,
    group_sync::{GroupSyncCollaborators, GroupSyncScheduler},
    utils::persistence::open_db,
};

use super::{
    runner::JobRunnerError,
    store::{JobStore, SqliteJobStore},
};

/// The runners of all job types, each constructed once.
#[derive(Debug, Clone)]
pub struct JobRunners {
    group_sync: Arc<GroupSyncScheduler>,
}

impl JobRunners {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        collaborators: GroupSyncCollaborators,
        settings: &Settings,
    ) -> Self {
        let group_sync =
            GroupSyncScheduler::new(store, clock, collaborators, settings.group_sync.clone());
        Self {
            group_sync: Arc::new(group_sync),
        }
    }

    /// Opens the database configured in `settings` and loads the persisted jobs.
    pub async fn open(
        settings: &Settings,
        collaborators: GroupSyncCollaborators,
    ) -> anyhow::Result<Self> {
        let pool = open_db(settings.database.path.as_deref())
            .await
            .context("Failed to open job database")?;
        let runners = Self::new(
            Arc::new(SqliteJobStore::new(pool)),
            Arc::new(SystemClock),
            collaborators,
            settings,
        );
        runners.load_all().await?;
        Ok(runners)
    }

    pub fn group_sync(&self) -> &Arc<GroupSyncScheduler> {
        &self.group_sync
    }

    pub async fn load_all(&self) -> Result<(), JobRunnerError> {
        self.group_sync.runner().load_jobs_from_store().await?;
        Ok(())
    }

    pub async fn start_all(&self) {
        let group_sync = self.group_sync.runner().start_processing().await;
        info!(?group_sync, "Started job runners");
    }

    /// Stops all runners, waiting for running jobs to finish.
    pub async fn stop_all(&self) {
        self.group_sync.runner().stop_and_wait_current_job().await;
        info!("Stopped job runners");
    }

    pub async fn is_idle(&self) -> bool {
        self.group_sync.runner().job_records().await.is_empty()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::TimeDelta;
    use tokio::time::{sleep, timeout};

    use crate::{
        clock::ManualClock,
        configurations::{DatabaseSettings, GroupSyncSettings},
        job::{JobType, runner::JobOutcome, store::MemoryJobStore},
        test_utils::{FakeResponse, TestCollaborators, group_pk},
        utils::init_test_tracing,
    };

    use super::*;

    #[tokio::test]
    async fn queued_sync_runs_in_background() -> anyhow::Result<()> {
        init_test_tracing();
        let collaborators = TestCollaborators::with_group(group_pk(1));
        let clock = ManualClock::at_millis(0);
        let settings = Settings {
            group_sync: GroupSyncSettings {
                lead_time: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let runners = JobRunners::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(clock.clone()),
            collaborators.collaborators(),
            &settings,
        );
        runners.load_all().await?;
        runners.start_all().await;

        runners
            .group_sync()
            .queue_new_job_if_needed(&group_pk(1))
            .await?;
        timeout(Duration::from_secs(5), async {
            while !runners.is_idle().await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        runners.stop_all().await;

        assert_eq!(
            runners.group_sync().last_runs().get(&group_pk(1)),
            Some(clock.now())
        );
        // the pushed dump is saved even with nothing to push
        assert_eq!(collaborators.config_state.dump_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn hanging_swarm_times_out_and_is_retried() -> anyhow::Result<()> {
        init_test_tracing();
        let collaborators = TestCollaborators::with_group(group_pk(1));
        collaborators.config_state.set_pending(
            &group_pk(1),
            crate::config_state::PendingChangeSet {
                obsolete_hashes: [swarmcommon::identifiers::MessageHash::new("old")].into(),
                messages: Vec::new(),
            },
        );
        collaborators.swarm.push_response(FakeResponse::Hang);
        let clock = ManualClock::at_millis(0);
        let settings = Settings {
            group_sync: GroupSyncSettings {
                job_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = MemoryJobStore::new();
        let runners = JobRunners::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            collaborators.collaborators(),
            &settings,
        );

        runners
            .group_sync()
            .queue_new_job_if_needed(&group_pk(1))
            .await?;
        clock.advance(TimeDelta::seconds(1));
        let runner = runners.group_sync().runner();
        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Retrying { retry_count: 1, .. })
        ));
        assert!(runners.group_sync().last_runs().get(&group_pk(1)).is_none());

        // the retry gets an answer and succeeds
        clock.advance(TimeDelta::seconds(15));
        assert!(matches!(
            runner.run_next_due_job().await?,
            Some(JobOutcome::Succeeded { .. })
        ));
        assert!(store.load(JobType::GroupSync).await?.is_empty());
        assert_eq!(collaborators.swarm.batch_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn open_reloads_persisted_jobs() -> anyhow::Result<()> {
        init_test_tracing();
        let dir = tempfile::tempdir()?;
        let settings = Settings {
            database: DatabaseSettings {
                path: Some(dir.path().join("client.db")),
            },
            ..Default::default()
        };

        let collaborators = TestCollaborators::with_group(group_pk(1));
        let runners = JobRunners::open(&settings, collaborators.collaborators()).await?;
        runners
            .group_sync()
            .queue_new_job_if_needed(&group_pk(1))
            .await?;
        let before = runners.group_sync().runner().job_records().await;
        drop(runners);

        let runners = JobRunners::open(&settings, collaborators.collaborators()).await?;
        assert_eq!(runners.group_sync().runner().job_records().await, before);
        Ok(())
    }
}
