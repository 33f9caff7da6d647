// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use swarmcommon::identifiers::GroupPubkey;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    clock::Clock,
    configurations::GroupSyncSettings,
    job::{
        AddJobOutcome,
        runner::{JobRunner, JobRunnerError},
        store::JobStore,
    },
};

use super::{GroupSyncCollaborators, GroupSyncContext, GroupSyncJob};

/// Time of the last successful sync of each group.
///
/// Owned by the [`GroupSyncScheduler`]; sync jobs get a handle to record their success.
#[derive(Debug, Clone, Default)]
pub struct LastRunRegistry(Arc<DashMap<GroupPubkey, DateTime<Utc>>>);

impl LastRunRegistry {
    pub fn get(&self, group_pk: &GroupPubkey) -> Option<DateTime<Utc>> {
        self.0.get(group_pk).map(|last_run| *last_run)
    }

    pub(crate) fn record(&self, group_pk: GroupPubkey, at: DateTime<Utc>) {
        self.0.insert(group_pk, at);
    }
}

/// Queues group sync jobs, spacing out syncs of the same group.
#[derive(Debug)]
pub struct GroupSyncScheduler {
    runner: JobRunner<GroupSyncJob>,
    last_runs: LastRunRegistry,
    /// Serializes scheduling decisions per group
    locks: DashMap<GroupPubkey, Arc<Mutex<()>>>,
    linking_device: AtomicBool,
    clock: Arc<dyn Clock>,
    settings: GroupSyncSettings,
}

impl GroupSyncScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        collaborators: GroupSyncCollaborators,
        settings: GroupSyncSettings,
    ) -> Self {
        let last_runs = LastRunRegistry::default();
        let context = GroupSyncContext::new(
            collaborators,
            last_runs.clone(),
            clock.clone(),
            settings.clone(),
        );
        Self {
            runner: JobRunner::new(store, clock.clone(), context),
            last_runs,
            locks: DashMap::new(),
            linking_device: AtomicBool::new(false),
            clock,
            settings,
        }
    }

    pub fn runner(&self) -> &JobRunner<GroupSyncJob> {
        &self.runner
    }

    pub fn last_runs(&self) -> &LastRunRegistry {
        &self.last_runs
    }

    /// While a device is being linked, no syncs are queued.
    pub fn set_linking_device(&self, linking: bool) {
        self.linking_device.store(linking, Ordering::SeqCst);
    }

    /// Queues a sync of the group, unless one is queued already.
    ///
    /// The sync is scheduled no earlier than the minimum interval after the last successful sync
    /// of the group, and no earlier than the lead time from now. Returns `None` if no job was
    /// queued because a device is being linked.
    pub async fn queue_new_job_if_needed(
        &self,
        group_pk: &GroupPubkey,
    ) -> Result<Option<AddJobOutcome>, JobRunnerError> {
        if self.linking_device.load(Ordering::SeqCst) {
            info!(group = %group_pk.short(), "Linking a device; not scheduling group sync");
            return Ok(None);
        }

        let lock = self.locks.entry(group_pk.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            let scheduled_for = self.next_run_at(group_pk);
            debug!(group = %group_pk.short(), %scheduled_for, "Scheduling group sync");
            let job = GroupSyncJob::new(group_pk, scheduled_for, &self.settings);
            self.runner.add_job(job).await
        };
        drop(lock);
        // unused once only the map holds it
        self.locks.remove_if(group_pk, |_, lock| Arc::strong_count(lock) == 1);

        Ok(Some(result?))
    }

    fn next_run_at(&self, group_pk: &GroupPubkey) -> DateTime<Utc> {
        let now = self.clock.now();
        let lead_time =
            TimeDelta::from_std(self.settings.lead_time).unwrap_or(TimeDelta::zero());
        let Some(last_run) = self.last_runs.get(group_pk) else {
            return now + lead_time;
        };

        let min_interval =
            TimeDelta::from_std(self.settings.min_interval).unwrap_or(TimeDelta::zero());
        let elapsed = (now - last_run).max(TimeDelta::zero());
        if elapsed >= min_interval {
            now + lead_time
        } else {
            now + (min_interval - elapsed).max(lead_time)
        }
    }
}
