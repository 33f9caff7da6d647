// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pushing the configuration of groups to their swarms.
//!
//! A [`GroupSyncJob`] pushes whatever the config state machine reports as pending for its group
//! and confirms what the swarm accepted. Jobs are queued through the [`GroupSyncScheduler`],
//! which spaces out syncs of the same group.

use std::{fmt, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use swarmcommon::identifiers::GroupPubkey;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    config_state::ConfigStateMachine,
    configurations::GroupSyncSettings,
    identity::{IdentityProvider, UserGroups},
    job::{JobError, JobRecord, JobRecordError, JobType, PersistedJob, RunJobResult},
    swarm_api::SwarmTransport,
};

mod batch;
mod push;
mod scheduler;

pub use push::{
    GroupUpdateMessage, PushExtras, push_changes_to_group_swarm_if_needed,
    store_group_update_messages,
};
pub use scheduler::{GroupSyncScheduler, LastRunRegistry};

/// The services a group sync talks to.
#[derive(Clone)]
pub struct GroupSyncCollaborators {
    pub config_state: Arc<dyn ConfigStateMachine>,
    pub swarm: Arc<dyn SwarmTransport>,
    pub identity: Arc<dyn IdentityProvider>,
    pub user_groups: Arc<dyn UserGroups>,
}

impl fmt::Debug for GroupSyncCollaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSyncCollaborators").finish_non_exhaustive()
    }
}

/// Everything a [`GroupSyncJob`] needs to run.
#[derive(Clone)]
pub struct GroupSyncContext {
    pub(crate) config_state: Arc<dyn ConfigStateMachine>,
    pub(crate) swarm: Arc<dyn SwarmTransport>,
    pub(crate) identity: Arc<dyn IdentityProvider>,
    pub(crate) user_groups: Arc<dyn UserGroups>,
    pub(crate) last_runs: LastRunRegistry,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: GroupSyncSettings,
}

impl fmt::Debug for GroupSyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupSyncContext")
            .field("last_runs", &self.last_runs)
            .field("clock", &self.clock)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl GroupSyncContext {
    pub fn new(
        collaborators: GroupSyncCollaborators,
        last_runs: LastRunRegistry,
        clock: Arc<dyn Clock>,
        settings: GroupSyncSettings,
    ) -> Self {
        let GroupSyncCollaborators {
            config_state,
            swarm,
            identity,
            user_groups,
        } = collaborators;
        Self {
            config_state,
            swarm,
            identity,
            user_groups,
            last_runs,
            clock,
            settings,
        }
    }
}

/// Pushes the pending configuration changes of one group.
///
/// The identifier of the job is the group public key.
#[derive(Debug, Clone)]
pub struct GroupSyncJob {
    record: JobRecord,
}

impl GroupSyncJob {
    pub fn new(
        group_pk: &GroupPubkey,
        scheduled_for: DateTime<Utc>,
        settings: &GroupSyncSettings,
    ) -> Self {
        Self {
            record: JobRecord::new(
                JobType::GroupSync,
                group_pk.as_str(),
                scheduled_for,
                settings.max_attempts,
                settings.retry_delay,
            ),
        }
    }

    async fn sync(&self, context: &GroupSyncContext) -> Result<RunJobResult, JobError> {
        let Ok(group_pk) = self.identifier().parse::<GroupPubkey>() else {
            warn!(identifier = self.identifier(), "Not a group public key; dropping job");
            return Ok(RunJobResult::PermanentFailure);
        };
        debug!(group = %group_pk.short(), "Group sync starting");

        // writes to the swarm are authenticated; a failing lookup is retried, only an absent
        // identity is permanent
        let user_id = context.identity.current_user_id().await?;
        let signing_keys = context.identity.current_user_signing_keys().await?;
        if user_id.is_none() || signing_keys.is_none() {
            warn!(group = %group_pk.short(), "No local identity; dropping job");
            return Ok(RunJobResult::PermanentFailure);
        }

        let result =
            push_changes_to_group_swarm_if_needed(context, &group_pk, &PushExtras::default())
                .await?;
        if result == RunJobResult::Success {
            context.last_runs.record(group_pk, context.clock.now());
        }
        Ok(result)
    }
}

impl PersistedJob for GroupSyncJob {
    const JOB_TYPE: JobType = JobType::GroupSync;

    type Context = GroupSyncContext;

    fn from_record(record: JobRecord) -> Result<Self, JobRecordError> {
        Self::check_type(&record)?;
        Ok(Self { record })
    }

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    async fn run(&self, context: &GroupSyncContext) -> Result<RunJobResult, JobError> {
        let started = Instant::now();
        let result = self.sync(context).await;
        debug!(
            identifier = self.identifier(),
            elapsed_ms = started.elapsed().as_millis(),
            ?result,
            "Group sync run finished"
        );
        result
    }

    fn job_timeout(&self, context: &GroupSyncContext) -> std::time::Duration {
        context.settings.job_timeout
    }
}
