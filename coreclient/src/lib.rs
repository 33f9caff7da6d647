// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background jobs keeping the locally authoritative group configuration in sync with the group
//! swarm.
//!
//! The crate consists of a generic persisted job framework ([`job`]), the group sync job built
//! on top of it ([`group_sync`]), and the throttling layer deciding when a sync runs
//! ([`group_sync::GroupSyncScheduler`]). Everything outside of the scheduling core is accessed
//! through collaborator traits: [`config_state::ConfigStateMachine`],
//! [`swarm_api::SwarmTransport`], [`identity::IdentityProvider`] and
//! [`identity::UserGroups`].

pub mod clock;
pub mod config_state;
pub mod configurations;
pub mod group_sync;
pub mod identity;
pub mod job;
pub mod swarm_api;
pub(crate) mod utils;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use clock::{Clock, SystemClock};
pub use configurations::Settings;
pub use group_sync::{
    GroupSyncCollaborators, GroupSyncContext, GroupSyncJob, GroupSyncScheduler, LastRunRegistry,
};
pub use job::{
    AddJobOutcome, JobError, JobRecord, JobType, PersistedJob, RunJobResult,
    runner::{JobOutcome, JobRunner, JobRunnerError, StartProcessing},
    runners::JobRunners,
    store::{JobStore, JobStoreError, MemoryJobStore, SqliteJobStore},
};
pub use utils::persistence::{open_db, open_db_in_memory};
