// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::time::Duration;

use anyhow::ensure;
use chrono::{DateTime, Utc};
use swarmcommon::identifiers::GroupPubkey;
use tracing::{debug, info, warn};

use crate::{
    config_state::PushConfirmation,
    job::{JobError, RunJobResult},
    swarm_api::{StoreMessageRequest, SubRequest},
};

use super::{
    GroupSyncContext,
    batch::{BatchOutcome, SyncBatch},
};

/// Operations pushed together with the pending configuration changes.
#[derive(Debug, Clone, Default)]
pub struct PushExtras {
    /// Supplemental key messages, already encrypted
    pub supplemental_keys: Vec<Vec<u8>>,
    /// Member tokens to revoke; must not be empty when set
    pub revoke: Option<Vec<Vec<u8>>>,
    /// Member tokens to restore; must not be empty when set
    pub unrevoke: Option<Vec<Vec<u8>>>,
    /// Deletes all messages of the group
    pub delete_all: bool,
}

impl PushExtras {
    pub fn is_empty(&self) -> bool {
        self.supplemental_keys.is_empty()
            && self.revoke.is_none()
            && self.unrevoke.is_none()
            && !self.delete_all
    }
}

/// An already serialized group update message.
#[derive(Debug, Clone)]
pub struct GroupUpdateMessage {
    pub plaintext: Vec<u8>,
    pub ttl: Duration,
    pub network_timestamp: DateTime<Utc>,
}

/// Pushes the pending configuration changes of the group, if any, together with `extras`.
///
/// Confirms the changes the swarm accepted in the config state machine. Safe to call
/// repeatedly: what to push is computed from the confirmed state on every call.
pub async fn push_changes_to_group_swarm_if_needed(
    context: &GroupSyncContext,
    group_pk: &GroupPubkey,
    extras: &PushExtras,
) -> Result<RunJobResult, JobError> {
    // keep the local state durable, whatever happens with the network
    context.config_state.save_dumps(group_pk).await?;

    let changes = context.config_state.pending_changes(group_pk).await?;
    if changes.is_empty() && extras.is_empty() {
        debug!(group = %group_pk.short(), "Nothing to push");
        return Ok(RunJobResult::Success);
    }

    let Some(group) = context.user_groups.get_group(group_pk).await? else {
        debug!(group = %group_pk.short(), "Group not found; nothing to push");
        return Ok(RunJobResult::Success);
    };

    let batch = SyncBatch::build(&group, &changes, extras, context.clock.now())?;
    debug!(
        group = %group_pk.short(),
        messages = changes.messages.len(),
        obsolete_hashes = changes.obsolete_hashes.len(),
        requests = batch.len(),
        "Pushing changes"
    );

    let results = match context.swarm.send_batch(group_pk, batch.requests()).await {
        Ok(results) => results,
        Err(error) => {
            warn!(group = %group_pk.short(), %error, "Failed to push changes");
            return Ok(RunJobResult::RetryJobIfPossible);
        }
    };

    if results.len() != batch.len() {
        info!(
            group = %group_pk.short(),
            expected = batch.len(),
            actual = results.len(),
            "Unexpected number of results"
        );
        return Ok(RunJobResult::RetryJobIfPossible);
    }

    let confirmation = match batch.interpret(group_pk, &results)? {
        BatchOutcome::NothingAccepted => {
            info!(group = %group_pk.short(), "No change was accepted");
            return Ok(RunJobResult::RetryJobIfPossible);
        }
        BatchOutcome::Accepted(confirmation) => confirmation,
    };

    confirm_pushed_and_dump(context, group_pk, &confirmation).await?;
    Ok(RunJobResult::Success)
}

async fn confirm_pushed_and_dump(
    context: &GroupSyncContext,
    group_pk: &GroupPubkey,
    confirmation: &PushConfirmation,
) -> anyhow::Result<()> {
    if !confirmation.is_empty() {
        for (namespace, confirmed) in confirmation.iter() {
            debug!(
                group = %group_pk.short(),
                ?namespace,
                seqno = %confirmed.seqno,
                hash = %confirmed.hash,
                "Confirming push"
            );
        }
        context
            .config_state
            .confirm_pushed(group_pk, confirmation)
            .await?;
    }
    context.config_state.save_dumps(group_pk).await
}

/// Encrypts the group update messages and stores them in the group swarm in one batch.
///
/// Returns `false` if the group is unknown or the swarm did not answer every message.
pub async fn store_group_update_messages(
    context: &GroupSyncContext,
    group_pk: &GroupPubkey,
    messages: &[GroupUpdateMessage],
) -> anyhow::Result<bool> {
    if messages.is_empty() {
        return Ok(true);
    }

    let Some(group) = context.user_groups.get_group(group_pk).await? else {
        warn!(group = %group_pk.short(), "Cannot store update messages: group not found");
        return Ok(false);
    };

    let plaintexts: Vec<Vec<u8>> = messages
        .iter()
        .map(|message| message.plaintext.clone())
        .collect();
    let ciphertexts = context
        .config_state
        .encrypt_messages(group_pk, &plaintexts)
        .await?;
    ensure!(
        ciphertexts.len() == messages.len(),
        "encrypted {} of {} update messages",
        ciphertexts.len(),
        messages.len()
    );

    let requests: Vec<SubRequest> = messages
        .iter()
        .zip(ciphertexts)
        .map(|(message, ciphertext)| {
            StoreMessageRequest {
                group_pk: group_pk.clone(),
                ciphertext,
                ttl: message.ttl,
                network_timestamp: message.network_timestamp,
                secret_key: group.usable_secret_key().cloned(),
            }
            .into()
        })
        .collect();

    let results = context.swarm.send_batch(group_pk, &requests).await?;
    if results.len() != requests.len() {
        info!(
            group = %group_pk.short(),
            expected = requests.len(),
            actual = results.len(),
            "Unexpected number of results"
        );
        return Ok(false);
    }
    Ok(true)
}
