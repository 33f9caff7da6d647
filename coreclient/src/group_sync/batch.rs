// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Assembly of the sub-requests of one sync attempt and interpretation of their results.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use swarmcommon::{
    identifiers::{GroupPubkey, SeqNo},
    keys::GroupSecretKey,
    namespaces::{ConfigNamespace, SwarmNamespace},
};
use tracing::debug;

use crate::{
    config_state::{PendingChangeSet, PushConfirmation},
    identity::UserGroupEntry,
    job::JobError,
    swarm_api::{
        DEFAULT_CONFIG_TTL, DeleteAllRequest, DeleteHashesRequest, StoreConfigRequest,
        StoreKeysRequest, SubRequest, SubResult, TokenRequest,
    },
};

use super::PushExtras;

/// What a sub-request at a given position of the batch stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Config {
        namespace: SwarmNamespace,
        seqno: SeqNo,
    },
    Auxiliary,
}

/// Interpretation of the results of a batch.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BatchOutcome {
    /// Nothing which could be confirmed was accepted.
    NothingAccepted,
    Accepted(PushConfirmation),
}

/// The ordered sub-requests of one sync attempt.
#[derive(Debug)]
pub(crate) struct SyncBatch {
    requests: Vec<SubRequest>,
    slots: Vec<Slot>,
}

impl SyncBatch {
    /// Builds the batch in the order: config messages, supplemental keys, obsolete hashes,
    /// revoke, unrevoke, delete all.
    pub(crate) fn build(
        group: &UserGroupEntry,
        changes: &PendingChangeSet,
        extras: &PushExtras,
        network_timestamp: DateTime<Utc>,
    ) -> Result<Self, JobError> {
        let group_pk = &group.group_pk;
        let mut batch = Self {
            requests: Vec::new(),
            slots: Vec::new(),
        };

        for message in &changes.messages {
            let secret_key = required_secret_key(group, "pending config messages")?;
            batch.push(
                StoreConfigRequest {
                    group_pk: group_pk.clone(),
                    namespace: message.namespace,
                    ciphertext: message.ciphertext.clone(),
                    ttl: message.ttl.unwrap_or(DEFAULT_CONFIG_TTL),
                    network_timestamp,
                    secret_key,
                },
                Slot::Config {
                    namespace: message.namespace,
                    seqno: message.seqno,
                },
            );
        }

        for key in &extras.supplemental_keys {
            let secret_key = required_secret_key(group, "supplemental keys")?;
            batch.push(
                StoreKeysRequest {
                    group_pk: group_pk.clone(),
                    ciphertext: key.clone(),
                    ttl: DEFAULT_CONFIG_TTL,
                    network_timestamp,
                    secret_key,
                },
                Slot::Auxiliary,
            );
        }

        if !changes.obsolete_hashes.is_empty() {
            let secret_key = required_secret_key(group, "obsolete hashes")?;
            batch.push(
                DeleteHashesRequest {
                    group_pk: group_pk.clone(),
                    hashes: changes.obsolete_hashes.iter().cloned().collect(),
                    secret_key,
                },
                Slot::Auxiliary,
            );
        }

        if let Some(tokens) = &extras.revoke {
            let request = token_request(group, tokens, "revoke")?;
            batch.push(SubRequest::Revoke(request), Slot::Auxiliary);
        }
        if let Some(tokens) = &extras.unrevoke {
            let request = token_request(group, tokens, "unrevoke")?;
            batch.push(SubRequest::Unrevoke(request), Slot::Auxiliary);
        }

        if extras.delete_all {
            let secret_key = required_secret_key(group, "delete all")?;
            batch.push(
                DeleteAllRequest {
                    group_pk: group_pk.clone(),
                    namespace: SwarmNamespace::GroupMessages,
                    secret_key,
                },
                Slot::Auxiliary,
            );
        }

        Ok(batch)
    }

    fn push(&mut self, request: impl Into<SubRequest>, slot: Slot) {
        self.requests.push(request.into());
        self.slots.push(slot);
    }

    pub(crate) fn requests(&self) -> &[SubRequest] {
        &self.requests
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    /// Maps the results back to the sub-requests by position.
    ///
    /// A stored config message is only confirmable when the swarm accepted it and reported the
    /// hash it is stored under. When the batch stored config messages, at least one of them must
    /// be confirmable. Expects one result per sub-request.
    pub(crate) fn interpret(
        &self,
        group_pk: &GroupPubkey,
        results: &[SubResult],
    ) -> Result<BatchOutcome, JobError> {
        debug_assert_eq!(results.len(), self.slots.len());

        let mut any_accepted = false;
        let mut confirmation = PushConfirmation::default();
        for ((slot, result), request) in self.slots.iter().zip(results).zip(&self.requests) {
            if !result.is_accepted() {
                debug!(
                    group = %group_pk.short(),
                    request = request.kind(),
                    code = result.code,
                    "Sub-request not accepted"
                );
                continue;
            }
            any_accepted = true;

            let Slot::Config { namespace, seqno } = *slot else {
                continue;
            };
            let Some(hash) = &result.hash else {
                debug!(group = %group_pk.short(), %namespace, "Stored config without hash");
                continue;
            };
            let namespace = ConfigNamespace::try_from(namespace).map_err(|error| {
                JobError::invariant(anyhow!("cannot confirm push of {group_pk:?}: {error}"))
            })?;
            confirmation.insert(namespace, seqno, hash.clone());
        }

        let stores_config = self
            .slots
            .iter()
            .any(|slot| matches!(slot, Slot::Config { .. }));
        if !any_accepted || (stores_config && confirmation.is_empty()) {
            return Ok(BatchOutcome::NothingAccepted);
        }
        Ok(BatchOutcome::Accepted(confirmation))
    }
}

fn required_secret_key(group: &UserGroupEntry, purpose: &str) -> Result<GroupSecretKey, JobError> {
    group.usable_secret_key().cloned().ok_or_else(|| {
        JobError::invariant(anyhow!(
            "{purpose} for {:?} require the group secret key, which is missing",
            group.group_pk
        ))
    })
}

fn token_request(
    group: &UserGroupEntry,
    tokens: &[Vec<u8>],
    purpose: &str,
) -> Result<TokenRequest, JobError> {
    if tokens.is_empty() {
        return Err(JobError::invariant(anyhow!(
            "{purpose} request for {:?} without tokens",
            group.group_pk
        )));
    }
    Ok(TokenRequest {
        group_pk: group.group_pk.clone(),
        tokens: tokens.to_vec(),
        secret_key: required_secret_key(group, purpose)?,
    })
}

#[cfg(test)]
mod test {
    use std::{collections::BTreeSet, time::Duration};

    use swarmcommon::identifiers::MessageHash;

    use crate::{
        config_state::PendingMessage,
        test_utils::{group_pk, secret_key},
    };

    use super::*;

    fn group(with_key: bool) -> UserGroupEntry {
        UserGroupEntry {
            group_pk: group_pk(1),
            secret_key: with_key.then(secret_key),
        }
    }

    fn message(namespace: SwarmNamespace, seqno: u64) -> PendingMessage {
        PendingMessage {
            namespace,
            seqno: SeqNo(seqno),
            ciphertext: vec![seqno as u8],
            ttl: None,
        }
    }

    fn changes() -> PendingChangeSet {
        PendingChangeSet {
            obsolete_hashes: BTreeSet::from([MessageHash::new("old")]),
            messages: vec![
                message(SwarmNamespace::GroupKeys, 1),
                message(SwarmNamespace::GroupInfo, 7),
            ],
        }
    }

    #[test]
    fn requests_are_ordered() {
        let extras = PushExtras {
            supplemental_keys: vec![vec![1], vec![2]],
            revoke: Some(vec![vec![3]]),
            unrevoke: Some(vec![vec![4]]),
            delete_all: true,
        };
        let batch = SyncBatch::build(&group(true), &changes(), &extras, Utc::now()).unwrap();

        let kinds: Vec<_> = batch.requests().iter().map(SubRequest::kind).collect();
        assert_eq!(
            kinds,
            [
                "store_config",
                "store_config",
                "store_keys",
                "store_keys",
                "delete_hashes",
                "revoke",
                "unrevoke",
                "delete_all"
            ]
        );
        let SubRequest::StoreConfig(request) = &batch.requests()[0] else {
            panic!("expected a store config request");
        };
        assert_eq!(request.ttl, DEFAULT_CONFIG_TTL);
    }

    #[test]
    fn explicit_ttl_is_kept() {
        let mut changes = changes();
        changes.messages[0].ttl = Some(Duration::from_secs(60));
        let batch =
            SyncBatch::build(&group(true), &changes, &PushExtras::default(), Utc::now()).unwrap();
        let SubRequest::StoreConfig(request) = &batch.requests()[0] else {
            panic!("expected a store config request");
        };
        assert_eq!(request.ttl, Duration::from_secs(60));
    }

    #[test]
    fn missing_secret_key_is_an_invariant_violation() {
        let result = SyncBatch::build(
            &group(false),
            &changes(),
            &PushExtras::default(),
            Utc::now(),
        );
        assert!(matches!(result, Err(JobError::InvariantViolation(_))));

        // an empty key counts as missing
        let group = UserGroupEntry {
            group_pk: group_pk(1),
            secret_key: Some(GroupSecretKey::new(Vec::new())),
        };
        let result = SyncBatch::build(&group, &changes(), &PushExtras::default(), Utc::now());
        assert!(matches!(result, Err(JobError::InvariantViolation(_))));
    }

    #[test]
    fn empty_revoke_tokens_are_an_invariant_violation() {
        let extras = PushExtras {
            revoke: Some(Vec::new()),
            ..Default::default()
        };
        let result =
            SyncBatch::build(&group(true), &PendingChangeSet::default(), &extras, Utc::now());
        assert!(matches!(result, Err(JobError::InvariantViolation(_))));
    }

    #[test]
    fn only_accepted_configs_with_hash_are_confirmed() {
        let batch =
            SyncBatch::build(&group(true), &changes(), &PushExtras::default(), Utc::now()).unwrap();
        let results = [
            SubResult {
                code: 500,
                hash: None,
            },
            SubResult::accepted(Some(MessageHash::new("info-7"))),
            SubResult::accepted(None),
        ];

        let BatchOutcome::Accepted(confirmation) =
            batch.interpret(&group_pk(1), &results).unwrap()
        else {
            panic!("expected accepted changes");
        };
        assert_eq!(confirmation.len(), 1);
        let confirmed = confirmation.get(ConfigNamespace::Info).unwrap();
        assert_eq!(confirmed.seqno, SeqNo(7));
        assert_eq!(confirmed.hash, MessageHash::new("info-7"));
    }

    #[test]
    fn nothing_accepted() {
        let batch =
            SyncBatch::build(&group(true), &changes(), &PushExtras::default(), Utc::now()).unwrap();

        let rejected = vec![
            SubResult {
                code: 421,
                hash: None,
            };
            3
        ];
        assert_eq!(
            batch.interpret(&group_pk(1), &rejected).unwrap(),
            BatchOutcome::NothingAccepted
        );

        // only the hash deletion went through
        let results = [
            SubResult {
                code: 500,
                hash: None,
            },
            SubResult {
                code: 500,
                hash: None,
            },
            SubResult::accepted(None),
        ];
        assert_eq!(
            batch.interpret(&group_pk(1), &results).unwrap(),
            BatchOutcome::NothingAccepted
        );
    }

    #[test]
    fn auxiliary_requests_alone_can_succeed() {
        let extras = PushExtras {
            delete_all: true,
            ..Default::default()
        };
        let batch =
            SyncBatch::build(&group(true), &PendingChangeSet::default(), &extras, Utc::now())
                .unwrap();
        assert_eq!(
            batch
                .interpret(&group_pk(1), &[SubResult::accepted(None)])
                .unwrap(),
            BatchOutcome::Accepted(PushConfirmation::default())
        );
    }

    #[test]
    fn unknown_namespace_is_an_invariant_violation() {
        let changes = PendingChangeSet {
            obsolete_hashes: BTreeSet::new(),
            messages: vec![message(SwarmNamespace::GroupMessages, 1)],
        };
        let batch =
            SyncBatch::build(&group(true), &changes, &PushExtras::default(), Utc::now()).unwrap();
        let result = batch.interpret(
            &group_pk(1),
            &[SubResult::accepted(Some(MessageHash::new("h")))],
        );
        assert!(matches!(result, Err(JobError::InvariantViolation(_))));
    }
}
