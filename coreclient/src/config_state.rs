// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Contract with the state machine holding the group configuration.
//!
//! The state machine owns the locally authoritative configuration of every group and knows
//! which parts of it were not yet confirmed to be stored in the group swarm.

use std::{
    collections::{BTreeMap, BTreeSet, btree_map},
    time::Duration,
};

use async_trait::async_trait;
use swarmcommon::{
    identifiers::{GroupPubkey, MessageHash, SeqNo},
    namespaces::{ConfigNamespace, SwarmNamespace},
};

/// An encrypted configuration message waiting to be stored in the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub namespace: SwarmNamespace,
    pub seqno: SeqNo,
    pub ciphertext: Vec<u8>,
    pub ttl: Option<Duration>,
}

/// Difference between the local configuration of a group and what was confirmed pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeSet {
    /// Hashes of messages superseded by the pending ones
    pub obsolete_hashes: BTreeSet<MessageHash>,
    pub messages: Vec<PendingMessage>,
}

impl PendingChangeSet {
    pub fn is_empty(&self) -> bool {
        self.obsolete_hashes.is_empty() && self.messages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedPush {
    pub seqno: SeqNo,
    pub hash: MessageHash,
}

/// Pushed configuration messages the swarm accepted, by namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushConfirmation {
    confirmed: BTreeMap<ConfigNamespace, ConfirmedPush>,
}

impl PushConfirmation {
    /// Records an accepted message. Of several messages in the same namespace, the one with the
    /// highest seqno wins.
    pub fn insert(&mut self, namespace: ConfigNamespace, seqno: SeqNo, hash: MessageHash) {
        match self.confirmed.entry(namespace) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(ConfirmedPush { seqno, hash });
            }
            btree_map::Entry::Occupied(mut entry) => {
                if entry.get().seqno < seqno {
                    entry.insert(ConfirmedPush { seqno, hash });
                }
            }
        }
    }

    pub fn get(&self, namespace: ConfigNamespace) -> Option<&ConfirmedPush> {
        self.confirmed.get(&namespace)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConfigNamespace, &ConfirmedPush)> {
        self.confirmed
            .iter()
            .map(|(namespace, confirmed)| (*namespace, confirmed))
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }
}

#[async_trait]
pub trait ConfigStateMachine: Send + Sync + 'static {
    /// Changes of the group which are not yet confirmed pushed.
    async fn pending_changes(&self, group_pk: &GroupPubkey) -> anyhow::Result<PendingChangeSet>;

    /// Marks pushed messages as stored in the swarm.
    async fn confirm_pushed(
        &self,
        group_pk: &GroupPubkey,
        confirmation: &PushConfirmation,
    ) -> anyhow::Result<()>;

    /// Persists the current encrypted state of the group.
    async fn save_dumps(&self, group_pk: &GroupPubkey) -> anyhow::Result<()>;

    /// Encrypts serialized messages for the group, preserving their order.
    async fn encrypt_messages(
        &self,
        group_pk: &GroupPubkey,
        plaintexts: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Vec<u8>>>;
}
