// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory fakes of the collaborators of the group sync.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use swarmcommon::{
    identifiers::{GroupPubkey, MessageHash, UserId},
    keys::{Ed25519KeyPair, GroupSecretKey},
    namespaces::SwarmNamespace,
};

use crate::{
    config_state::{ConfigStateMachine, PendingChangeSet, PushConfirmation},
    group_sync::GroupSyncCollaborators,
    identity::{IdentityProvider, UserGroupEntry, UserGroups},
    swarm_api::{SubRequest, SubResult, SwarmError, SwarmTransport},
};

/// A valid group public key derived from `n`.
pub fn group_pk(n: u8) -> GroupPubkey {
    format!("03{}", hex::encode([n; 32]))
        .parse()
        .expect("valid group public key")
}

pub fn user_id() -> UserId {
    format!("05{}", hex::encode([0xab; 32]))
        .parse()
        .expect("valid user id")
}

pub fn secret_key() -> GroupSecretKey {
    GroupSecretKey::new(vec![7; 64])
}

#[derive(Debug, Default)]
struct ConfigStateInner {
    pending: HashMap<GroupPubkey, PendingChangeSet>,
    confirmations: Vec<(GroupPubkey, PushConfirmation)>,
    dumps: usize,
}

/// Config state machine which confirms pending messages up to the confirmed seqno.
#[derive(Debug, Default)]
pub struct FakeConfigState {
    inner: Mutex<ConfigStateInner>,
}

impl FakeConfigState {
    pub fn set_pending(&self, group_pk: &GroupPubkey, changes: PendingChangeSet) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending.insert(group_pk.clone(), changes);
    }

    pub fn pending(&self, group_pk: &GroupPubkey) -> PendingChangeSet {
        let inner = self.inner.lock().unwrap();
        inner.pending.get(group_pk).cloned().unwrap_or_default()
    }

    pub fn confirmations(&self) -> Vec<(GroupPubkey, PushConfirmation)> {
        self.inner.lock().unwrap().confirmations.clone()
    }

    pub fn dump_count(&self) -> usize {
        self.inner.lock().unwrap().dumps
    }
}

#[async_trait]
impl ConfigStateMachine for FakeConfigState {
    async fn pending_changes(&self, group_pk: &GroupPubkey) -> anyhow::Result<PendingChangeSet> {
        Ok(self.pending(group_pk))
    }

    async fn confirm_pushed(
        &self,
        group_pk: &GroupPubkey,
        confirmation: &PushConfirmation,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pending) = inner.pending.get_mut(group_pk) {
            pending.messages.retain(|message| {
                !confirmation.iter().any(|(namespace, confirmed)| {
                    SwarmNamespace::from(namespace) == message.namespace
                        && message.seqno <= confirmed.seqno
                })
            });
            pending.obsolete_hashes.clear();
        }
        inner
            .confirmations
            .push((group_pk.clone(), confirmation.clone()));
        Ok(())
    }

    async fn save_dumps(&self, _group_pk: &GroupPubkey) -> anyhow::Result<()> {
        self.inner.lock().unwrap().dumps += 1;
        Ok(())
    }

    async fn encrypt_messages(
        &self,
        _group_pk: &GroupPubkey,
        plaintexts: &[Vec<u8>],
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(plaintexts
            .iter()
            .map(|plaintext| plaintext.iter().rev().copied().collect())
            .collect())
    }
}

/// How the fake swarm answers the next batch.
#[derive(Debug, Clone)]
pub enum FakeResponse {
    /// Accepts every sub-request; stores are answered with a hash
    AcceptAll,
    Fixed(Vec<SubResult>),
    Error,
    /// Never answers
    Hang,
}

#[derive(Debug, Default)]
pub struct FakeSwarm {
    responses: Mutex<VecDeque<FakeResponse>>,
    batches: Mutex<Vec<(GroupPubkey, Vec<SubRequest>)>>,
}

impl FakeSwarm {
    /// Queues the answer to a future batch. Without queued answers, batches are accepted.
    pub fn push_response(&self, response: FakeResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn batches(&self) -> Vec<(GroupPubkey, Vec<SubRequest>)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl SwarmTransport for FakeSwarm {
    async fn send_batch(
        &self,
        group_pk: &GroupPubkey,
        requests: &[SubRequest],
    ) -> Result<Vec<SubResult>, SwarmError> {
        self.batches
            .lock()
            .unwrap()
            .push((group_pk.clone(), requests.to_vec()));
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(FakeResponse::AcceptAll);

        match response {
            FakeResponse::AcceptAll => Ok(requests
                .iter()
                .enumerate()
                .map(|(i, request)| match request {
                    SubRequest::StoreConfig(_)
                    | SubRequest::StoreKeys(_)
                    | SubRequest::StoreMessage(_) => {
                        SubResult::accepted(Some(MessageHash::new(format!("hash-{i}"))))
                    }
                    _ => SubResult::accepted(None),
                })
                .collect()),
            FakeResponse::Fixed(results) => Ok(results),
            FakeResponse::Error => Err(SwarmError::Network(anyhow::anyhow!("connection reset"))),
            FakeResponse::Hang => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
pub struct FakeIdentity {
    user_id: Option<UserId>,
    signing_keys: Option<Ed25519KeyPair>,
    unavailable: bool,
}

impl FakeIdentity {
    pub fn present() -> Self {
        Self {
            user_id: Some(user_id()),
            signing_keys: Some(Ed25519KeyPair::new([1; 32], vec![2; 64])),
            unavailable: false,
        }
    }

    pub fn absent() -> Self {
        Self {
            user_id: None,
            signing_keys: None,
            unavailable: false,
        }
    }

    /// An identity store which fails to answer.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::present()
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn current_user_id(&self) -> anyhow::Result<Option<UserId>> {
        anyhow::ensure!(!self.unavailable, "identity store unavailable");
        Ok(self.user_id.clone())
    }

    async fn current_user_signing_keys(&self) -> anyhow::Result<Option<Ed25519KeyPair>> {
        anyhow::ensure!(!self.unavailable, "identity store unavailable");
        Ok(self.signing_keys.clone())
    }
}

#[derive(Debug, Default)]
pub struct FakeUserGroups {
    groups: Mutex<HashMap<GroupPubkey, UserGroupEntry>>,
}

impl FakeUserGroups {
    /// Adds a group the user is an admin of.
    pub fn insert(&self, group_pk: GroupPubkey) {
        self.insert_entry(UserGroupEntry {
            group_pk,
            secret_key: Some(secret_key()),
        });
    }

    pub fn insert_without_key(&self, group_pk: GroupPubkey) {
        self.insert_entry(UserGroupEntry {
            group_pk,
            secret_key: None,
        });
    }

    fn insert_entry(&self, entry: UserGroupEntry) {
        self.groups
            .lock()
            .unwrap()
            .insert(entry.group_pk.clone(), entry);
    }
}

#[async_trait]
impl UserGroups for FakeUserGroups {
    async fn get_group(&self, group_pk: &GroupPubkey) -> anyhow::Result<Option<UserGroupEntry>> {
        Ok(self.groups.lock().unwrap().get(group_pk).cloned())
    }
}

/// A set of fakes, with typed access for assertions.
#[derive(Debug, Clone)]
pub struct TestCollaborators {
    pub config_state: Arc<FakeConfigState>,
    pub swarm: Arc<FakeSwarm>,
    pub identity: Arc<FakeIdentity>,
    pub user_groups: Arc<FakeUserGroups>,
}

impl TestCollaborators {
    /// Fakes with a local identity and no groups.
    pub fn new() -> Self {
        Self {
            config_state: Arc::default(),
            swarm: Arc::default(),
            identity: Arc::new(FakeIdentity::present()),
            user_groups: Arc::default(),
        }
    }

    /// Fakes with a local identity which is admin of the group.
    pub fn with_group(group_pk: GroupPubkey) -> Self {
        let collaborators = Self::new();
        collaborators.user_groups.insert(group_pk);
        collaborators
    }

    pub fn collaborators(&self) -> GroupSyncCollaborators {
        GroupSyncCollaborators {
            config_state: self.config_state.clone(),
            swarm: self.swarm.clone(),
            identity: self.identity.clone(),
            user_groups: self.user_groups.clone(),
        }
    }
}

impl Default for TestCollaborators {
    fn default() -> Self {
        Self::new()
    }
}
