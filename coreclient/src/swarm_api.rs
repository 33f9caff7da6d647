// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Requests to the swarm storing the data of a group.
//!
//! A batch of sub-requests is sent to the swarm in one call and answered with one result per
//! sub-request, in the same order. How requests are signed and encoded on the wire is up to the
//! [`SwarmTransport`] implementation; the requests carry the key material needed for it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use swarmcommon::{
    identifiers::{GroupPubkey, MessageHash},
    keys::GroupSecretKey,
    namespaces::SwarmNamespace,
};

/// Time to live of configuration messages without an explicit one.
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Status code of an accepted sub-request.
pub const STATUS_OK: u16 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfigRequest {
    pub group_pk: GroupPubkey,
    pub namespace: SwarmNamespace,
    pub ciphertext: Vec<u8>,
    pub ttl: Duration,
    pub network_timestamp: DateTime<Utc>,
    pub secret_key: GroupSecretKey,
}

/// Stores supplemental key material, which is already encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeysRequest {
    pub group_pk: GroupPubkey,
    pub ciphertext: Vec<u8>,
    pub ttl: Duration,
    pub network_timestamp: DateTime<Utc>,
    pub secret_key: GroupSecretKey,
}

/// Stores a message in the group messages namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessageRequest {
    pub group_pk: GroupPubkey,
    pub ciphertext: Vec<u8>,
    pub ttl: Duration,
    pub network_timestamp: DateTime<Utc>,
    pub secret_key: Option<GroupSecretKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteHashesRequest {
    pub group_pk: GroupPubkey,
    pub hashes: Vec<MessageHash>,
    pub secret_key: GroupSecretKey,
}

/// Revokes (or restores) the subaccount tokens of group members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub group_pk: GroupPubkey,
    pub tokens: Vec<Vec<u8>>,
    pub secret_key: GroupSecretKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteAllRequest {
    pub group_pk: GroupPubkey,
    pub namespace: SwarmNamespace,
    pub secret_key: GroupSecretKey,
}

#[derive(Debug, Clone, PartialEq, Eq, derive_more::From)]
pub enum SubRequest {
    StoreConfig(StoreConfigRequest),
    StoreKeys(StoreKeysRequest),
    StoreMessage(StoreMessageRequest),
    DeleteHashes(DeleteHashesRequest),
    #[from(ignore)]
    Revoke(TokenRequest),
    #[from(ignore)]
    Unrevoke(TokenRequest),
    DeleteAll(DeleteAllRequest),
}

impl SubRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SubRequest::StoreConfig(_) => "store_config",
            SubRequest::StoreKeys(_) => "store_keys",
            SubRequest::StoreMessage(_) => "store_message",
            SubRequest::DeleteHashes(_) => "delete_hashes",
            SubRequest::Revoke(_) => "revoke",
            SubRequest::Unrevoke(_) => "unrevoke",
            SubRequest::DeleteAll(_) => "delete_all",
        }
    }
}

/// Outcome of one sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResult {
    pub code: u16,
    /// Hash under which a stored message is kept by the swarm
    pub hash: Option<MessageHash>,
}

impl SubResult {
    pub fn accepted(hash: Option<MessageHash>) -> Self {
        Self {
            code: STATUS_OK,
            hash,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.code == STATUS_OK
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Network error: {0}")]
    Network(anyhow::Error),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Other(anyhow::Error),
}

#[async_trait]
pub trait SwarmTransport: Send + Sync + 'static {
    /// Sends the requests to the swarm of the group as one batch.
    ///
    /// On success, returns the results of the sub-requests as reported by the swarm. Callers
    /// must not assume there is exactly one result per request.
    async fn send_batch(
        &self,
        group_pk: &GroupPubkey,
        requests: &[SubRequest],
    ) -> Result<Vec<SubResult>, SwarmError>;
}
