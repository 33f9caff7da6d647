// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Access to the local user and the groups they are a member of.

use async_trait::async_trait;
use swarmcommon::{
    identifiers::{GroupPubkey, UserId},
    keys::{Ed25519KeyPair, GroupSecretKey},
};

/// The account of the local user.
///
/// Both methods return `None` while no account is set up on this device.
#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    async fn current_user_id(&self) -> anyhow::Result<Option<UserId>>;

    async fn current_user_signing_keys(&self) -> anyhow::Result<Option<Ed25519KeyPair>>;
}

/// Entry of a group in the directory of the user's groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserGroupEntry {
    pub group_pk: GroupPubkey,
    /// Only present when the user is an admin of the group
    pub secret_key: Option<GroupSecretKey>,
}

impl UserGroupEntry {
    /// The secret key, if it is present and not empty.
    pub fn usable_secret_key(&self) -> Option<&GroupSecretKey> {
        self.secret_key.as_ref().filter(|key| !key.is_empty())
    }
}

#[async_trait]
pub trait UserGroups: Send + Sync + 'static {
    async fn get_group(&self, group_pk: &GroupPubkey) -> anyhow::Result<Option<UserGroupEntry>>;
}
