// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Public key based identifiers of users and groups.
//!
//! Both identifiers are 33 bytes, hex encoded, where the first byte is a type prefix: `05` for
//! users and `03` for groups.

use std::{fmt, str::FromStr};

use displaydoc::Display;
use serde::{Deserialize, Serialize};

const PUBKEY_HEX_LEN: usize = 66;

const GROUP_PREFIX: &str = "03";
const USER_PREFIX: &str = "05";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Display)]
pub enum IdentifierError {
    /// Invalid length: expected {expected} hex characters, got {actual}
    InvalidLength { expected: usize, actual: usize },
    /// Invalid prefix: expected `{expected}`
    InvalidPrefix { expected: &'static str },
    /// Identifier is not a hex string
    InvalidHex,
}

fn validate_prefixed_hex(value: &str, prefix: &'static str) -> Result<String, IdentifierError> {
    if value.len() != PUBKEY_HEX_LEN {
        return Err(IdentifierError::InvalidLength {
            expected: PUBKEY_HEX_LEN,
            actual: value.len(),
        });
    }
    if !value.starts_with(prefix) {
        return Err(IdentifierError::InvalidPrefix { expected: prefix });
    }
    hex::decode(value).map_err(|_| IdentifierError::InvalidHex)?;
    Ok(value.to_ascii_lowercase())
}

/// Shortened representation of a public key, suitable for logs.
fn short(value: &str) -> String {
    format!("{}...{}", &value[..8], &value[value.len() - 4..])
}

/// Identifier of a group and of its swarm.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPubkey(String);

impl GroupPubkey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form used in log lines.
    pub fn short(&self) -> String {
        short(&self.0)
    }

    /// Returns `true` if `value` has the shape of a group public key.
    pub fn is_group_pubkey(value: &str) -> bool {
        validate_prefixed_hex(value, GROUP_PREFIX).is_ok()
    }
}

impl FromStr for GroupPubkey {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_prefixed_hex(s, GROUP_PREFIX).map(Self)
    }
}

impl TryFrom<String> for GroupPubkey {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<GroupPubkey> for String {
    fn from(group_pk: GroupPubkey) -> Self {
        group_pk.0
    }
}

impl fmt::Display for GroupPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for GroupPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("GroupPubkey").field(&self.short()).finish()
    }
}

/// Identifier of a user (and of the user's own swarm).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for UserId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_prefixed_hex(s, USER_PREFIX).map(Self)
    }
}

impl TryFrom<String> for UserId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UserId> for String {
    fn from(user_id: UserId) -> Self {
        user_id.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("UserId").field(&short(&self.0)).finish()
    }
}

/// Hash under which the swarm stores a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHash(String);

impl MessageHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sequence number of a config object within its namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeqNo(pub u64);

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
