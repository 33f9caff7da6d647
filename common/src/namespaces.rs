// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespaces of a group swarm.
///
/// Each namespace is versioned independently by the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i16", into = "i16")]
pub enum SwarmNamespace {
    GroupMessages,
    GroupKeys,
    GroupInfo,
    GroupMembers,
    RevokedRetrievableGroupMessages,
}

impl SwarmNamespace {
    pub const fn as_i16(self) -> i16 {
        match self {
            SwarmNamespace::GroupMessages => 11,
            SwarmNamespace::GroupKeys => 12,
            SwarmNamespace::GroupInfo => 13,
            SwarmNamespace::GroupMembers => 14,
            SwarmNamespace::RevokedRetrievableGroupMessages => -11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Unknown swarm namespace {0}")]
pub struct UnknownNamespace(pub i16);

impl TryFrom<i16> for SwarmNamespace {
    type Error = UnknownNamespace;

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        match value {
            11 => Ok(SwarmNamespace::GroupMessages),
            12 => Ok(SwarmNamespace::GroupKeys),
            13 => Ok(SwarmNamespace::GroupInfo),
            14 => Ok(SwarmNamespace::GroupMembers),
            -11 => Ok(SwarmNamespace::RevokedRetrievableGroupMessages),
            other => Err(UnknownNamespace(other)),
        }
    }
}

impl From<SwarmNamespace> for i16 {
    fn from(namespace: SwarmNamespace) -> Self {
        namespace.as_i16()
    }
}

impl fmt::Display for SwarmNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i16())
    }
}

/// The subset of swarm namespaces that hold group configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigNamespace {
    Keys,
    Info,
    Members,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{0} is not a config namespace")]
pub struct NotAConfigNamespace(pub SwarmNamespace);

impl TryFrom<SwarmNamespace> for ConfigNamespace {
    type Error = NotAConfigNamespace;

    fn try_from(namespace: SwarmNamespace) -> Result<Self, Self::Error> {
        match namespace {
            SwarmNamespace::GroupKeys => Ok(ConfigNamespace::Keys),
            SwarmNamespace::GroupInfo => Ok(ConfigNamespace::Info),
            SwarmNamespace::GroupMembers => Ok(ConfigNamespace::Members),
            SwarmNamespace::GroupMessages | SwarmNamespace::RevokedRetrievableGroupMessages => {
                Err(NotAConfigNamespace(namespace))
            }
        }
    }
}

impl From<ConfigNamespace> for SwarmNamespace {
    fn from(namespace: ConfigNamespace) -> Self {
        match namespace {
            ConfigNamespace::Keys => SwarmNamespace::GroupKeys,
            ConfigNamespace::Info => SwarmNamespace::GroupInfo,
            ConfigNamespace::Members => SwarmNamespace::GroupMembers,
        }
    }
}
