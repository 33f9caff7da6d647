// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Opaque key material.
//!
//! Signing happens in the transport layer; these types only carry the bytes and make sure they
//! never end up in logs and are wiped on drop.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Secret key of a group, required to sign writes to the group swarm.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct GroupSecretKey(Vec<u8>);

impl GroupSecretKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for GroupSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GroupSecretKey(<redacted>)")
    }
}

/// Ed25519 key pair of the local user, used to authenticate requests.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)]
    public_key: [u8; 32],
    secret_key: Vec<u8>,
}

impl Ed25519KeyPair {
    pub fn new(public_key: [u8; 32], secret_key: Vec<u8>) -> Self {
        Self {
            public_key,
            secret_key,
        }
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}
