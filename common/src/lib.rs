// SPDX-FileCopyrightText: 2026 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Identifiers and value types shared between the components of the swarm sync client.

pub mod identifiers;
pub mod keys;
pub mod namespaces;
