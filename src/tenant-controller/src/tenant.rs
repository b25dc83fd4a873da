// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tenant identifiers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;

/// The name of a logical tenant. Names are unique within a node.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TenantName(String);

impl TenantName {
    /// Constructs a tenant name.
    pub fn new(name: impl Into<String>) -> TenantName {
        TenantName(name.into())
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantName {
    fn from(name: &str) -> TenantName {
        TenantName::new(name)
    }
}

impl From<String> for TenantName {
    fn from(name: String) -> TenantName {
        TenantName(name)
    }
}

/// The numeric identifier of a tenant, assigned by the tenant server once it
/// has started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TenantId(Option<u64>);

impl TenantId {
    /// An identifier that has not been assigned.
    pub const UNSET: TenantId = TenantId(None);

    /// Constructs an assigned tenant identifier.
    pub fn new(id: u64) -> TenantId {
        TenantId(Some(id))
    }

    /// Reports whether the identifier has been assigned.
    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    /// Returns the identifier as an integer, or zero if it is not set.
    pub fn to_u64(&self) -> u64 {
        self.0.unwrap_or(0)
    }
}

/// The identifier of one SQL instance of a tenant server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId(pub i32);

/// The identifier of the node hosting the tenant servers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub i32);

/// A shared, renamable holder of a tenant's name.
///
/// The container is handed to the tenant server at creation so that a server
/// observes renames of its tenant without being recreated.
#[derive(Clone, Debug)]
pub struct TenantNameContainer {
    name: Arc<RwLock<TenantName>>,
}

impl TenantNameContainer {
    /// Constructs a container holding `name`.
    pub fn new(name: TenantName) -> TenantNameContainer {
        TenantNameContainer {
            name: Arc::new(RwLock::new(name)),
        }
    }

    /// Returns the current name.
    pub fn get(&self) -> TenantName {
        self.name.read().expect("lock poisoned").clone()
    }

    /// Replaces the current name.
    pub fn set(&self, name: TenantName) {
        *self.name.write().expect("lock poisoned") = name;
    }
}

impl fmt::Display for TenantNameContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.get().fmt(f)
    }
}

/// Per-tenant overrides handed to the tenant server creator.
///
/// The controller treats these as opaque; they are typically used by tests to
/// configure individual tenant servers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TenantServerArgs {
    /// Arbitrary key/value settings.
    pub settings: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[mz_ore::test]
    fn tenant_id_unset() {
        assert!(!TenantId::UNSET.is_set());
        assert_eq!(TenantId::UNSET.to_u64(), 0);
        assert!(TenantId::new(7).is_set());
        assert_eq!(TenantId::new(7).to_u64(), 7);
    }

    #[mz_ore::test]
    fn name_container_observes_renames() {
        let container = TenantNameContainer::new("app".into());
        let shared = container.clone();
        container.set("app-renamed".into());
        assert_eq!(shared.get(), TenantName::new("app-renamed"));
        assert_eq!(shared.to_string(), "app-renamed");
    }
}
