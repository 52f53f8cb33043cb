//! Capability attenuation: from a declarative grant to concrete endowments.
//!
//! The host registers one factory per capability in a [`CapabilityCatalog`].
//! [`CapabilityCatalog::attenuate`] turns a [`PermissionGrant`] into an
//! [`EndowmentSet`] holding exactly the granted capabilities, each wrapped
//! in a caveat guard when the grant narrows it. Nothing outside the grant
//! is reachable from the set, not even by name.

pub mod builtin;
pub mod caveat;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ExecutionError, Result};
use crate::snap::SnapId;

pub use builtin::HostHooks;
pub use caveat::CaveatGuard;

/// A runtime constraint narrowing a granted capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Caveat {
    /// Request URLs must belong to one of these origins (`*` allows any).
    AllowedOrigins(Vec<String>),
    /// Derivation paths must equal or extend one of these prefixes.
    AllowedPaths(Vec<String>),
    /// Upper bound on the serialized size of written data.
    MaxBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaveatKind {
    AllowedOrigins,
    AllowedPaths,
    MaxBytes,
}

impl Caveat {
    pub fn kind(&self) -> CaveatKind {
        match self {
            Self::AllowedOrigins(_) => CaveatKind::AllowedOrigins,
            Self::AllowedPaths(_) => CaveatKind::AllowedPaths,
            Self::MaxBytes(_) => CaveatKind::MaxBytes,
        }
    }
}

impl fmt::Display for CaveatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AllowedOrigins => "allowedOrigins",
            Self::AllowedPaths => "allowedPaths",
            Self::MaxBytes => "maxBytes",
        })
    }
}

/// Declarative permissions of one snap: capability name → caveats.
///
/// Ordered so that attenuation iterates deterministically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionGrant {
    permissions: BTreeMap<String, Vec<Caveat>>,
}

impl PermissionGrant {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a capability with its caveats.
    pub fn with(mut self, capability: &str, caveats: Vec<Caveat>) -> Self {
        self.permissions.insert(capability.to_string(), caveats);
        self
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.permissions.contains_key(capability)
    }

    pub fn caveats(&self, capability: &str) -> Option<&[Caveat]> {
        self.permissions.get(capability).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.permissions.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Vec<Caveat>)> {
        self.permissions.iter()
    }
}

/// Per-call context handed to an endowment.
#[derive(Debug, Clone)]
pub struct EndowmentContext {
    pub snap_id: SnapId,
    pub job_id: String,
}

/// A host capability exposed to a sandbox.
///
/// Implementations are the concrete host functions; the attenuator decides
/// which of them a given snap can reach and under which caveats.
#[async_trait]
pub trait Endowment: Send + Sync {
    /// Capability name the sandbox invokes, e.g. `snap_manageState`.
    fn name(&self) -> &str;

    /// Caveat kinds this capability knows how to enforce.
    fn supported_caveats(&self) -> &[CaveatKind] {
        &[]
    }

    async fn invoke(&self, params: Value, context: &EndowmentContext) -> Result<Value>;
}

/// Builds a fresh endowment. Captures live host hooks.
pub type EndowmentFactory = Arc<dyn Fn() -> Arc<dyn Endowment> + Send + Sync>;

/// Every capability the host is able to provide.
#[derive(Clone, Default)]
pub struct CapabilityCatalog {
    factories: BTreeMap<String, EndowmentFactory>,
}

impl CapabilityCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: &str, factory: EndowmentFactory) {
        self.factories.insert(capability.to_string(), factory);
    }

    pub fn provides(&self, capability: &str) -> bool {
        self.factories.contains_key(capability)
    }

    /// Maps a grant to the endowments the sandbox may use.
    ///
    /// Fails if the grant names a capability the host does not provide or
    /// attaches a caveat the capability cannot enforce.
    pub fn attenuate(&self, grant: &PermissionGrant) -> Result<EndowmentSet> {
        let mut endowments: BTreeMap<String, Arc<dyn Endowment>> = BTreeMap::new();
        for (capability, caveats) in grant.iter() {
            let factory = self.factories.get(capability).ok_or_else(|| {
                ExecutionError::Attenuation(format!("unknown capability '{capability}'"))
            })?;
            let endowment = factory();
            for caveat in caveats {
                if !endowment.supported_caveats().contains(&caveat.kind()) {
                    return Err(ExecutionError::Attenuation(format!(
                        "capability '{capability}' does not support caveat '{}'",
                        caveat.kind()
                    )));
                }
            }
            let endowment = if caveats.is_empty() {
                endowment
            } else {
                Arc::new(CaveatGuard::new(endowment, caveats.clone())) as Arc<dyn Endowment>
            };
            endowments.insert(capability.clone(), endowment);
        }
        debug!(capabilities = ?endowments.keys().collect::<Vec<_>>(), "attenuated grant");
        Ok(EndowmentSet { endowments })
    }
}

/// The attenuated capability set of one job. Immutable once built.
#[derive(Clone, Default)]
pub struct EndowmentSet {
    endowments: BTreeMap<String, Arc<dyn Endowment>>,
}

impl EndowmentSet {
    /// Names of the granted capabilities, in a stable order.
    pub fn names(&self) -> Vec<String> {
        self.endowments.keys().cloned().collect()
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.endowments.contains_key(capability)
    }

    pub fn len(&self) -> usize {
        self.endowments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endowments.is_empty()
    }

    /// Invokes a granted capability.
    ///
    /// Unknown and ungranted names fail identically, so the sandbox cannot
    /// probe which capabilities exist on the host.
    pub async fn invoke(
        &self,
        capability: &str,
        params: Value,
        context: &EndowmentContext,
    ) -> Result<Value> {
        match self.endowments.get(capability) {
            Some(endowment) => endowment.invoke(params, context).await,
            None => Err(ExecutionError::MethodNotFound(capability.to_string())),
        }
    }
}

impl fmt::Debug for EndowmentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.endowments.keys()).finish()
    }
}
