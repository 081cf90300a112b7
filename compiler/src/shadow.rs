// shadow.rs — Array shadow registry
//
// Bookkeeping table mapping a logical array name to its host/device twin
// names and residency status. Shadow descriptors are registered in the graph
// as transients and persist for the lifetime of the graph; no operation ever
// frees a previously created shadow.
//
// Preconditions: queried names resolve to descriptors in the graph.
// Postconditions: entry status transitions are monotonic — once
//                 BothFromThisTransform, an entry never reverts to a
//                 single-residency status within the same transform call.
// Failure modes: `clone_to_host` fails on a name collision with an unrelated
//                existing array of incompatible shape.
// Side effects: mutates the graph's array table.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{ArrayDesc, ProgramGraph, StorageKind};
use crate::transform::OffloadError;

// ── Entry ───────────────────────────────────────────────────────────────────

/// Residency status of a registered array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    HostOnly,
    DeviceOnly,
    /// Already device-resident when the transform started (inherited from an
    /// enclosing transform); never re-cloned.
    BothFromOuterScope,
    BothFromThisTransform,
}

/// Twin names plus residency status for one logical array.
#[derive(Debug, Clone)]
pub struct ShadowEntry {
    pub host: Option<String>,
    pub device: Option<String>,
    pub status: Residency,
}

// ── Registry ────────────────────────────────────────────────────────────────

/// String-keyed table of host/device twins. Entries are created lazily on the
/// first clone/move request and never deleted.
#[derive(Debug, Default)]
pub struct ShadowRegistry {
    entries: BTreeMap<String, ShadowEntry>,
}

impl ShadowRegistry {
    /// Seed the registry from arrays that are already device-resident on
    /// entry, tagging them `BothFromOuterScope` so they are never re-cloned.
    pub fn bootstrap(graph: &ProgramGraph) -> Self {
        let mut reg = ShadowRegistry::default();
        for (name, desc) in &graph.arrays {
            if desc.storage.device_accessible() {
                reg.entries.insert(
                    name.clone(),
                    ShadowEntry {
                        host: None,
                        device: Some(name.clone()),
                        status: Residency::BothFromOuterScope,
                    },
                );
            }
        }
        reg
    }

    /// Flip the named descriptor to device-resident storage in place and mark
    /// the entry DeviceOnly. A host twin, if any, stays registered separately.
    pub fn move_to_device(&mut self, graph: &mut ProgramGraph, name: &str) {
        if let Some(desc) = graph.arrays.get_mut(name) {
            desc.storage = StorageKind::DeviceGlobal;
        }
        match self.entries.get_mut(name) {
            Some(entry) => {
                if entry.device.is_none() {
                    entry.device = Some(name.to_string());
                }
                entry.status = Residency::DeviceOnly;
            }
            None => {
                self.entries.insert(
                    name.to_string(),
                    ShadowEntry {
                        host: None,
                        device: Some(name.to_string()),
                        status: Residency::DeviceOnly,
                    },
                );
            }
        }
    }

    /// Idempotent device clone: returns the existing device twin if one is
    /// registered, otherwise allocates a transient device-resident descriptor
    /// under a fresh `device_<name>` and registers it.
    pub fn clone_to_device(&mut self, graph: &mut ProgramGraph, name: &str) -> String {
        if let Some(entry) = self.entries.get(name) {
            if let Some(device) = &entry.device {
                return device.clone();
            }
        }

        let mut newdesc = graph.arrays[name].clone();
        newdesc.storage = StorageKind::DeviceGlobal;
        newdesc.transient = true;
        let new_name = graph.add_array_unique(&format!("device_{name}"), newdesc);

        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.device = Some(new_name.clone());
                entry.status = Residency::BothFromThisTransform;
            }
            None => {
                self.entries.insert(
                    name.to_string(),
                    ShadowEntry {
                        host: None,
                        device: Some(new_name.clone()),
                        status: Residency::DeviceOnly,
                    },
                );
            }
        }
        new_name
    }

    /// Symmetric host clone under `host_<name>`. Probes for an existing array
    /// of that name first: a compatible one is reused, an incompatible one is
    /// an internal invariant violation.
    pub fn clone_to_host(
        &mut self,
        graph: &mut ProgramGraph,
        name: &str,
    ) -> Result<String, OffloadError> {
        if let Some(entry) = self.entries.get(name) {
            if matches!(
                entry.status,
                Residency::HostOnly | Residency::BothFromThisTransform
            ) {
                if let Some(host) = &entry.host {
                    return Ok(host.clone());
                }
            }
        }

        let mut newdesc = graph.arrays[name].clone();
        newdesc.storage = StorageKind::HostHeap;
        newdesc.transient = true;
        let new_name = format!("host_{name}");

        match graph.arrays.get(&new_name) {
            None => {
                graph.add_array(new_name.clone(), newdesc);
            }
            Some(existing) if existing.shape_compatible(&newdesc) => {}
            Some(_) => {
                return Err(OffloadError::invariant(format!(
                    "host shadow '{new_name}' collides with an existing array of incompatible shape"
                )));
            }
        }

        match self.entries.get_mut(name) {
            Some(entry) => {
                entry.host = Some(new_name.clone());
                entry.status = Residency::BothFromThisTransform;
            }
            None => {
                self.entries.insert(
                    name.to_string(),
                    ShadowEntry {
                        host: Some(new_name.clone()),
                        device: None,
                        status: Residency::HostOnly,
                    },
                );
            }
        }
        Ok(new_name)
    }

    /// Whether this transform holds a device twin for `name`. Arrays that
    /// were device-resident before the transform started do not count; they
    /// need no copies.
    pub fn on_device(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| {
            matches!(
                e.status,
                Residency::DeviceOnly | Residency::BothFromThisTransform
            )
        })
    }

    /// Whether this transform holds a host twin for `name`.
    pub fn on_host(&self, name: &str) -> bool {
        self.entries.get(name).is_some_and(|e| {
            matches!(
                e.status,
                Residency::HostOnly | Residency::BothFromThisTransform
            )
        })
    }

    pub fn device_array(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|e| e.device.as_deref())
    }

    pub fn host_array(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|e| e.host.as_deref())
    }

    pub fn entry(&self, name: &str) -> Option<&ShadowEntry> {
        self.entries.get(name)
    }

    /// All logical names the registry tracks.
    pub fn names(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
