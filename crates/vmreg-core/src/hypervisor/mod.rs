//! Hypervisor capabilities consumed by the batch registrar.
//!
//! The registrar only needs four things from a host: open a session, look up a
//! datastore, list descriptor files on it, and register a descriptor. These are
//! expressed as traits so the vSphere REST backend and test doubles share one
//! orchestration path.

mod traits;
mod vsphere;

pub use traits::{HypervisorConnector, HypervisorSession};
pub use vsphere::{VsphereConnector, VsphereSession};

use serde::{Deserialize, Serialize};

/// A datastore as seen by the registrar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatastoreRef {
    /// Logical name, used inside bracketed paths.
    pub name: String,
    /// Hierarchical prefix of every file enumerated on this datastore.
    pub browser_root: String,
    /// Backend identifier (e.g. `datastore-12`).
    pub id: String,
    /// Name of the datacenter holding the datastore, as used in browser URLs.
    pub datacenter: String,
    /// Backend identifier of that datacenter (e.g. `datacenter-3`).
    pub datacenter_id: String,
}

/// A VM descriptor file found on a datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorFile {
    /// Full browser path, starting with the datastore's browser root.
    pub full_path: String,
    /// File name for display.
    pub name: String,
}

impl DescriptorFile {
    pub fn new(full_path: impl Into<String>) -> Self {
        let full_path = full_path.into();
        let name = full_path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or_default()
            .to_string();
        Self { full_path, name }
    }
}

/// A VM created by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredVm {
    /// Backend identifier (e.g. `vm-42`).
    pub id: String,
    /// Bracketed path the VM was registered from.
    pub datastore_path: String,
}
