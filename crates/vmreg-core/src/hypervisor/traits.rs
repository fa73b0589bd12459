//! Hypervisor connection and session traits.

use super::{DatastoreRef, DescriptorFile, RegisteredVm};
use crate::config::{ConnectOptions, Credential, Endpoint};
use crate::Result;
use async_trait::async_trait;

/// Opens authenticated sessions against a hypervisor endpoint.
#[async_trait]
pub trait HypervisorConnector: Send + Sync {
    type Session: HypervisorSession;

    /// Establish a session.
    ///
    /// Certificate policy and timeouts come from `options` and apply to this
    /// connection only.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<Self::Session>;
}

/// An open session on a single host.
#[async_trait]
pub trait HypervisorSession: Send + Sync {
    /// Look up a datastore by its logical name.
    async fn find_datastore(&self, name: &str) -> Result<DatastoreRef>;

    /// Recursively list files under the datastore's browser root whose
    /// extension matches `extension` (case-insensitive, without the dot).
    async fn list_descriptor_files(
        &self,
        datastore: &DatastoreRef,
        extension: &str,
    ) -> Result<Vec<DescriptorFile>>;

    /// Register the descriptor at `datastore_path`, which lives on `datastore`,
    /// on `target_host`.
    async fn register_vm(
        &self,
        datastore: &DatastoreRef,
        datastore_path: &str,
        target_host: &str,
    ) -> Result<RegisteredVm>;

    /// End the session. Called exactly once per session.
    async fn disconnect(&self) -> Result<()>;
}
