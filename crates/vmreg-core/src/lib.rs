//! vmreg core - bulk registration of VM descriptor files through vCenter.
//!
//! The crate discovers `.vmx` descriptor files on a datastore, translates each
//! browser path into the bracketed datastore path the registration call
//! expects, and registers them one by one, tolerating per-file failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use vmreg_core::{BatchRegistrar, Credential, LineReporter, RegistrarConfig, VsphereConnector};
//!
//! #[tokio::main]
//! async fn main() -> vmreg_core::Result<()> {
//!     let config = RegistrarConfig::new(
//!         "vcenter.example.local",
//!         Credential::new("root", "secret"),
//!         "Datastore1",
//!     )?
//!     .with_datacenter(Some("DC-West".to_string()))
//!     .with_vm_host(Some("esx01.example.local".to_string()))
//!     .with_ignore_cert_errors(true);
//!
//!     let registrar = BatchRegistrar::new(VsphereConnector::new(), config);
//!     let report = registrar.run(&mut LineReporter::stdout()).await?;
//!     println!("{} registered, {} failed", report.succeeded(), report.failed());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hypervisor;
pub mod path;
pub mod progress;
pub mod registrar;

pub use config::{ConnectOptions, Credential, Endpoint, RegistrarConfig};
pub use error::{Result, VmregError};
pub use hypervisor::{
    DatastoreRef, DescriptorFile, HypervisorConnector, HypervisorSession, RegisteredVm,
    VsphereConnector, VsphereSession,
};
pub use path::correct_path;
pub use progress::{LineReporter, ProgressUpdate, Reporter, SilentReporter};
pub use registrar::{BatchRegistrar, FileOutcome, RegistrationOutcome, RegistrationReport};
