//! vmreg - register every VM descriptor file found on a datastore.
//!
//! Talks to a vCenter Server. Progress lines go to stdout; diagnostic logging
//! goes to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;
use vmreg_core::config::{NetworkConfig, RegistrationConfig};
use vmreg_core::{BatchRegistrar, Credential, LineReporter, RegistrarConfig, VsphereConnector};

#[derive(Parser, Debug)]
#[command(name = "vmreg")]
#[command(about = "Register all VM descriptor files on a datastore with a hypervisor host")]
#[command(version)]
struct Args {
    /// Hypervisor host to connect to
    #[arg(short, long, env = "VMREG_SERVER")]
    server: String,

    /// Username for the session
    #[arg(short, long, env = "VMREG_USER")]
    user: String,

    /// Password for the session
    #[arg(short, long, env = "VMREG_PASSWORD", hide_env_values = true)]
    password: String,

    /// Datastore to scan for descriptor files
    #[arg(short, long, env = "VMREG_DATASTORE")]
    datastore: String,

    /// ESXi host to register the VMs on (defaults to --server, or the datacenter's only host)
    #[arg(long)]
    vm_host: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    ignore_cert_errors: bool,

    /// Descriptor file extension
    #[arg(long, default_value = RegistrationConfig::DESCRIPTOR_EXTENSION)]
    extension: String,

    /// Datacenter holding the datastore (searched across all datacenters when omitted)
    #[arg(long)]
    datacenter: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = NetworkConfig::REQUEST_TIMEOUT.as_secs())]
    timeout: u64,

    /// Show the paths that would be registered without registering them
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    fn into_config(self) -> Result<RegistrarConfig> {
        let config = RegistrarConfig::new(
            &self.server,
            Credential::new(self.user, self.password),
            self.datastore,
        )
        .context("Invalid arguments")?
        .with_vm_host(self.vm_host)
        .with_ignore_cert_errors(self.ignore_cert_errors)
        .with_extension(&self.extension)
        .with_datacenter(self.datacenter)
        .with_timeout(Duration::from_secs(self.timeout.max(1)))
        .with_dry_run(self.dry_run);
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::WARN };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = args.into_config()?;
    debug!("Configuration: {:?}", config);

    let server = config.endpoint.host().to_string();
    let datastore = config.datastore.clone();
    let registrar = BatchRegistrar::new(VsphereConnector::new(), config);

    let mut reporter = LineReporter::stdout();
    registrar
        .run(&mut reporter)
        .await
        .with_context(|| format!("Registration on {} (datastore {}) aborted", server, datastore))?;

    Ok(())
}
