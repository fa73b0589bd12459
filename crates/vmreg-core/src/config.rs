//! Centralized configuration for vmreg.
//!
//! Constants for network behaviour and registration defaults, plus the runtime
//! configuration of a single registration run.

use crate::{Result, VmregError};
use std::fmt;
use std::time::Duration;
use url::Url;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const USER_AGENT: &'static str = "vmreg/0.1";
    pub const DEFAULT_SCHEME: &'static str = "https";
    pub const SESSION_HEADER: &'static str = "vmware-api-session-id";
}

/// Registration defaults.
pub struct RegistrationConfig;

impl RegistrationConfig {
    pub const DESCRIPTOR_EXTENSION: &'static str = "vmx";
    pub const BROWSER_SCHEME: &'static str = "vmstores:";
}

/// Username and secret for a hypervisor session.
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    secret: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Address of the hypervisor management endpoint.
///
/// A bare host name (`esxi.example.local`, `10.0.0.5:8443`) is served over
/// HTTPS; a value carrying a scheme is used as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base_url: Url,
    host: String,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(VmregError::Config {
                message: "Host address must not be empty".to_string(),
            });
        }

        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("{}://{}", NetworkConfig::DEFAULT_SCHEME, address)
        };
        let mut base_url = Url::parse(&raw)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let host = base_url
            .host_str()
            .ok_or_else(|| VmregError::Config {
                message: format!("Host address has no host component: {}", address),
            })?
            .to_string();

        Ok(Self { base_url, host })
    }

    /// Host name without scheme or port.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve an API path against the endpoint root.
    pub fn join(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url)
    }
}

/// Per-connection client options.
///
/// Certificate policy lives here instead of in any process-wide setting so two
/// runs in one process never affect each other.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
    /// Datacenter holding the datastore; discovered from the inventory when unset.
    pub datacenter: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            accept_invalid_certs: false,
            timeout: NetworkConfig::REQUEST_TIMEOUT,
            datacenter: None,
        }
    }
}

/// Configuration of a single registration run.
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub endpoint: Endpoint,
    pub credential: Credential,
    pub datastore: String,
    /// Host that receives the registered VMs; the connection host when unset.
    pub vm_host: Option<String>,
    pub connect: ConnectOptions,
    pub extension: String,
    pub dry_run: bool,
}

impl RegistrarConfig {
    pub fn new(
        server: &str,
        credential: Credential,
        datastore: impl Into<String>,
    ) -> Result<Self> {
        let datastore = datastore.into();
        if datastore.trim().is_empty() {
            return Err(VmregError::Config {
                message: "Datastore name must not be empty".to_string(),
            });
        }

        Ok(Self {
            endpoint: Endpoint::parse(server)?,
            credential,
            datastore,
            vm_host: None,
            connect: ConnectOptions::default(),
            extension: RegistrationConfig::DESCRIPTOR_EXTENSION.to_string(),
            dry_run: false,
        })
    }

    pub fn with_vm_host(mut self, vm_host: Option<String>) -> Self {
        self.vm_host = vm_host.filter(|h| !h.trim().is_empty());
        self
    }

    pub fn with_ignore_cert_errors(mut self, ignore: bool) -> Self {
        self.connect.accept_invalid_certs = ignore;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect.timeout = timeout;
        self
    }

    pub fn with_datacenter(mut self, datacenter: Option<String>) -> Self {
        self.connect.datacenter = datacenter.filter(|dc| !dc.trim().is_empty());
        self
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_ascii_lowercase();
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Host on which VMs are registered.
    ///
    /// Defaults to the connection host; the vSphere backend then falls back
    /// to the datastore datacenter's only host.
    pub fn target_host(&self) -> &str {
        self.vm_host.as_deref().unwrap_or(self.endpoint.host())
    }
}
