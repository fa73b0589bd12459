//! vSphere backend.
//!
//! Targets a vCenter Server: the Automation REST API used for sessions,
//! inventory lookups and registration is served by vCenter, not by a
//! standalone ESXi host. Descriptor files are enumerated through the
//! datastore HTTP file browser (`/folder`):
//!
//! - `POST /api/session` (basic auth) returns the session token
//! - `GET /api/vcenter/datacenter` and `GET /api/vcenter/datastore?names=..&datacenters=..`
//!   find the datastore and the datacenter it lives in
//! - `GET /folder/<dir>/?dcPath=..&dsName=..` returns an HTML listing per directory
//! - `GET /api/vcenter/host` and `GET /api/vcenter/folder`, both scoped to the
//!   datastore's datacenter, resolve placement
//! - `POST /api/vcenter/vm?action=register` registers one descriptor
//! - `DELETE /api/session` logs out

use super::{DatastoreRef, DescriptorFile, HypervisorConnector, HypervisorSession, RegisteredVm};
use crate::config::{ConnectOptions, Credential, Endpoint, NetworkConfig};
use crate::path::{browser_root_for, join_browser_path};
use crate::{Result, VmregError};
use async_trait::async_trait;
use regex::{Captures, Regex};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Deepest directory level the file browser walk descends into.
const MAX_BROWSE_DEPTH: usize = 32;

static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<a\s+[^>]*href\s*=\s*"([^"]*)"[^>]*>([^<]*)</a>"#)
        .expect("anchor regex must compile")
});

static ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)&(#x[0-9a-f]+|#[0-9]+|lt|gt|quot|apos|amp);")
        .expect("entity regex must compile")
});

/// Base used to resolve relative links found in listings.
static LISTING_BASE: LazyLock<Url> =
    LazyLock::new(|| Url::parse("http://listing.invalid/").expect("listing base must parse"));

/// Error body returned by the Automation API.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error_type: Option<String>,
    #[serde(default)]
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    default_message: String,
}

/// Entry of `GET /api/vcenter/datacenter`.
#[derive(Debug, Deserialize)]
struct DatacenterSummary {
    datacenter: String,
    name: String,
}

/// Entry of `GET /api/vcenter/datastore`.
#[derive(Debug, Deserialize)]
struct DatastoreSummary {
    datastore: String,
    name: String,
}

/// Entry of `GET /api/vcenter/host`.
#[derive(Debug, Deserialize)]
struct HostSummary {
    host: String,
    name: String,
}

/// Entry of `GET /api/vcenter/folder`.
#[derive(Debug, Deserialize)]
struct FolderSummary {
    folder: String,
}

/// Where a registered VM is placed.
#[derive(Debug, Clone, Serialize)]
struct Placement {
    host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    folder: Option<String>,
}

/// Body of `POST /api/vcenter/vm?action=register`.
#[derive(Debug, Serialize)]
struct RegisterSpec<'a> {
    datastore_path: &'a str,
    placement: Placement,
}

/// One row of a datastore browser listing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BrowserEntry {
    name: String,
    is_dir: bool,
}

/// Map a transport failure, reporting timeouts with the configured limit.
fn transport_error(err: reqwest::Error, timeout: Duration) -> VmregError {
    if err.is_timeout() {
        VmregError::Timeout(timeout)
    } else {
        VmregError::from(err)
    }
}

/// Turn a non-success response into an API error, keeping the server message.
async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(VmregError::Api {
        status: status.as_u16(),
        message: api_error_message(&body),
    })
}

fn api_error_message(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let messages: Vec<&str> = parsed
                .messages
                .iter()
                .map(|m| m.default_message.as_str())
                .filter(|m| !m.is_empty())
                .collect();
            match (parsed.error_type, messages.is_empty()) {
                (Some(kind), false) => format!("{}: {}", kind, messages.join("; ")),
                (Some(kind), true) => kind,
                (None, false) => messages.join("; "),
                (None, true) => body.trim().to_string(),
            }
        }
        Err(_) => body.trim().to_string(),
    }
}

/// Decode named and numeric character references in a single pass.
fn unescape_html(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &Captures<'_>| {
            let entity = &caps[1];
            let lower = entity.to_ascii_lowercase();
            let decoded = match lower.as_str() {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let code = match lower.strip_prefix("#x") {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => lower[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Decoded path segments below `/folder`, or `None` for links outside the browser.
fn folder_segments(url: &Url) -> Option<Vec<String>> {
    let mut segments = url.path_segments()?;
    if segments.next()? != "folder" {
        return None;
    }
    segments
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).ok().map(|d| d.into_owned()))
        .collect()
}

/// Parse a `/folder` HTML listing of `current_dir` into its child entries.
///
/// Only links that carry a `dsName` and point one level below `current_dir`
/// are children; parent and datacenter links are dropped. Directories are
/// recognised by a trailing slash on the link or its text.
fn parse_listing(html: &str, current_dir: &str) -> Vec<BrowserEntry> {
    let current: Vec<&str> = current_dir.split('/').filter(|p| !p.is_empty()).collect();

    ANCHOR
        .captures_iter(html)
        .filter_map(|caps| {
            let href = unescape_html(&caps[1]);
            let text = unescape_html(caps[2].trim());
            let url = LISTING_BASE.join(&href).ok()?;
            if !url.query_pairs().any(|(key, _)| key == "dsName") {
                return None;
            }

            let segments = folder_segments(&url)?;
            if segments.len() != current.len() + 1
                || segments.iter().zip(&current).any(|(a, b)| a != b)
            {
                return None;
            }

            let name = segments.last()?.clone();
            if name == "." || name == ".." {
                return None;
            }
            let is_dir = url.path().ends_with('/') || text.ends_with('/');
            Some(BrowserEntry { name, is_dir })
        })
        .collect()
}

fn has_extension(name: &str, extension: &str) -> bool {
    name.rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

/// Connector for vCenter servers.
#[derive(Debug, Default, Clone)]
pub struct VsphereConnector;

impl VsphereConnector {
    pub fn new() -> Self {
        Self
    }

    fn build_client(options: &ConnectOptions) -> Result<Client> {
        if options.accept_invalid_certs {
            warn!("TLS certificate validation is disabled for this connection");
        }

        Client::builder()
            .timeout(options.timeout)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(|e| VmregError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })
    }
}

#[async_trait]
impl HypervisorConnector for VsphereConnector {
    type Session = VsphereSession;

    async fn connect(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        options: &ConnectOptions,
    ) -> Result<VsphereSession> {
        let client = Self::build_client(options)?;
        let url = endpoint.join("api/session")?;
        debug!("Creating session at {}", url);

        let response = client
            .post(url)
            .basic_auth(&credential.username, Some(credential.secret()))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    return VmregError::Timeout(options.timeout);
                }
                VmregError::Network {
                    message: format!("Failed to connect to {}: {}", endpoint, e),
                    cause: std::error::Error::source(&e).map(|s| s.to_string()),
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(VmregError::Authentication {
                host: endpoint.host().to_string(),
                user: credential.username.clone(),
                message: api_error_message(&body),
            });
        }

        let token: String = check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(e, options.timeout))?;
        info!(
            "Connected to {} as {}",
            endpoint.host(),
            credential.username
        );

        Ok(VsphereSession {
            client,
            endpoint: endpoint.clone(),
            token,
            datacenter: options.datacenter.clone(),
            timeout: options.timeout,
            placements: Mutex::new(HashMap::new()),
        })
    }
}

/// An authenticated vCenter session.
pub struct VsphereSession {
    client: Client,
    endpoint: Endpoint,
    token: String,
    /// Datacenter to search; every datacenter when unset.
    datacenter: Option<String>,
    timeout: Duration,
    /// Placement per (datacenter, target host), resolved on first registration.
    placements: Mutex<HashMap<(String, String), Placement>>,
}

impl std::fmt::Debug for VsphereSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereSession")
            .field("endpoint", &self.endpoint)
            .field("datacenter", &self.datacenter)
            .finish_non_exhaustive()
    }
}

impl VsphereSession {
    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(NetworkConfig::SESSION_HEADER, &self.token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self
            .authed(request)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        check_response(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T> {
        debug!("GET {}", url);
        self.send(self.client.get(url))
            .await?
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))
    }

    async fn datacenters(&self) -> Result<Vec<DatacenterSummary>> {
        let mut url = self.endpoint.join("api/vcenter/datacenter")?;
        if let Some(name) = &self.datacenter {
            url.query_pairs_mut().append_pair("names", name);
        }
        let datacenters: Vec<DatacenterSummary> = self.get_json(url).await?;

        match &self.datacenter {
            Some(name) => {
                let matching: Vec<DatacenterSummary> =
                    datacenters.into_iter().filter(|dc| &dc.name == name).collect();
                if matching.is_empty() {
                    return Err(VmregError::DatacenterNotFound { name: name.clone() });
                }
                Ok(matching)
            }
            None => Ok(datacenters),
        }
    }

    fn folder_url(&self, datastore: &DatastoreRef, relative_dir: &str) -> Result<Url> {
        let mut url = self.endpoint.join("folder")?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| VmregError::Config {
                message: format!("Endpoint cannot carry a path: {}", self.endpoint),
            })?;
            segments.pop_if_empty();
            for part in relative_dir.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
            segments.push("");
        }
        url.query_pairs_mut()
            .append_pair("dcPath", &datastore.datacenter)
            .append_pair("dsName", &datastore.name);
        Ok(url)
    }

    async fn list_directory(
        &self,
        datastore: &DatastoreRef,
        relative_dir: &str,
    ) -> Result<Vec<BrowserEntry>> {
        let url = self.folder_url(datastore, relative_dir)?;
        debug!("Browsing {}", url);
        let html = self
            .send(self.client.get(url))
            .await?
            .text()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        Ok(parse_listing(&html, relative_dir))
    }

    async fn hosts(&self, datacenter_id: &str, name: Option<&str>) -> Result<Vec<HostSummary>> {
        let mut url = self.endpoint.join("api/vcenter/host")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("datacenters", datacenter_id);
            if let Some(name) = name {
                query.append_pair("names", name);
            }
        }
        self.get_json(url).await
    }

    /// Resolve the ESXi host and VM folder for registrations on `target_host`.
    ///
    /// When the target is the vCenter itself (the default), the datacenter's
    /// only host is used; a datacenter with several hosts needs an explicit
    /// target.
    async fn placement_for(
        &self,
        datastore: &DatastoreRef,
        target_host: &str,
    ) -> Result<Placement> {
        let key = (datastore.datacenter_id.clone(), target_host.to_string());
        let cached = self
            .placements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned();
        if let Some(placement) = cached {
            return Ok(placement);
        }

        let named = self
            .hosts(&datastore.datacenter_id, Some(target_host))
            .await?
            .into_iter()
            .find(|h| h.name.eq_ignore_ascii_case(target_host));
        let host = match named {
            Some(host) => host.host,
            None if target_host.eq_ignore_ascii_case(self.endpoint.host()) => {
                let mut hosts = self.hosts(&datastore.datacenter_id, None).await?;
                if hosts.len() != 1 {
                    return Err(VmregError::HostNotFound {
                        name: format!(
                            "{} ({} hosts in datacenter {}, pick one explicitly)",
                            target_host,
                            hosts.len(),
                            datastore.datacenter
                        ),
                    });
                }
                hosts.remove(0).host
            }
            None => {
                return Err(VmregError::HostNotFound {
                    name: target_host.to_string(),
                })
            }
        };

        let mut url = self.endpoint.join("api/vcenter/folder")?;
        url.query_pairs_mut()
            .append_pair("type", "VIRTUAL_MACHINE")
            .append_pair("datacenters", &datastore.datacenter_id);
        let folders: Vec<FolderSummary> = self.get_json(url).await?;
        let folder = folders.into_iter().next().map(|f| f.folder);

        debug!(
            "Placement for {} in {}: host={} folder={:?}",
            target_host, datastore.datacenter, host, folder
        );
        let placement = Placement { host, folder };
        self.placements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, placement.clone());
        Ok(placement)
    }
}

#[async_trait]
impl HypervisorSession for VsphereSession {
    async fn find_datastore(&self, name: &str) -> Result<DatastoreRef> {
        for datacenter in self.datacenters().await? {
            let mut url = self.endpoint.join("api/vcenter/datastore")?;
            url.query_pairs_mut()
                .append_pair("names", name)
                .append_pair("datacenters", &datacenter.datacenter);
            let datastores: Vec<DatastoreSummary> = self.get_json(url).await?;

            if let Some(found) = datastores.into_iter().find(|ds| ds.name == name) {
                info!(
                    "Resolved datastore {} ({}) in datacenter {}",
                    found.name, found.datastore, datacenter.name
                );
                return Ok(DatastoreRef {
                    browser_root: browser_root_for(self.endpoint.host(), &found.name),
                    name: found.name,
                    id: found.datastore,
                    datacenter: datacenter.name,
                    datacenter_id: datacenter.datacenter,
                });
            }
        }

        Err(VmregError::DatastoreNotFound {
            name: name.to_string(),
        })
    }

    async fn list_descriptor_files(
        &self,
        datastore: &DatastoreRef,
        extension: &str,
    ) -> Result<Vec<DescriptorFile>> {
        let mut files = Vec::new();
        let mut pending = VecDeque::from([(String::new(), 0usize)]);

        while let Some((dir, depth)) = pending.pop_front() {
            for entry in self.list_directory(datastore, &dir).await? {
                let relative = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };

                if entry.is_dir {
                    if depth + 1 < MAX_BROWSE_DEPTH {
                        pending.push_back((relative, depth + 1));
                    } else {
                        warn!("Not descending into {}: too deeply nested", relative);
                    }
                } else if has_extension(&entry.name, extension) {
                    files.push(DescriptorFile::new(join_browser_path(
                        &datastore.browser_root,
                        &relative,
                    )));
                }
            }
        }

        debug!(
            "Found {} .{} files on {}",
            files.len(),
            extension,
            datastore.name
        );
        Ok(files)
    }

    async fn register_vm(
        &self,
        datastore: &DatastoreRef,
        datastore_path: &str,
        target_host: &str,
    ) -> Result<RegisteredVm> {
        let placement = self.placement_for(datastore, target_host).await?;
        let mut url = self.endpoint.join("api/vcenter/vm")?;
        url.query_pairs_mut().append_pair("action", "register");

        let spec = RegisterSpec {
            datastore_path,
            placement,
        };
        let response = self
            .send(self.client.post(url).json(&spec))
            .await
            .map_err(|e| match e {
                VmregError::Api { status, message } => VmregError::Registration {
                    path: datastore_path.to_string(),
                    message: format!("{} ({})", message, status),
                },
                other => other,
            })?;

        let id: String = response
            .json()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;
        Ok(RegisteredVm {
            id,
            datastore_path: datastore_path.to_string(),
        })
    }

    async fn disconnect(&self) -> Result<()> {
        let url = self.endpoint.join("api/session")?;
        self.send(self.client.delete(url)).await?;
        info!("Disconnected from {}", self.endpoint.host());
        Ok(())
    }
}
