//! Integration tests for the vSphere backend.
//!
//! A small axum server stands in for vCenter: it serves the Automation API
//! endpoints the backend uses and a `/folder` HTML browser over a fixed tree.
//! The inventory has two datacenters; `Datastore1` lives in `DC-West`, which
//! holds one ESXi host and its own VM folder.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vmreg_core::{
    BatchRegistrar, ConnectOptions, Credential, Endpoint, HypervisorConnector, HypervisorSession,
    RegistrarConfig, RegistrationOutcome, SilentReporter, VmregError, VsphereConnector,
};

const TOKEN: &str = "session-token-1";
/// `root:secret`
const BASIC_AUTH: &str = "Basic cm9vdDpzZWNyZXQ=";

#[derive(Default)]
struct FakeVsphere {
    logouts: AtomicUsize,
    registrations: Mutex<Vec<Value>>,
    browsed: Mutex<Vec<String>>,
}

type Shared = Arc<FakeVsphere>;

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("vmware-api-session-id")
        .and_then(|v| v.to_str().ok())
        == Some(TOKEN)
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error_type": "UNAUTHENTICATED", "messages": []})),
    )
        .into_response()
}

async fn create_session(headers: HeaderMap) -> Response {
    let auth = headers.get("authorization").and_then(|v| v.to_str().ok());
    if auth != Some(BASIC_AUTH) {
        return unauthenticated();
    }
    Json(json!(TOKEN)).into_response()
}

async fn delete_session(State(state): State<Shared>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    state.logouts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK.into_response()
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str)
}

async fn list_datacenters(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    let all = [("datacenter-1", "DC-East"), ("datacenter-2", "DC-West")];
    let body: Vec<Value> = all
        .iter()
        .filter(|(_, name)| param(&params, "names").map_or(true, |n| n == *name))
        .map(|(id, name)| json!({"datacenter": id, "name": name}))
        .collect();
    Json(body).into_response()
}

async fn list_datastores(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    let body = match (param(&params, "names"), param(&params, "datacenters")) {
        (Some("Datastore1"), Some("datacenter-2")) => json!([
            {"datastore": "datastore-11", "name": "Datastore1", "type": "VMFS"}
        ]),
        _ => json!([]),
    };
    Json(body).into_response()
}

async fn list_hosts(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    let hosts = match param(&params, "datacenters") {
        Some("datacenter-1") => vec![("host-5", "esx-east-01")],
        Some("datacenter-2") => vec![("host-10", "esx-target")],
        _ => vec![("host-5", "esx-east-01"), ("host-10", "esx-target")],
    };
    let body: Vec<Value> = hosts
        .into_iter()
        .filter(|(_, name)| param(&params, "names").map_or(true, |n| n == *name))
        .map(|(id, name)| json!({"host": id, "name": name, "connection_state": "CONNECTED"}))
        .collect();
    Json(body).into_response()
}

async fn list_folders(headers: HeaderMap, Query(params): Query<HashMap<String, String>>) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    assert_eq!(param(&params, "type"), Some("VIRTUAL_MACHINE"));
    let east = json!({"folder": "group-v1", "name": "vm", "type": "VIRTUAL_MACHINE"});
    let west = json!({"folder": "group-v3", "name": "vm", "type": "VIRTUAL_MACHINE"});
    let body = match param(&params, "datacenters") {
        Some("datacenter-1") => json!([east]),
        Some("datacenter-2") => json!([west]),
        _ => json!([east, west]),
    };
    Json(body).into_response()
}

async fn register_vm(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    assert_eq!(params.get("action").map(String::as_str), Some("register"));

    let path = body["datastore_path"].as_str().unwrap_or_default().to_string();
    if path.contains("slow") {
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    if path.contains("broken") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error_type": "INVALID_ARGUMENT",
                "messages": [{"id": "vmx", "default_message": "Invalid configuration for device '0'."}]
            })),
        )
            .into_response();
    }

    let mut registrations = state.registrations.lock().unwrap();
    registrations.push(body);
    Json(json!(format!("vm-{}", registrations.len()))).into_response()
}

fn anchor(relative: &str, label: &str) -> String {
    format!(
        r#"<tr><td><a href="/folder/{}?dcPath=DC-West&amp;dsName=Datastore1">{}</a></td></tr>"#,
        relative, label
    )
}

fn listing(dir: &str) -> Option<String> {
    let rows: Vec<String> = match dir {
        "" => vec![
            r#"<tr><td><a href="/folder?dcPath=DC-West">Parent Datacenter</a></td></tr>"#
                .to_string(),
            anchor("Broken/", "Broken/"),
            anchor("VM1/", "VM1/"),
            anchor("Web/", "Web/"),
            anchor("readme.txt", "readme.txt"),
        ],
        "Broken" => vec![anchor("Broken/broken.vmx", "broken.vmx")],
        "VM1" => vec![
            anchor("VM1/VM1.vmx", "VM1.vmx"),
            anchor("VM1/VM1.vmdk", "VM1.vmdk"),
            anchor("VM1/VM1.vmx.lck", "VM1.vmx.lck"),
        ],
        "Web" => vec![anchor("Web/web-01/", "web-01/")],
        "Web/web-01" => vec![anchor("Web/web-01/web-01.VMX", "web-01.VMX")],
        _ => return None,
    };
    Some(format!(
        "<html><body><table>{}</table></body></html>",
        rows.join("\n")
    ))
}

async fn browse(
    state: Shared,
    headers: HeaderMap,
    params: HashMap<String, String>,
    dir: String,
) -> Response {
    if !authorized(&headers) {
        return unauthenticated();
    }
    assert_eq!(param(&params, "dcPath"), Some("DC-West"));
    if param(&params, "dsName") != Some("Datastore1") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let dir = dir.trim_matches('/').to_string();
    state.browsed.lock().unwrap().push(dir.clone());
    match listing(&dir) {
        Some(html) => Html(html).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn browse_root(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    browse(state, headers, params, String::new()).await
}

async fn browse_dir(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(dir): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    browse(state, headers, params, dir).await
}

async fn start_fake_vsphere() -> (SocketAddr, Shared) {
    let state: Shared = Arc::new(FakeVsphere::default());
    let app = Router::new()
        .route("/api/session", post(create_session).delete(delete_session))
        .route("/api/vcenter/datacenter", get(list_datacenters))
        .route("/api/vcenter/datastore", get(list_datastores))
        .route("/api/vcenter/host", get(list_hosts))
        .route("/api/vcenter/folder", get(list_folders))
        .route("/api/vcenter/vm", post(register_vm))
        .route("/folder/", get(browse_root))
        .route("/folder/*dir", get(browse_dir))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind fake server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr, options: &ConnectOptions) -> vmreg_core::VsphereSession {
    let endpoint = Endpoint::parse(&format!("http://{}", addr)).unwrap();
    VsphereConnector::new()
        .connect(&endpoint, &Credential::new("root", "secret"), options)
        .await
        .unwrap()
}

fn config(addr: SocketAddr, secret: &str, datastore: &str) -> RegistrarConfig {
    RegistrarConfig::new(
        &format!("http://{}", addr),
        Credential::new("root", secret),
        datastore,
    )
    .unwrap()
}

#[tokio::test]
async fn test_lists_descriptor_files_recursively() {
    let (addr, state) = start_fake_vsphere().await;
    let session = connect(addr, &ConnectOptions::default()).await;

    let datastore = session.find_datastore("Datastore1").await.unwrap();
    assert_eq!(datastore.id, "datastore-11");
    assert_eq!(datastore.datacenter, "DC-West");
    assert_eq!(datastore.datacenter_id, "datacenter-2");
    assert_eq!(datastore.browser_root, r"vmstores:\127.0.0.1\Datastore1");

    let files = session
        .list_descriptor_files(&datastore, "vmx")
        .await
        .unwrap();
    let paths: Vec<&str> = files.iter().map(|f| f.full_path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            r"vmstores:\127.0.0.1\Datastore1\Broken\broken.vmx",
            r"vmstores:\127.0.0.1\Datastore1\VM1\VM1.vmx",
            r"vmstores:\127.0.0.1\Datastore1\Web\web-01\web-01.VMX",
        ]
    );
    assert_eq!(
        *state.browsed.lock().unwrap(),
        vec!["", "Broken", "VM1", "Web", "Web/web-01"]
    );

    session.disconnect().await.unwrap();
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_batch_run_against_fake_host() {
    let (addr, state) = start_fake_vsphere().await;
    let config = config(addr, "secret", "Datastore1").with_vm_host(Some("esx-target".into()));
    let registrar = BatchRegistrar::new(VsphereConnector::new(), config);

    let report = registrar.run(&mut SilentReporter).await.unwrap();

    assert_eq!(report.total(), 3);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert_eq!(report.target_host, "esx-target");

    let failure = report.failures().next().unwrap();
    assert_eq!(failure.file.name, "broken.vmx");

    let registrations = state.registrations.lock().unwrap().clone();
    assert_eq!(
        registrations,
        vec![
            json!({
                "datastore_path": "[Datastore1] VM1/VM1.vmx",
                "placement": {"host": "host-10", "folder": "group-v3"}
            }),
            json!({
                "datastore_path": "[Datastore1] Web/web-01/web-01.VMX",
                "placement": {"host": "host-10", "folder": "group-v3"}
            }),
        ]
    );
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_wrong_password_is_fatal() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "wrong", "Datastore1"),
    );

    let err = registrar.run(&mut SilentReporter).await.unwrap_err();

    assert!(matches!(err, VmregError::Authentication { .. }));
    assert!(err.is_fatal());
    assert_eq!(state.logouts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_datastore_disconnects_once() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "NoSuchStore"),
    );

    let err = registrar.run(&mut SilentReporter).await.unwrap_err();

    assert!(matches!(err, VmregError::DatastoreNotFound { ref name } if name == "NoSuchStore"));
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
    assert!(state.registrations.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_only_browses() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "Datastore1").with_dry_run(true),
    );

    let report = registrar.run(&mut SilentReporter).await.unwrap();

    assert_eq!(report.total(), 3);
    assert_eq!(report.failed(), 0);
    assert!(state.registrations.lock().unwrap().is_empty());
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_placement_stays_in_datastore_datacenter() {
    let (addr, state) = start_fake_vsphere().await;
    // No --vm-host: the target is the vCenter address, which is not an ESXi
    // host, so the datastore datacenter's only host is used.
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "Datastore1").with_datacenter(Some("DC-West".into())),
    );

    let report = registrar.run(&mut SilentReporter).await.unwrap();

    assert_eq!(report.succeeded(), 2);
    let registrations = state.registrations.lock().unwrap().clone();
    assert_eq!(registrations.len(), 2);
    for registration in registrations {
        assert_eq!(
            registration["placement"],
            json!({"host": "host-10", "folder": "group-v3"})
        );
    }
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_host_from_other_datacenter_fails_per_file() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "Datastore1").with_vm_host(Some("esx-east-01".into())),
    );

    let report = registrar.run(&mut SilentReporter).await.unwrap();

    assert_eq!(report.total(), 3);
    assert_eq!(report.failed(), 3);
    let failure = report.failures().next().unwrap();
    assert_eq!(
        failure.outcome,
        RegistrationOutcome::Failed {
            message: "Host not found: esx-east-01".into()
        }
    );
    assert!(state.registrations.lock().unwrap().is_empty());
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_datacenter_is_fatal() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "Datastore1").with_datacenter(Some("DC-North".into())),
    );

    let err = registrar.run(&mut SilentReporter).await.unwrap_err();

    assert!(matches!(err, VmregError::DatacenterNotFound { ref name } if name == "DC-North"));
    assert!(err.is_fatal());
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_datastore_is_searched_only_in_given_datacenter() {
    let (addr, state) = start_fake_vsphere().await;
    let registrar = BatchRegistrar::new(
        VsphereConnector::new(),
        config(addr, "secret", "Datastore1").with_datacenter(Some("DC-East".into())),
    );

    let err = registrar.run(&mut SilentReporter).await.unwrap_err();

    assert!(matches!(err, VmregError::DatastoreNotFound { ref name } if name == "Datastore1"));
    assert!(state.browsed.lock().unwrap().is_empty());
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_timeout_reports_configured_limit() {
    let (addr, state) = start_fake_vsphere().await;
    let options = ConnectOptions {
        timeout: Duration::from_secs(1),
        ..ConnectOptions::default()
    };
    let session = connect(addr, &options).await;
    let datastore = session.find_datastore("Datastore1").await.unwrap();

    let err = session
        .register_vm(&datastore, "[Datastore1] slow/slow.vmx", "esx-target")
        .await
        .unwrap_err();

    assert!(matches!(err, VmregError::Timeout(limit) if limit == Duration::from_secs(1)));
    assert_eq!(err.to_string(), "Request timeout after 1s");
    assert!(state.registrations.lock().unwrap().is_empty());

    session.disconnect().await.unwrap();
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}
