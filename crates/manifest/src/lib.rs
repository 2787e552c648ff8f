//! kres manifest resolver: turns a manifest source into the document submitted to the cluster.
//!
//! Inline manifests get a name (carried over from the previous physical identity, or a
//! generated one seeded by the stack name); every document gets the idempotency annotation.
//! The resolved document is written to a well-known path that kubectl commands reference.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kres_core::{CloudError, ManifestSource, ReconcileError, Settings, TOKEN_ANNOTATION};
use metrics::{counter, histogram};
use regex::Regex;
use serde_json::{Map, Value as Json};
use tracing::{debug, info};

mod timestamps;

pub use timestamps::{normalize_plain_timestamps, to_rfc3339_utc};

/// Size bounds on manifest text and its parsed tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ManifestLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self { max_bytes: settings.max_manifest_bytes, max_nodes: settings.max_manifest_nodes }
    }
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Fetches `bucket/key` objects for `store://` (and `s3://`) manifest URLs.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<String, CloudError>;
}

/// `(bucket, key)` when `url` uses an object-store scheme.
pub fn object_store_location(url: &str) -> Option<(String, String)> {
    let re = Regex::new(r"^(?:store|s3)://([^/]+)/(.+)$").ok()?;
    let caps = re.captures(url)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

/// A resolved manifest ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDocument(Json);

impl ObjectDocument {
    pub fn as_json(&self) -> &Json {
        &self.0
    }

    pub fn into_json(self) -> Json {
        self.0
    }

    pub fn api_version(&self) -> &str {
        self.0.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.0.get("kind").and_then(|v| v.as_str()).unwrap_or_default()
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.0.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> Option<&str> {
        self.meta_str("name")
    }

    pub fn generate_name(&self) -> Option<&str> {
        self.meta_str("generateName")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace")
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }
}

/// Parse YAML (or JSON) manifest text under the default limits.
pub fn parse_document(text: &str) -> Result<ObjectDocument, ReconcileError> {
    parse_document_with(text, &ManifestLimits::default())
}

/// Parse YAML (or JSON) manifest text into a document with `apiVersion` and `kind`.
///
/// Plain YAML timestamp scalars come out as RFC3339 UTC strings; quoted strings are kept verbatim.
pub fn parse_document_with(text: &str, limits: &ManifestLimits) -> Result<ObjectDocument, ReconcileError> {
    if text.len() > limits.max_bytes {
        return Err(ReconcileError::validation(format!("manifest too large (>{} bytes)", limits.max_bytes)));
    }
    let val: serde_yaml::Value =
        serde_yaml::from_str(text).map_err(|e| ReconcileError::validation(format!("parsing manifest: {}", e)))?;
    let mut json = serde_json::to_value(val).map_err(|e| ReconcileError::serialization(format!("converting manifest to JSON: {}", e)))?;
    if !json.is_object() {
        return Err(ReconcileError::validation("manifest must be a mapping"));
    }
    if json_node_budget_exceeded(&json, limits.max_nodes) {
        return Err(ReconcileError::validation(format!("manifest too complex (>{} nodes)", limits.max_nodes)));
    }
    normalize_plain_timestamps(text, &mut json);
    if json.get("apiVersion").and_then(|v| v.as_str()).is_none() {
        return Err(ReconcileError::validation("manifest missing apiVersion"));
    }
    if json.get("kind").and_then(|v| v.as_str()).is_none() {
        return Err(ReconcileError::validation("manifest missing kind"));
    }
    Ok(ObjectDocument(json))
}

fn metadata_mut(doc: &mut Json) -> Option<&mut Map<String, Json>> {
    let meta = doc.as_object_mut()?.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(Map::new());
    }
    meta.as_object_mut()
}

/// Give an unnamed document a name: the tail of the previous physical identity when there is
/// one, otherwise a `cfn-<stack>-` generated-name prefix.
pub fn apply_naming(doc: &mut ObjectDocument, previous_identity: Option<&str>, stack_name: &str) {
    if doc.name().is_some() || doc.generate_name().is_some() {
        return;
    }
    let Some(meta) = metadata_mut(&mut doc.0) else { return };
    match previous_identity.and_then(|p| p.rsplit('/').next()).filter(|s| !s.is_empty()) {
        Some(tail) => {
            meta.insert("name".into(), Json::String(tail.to_string()));
        }
        None => {
            meta.insert("generateName".into(), Json::String(format!("cfn-{}-", stack_name.to_lowercase())));
        }
    }
}

/// Stamp the idempotency annotation, creating `metadata`/`annotations` as needed.
pub fn stamp_token(doc: &mut ObjectDocument, client_token: &str) {
    let Some(meta) = metadata_mut(&mut doc.0) else { return };
    let ann = meta.entry("annotations").or_insert_with(|| Json::Object(Map::new()));
    if !ann.is_object() {
        *ann = Json::Object(Map::new());
    }
    if let Json::Object(a) = ann {
        a.insert(TOKEN_ANNOTATION.into(), Json::String(client_token.to_string()));
    }
}

/// Write the document as JSON to `path`.
pub async fn write_manifest(doc: &ObjectDocument, path: &Path) -> Result<(), ReconcileError> {
    let bytes = serde_json::to_vec(&doc.0)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| ReconcileError::internal(format!("writing manifest to {}: {}", path.display(), e)))
}

/// Inputs of one resolution.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub source: &'a ManifestSource,
    /// Self-link (or any `/`-separated identity) of the object this manifest replaces.
    pub previous_identity: Option<&'a str>,
    /// Logical stack/request name seeding generated names.
    pub stack_name: &'a str,
    pub client_token: &'a str,
}

pub struct ManifestResolver {
    http: reqwest::Client,
    store: Option<Arc<dyn ObjectStore>>,
    manifest_path: PathBuf,
    limits: ManifestLimits,
}

impl ManifestResolver {
    pub fn new(manifest_path: impl Into<PathBuf>) -> Self {
        Self { http: reqwest::Client::new(), store: None, manifest_path: manifest_path.into(), limits: ManifestLimits::default() }
    }

    pub fn with_limits(mut self, limits: ManifestLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub async fn resolve(&self, req: ResolveRequest<'_>) -> Result<ObjectDocument, ReconcileError> {
        let mut doc = match req.source {
            ManifestSource::Inline(text) => {
                let mut doc = parse_document_with(text, &self.limits)?;
                apply_naming(&mut doc, req.previous_identity, req.stack_name);
                doc
            }
            ManifestSource::RemoteUrl(url) => parse_document_with(&self.fetch(url).await?, &self.limits)?,
        };
        stamp_token(&mut doc, req.client_token);
        write_manifest(&doc, &self.manifest_path).await?;
        debug!(kind = %doc.kind(), name = ?doc.name(), generate_name = ?doc.generate_name(), path = %self.manifest_path.display(), "manifest: resolved");
        Ok(doc)
    }

    /// Fetch remote manifest text from the object store or over HTTP(S).
    pub async fn fetch(&self, url: &str) -> Result<String, ReconcileError> {
        let t0 = Instant::now();
        let fetch_err = |cause: String| ReconcileError::Fetch { url: url.to_string(), cause };
        let text = if let Some((bucket, key)) = object_store_location(url) {
            counter!("manifest_fetch_total", 1u64, "scheme" => "object_store");
            let store = self.store.as_ref().ok_or_else(|| fetch_err("no object store configured".into()))?;
            store.get_object(&bucket, &key).await.map_err(|e| fetch_err(e.to_string()))?
        } else {
            counter!("manifest_fetch_total", 1u64, "scheme" => "http");
            let resp = self.http.get(url).send().await.map_err(|e| fetch_err(e.to_string()))?;
            let status = resp.status();
            if !status.is_success() {
                return Err(fetch_err(format!("[{}] {}", status.as_u16(), status.canonical_reason().unwrap_or("unknown"))));
            }
            resp.text().await.map_err(|e| fetch_err(e.to_string()))?
        };
        histogram!("manifest_fetch_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(url = %url, bytes = text.len(), "manifest: fetched");
        Ok(text)
    }
}
