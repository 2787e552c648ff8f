//! kres kubehub: kubectl command lines and the object model of their JSON output.
//!
//! Nothing here talks to a cluster. Commands are built as strings for the executor, and
//! their output is decoded into `kube::core` / `k8s-openapi` types.

#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::path::Path;

use k8s_openapi::api::batch::v1::Job;
use kres_core::{ReconcileError, TrackedObjectReference};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::debug;

fn q(s: &str) -> Cow<'_, str> {
    shell_escape::escape(Cow::Borrowed(s))
}

/// `(group, version)` of an `apiVersion`; the core group is empty.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

pub fn api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = split_api_version(api_version);
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

/// Fully qualified kubectl resource type, e.g. `job.v1.batch`, or just the kind for core kinds.
///
/// The lowercased kind is the singular resource name, which kubectl maps through discovery,
/// so custom resources with irregular plurals resolve as well.
pub fn resource_type(api_version: &str, kind: &str) -> String {
    let (group, version) = split_api_version(api_version);
    let singular = kind.to_lowercase();
    if group.is_empty() {
        singular
    } else {
        format!("{}.{}.{}", singular, version, group)
    }
}

/// API path of an object, as the control plane used to report in `metadata.selfLink`.
pub fn self_link(api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> String {
    let ar = api_resource(api_version, kind);
    let base = if ar.group.is_empty() {
        format!("/api/{}", ar.version)
    } else {
        format!("/apis/{}/{}", ar.group, ar.version)
    };
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{}/namespaces/{}/{}/{}", base, ns, ar.plural, name),
        None => format!("{}/{}/{}", base, ar.plural, name),
    }
}

/// Parts of an API path: `(resource type, namespace, name)`, the inverse of [`self_link`].
pub fn link_target(self_link: &str) -> Option<(String, Option<String>, String)> {
    let segs: Vec<&str> = self_link.trim_matches('/').split('/').collect();
    let (group, rest) = match segs.as_slice() {
        ["api", rest @ ..] => ("", rest),
        ["apis", group, rest @ ..] => (*group, rest),
        _ => return None,
    };
    let (version, namespace, plural, name) = match rest {
        [version, "namespaces", ns, plural, name] => (*version, Some(ns.to_string()), *plural, *name),
        [version, plural, name] => (*version, None, *plural, *name),
        _ => return None,
    };
    let rt = if group.is_empty() { plural.to_string() } else { format!("{}.{}.{}", plural, version, group) };
    Some((rt, namespace, name.to_string()))
}

/// Batch workloads are polled until done; cron schedules never finish.
pub fn is_stabilizable_link(self_link: &str) -> bool {
    self_link.starts_with("/apis/batch") && !self_link.contains("cronjobs")
}

pub fn create_cmd(manifest: &Path, namespace: &str) -> String {
    format!("kubectl create --save-config -o json -f {} -n {}", q(&manifest.to_string_lossy()), q(namespace))
}

pub fn apply_cmd(manifest: &Path, namespace: &str) -> String {
    format!("kubectl apply -o json -f {} -n {}", q(&manifest.to_string_lossy()), q(namespace))
}

pub fn get_cmd(resource_type: &str, name: &str, namespace: &str) -> String {
    format!("kubectl get {}/{} -o json -n {}", q(resource_type), q(name), q(namespace))
}

/// Paginated listing of every object of one type in a namespace.
pub fn list_cmd(resource_type: &str, namespace: &str, chunk_size: usize) -> String {
    format!("kubectl get {} -o json -n {} --chunk-size={}", q(resource_type), q(namespace), chunk_size)
}

pub fn delete_cmd(resource_type: &str, name: &str, namespace: &str) -> String {
    format!("kubectl delete {}/{} -n {}", q(resource_type), q(name), q(namespace))
}

/// Evaluate `json_path` against `target` (any kubectl object argument, e.g. `svc/web`).
pub fn jsonpath_cmd(target: &str, json_path: &str, namespace: &str) -> String {
    format!("kubectl get {} -o {} --namespace {}", q(target), q(&format!("jsonpath={}", json_path)), q(namespace))
}

pub fn update_kubeconfig_cmd(cluster: &str, kubeconfig: &Path) -> String {
    format!(
        "aws eks update-kubeconfig --name {c} --alias {c} --kubeconfig {k}",
        c = q(cluster),
        k = q(&kubeconfig.to_string_lossy())
    )
}

pub fn use_context_cmd(cluster: &str) -> String {
    format!("kubectl config use-context {}", q(cluster))
}

fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Decode one object printed by `kubectl ... -o json`.
pub fn parse_object(output: &str) -> Result<DynamicObject, ReconcileError> {
    let mut raw: Json = serde_json::from_str(output.trim())
        .map_err(|e| ReconcileError::serialization(format!("decoding kubectl output: {}", e)))?;
    strip_managed_fields(&mut raw);
    serde_json::from_value(raw).map_err(|e| ReconcileError::serialization(format!("decoding object: {}", e)))
}

/// Reference fields of a live object; `selfLink` is rebuilt when the server omits it.
pub fn tracked_reference(obj: &DynamicObject) -> TrackedObjectReference {
    let (api_version, kind) = obj
        .types
        .as_ref()
        .map(|t| (t.api_version.clone(), t.kind.clone()))
        .unwrap_or_default();
    let meta = &obj.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let link = meta
        .self_link
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| self_link(&api_version, &kind, meta.namespace.as_deref(), &name));
    TrackedObjectReference {
        uid: meta.uid.clone(),
        self_link: link,
        resource_version: meta.resource_version.clone(),
        namespace: meta.namespace.clone(),
        name,
        api_version,
        kind,
    }
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    items: Vec<Json>,
}

/// First object of a `kubectl get -o json` listing whose annotation `key` equals `value`.
pub fn find_annotated(list_output: &str, key: &str, value: &str) -> Result<Option<DynamicObject>, ReconcileError> {
    let list: ItemList = serde_json::from_str(list_output.trim())
        .map_err(|e| ReconcileError::serialization(format!("decoding object list: {}", e)))?;
    debug!(items = list.items.len(), annotation = key, "kubehub: scanning list");
    for mut item in list.items {
        let hit = item
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
            == Some(value);
        if hit {
            strip_managed_fields(&mut item);
            let obj = serde_json::from_value(item).map_err(|e| ReconcileError::serialization(format!("decoding object: {}", e)))?;
            return Ok(Some(obj));
        }
    }
    Ok(None)
}

/// Terminal state of a batch Job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobProgress {
    Complete,
    Failed { reason: String, message: String },
    Running,
}

/// Inspect the conditions of a Job printed by `kubectl get ... -o json`.
pub fn job_progress(output: &str) -> Result<JobProgress, ReconcileError> {
    let job: Job = serde_json::from_str(output.trim())
        .map_err(|e| ReconcileError::serialization(format!("decoding job: {}", e)))?;
    let conditions = job.status.as_ref().and_then(|s| s.conditions.as_ref());
    let mut progress = JobProgress::Running;
    for c in conditions.into_iter().flatten() {
        if c.status != "True" {
            continue;
        }
        match c.type_.as_str() {
            "Complete" => {
                progress = JobProgress::Complete;
                break;
            }
            "Failed" => {
                progress = JobProgress::Failed {
                    reason: c.reason.clone().unwrap_or_default(),
                    message: c.message.clone().unwrap_or_default(),
                };
                break;
            }
            _ => {}
        }
    }
    Ok(progress)
}
