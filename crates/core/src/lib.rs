//! kres core types: resource models, invocation contract, callback context and errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod context;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod settings;

pub use context::{CallbackContext, ReconcileState};
pub use error::{CloudError, CommandError, ErrorCode, IdentityError, ReconcileError};
pub use identity::ResourceIdentity;
pub use proxy::{ProxyErrorEnvelope, ProxyRequest, ProxyResponse};
pub use settings::Settings;

/// Annotation stamped on every submitted object; holds the client request token.
pub const TOKEN_ANNOTATION: &str = "kres.dev/client-request-token";

/// Delay before the first real submission of a CREATE.
pub const INIT_DELAY_SECS: u64 = 1;

/// Delay between stabilization polls of a batch workload.
pub const STABILIZE_DELAY_SECS: u64 = 30;

pub mod prelude {
    pub use super::{
        Action, CallbackContext, ErrorCode, ManifestSource, OperationStatus, ProgressEvent, ReconcileError,
        ReconcileState, Request, ResourceIdentity, ResourceModel, TrackedObjectReference,
    };
}

/// Where the manifest of an apply comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestSource {
    Inline(String),
    RemoteUrl(String),
}

/// Object reference populated from the control plane after a submit or lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedObjectReference {
    pub uid: Option<String>,
    pub self_link: String,
    pub resource_version: Option<String>,
    pub namespace: Option<String>,
    pub name: String,
    /// `apiVersion` of the live object, e.g. `batch/v1`.
    pub api_version: String,
    pub kind: String,
}

/// Desired/observed state of an applied manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceModel {
    #[serde(rename = "ClusterName", default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(rename = "Namespace", default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(rename = "Manifest", default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(rename = "Url", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Encoded [`ResourceIdentity`]; assigned on the first CREATE step.
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "resourceVersion", default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(rename = "selfLink", default, skip_serializing_if = "Option::is_none")]
    pub self_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ResourceModel {
    /// Exactly one of `Manifest` / `Url` must be set.
    pub fn manifest_source(&self) -> Result<ManifestSource, ReconcileError> {
        let manifest = self.manifest.as_deref().filter(|s| !s.trim().is_empty());
        let url = self.url.as_deref().filter(|s| !s.trim().is_empty());
        match (manifest, url) {
            (Some(m), None) => Ok(ManifestSource::Inline(m.to_string())),
            (None, Some(u)) => Ok(ManifestSource::RemoteUrl(u.to_string())),
            _ => Err(ReconcileError::validation("Either Manifest or Url must be specified.")),
        }
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or("default")
    }

    /// Overwrite the read-only fields from a live object reference.
    pub fn track(&mut self, r: &TrackedObjectReference) {
        if r.uid.is_some() {
            self.uid = r.uid.clone();
        }
        self.self_link = Some(r.self_link.clone());
        if r.resource_version.is_some() {
            self.resource_version = r.resource_version.clone();
        }
        if r.namespace.is_some() {
            self.namespace = r.namespace.clone();
        }
        self.name = Some(r.name.clone());
    }
}

/// Model of the field-read resource: one JSONPath evaluated against a live object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// kubectl object argument, e.g. `service/my-svc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Create,
    Update,
    Delete,
    Read,
    List,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Read => "read",
            Action::List => "list",
        }
    }
}

/// One invocation handed to a handler by the outer framework.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<M> {
    pub action: Action,
    #[serde(default = "Option::default")]
    pub desired_resource_state: Option<M>,
    #[serde(default = "Option::default")]
    pub previous_resource_state: Option<M>,
    #[serde(default)]
    pub callback_context: CallbackContext,
    /// Stable across retries of one logical request.
    #[serde(default)]
    pub client_request_token: Option<String>,
    /// Logical (stack-level) name of the resource.
    #[serde(default)]
    pub logical_resource_identifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    InProgress,
    Success,
    Failed,
}

/// Result of one handler step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent<M> {
    pub status: OperationStatus,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub resource_model: Option<M>,
    #[serde(default, skip_serializing_if = "CallbackContext::is_empty")]
    pub callback_context: CallbackContext,
    #[serde(default)]
    pub callback_delay_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<M> ProgressEvent<M> {
    pub fn in_progress(model: M, context: CallbackContext, delay_secs: u64) -> Self {
        Self {
            status: OperationStatus::InProgress,
            resource_model: Some(model),
            callback_context: context,
            callback_delay_seconds: delay_secs,
            error_code: None,
            message: None,
        }
    }

    pub fn success(model: Option<M>) -> Self {
        Self {
            status: OperationStatus::Success,
            resource_model: model,
            callback_context: CallbackContext::default(),
            callback_delay_seconds: 0,
            error_code: None,
            message: None,
        }
    }

    /// Render a handler error the way the outer framework expects it.
    pub fn failed(err: &ReconcileError) -> Self {
        Self {
            status: OperationStatus::Failed,
            resource_model: None,
            callback_context: CallbackContext::default(),
            callback_delay_seconds: 0,
            error_code: Some(err.code()),
            message: Some(err.to_string()),
        }
    }
}
