//! kres router: decides how the control plane is reached and manages the proxy unit.
//!
//! The decision ([`proxy_required`]) is a pure function of fetched network facts.
//! Provisioning ([`NetworkRouter::ensure_proxy`]) is an idempotent upsert, safe to call
//! before every proxied command.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kres_core::settings::{PROXY_MEMORY_MB, PROXY_TIMEOUT_SECS};
use kres_core::{CloudError, ProxyRequest, ProxyResponse, ReconcileError, Settings};
use kres_manifest::ObjectStore;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tokio::time::Instant;
use tracing::{error, info, warn};

mod aws;
mod mock;

pub use aws::{role_arn_from_caller, AwsCli};
pub use mock::MockCloud;

const OPEN_CIDR: &str = "0.0.0.0/0";

/// Network configuration of a cluster's API endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetwork {
    pub subnet_ids: BTreeSet<String>,
    pub security_group_ids: BTreeSet<String>,
    pub endpoint_public_access: bool,
    pub public_access_cidrs: Vec<String>,
}

impl ClusterNetwork {
    /// Public endpoint reachable from anywhere.
    pub fn is_open_to_all(&self) -> bool {
        self.endpoint_public_access && self.public_access_cidrs.iter().any(|c| c == OPEN_CIDR)
    }
}

/// Network attachment of the execution unit this process runs in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionNetwork {
    pub vpc_id: Option<String>,
    pub subnet_ids: BTreeSet<String>,
    pub security_group_ids: BTreeSet<String>,
}

impl ExecutionNetwork {
    pub fn in_vpc(&self) -> bool {
        self.vpc_id.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Everything needed to create or reconfigure a proxy unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpec {
    pub name: String,
    pub runtime: String,
    pub handler: String,
    pub role_arn: String,
    pub timeout_secs: u32,
    pub memory_mb: u32,
    pub subnet_ids: Vec<String>,
    pub security_group_ids: Vec<String>,
    pub code_path: PathBuf,
}

/// The cloud operations the reconciler consumes.
#[async_trait::async_trait]
pub trait CloudApi: ObjectStore {
    async fn describe_cluster_network(&self, cluster: &str) -> Result<ClusterNetwork, CloudError>;
    async fn current_network(&self, function_name: &str) -> Result<ExecutionNetwork, CloudError>;
    /// The subset of `subnet_ids` tagged for internal load balancers.
    async fn internal_subnets(&self, subnet_ids: &[String]) -> Result<Vec<String>, CloudError>;
    async fn execution_role(&self) -> Result<String, CloudError>;
    async fn create_function(&self, spec: &FunctionSpec) -> Result<(), CloudError>;
    async fn update_function_code(&self, name: &str, code_path: &Path) -> Result<(), CloudError>;
    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), CloudError>;
    /// Synchronous request/response invocation; returns the decoded response payload.
    async fn invoke_function(&self, name: &str, payload: &Json) -> Result<Json, CloudError>;
}

/// Whether a command for `cluster` has to go through a proxy unit.
///
/// Direct access works when the endpoint is open to all (and that rule is enabled), or when the
/// current unit sits in a VPC whose subnets and security groups are all the cluster's own.
pub fn proxy_required(cluster: &ClusterNetwork, current: Option<&ExecutionNetwork>, allow_public: bool) -> bool {
    if allow_public && cluster.is_open_to_all() {
        return false;
    }
    match current {
        Some(net) if net.in_vpc() => {
            let inside = net.subnet_ids.is_subset(&cluster.subnet_ids) && net.security_group_ids.is_subset(&cluster.security_group_ids);
            !inside
        }
        _ => true,
    }
}

/// Retry `op` while the cloud reports the target busy, for at most `time_box`.
pub async fn retry_busy<T, F, Fut>(what: &str, delay: Duration, time_box: Duration, mut op: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Err(CloudError::Busy(message)) => {
                let waited = started.elapsed();
                if waited >= time_box || waited + delay > time_box {
                    error!(op = %what, attempt, waited_s = waited.as_secs(), "router: still busy, giving up");
                    return Err(CloudError::Timeout { waited_secs: waited.as_secs(), message });
                }
                counter!("proxy_busy_retries_total", 1u64);
                warn!(op = %what, attempt, delay_ms = delay.as_millis() as u64, error = %message, "router: target busy, retrying");
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

pub struct NetworkRouter {
    cloud: Arc<dyn CloudApi>,
    settings: Settings,
}

impl NetworkRouter {
    pub fn new(cloud: Arc<dyn CloudApi>, settings: Settings) -> Self {
        Self { cloud, settings }
    }

    pub fn cloud(&self) -> Arc<dyn CloudApi> {
        self.cloud.clone()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fetch the network facts and apply [`proxy_required`].
    ///
    /// A failing self-inspection counts as "not in a VPC".
    pub async fn needs_proxy(&self, cluster: &str) -> Result<bool, CloudError> {
        let net = self.cloud.describe_cluster_network(cluster).await?;
        let allow_public = self.settings.allow_public_endpoint;
        let current = match &self.settings.function_name {
            _ if allow_public && net.is_open_to_all() => None,
            Some(function) => match self.cloud.current_network(function).await {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(function = %function, error = %e, "router: cannot inspect own network, assuming outside VPC");
                    None
                }
            },
            None => None,
        };
        let needed = proxy_required(&net, current.as_ref(), allow_public);
        info!(cluster = %cluster, proxy = needed, public = net.is_open_to_all(), "router: access decided");
        Ok(needed)
    }

    /// Create the proxy unit for `cluster`, or bring an existing one up to date. Returns its name.
    pub async fn ensure_proxy(&self, cluster: &str) -> Result<String, CloudError> {
        let net = self.cloud.describe_cluster_network(cluster).await?;
        let all_subnets: Vec<String> = net.subnet_ids.iter().cloned().collect();
        let subnet_ids = self.cloud.internal_subnets(&all_subnets).await?;
        let role_arn = self.cloud.execution_role().await?;
        let spec = FunctionSpec {
            name: self.settings.proxy_function_name(cluster),
            runtime: self.settings.proxy_runtime.clone(),
            handler: self.settings.proxy_handler.clone(),
            role_arn,
            timeout_secs: PROXY_TIMEOUT_SECS,
            memory_mb: PROXY_MEMORY_MB,
            subnet_ids,
            security_group_ids: net.security_group_ids.iter().cloned().collect(),
            code_path: self.settings.proxy_code_path.clone(),
        };
        match self.cloud.create_function(&spec).await {
            Ok(()) => {
                counter!("proxy_provisioned_total", 1u64, "op" => "create");
                info!(function = %spec.name, subnets = spec.subnet_ids.len(), "router: proxy created");
            }
            Err(CloudError::AlreadyExists(_)) => {
                counter!("proxy_provisioned_total", 1u64, "op" => "update");
                warn!(function = %spec.name, "router: proxy exists, updating in place");
                let (delay, time_box) = (self.settings.proxy_busy_delay, self.settings.proxy_busy_timeout);
                retry_busy("update_function_code", delay, time_box, || self.cloud.update_function_code(&spec.name, &spec.code_path)).await?;
                retry_busy("update_function_configuration", delay, time_box, || self.cloud.update_function_configuration(&spec)).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(spec.name)
    }
}

/// Client side of the proxy RPC.
pub struct ProxyClient {
    cloud: Arc<dyn CloudApi>,
    busy_delay: Duration,
    busy_timeout: Duration,
}

impl ProxyClient {
    pub fn new(cloud: Arc<dyn CloudApi>, settings: &Settings) -> Self {
        Self { cloud, busy_delay: settings.proxy_busy_delay, busy_timeout: settings.proxy_busy_timeout }
    }

    /// Invoke `function` and unwrap its output; an error envelope becomes [`ReconcileError::Proxy`].
    pub async fn call(&self, function: &str, req: &ProxyRequest) -> Result<String, ReconcileError> {
        let payload = serde_json::to_value(req)?;
        let t0 = Instant::now();
        counter!("proxy_invocations_total", 1u64);
        let raw = retry_busy("invoke", self.busy_delay, self.busy_timeout, || self.cloud.invoke_function(function, &payload)).await?;
        histogram!("proxy_invoke_ms", t0.elapsed().as_secs_f64() * 1000.0);
        let resp: ProxyResponse = serde_json::from_value(raw)
            .map_err(|e| ReconcileError::serialization(format!("decoding proxy response: {}", e)))?;
        match resp {
            ProxyResponse::Output(out) => Ok(out),
            ProxyResponse::Error(env) => {
                counter!("proxy_errors_total", 1u64);
                error!(function = %function, error_type = %env.error_type, message = %env.error_message, trace = ?env.stack_trace, "router: proxied command failed");
                Err(ReconcileError::Proxy { error_type: env.error_type, message: env.error_message })
            }
        }
    }
}
