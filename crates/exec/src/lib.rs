//! kres exec: the command executor.
//!
//! A command for a named cluster runs either directly (after the kubeconfig for that cluster
//! is in place) or through the cluster's proxy unit, as decided by the router. Callers only
//! see the output text or a [`ReconcileError`]. The proxy unit itself runs
//! [`serve_proxy_request`], which always executes directly.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use kres_core::{ProxyErrorEnvelope, ProxyRequest, ProxyResponse, ReconcileError, Settings};
use kres_ops::{run_with_retry, CommandRunner, RetryPolicy};
use kres_router::{CloudApi, NetworkRouter, ProxyClient};
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Direct,
    Proxy(String),
}

struct Proxying {
    router: NetworkRouter,
    client: ProxyClient,
}

pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    proxying: Option<Proxying>,
    retry: RetryPolicy,
    settings: Settings,
    credentials: tokio::sync::Mutex<HashSet<String>>,
    routes: Mutex<HashMap<String, Route>>,
}

impl Executor {
    /// An executor that always runs commands directly.
    pub fn new(runner: Arc<dyn CommandRunner>, settings: Settings) -> Self {
        Self {
            runner,
            proxying: None,
            retry: RetryPolicy::from_settings(&settings),
            settings,
            credentials: tokio::sync::Mutex::new(HashSet::new()),
            routes: Mutex::new(HashMap::new()),
        }
    }

    /// Route cluster commands through a proxy unit when the cluster is not reachable directly.
    pub fn with_cloud(mut self, cloud: Arc<dyn CloudApi>) -> Self {
        let client = ProxyClient::new(cloud.clone(), &self.settings);
        self.proxying = Some(Proxying { router: NetworkRouter::new(cloud, self.settings.clone()), client });
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manifest_path(&self) -> &Path {
        &self.settings.manifest_path
    }

    /// Run `command`, against `cluster` when given, else against the ambient kubeconfig context.
    pub async fn run(&self, command: &str, cluster: Option<&str>) -> Result<String, ReconcileError> {
        let cluster = cluster.filter(|c| !c.is_empty());
        if let (Some(cluster), Some(p)) = (cluster, &self.proxying) {
            if let Route::Proxy(function) = self.route(p, cluster).await? {
                return self.run_proxied(p, &function, cluster, command).await;
            }
        }
        self.run_direct(command, cluster).await
    }

    /// Run `command` in this process, never through a proxy.
    pub async fn run_direct(&self, command: &str, cluster: Option<&str>) -> Result<String, ReconcileError> {
        if let Some(cluster) = cluster.filter(|c| !c.is_empty()) {
            self.ensure_credentials(cluster).await?;
        }
        let t0 = Instant::now();
        counter!("exec_commands_total", 1u64, "route" => "direct");
        let res = run_with_retry(self.runner.as_ref(), command, &self.retry).await;
        histogram!("exec_command_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res.map_err(|e| {
            counter!("exec_command_failures_total", 1u64);
            error!(command = %command, exit_code = ?e.exit_code, output = %e.output.trim(), "exec: command failed");
            ReconcileError::from(e)
        })
    }

    /// Write the kubeconfig entry for `cluster` and select it; done once per executor and cluster.
    pub async fn ensure_credentials(&self, cluster: &str) -> Result<(), ReconcileError> {
        let mut done = self.credentials.lock().await;
        if done.contains(cluster) {
            return Ok(());
        }
        let t0 = Instant::now();
        for cmd in [kres_kubehub::update_kubeconfig_cmd(cluster, &self.settings.kubeconfig), kres_kubehub::use_context_cmd(cluster)] {
            run_with_retry(self.runner.as_ref(), &cmd, &self.retry).await?;
        }
        done.insert(cluster.to_string());
        info!(cluster = %cluster, took_ms = t0.elapsed().as_millis() as u64, "exec: credentials configured");
        Ok(())
    }

    async fn route(&self, p: &Proxying, cluster: &str) -> Result<Route, ReconcileError> {
        let cached = self.lock_routes().get(cluster).cloned();
        if let Some(route) = cached {
            return Ok(route);
        }
        let route = if p.router.needs_proxy(cluster).await? {
            Route::Proxy(p.router.ensure_proxy(cluster).await?)
        } else {
            Route::Direct
        };
        debug!(cluster = %cluster, route = ?route, "exec: route cached");
        self.lock_routes().insert(cluster.to_string(), route.clone());
        Ok(route)
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn run_proxied(&self, p: &Proxying, function: &str, cluster: &str, command: &str) -> Result<String, ReconcileError> {
        let manifest = self.manifest_for(command).await?;
        let req = ProxyRequest { cluster_name: cluster.to_string(), manifest, command: command.to_string() };
        let t0 = Instant::now();
        counter!("exec_commands_total", 1u64, "route" => "proxy");
        debug!(function = %function, command = %command, with_manifest = req.manifest.is_some(), "exec: proxying");
        let res = p.client.call(function, &req).await;
        histogram!("exec_command_ms", t0.elapsed().as_secs_f64() * 1000.0);
        res
    }

    /// The manifest document, when `command` references the manifest path and it has been written.
    async fn manifest_for(&self, command: &str) -> Result<Option<Json>, ReconcileError> {
        let path = self.manifest_path();
        if !command.contains(path.to_string_lossy().as_ref()) {
            return Ok(None);
        }
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReconcileError::internal(format!("reading manifest {}: {}", path.display(), e))),
        }
    }
}

fn error_type(e: &ReconcileError) -> &'static str {
    match e {
        ReconcileError::Command(_) => "CommandError",
        ReconcileError::Cloud(_) => "CloudError",
        ReconcileError::Serialization(_) => "SerializationError",
        ReconcileError::Validation(_) => "ValidationError",
        _ => "InternalError",
    }
}

/// Proxy-side handling of one request: materialise the manifest, run directly, wrap the outcome.
pub async fn serve_proxy_request(executor: &Executor, req: ProxyRequest) -> ProxyResponse {
    let res: Result<String, ReconcileError> = async {
        if let Some(doc) = &req.manifest {
            let path = executor.manifest_path();
            tokio::fs::write(path, serde_json::to_vec(doc)?)
                .await
                .map_err(|e| ReconcileError::internal(format!("writing manifest to {}: {}", path.display(), e)))?;
        }
        let cluster = Some(req.cluster_name.as_str()).filter(|c| !c.is_empty());
        executor.run_direct(&req.command, cluster).await
    }
    .await;
    match res {
        Ok(out) => ProxyResponse::Output(out),
        Err(e) => {
            let mut stack_trace = vec![format!("{:?}", e)];
            let mut source = std::error::Error::source(&e);
            while let Some(s) = source {
                stack_trace.push(s.to_string());
                source = s.source();
            }
            ProxyResponse::Error(ProxyErrorEnvelope { error_type: error_type(&e).to_string(), error_message: e.to_string(), stack_trace })
        }
    }
}
