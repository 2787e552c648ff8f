use std::sync::Arc;
use std::time::{Duration, Instant};

use kres_core::{GetModel, ProgressEvent, ReconcileError, Request};
use kres_exec::Executor;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::{desired, HandlerResult, ResourceHandler};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outputs longer than this are identified by their digest.
const MAX_INLINE_ID: usize = 1000;

/// Identifier of a field read: the output itself, or `SHA256-<hex>` for long outputs.
pub fn response_id(output: &str) -> String {
    if output.len() > MAX_INLINE_ID {
        format!("SHA256-{}", hex::encode(Sha256::digest(output.as_bytes())))
    } else {
        output.to_string()
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ReconcileError> {
    value.as_deref().filter(|s| !s.is_empty()).ok_or_else(|| ReconcileError::validation(format!("{} is required", field)))
}

/// Reads one JSONPath from a live object.
pub struct GetResource {
    exec: Arc<Executor>,
    interval: Duration,
    timeout: Duration,
}

impl GetResource {
    pub fn new(exec: Arc<Executor>) -> Self {
        let timeout = exec.settings().read_timeout;
        Self { exec, interval: DEFAULT_POLL_INTERVAL, timeout }
    }

    /// Retry every `interval` until `timeout` has elapsed.
    pub fn with_poll(mut self, interval: Duration, timeout: Duration) -> Self {
        self.interval = interval;
        self.timeout = timeout;
        self
    }

    async fn read_field(&self, mut model: GetModel) -> HandlerResult<GetModel> {
        let target = required(&model.name, "Name")?;
        let json_path = required(&model.json_path, "JsonPath")?;
        let namespace = model.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or("default");
        let cmd = kres_kubehub::jsonpath_cmd(target, json_path, namespace);
        let cluster = model.cluster_name.as_deref();

        let t0 = Instant::now();
        let mut attempt = 0u32;
        let out = loop {
            attempt += 1;
            match self.exec.run(&cmd, cluster).await {
                Ok(out) => break out,
                Err(e) if t0.elapsed() + self.interval < self.timeout => {
                    warn!(target = %target, attempt, error = %e, "get: read failed, retrying");
                    tokio::time::sleep(self.interval).await;
                }
                Err(e) => return Err(e),
            }
        };
        info!(target = %target, bytes = out.len(), attempts = attempt, took_ms = t0.elapsed().as_millis() as u64, "get: field read");
        model.id = Some(response_id(&out));
        model.response = Some(out);
        Ok(ProgressEvent::success(Some(model)))
    }
}

#[async_trait::async_trait]
impl ResourceHandler for GetResource {
    type Model = GetModel;

    fn type_name(&self) -> &'static str {
        "Kres::Kubernetes::Get"
    }

    async fn create(&self, req: &Request<GetModel>) -> HandlerResult<GetModel> {
        self.read_field(desired(req)?).await
    }

    async fn update(&self, req: &Request<GetModel>) -> HandlerResult<GetModel> {
        Ok(ProgressEvent::success(Some(desired(req)?)))
    }

    async fn delete(&self, req: &Request<GetModel>) -> HandlerResult<GetModel> {
        Ok(ProgressEvent::success(req.desired_resource_state.clone()))
    }

    async fn read(&self, req: &Request<GetModel>) -> HandlerResult<GetModel> {
        self.read_field(desired(req)?).await
    }
}
