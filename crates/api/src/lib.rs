//! kres api: resource handlers driven by the outer invocation framework.
//!
//! Each invocation carries one [`Request`] and is answered with one [`ProgressEvent`]. Work
//! that outlives an invocation is expressed as an IN_PROGRESS event whose callback context
//! the framework hands back on the next call; handlers keep no state of their own.

#![forbid(unsafe_code)]

use std::time::Instant;

use kres_core::{Action, ProgressEvent, ReconcileError, Request, ResourceIdentity, TrackedObjectReference, TOKEN_ANNOTATION};
use kres_exec::Executor;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod apply;
mod get;

pub use apply::ApplyResource;
pub use get::{response_id, GetResource, DEFAULT_POLL_INTERVAL};

pub type HandlerResult<M> = Result<ProgressEvent<M>, ReconcileError>;

/// One resource type: a handler per lifecycle action.
#[async_trait::async_trait]
pub trait ResourceHandler: Send + Sync {
    type Model: Send + Sync;

    /// Type name used in logs and metrics.
    fn type_name(&self) -> &'static str;

    async fn create(&self, req: &Request<Self::Model>) -> HandlerResult<Self::Model>;

    async fn update(&self, req: &Request<Self::Model>) -> HandlerResult<Self::Model>;

    async fn delete(&self, req: &Request<Self::Model>) -> HandlerResult<Self::Model>;

    async fn read(&self, req: &Request<Self::Model>) -> HandlerResult<Self::Model>;

    async fn list(&self, _req: &Request<Self::Model>) -> HandlerResult<Self::Model> {
        Err(ReconcileError::Unsupported(format!("{} does not support LIST", self.type_name())))
    }
}

/// Run one handler step; errors are rendered as a FAILED event.
pub async fn handle<H: ResourceHandler + ?Sized>(handler: &H, req: &Request<H::Model>) -> ProgressEvent<H::Model> {
    let t0 = Instant::now();
    let action = req.action.as_str();
    info!(resource = handler.type_name(), action, "api: handle start");
    let res = match req.action {
        Action::Create => handler.create(req).await,
        Action::Update => handler.update(req).await,
        Action::Delete => handler.delete(req).await,
        Action::Read => handler.read(req).await,
        Action::List => handler.list(req).await,
    };
    histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0, "action" => action);
    match res {
        Ok(event) => {
            let status = format!("{:?}", event.status);
            counter!("reconcile_total", 1u64, "action" => action, "status" => status.clone());
            info!(resource = handler.type_name(), action, status = %status, delay_s = event.callback_delay_seconds, took_ms = t0.elapsed().as_millis() as u64, "api: handle ok");
            event
        }
        Err(e) => {
            counter!("reconcile_total", 1u64, "action" => action, "status" => "Failed");
            warn!(resource = handler.type_name(), action, error = %e, took_ms = t0.elapsed().as_millis() as u64, "api: handle failed");
            ProgressEvent::failed(&e)
        }
    }
}

/// Find the live object stamped with the identity's client token, if any.
///
/// Lists every object of the identity's type in its namespace (paged by `chunk_size`) and
/// takes the first whose token annotation matches exactly.
pub async fn find_by_token(
    exec: &Executor,
    identity: &ResourceIdentity,
    chunk_size: usize,
) -> Result<Option<TrackedObjectReference>, ReconcileError> {
    let cmd = kres_kubehub::list_cmd(&identity.kind, &identity.namespace, chunk_size);
    let out = exec.run(&cmd, identity.cluster()).await?;
    let found = kres_kubehub::find_annotated(&out, TOKEN_ANNOTATION, &identity.client_token)?;
    let reference = found.as_ref().map(kres_kubehub::tracked_reference);
    debug!(kind = %identity.kind, namespace = %identity.namespace, found = reference.is_some(), "api: token lookup");
    Ok(reference)
}

/// Desired state of a request, which every action except LIST requires.
pub(crate) fn desired<M: Clone>(req: &Request<M>) -> Result<M, ReconcileError> {
    req.desired_resource_state
        .clone()
        .ok_or_else(|| ReconcileError::validation("desiredResourceState is required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kres_core::{CallbackContext, ErrorCode, OperationStatus};

    struct Echo;

    #[async_trait::async_trait]
    impl ResourceHandler for Echo {
        type Model = String;

        fn type_name(&self) -> &'static str {
            "Test::Echo"
        }

        async fn create(&self, req: &Request<String>) -> HandlerResult<String> {
            Ok(ProgressEvent::success(Some(desired(req)?)))
        }

        async fn update(&self, _req: &Request<String>) -> HandlerResult<String> {
            Err(ReconcileError::not_found("gone"))
        }

        async fn delete(&self, _req: &Request<String>) -> HandlerResult<String> {
            Ok(ProgressEvent::success(None))
        }

        async fn read(&self, req: &Request<String>) -> HandlerResult<String> {
            Ok(ProgressEvent::in_progress(desired(req)?, CallbackContext::new(), 5))
        }
    }

    fn request(action: Action, model: Option<&str>) -> Request<String> {
        Request {
            action,
            desired_resource_state: model.map(str::to_string),
            previous_resource_state: None,
            callback_context: CallbackContext::new(),
            client_request_token: Some("tok".into()),
            logical_resource_identifier: None,
        }
    }

    #[tokio::test]
    async fn dispatches_on_action() {
        let ok = handle(&Echo, &request(Action::Create, Some("m"))).await;
        assert_eq!(ok.status, OperationStatus::Success);
        assert_eq!(ok.resource_model.as_deref(), Some("m"));

        let pending = handle(&Echo, &request(Action::Read, Some("m"))).await;
        assert_eq!(pending.status, OperationStatus::InProgress);
        assert_eq!(pending.callback_delay_seconds, 5);
    }

    #[tokio::test]
    async fn errors_become_failed_events() {
        let missing = handle(&Echo, &request(Action::Update, Some("m"))).await;
        assert_eq!(missing.status, OperationStatus::Failed);
        assert_eq!(missing.error_code, Some(ErrorCode::NotFound));

        let invalid = handle(&Echo, &request(Action::Create, None)).await;
        assert_eq!(invalid.error_code, Some(ErrorCode::InvalidRequest));

        let list = handle(&Echo, &request(Action::List, None)).await;
        assert_eq!(list.error_code, Some(ErrorCode::InvalidRequest));
        assert!(list.message.unwrap_or_default().contains("Test::Echo"));
    }
}
