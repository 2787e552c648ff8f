use std::sync::Arc;

use kres_core::{
    ProgressEvent, ReconcileError, ReconcileState, Request, ResourceIdentity, ResourceModel, TrackedObjectReference,
    INIT_DELAY_SECS, STABILIZE_DELAY_SECS,
};
use kres_exec::Executor;
use kres_kubehub::{self as kubehub, JobProgress};
use kres_manifest::{ManifestResolver, ResolveRequest};
use tracing::{info, warn};

use crate::{desired, find_by_token, HandlerResult, ResourceHandler};

const DEFAULT_STACK_NAME: &str = "resource";

/// Applies an arbitrary manifest to a cluster and tracks the resulting object.
pub struct ApplyResource {
    exec: Arc<Executor>,
    resolver: ManifestResolver,
}

impl ApplyResource {
    pub fn new(exec: Arc<Executor>, resolver: ManifestResolver) -> Self {
        Self { exec, resolver }
    }

    fn chunk_size(&self) -> usize {
        self.exec.settings().list_chunk_size
    }

    async fn lookup(&self, identity: &ResourceIdentity) -> Result<Option<TrackedObjectReference>, ReconcileError> {
        find_by_token(&self.exec, identity, self.chunk_size()).await
    }

    async fn require(&self, identity: &ResourceIdentity) -> Result<TrackedObjectReference, ReconcileError> {
        self.lookup(identity).await?.ok_or_else(|| {
            ReconcileError::not_found(format!("no {} in namespace {} carries token {}", identity.kind, identity.namespace, identity.client_token))
        })
    }

    /// Submit the resolved manifest; a conflict with our own earlier attempt adopts that object.
    async fn submit(&self, identity: &ResourceIdentity) -> Result<TrackedObjectReference, ReconcileError> {
        let cmd = kubehub::create_cmd(self.resolver.manifest_path(), &identity.namespace);
        match self.exec.run(&cmd, identity.cluster()).await {
            Ok(out) => Ok(kubehub::tracked_reference(&kubehub::parse_object(&out)?)),
            Err(e) if e.is_already_exists() => {
                warn!(kind = %identity.kind, namespace = %identity.namespace, "apply: create conflicted, looking for an earlier attempt");
                self.lookup(identity).await?.ok_or_else(|| ReconcileError::already_exists(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_workload(
        &self,
        mut model: ResourceModel,
        identity: &ResourceIdentity,
        state: ReconcileState,
    ) -> HandlerResult<ResourceModel> {
        let ReconcileState::AwaitingStabilization { self_link, name } = &state else {
            return Err(ReconcileError::internal("not awaiting stabilization"));
        };
        if !kubehub::is_stabilizable_link(self_link) {
            return Ok(ProgressEvent::success(Some(model)));
        }
        let (resource_type, namespace, name) = kubehub::link_target(self_link)
            .unwrap_or_else(|| (identity.kind.clone(), None, name.clone()));
        let namespace = namespace.unwrap_or_else(|| identity.namespace.clone());
        let out = self.exec.run(&kubehub::get_cmd(&resource_type, &name, &namespace), identity.cluster()).await?;
        model.track(&kubehub::tracked_reference(&kubehub::parse_object(&out)?));
        match kubehub::job_progress(&out)? {
            JobProgress::Complete => {
                info!(name = %name, namespace = %namespace, "apply: workload complete");
                Ok(ProgressEvent::success(Some(model)))
            }
            JobProgress::Failed { reason, message } => Err(ReconcileError::WorkloadFailed { reason, message }),
            JobProgress::Running => Ok(ProgressEvent::in_progress(model, state.to_context(), STABILIZE_DELAY_SECS)),
        }
    }
}

/// Identity stored on the desired model, else on the previous one.
fn stored_identity(req: &Request<ResourceModel>) -> Result<ResourceIdentity, ReconcileError> {
    let id = [&req.desired_resource_state, &req.previous_resource_state]
        .into_iter()
        .flatten()
        .find_map(|m| m.id.as_deref().filter(|s| !s.is_empty()))
        .ok_or_else(|| ReconcileError::not_found("resource has no identity"))?;
    Ok(ResourceIdentity::decode(id)?)
}

#[async_trait::async_trait]
impl ResourceHandler for ApplyResource {
    type Model = ResourceModel;

    fn type_name(&self) -> &'static str {
        "Kres::Kubernetes::Resource"
    }

    async fn create(&self, req: &Request<ResourceModel>) -> HandlerResult<ResourceModel> {
        let mut model = desired(req)?;
        let source = model.manifest_source()?;
        // Later steps of one CREATE keep the identity, and its token, minted by the first.
        let carried = model.id.as_deref().filter(|s| !s.is_empty()).map(ResourceIdentity::decode).transpose()?;
        let token = match &carried {
            Some(identity) => identity.client_token.clone(),
            None => req
                .client_request_token
                .as_deref()
                .filter(|t| !t.is_empty())
                .ok_or_else(|| ReconcileError::validation("clientRequestToken is required"))?
                .to_string(),
        };
        let stack_name = req.logical_resource_identifier.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_STACK_NAME);
        let doc = self
            .resolver
            .resolve(ResolveRequest { source: &source, previous_identity: model.self_link.as_deref(), stack_name, client_token: &token })
            .await?;
        let identity = match carried {
            Some(identity) => identity,
            None => {
                let namespace = doc.namespace().map(str::to_string).unwrap_or_else(|| model.namespace_or_default().to_string());
                ResourceIdentity::new(
                    token,
                    model.cluster_name.clone().unwrap_or_default(),
                    namespace,
                    kubehub::resource_type(doc.api_version(), doc.kind()),
                )
            }
        };
        model.id = Some(identity.encode());

        let state = ReconcileState::from_context(&req.callback_context);
        match state {
            ReconcileState::Uninitialized => {
                return Ok(ProgressEvent::in_progress(model, ReconcileState::Submitting.to_context(), INIT_DELAY_SECS));
            }
            ReconcileState::AwaitingStabilization { .. } => return self.poll_workload(model, &identity, state).await,
            ReconcileState::Submitting => {}
        }

        let reference = match self.lookup(&identity).await? {
            Some(existing) => {
                info!(self_link = %existing.self_link, "apply: adopting object from an earlier attempt");
                existing
            }
            None => self.submit(&identity).await?,
        };
        model.track(&reference);
        info!(self_link = %reference.self_link, uid = ?reference.uid, "apply: submitted");
        if kubehub::is_stabilizable_link(&reference.self_link) {
            let next = ReconcileState::AwaitingStabilization { self_link: reference.self_link.clone(), name: reference.name.clone() };
            return Ok(ProgressEvent::in_progress(model, next.to_context(), STABILIZE_DELAY_SECS));
        }
        Ok(ProgressEvent::success(Some(model)))
    }

    async fn update(&self, req: &Request<ResourceModel>) -> HandlerResult<ResourceModel> {
        let mut model = desired(req)?;
        let source = model.manifest_source()?;
        let identity = stored_identity(req)?;
        let existing = self.require(&identity).await?;
        let stack_name = req.logical_resource_identifier.as_deref().filter(|s| !s.is_empty()).unwrap_or(DEFAULT_STACK_NAME);
        self.resolver
            .resolve(ResolveRequest {
                source: &source,
                previous_identity: Some(existing.self_link.as_str()),
                stack_name,
                client_token: &identity.client_token,
            })
            .await?;
        let cmd = kubehub::apply_cmd(self.resolver.manifest_path(), &identity.namespace);
        let out = self.exec.run(&cmd, identity.cluster()).await?;
        let reference = kubehub::tracked_reference(&kubehub::parse_object(&out)?);
        model.track(&reference);
        model.id = Some(identity.encode());
        info!(self_link = %reference.self_link, resource_version = ?reference.resource_version, "apply: updated");
        Ok(ProgressEvent::success(Some(model)))
    }

    async fn delete(&self, req: &Request<ResourceModel>) -> HandlerResult<ResourceModel> {
        let identity = stored_identity(req)?;
        let existing = self.require(&identity).await?;
        let namespace = existing.namespace.clone().unwrap_or_else(|| identity.namespace.clone());
        let cmd = kubehub::delete_cmd(&identity.kind, &existing.name, &namespace);
        match self.exec.run(&cmd, identity.cluster()).await {
            Ok(_) => info!(self_link = %existing.self_link, "apply: deleted"),
            Err(e) if e.is_not_found() => info!(self_link = %existing.self_link, "apply: already gone"),
            Err(e) => return Err(e),
        }
        Ok(ProgressEvent::success(None))
    }

    async fn read(&self, req: &Request<ResourceModel>) -> HandlerResult<ResourceModel> {
        let mut model = desired(req)?;
        let identity = stored_identity(req)?;
        let existing = self.require(&identity).await?;
        model.track(&existing);
        model.id = Some(identity.encode());
        Ok(ProgressEvent::success(Some(model)))
    }
}
