//! Callback context: the only state carried between invocations of one operation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const INIT_KEY: &str = "init";
pub const INIT_COMPLETE: &str = "complete";
pub const STABILIZING_KEY: &str = "stabilizing";
pub const NAME_KEY: &str = "name";

/// Opaque key/value blob round-tripped by the outer framework.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackContext(Map<String, Value>);

impl CallbackContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Value::String(value.into()));
    }
}

/// Where a multi-step operation stands, decoded from the callback context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileState {
    /// No context yet: first invocation of the operation.
    Uninitialized,
    /// Initialization checkpoint recorded; the next step submits.
    Submitting,
    /// An asynchronous workload was submitted and its terminal condition is pending.
    AwaitingStabilization { self_link: String, name: String },
}

impl ReconcileState {
    pub fn from_context(ctx: &CallbackContext) -> Self {
        if let Some(self_link) = ctx.get_str(STABILIZING_KEY) {
            let name = ctx
                .get_str(NAME_KEY)
                .map(str::to_string)
                .unwrap_or_else(|| self_link.rsplit('/').next().unwrap_or_default().to_string());
            return ReconcileState::AwaitingStabilization { self_link: self_link.to_string(), name };
        }
        if ctx.is_empty() {
            ReconcileState::Uninitialized
        } else {
            ReconcileState::Submitting
        }
    }

    pub fn to_context(&self) -> CallbackContext {
        let mut ctx = CallbackContext::new();
        match self {
            ReconcileState::Uninitialized => {}
            ReconcileState::Submitting => ctx.insert(INIT_KEY, INIT_COMPLETE),
            ReconcileState::AwaitingStabilization { self_link, name } => {
                ctx.insert(STABILIZING_KEY, self_link.as_str());
                ctx.insert(NAME_KEY, name.as_str());
            }
        }
        ctx
    }
}
