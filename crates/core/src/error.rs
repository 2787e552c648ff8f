//! Error taxonomy shared by every kres crate.

use serde::{Deserialize, Serialize};

/// Substring kubectl prints when the API server cannot be reached.
pub const UNREACHABLE_MARKER: &str = "Unable to connect to the server";

/// Substring the cloud returns while a function is mid-update.
pub const BUSY_MARKER: &str = "The operation cannot be performed at this time";

/// Non-zero exit of a control-plane command, with its captured output.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command failed ({}): {}", exit_label(.exit_code), .output.trim())]
pub struct CommandError {
    pub exit_code: Option<i32>,
    pub output: String,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "no exit code".to_string(),
    }
}

impl CommandError {
    pub fn new(exit_code: Option<i32>, output: impl Into<String>) -> Self {
        Self { exit_code, output: output.into() }
    }

    /// Transient connectivity failure: the only class retried locally.
    pub fn is_unreachable(&self) -> bool {
        self.output.contains(UNREACHABLE_MARKER)
    }

    pub fn is_already_exists(&self) -> bool {
        is_already_exists_text(&self.output)
    }

    pub fn is_not_found(&self) -> bool {
        is_not_found_text(&self.output)
    }

    /// The cloud rejected the call because the target is mid-update.
    pub fn is_busy(&self) -> bool {
        self.output.contains(BUSY_MARKER)
    }
}

fn is_already_exists_text(s: &str) -> bool {
    s.contains("(AlreadyExists)") || s.contains("already exists")
}

/// kubectl reports missing objects as `Error from server (NotFound): ...`.
fn is_not_found_text(s: &str) -> bool {
    s.contains("(NotFound)")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity token is not valid base64: {0}")]
    Encoding(String),
    #[error("identity token is not valid utf-8")]
    Utf8,
    #[error("identity token has {0} fields, expected 4")]
    FieldCount(usize),
    #[error("identity token field {0} is malformed")]
    Malformed(usize),
    #[error("unsupported identity token version: {0}")]
    Version(String),
}

/// Failures reported by the cloud boundary (cluster lookup, proxy unit, object store).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudError {
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("busy: {0}")]
    Busy(String),
    #[error("gave up after {waited_secs}s: {message}")]
    Timeout { waited_secs: u64, message: String },
    #[error("{0}")]
    Other(String),
}

impl CloudError {
    /// Classify raw cloud tool output.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(BUSY_MARKER) {
            CloudError::Busy(message)
        } else if message.contains("ResourceConflictException") && message.contains("already exist") {
            CloudError::AlreadyExists(message)
        } else {
            CloudError::Other(message)
        }
    }
}

impl From<CommandError> for CloudError {
    fn from(e: CommandError) -> Self {
        CloudError::classify(e.output)
    }
}

/// Error codes understood by the outer invocation framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    InvalidRequest,
    GeneralServiceException,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ReconcileError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("failed to fetch manifest {url}: {cause}")]
    Fetch { url: String, cause: String },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("job failed: {reason} {message}")]
    WorkloadFailed { reason: String, message: String },

    /// Error envelope returned by the remote proxy unit.
    #[error("{error_type}: {message}")]
    Proxy { error_type: String, message: String },

    #[error("invalid identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Control-plane "already exists", whether the command ran locally or through the proxy.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::Command(e) => e.is_already_exists(),
            Self::Proxy { message, .. } => is_already_exists_text(message),
            _ => false,
        }
    }

    /// Control-plane "not found", whether the command ran locally or through the proxy.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Command(e) => e.is_not_found(),
            Self::Proxy { message, .. } => is_not_found_text(message),
            _ => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Validation(_) | Self::Identity(_) | Self::Unsupported(_) => ErrorCode::InvalidRequest,
            _ => ErrorCode::GeneralServiceException,
        }
    }
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_classifiers() {
        let unreachable = CommandError::new(Some(1), "Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout");
        assert!(unreachable.is_unreachable());
        assert!(!unreachable.is_already_exists());

        let exists = CommandError::new(Some(1), "Error from server (AlreadyExists): error when creating \"/tmp/manifest.json\": jobs.batch \"a\" already exists");
        assert!(exists.is_already_exists());
        assert!(!exists.is_unreachable());

        let gone = CommandError::new(Some(1), "Error from server (NotFound): jobs.batch \"a\" not found");
        assert!(gone.is_not_found());

        let busy = CommandError::new(Some(254), "An error occurred (ResourceConflictException) when calling the Invoke operation: The operation cannot be performed at this time.");
        assert!(busy.is_busy());
        assert!(!gone.is_busy());
    }

    #[test]
    fn command_error_display_includes_exit_and_output() {
        let e = CommandError::new(Some(2), "boom\n");
        assert_eq!(e.to_string(), "command failed (exit code 2): boom");
        let e = CommandError::new(None, "spawn failed");
        assert_eq!(e.to_string(), "command failed (no exit code): spawn failed");
    }

    #[test]
    fn cloud_errors_are_classified_from_output() {
        assert!(matches!(
            CloudError::classify("An error occurred (ResourceConflictException) when calling the CreateFunction operation: Function already exist: kres-apply-proxy-eks"),
            CloudError::AlreadyExists(_)
        ));
        assert!(matches!(
            CloudError::classify("An error occurred (ResourceConflictException): The operation cannot be performed at this time. An update is in progress"),
            CloudError::Busy(_)
        ));
        assert!(matches!(CloudError::classify("AccessDenied"), CloudError::Other(_)));
    }

    #[test]
    fn proxied_errors_classify_like_local_ones() {
        let e = ReconcileError::Proxy { error_type: "CommandError".into(), message: "Error from server (AlreadyExists): x".into() };
        assert!(e.is_already_exists());
        let e = ReconcileError::Proxy { error_type: "CommandError".into(), message: "Error from server (NotFound): x".into() };
        assert!(e.is_not_found());
        assert!(!ReconcileError::validation("x").is_not_found());
        let cloud = ReconcileError::Proxy {
            error_type: "CloudError".into(),
            message: "An error occurred (ResourceNotFoundException) when calling the GetFunction operation: Function not found".into(),
        };
        assert!(!cloud.is_not_found());
    }

    #[test]
    fn error_codes_map_taxonomy() {
        assert_eq!(ReconcileError::validation("x").code(), ErrorCode::InvalidRequest);
        assert_eq!(ReconcileError::already_exists("x").code(), ErrorCode::AlreadyExists);
        assert_eq!(ReconcileError::not_found("x").code(), ErrorCode::NotFound);
        let wf = ReconcileError::WorkloadFailed { reason: "BackoffLimitExceeded".into(), message: "Job has reached the specified backoff limit".into() };
        assert_eq!(wf.code(), ErrorCode::GeneralServiceException);
        assert_eq!(wf.to_string(), "job failed: BackoffLimitExceeded Job has reached the specified backoff limit");
    }
}
