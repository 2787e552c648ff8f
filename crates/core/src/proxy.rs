//! Wire types of the remote proxy RPC.

use serde::{Deserialize, Serialize};

/// Payload sent to the proxy execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub cluster_name: String,
    /// Manifest document to materialise at the proxy's temporary path before running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<serde_json::Value>,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

/// Either the raw command output or an error envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyResponse {
    Error(ProxyErrorEnvelope),
    Output(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_distinguishes_output_from_envelope() {
        let out: ProxyResponse = serde_json::from_str("\"{\\\"kind\\\":\\\"Job\\\"}\"").unwrap();
        assert_eq!(out, ProxyResponse::Output("{\"kind\":\"Job\"}".into()));

        let err: ProxyResponse = serde_json::from_value(serde_json::json!({
            "errorType": "CommandError",
            "errorMessage": "Error from server (NotFound): x",
            "stackTrace": ["kres_exec::serve"]
        }))
        .unwrap();
        match err {
            ProxyResponse::Error(env) => {
                assert_eq!(env.error_type, "CommandError");
                assert_eq!(env.stack_trace.len(), 1);
            }
            other => panic!("expected envelope, got {:?}", other),
        }
    }

    #[test]
    fn request_omits_absent_manifest() {
        let req = ProxyRequest { cluster_name: "eks".into(), manifest: None, command: "kubectl get ns".into() };
        assert_eq!(serde_json::to_value(&req).unwrap(), serde_json::json!({"cluster_name": "eks", "command": "kubectl get ns"}));
    }
}
