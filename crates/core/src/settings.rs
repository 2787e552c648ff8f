//! Runtime knobs, read from `KRES_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Proxy unit timeout (seconds).
pub const PROXY_TIMEOUT_SECS: u32 = 900;
/// Proxy unit memory (MB).
pub const PROXY_MEMORY_MB: u32 = 512;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub manifest_path: PathBuf,
    pub kubeconfig: PathBuf,
    pub bin_dir: Option<PathBuf>,
    pub cmd_retries: u32,
    pub cmd_retry_delay: Duration,
    pub proxy_busy_delay: Duration,
    pub proxy_busy_timeout: Duration,
    pub proxy_prefix: String,
    pub proxy_code_path: PathBuf,
    pub proxy_runtime: String,
    pub proxy_handler: String,
    pub allow_public_endpoint: bool,
    pub list_chunk_size: usize,
    pub read_timeout: Duration,
    /// Largest manifest text accepted, in bytes.
    pub max_manifest_bytes: usize,
    /// Largest manifest accepted, in JSON nodes.
    pub max_manifest_nodes: usize,
    /// Name of the execution unit this process runs in, if any.
    pub function_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            manifest_path: PathBuf::from("/tmp/manifest.json"),
            kubeconfig: PathBuf::from("/tmp/kube.config"),
            bin_dir: Some(PathBuf::from("/var/task/bin")),
            cmd_retries: 5,
            cmd_retry_delay: Duration::from_secs(5),
            proxy_busy_delay: Duration::from_secs(10),
            proxy_busy_timeout: Duration::from_secs(600),
            proxy_prefix: "kres-apply-proxy".to_string(),
            proxy_code_path: PathBuf::from("./proxy.zip"),
            proxy_runtime: "provided.al2".to_string(),
            proxy_handler: "bootstrap".to_string(),
            allow_public_endpoint: true,
            list_chunk_size: 500,
            read_timeout: Duration::from_secs(600),
            max_manifest_bytes: 1_000_000,
            max_manifest_nodes: 100_000,
            function_name: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup; unparsable values keep their default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let secs = |k: &str, dflt: Duration| get(k).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(dflt);
        Self {
            manifest_path: get("KRES_MANIFEST_PATH").map(PathBuf::from).unwrap_or(d.manifest_path),
            kubeconfig: get("KRES_KUBECONFIG").map(PathBuf::from).unwrap_or(d.kubeconfig),
            bin_dir: match get("KRES_BIN_DIR") {
                Some(s) if s.is_empty() => None,
                Some(s) => Some(PathBuf::from(s)),
                None => d.bin_dir,
            },
            cmd_retries: get("KRES_CMD_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(d.cmd_retries),
            cmd_retry_delay: secs("KRES_CMD_RETRY_DELAY_SECS", d.cmd_retry_delay),
            proxy_busy_delay: secs("KRES_PROXY_BUSY_DELAY_SECS", d.proxy_busy_delay),
            proxy_busy_timeout: secs("KRES_PROXY_BUSY_TIMEOUT_SECS", d.proxy_busy_timeout),
            proxy_prefix: get("KRES_PROXY_PREFIX").unwrap_or(d.proxy_prefix),
            proxy_code_path: get("KRES_PROXY_CODE_PATH").map(PathBuf::from).unwrap_or(d.proxy_code_path),
            proxy_runtime: get("KRES_PROXY_RUNTIME").unwrap_or(d.proxy_runtime),
            proxy_handler: get("KRES_PROXY_HANDLER").unwrap_or(d.proxy_handler),
            allow_public_endpoint: get("KRES_ALLOW_PUBLIC_ENDPOINT")
                .map(|v| !(v == "0" || v.eq_ignore_ascii_case("false")))
                .unwrap_or(d.allow_public_endpoint),
            list_chunk_size: get("KRES_LIST_CHUNK_SIZE").and_then(|s| s.parse().ok()).filter(|n| *n > 0).unwrap_or(d.list_chunk_size),
            read_timeout: secs("KRES_READ_TIMEOUT_SECS", d.read_timeout),
            max_manifest_bytes: get("KRES_MAX_MANIFEST_BYTES").and_then(|s| s.parse().ok()).unwrap_or(d.max_manifest_bytes),
            max_manifest_nodes: get("KRES_MAX_MANIFEST_NODES").and_then(|s| s.parse().ok()).unwrap_or(d.max_manifest_nodes),
            function_name: get("KRES_FUNCTION_NAME").or_else(|| get("AWS_LAMBDA_FUNCTION_NAME")).filter(|s| !s.is_empty()),
        }
    }

    /// Name of the proxy unit serving `cluster`.
    pub fn proxy_function_name(&self, cluster: &str) -> String {
        format!("{}-{}", self.proxy_prefix, cluster)
    }
}
