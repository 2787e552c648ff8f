use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kres_core::{CommandError, ProxyRequest, ProxyResponse, ReconcileError, Settings};
use kres_exec::{serve_proxy_request, Executor};
use kres_ops::{RetryPolicy, ScriptedRunner};
use kres_router::{ClusterNetwork, MockCloud};
use serde_json::json;

fn settings(dir: &tempfile::TempDir) -> Settings {
    Settings {
        manifest_path: dir.path().join("manifest.json"),
        kubeconfig: dir.path().join("kube.config"),
        proxy_busy_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn fast() -> RetryPolicy {
    RetryPolicy { retries: 5, delay: Duration::ZERO }
}

fn cluster(public: bool) -> ClusterNetwork {
    ClusterNetwork {
        subnet_ids: ["subnet-a".to_string()].into_iter().collect(),
        security_group_ids: BTreeSet::new(),
        endpoint_public_access: public,
        public_access_cidrs: vec!["0.0.0.0/0".into()],
    }
}

fn credentials_runner() -> ScriptedRunner {
    ScriptedRunner::new().on("update-kubeconfig", Ok(String::new())).on("config use-context", Ok(String::new()))
}

#[tokio::test]
async fn direct_commands_configure_credentials_once() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(credentials_runner().on("kubectl get", Ok("out".into())));
    let exec = Executor::new(runner.clone(), settings(&dir)).with_retry(fast());

    assert_eq!(exec.run("kubectl get ns", Some("eks")).await.unwrap(), "out");
    assert_eq!(exec.run("kubectl get pods", Some("eks")).await.unwrap(), "out");
    assert_eq!(runner.count("update-kubeconfig"), 1);
    assert_eq!(runner.count("use-context eks"), 1);
    let first = &runner.calls()[0];
    assert!(first.contains("--name eks --alias eks --kubeconfig"), "first={}", first);
}

#[tokio::test]
async fn ambient_context_skips_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().on("kubectl get", Ok("out".into())));
    let exec = Executor::new(runner.clone(), settings(&dir)).with_retry(fast());
    exec.run("kubectl get ns", None).await.unwrap();
    exec.run("kubectl get ns", Some("")).await.unwrap();
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn unreachable_server_is_retried_then_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().on(
        "kubectl get",
        Err(CommandError::new(Some(1), "Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout")),
    ));
    let exec = Executor::new(runner.clone(), settings(&dir)).with_retry(fast());
    let err = exec.run("kubectl get ns", None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Command(ref c) if c.is_unreachable()), "err={:?}", err);
    assert_eq!(runner.count("kubectl get"), 6);
}

#[tokio::test]
async fn public_cluster_runs_direct() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(credentials_runner().on("kubectl get", Ok("direct".into())));
    let cloud = Arc::new(MockCloud::new().with_cluster("eks", cluster(true)));
    let exec = Executor::new(runner.clone(), settings(&dir)).with_retry(fast()).with_cloud(cloud.clone());
    assert_eq!(exec.run("kubectl get ns", Some("eks")).await.unwrap(), "direct");
    assert_eq!(cloud.count("create_function"), 0);
}

#[tokio::test]
async fn private_cluster_goes_through_proxy_with_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(&dir);
    std::fs::write(&s.manifest_path, r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"c"}}"#).unwrap();
    let create = format!("kubectl create --save-config -o json -f {} -n default", s.manifest_path.display());

    let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
    let sink = seen.clone();
    let cloud = Arc::new(MockCloud::new().with_cluster("eks", cluster(false)).with_invoke(move |_, payload| {
        sink.lock().unwrap().push(payload.clone());
        Ok(json!("{\"kind\":\"ConfigMap\"}"))
    }));
    let runner = Arc::new(ScriptedRunner::new());
    let exec = Executor::new(runner.clone(), s).with_retry(fast()).with_cloud(cloud.clone());

    assert_eq!(exec.run(&create, Some("eks")).await.unwrap(), "{\"kind\":\"ConfigMap\"}");
    exec.run("kubectl get configmaps -o json -n default", Some("eks")).await.unwrap();

    assert!(runner.calls().is_empty());
    assert_eq!(cloud.count("create_function"), 1);
    assert_eq!(cloud.count("describe_cluster"), 2, "route is decided once per cluster");
    let payloads = seen.lock().unwrap();
    assert_eq!(payloads[0]["cluster_name"], "eks");
    assert_eq!(payloads[0]["manifest"]["metadata"]["name"], "c");
    assert!(payloads[1].get("manifest").is_none());
}

#[tokio::test]
async fn proxy_side_writes_manifest_and_runs_direct() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(&dir);
    let path = s.manifest_path.clone();
    let runner = Arc::new(credentials_runner().on("kubectl apply", Ok("applied".into())));
    let exec = Executor::new(runner.clone(), s).with_retry(fast());

    let req = ProxyRequest {
        cluster_name: "eks".into(),
        manifest: Some(json!({"apiVersion": "v1", "kind": "ConfigMap"})),
        command: format!("kubectl apply -o json -f {} -n default", path.display()),
    };
    assert_eq!(serve_proxy_request(&exec, req).await, ProxyResponse::Output("applied".into()));
    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(written["kind"], "ConfigMap");
    assert_eq!(runner.count("update-kubeconfig"), 1);
}

#[tokio::test]
async fn proxy_side_failures_become_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let runner = Arc::new(ScriptedRunner::new().on(
        "kubectl delete",
        Err(CommandError::new(Some(1), "Error from server (NotFound): jobs.batch \"a\" not found")),
    ));
    let exec = Executor::new(runner, settings(&dir)).with_retry(fast());
    let req = ProxyRequest { cluster_name: String::new(), manifest: None, command: "kubectl delete jobs.v1.batch/a -n default".into() };
    match serve_proxy_request(&exec, req).await {
        ProxyResponse::Error(env) => {
            assert_eq!(env.error_type, "CommandError");
            assert!(env.error_message.contains("(NotFound)"));
            assert!(!env.stack_trace.is_empty());
        }
        other => panic!("expected envelope, got {:?}", other),
    }
}
