use std::sync::{Arc, Mutex};

use kres_core::{CloudError, ManifestSource, ReconcileError, TOKEN_ANNOTATION};
use kres_manifest::{ManifestLimits, ManifestResolver, ObjectStore, ResolveRequest};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CONFIG_MAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  created: 2002-12-14 10:00:00\n";

#[derive(Default)]
struct FakeStore {
    objects: Vec<((String, String), String)>,
    seen: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<String, CloudError> {
        self.seen.lock().unwrap().push(format!("{}/{}", bucket, key));
        self.objects
            .iter()
            .find(|((b, k), _)| b == bucket && k == key)
            .map(|(_, body)| body.clone())
            .ok_or_else(|| CloudError::Other(format!("NoSuchKey: {}", key)))
    }
}

fn request<'a>(source: &'a ManifestSource, token: &'a str) -> ResolveRequest<'a> {
    ResolveRequest { source, previous_identity: None, stack_name: "MyStack", client_token: token }
}

#[tokio::test]
async fn remote_manifest_is_fetched_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifests/cm.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CONFIG_MAP))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("manifest.json");
    let resolver = ManifestResolver::new(&out);
    let source = ManifestSource::RemoteUrl(format!("{}/manifests/cm.yaml", server.uri()));

    let doc = resolver.resolve(request(&source, "tok-http")).await.unwrap();
    assert_eq!(doc.kind(), "ConfigMap");
    assert_eq!(doc.name(), Some("settings"));
    assert_eq!(doc.annotation(TOKEN_ANNOTATION), Some("tok-http"));

    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(written["metadata"]["annotations"][TOKEN_ANNOTATION], "tok-http");
    assert_eq!(written["data"]["created"], "2002-12-14T10:00:00Z");
}

#[tokio::test]
async fn http_error_status_is_a_fetch_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.yaml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let resolver = ManifestResolver::new(dir.path().join("manifest.json"));
    let url = format!("{}/missing.yaml", server.uri());

    match resolver.fetch(&url).await {
        Err(ReconcileError::Fetch { url: u, cause }) => {
            assert_eq!(u, url);
            assert_eq!(cause, "[404] Not Found");
        }
        other => panic!("expected fetch error, got {:?}", other),
    }
    assert!(!dir.path().join("manifest.json").exists());
}

#[tokio::test]
async fn object_store_urls_go_through_the_store() {
    let store = Arc::new(FakeStore {
        objects: vec![(("bucket".into(), "deploy/cm.yaml".into()), CONFIG_MAP.into())],
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let resolver = ManifestResolver::new(dir.path().join("manifest.json")).with_object_store(store.clone());

    let source = ManifestSource::RemoteUrl("store://bucket/deploy/cm.yaml".into());
    let doc = resolver.resolve(request(&source, "tok-store")).await.unwrap();
    assert_eq!(doc.name(), Some("settings"));
    assert_eq!(store.seen.lock().unwrap().as_slice(), ["bucket/deploy/cm.yaml"]);

    let err = resolver.fetch("s3://bucket/nope.yaml").await.unwrap_err();
    assert!(matches!(err, ReconcileError::Fetch { ref cause, .. } if cause.contains("NoSuchKey")), "err={:?}", err);
}

#[tokio::test]
async fn object_store_url_without_store_fails() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ManifestResolver::new(dir.path().join("manifest.json"));
    let err = resolver.fetch("store://bucket/key.yaml").await.unwrap_err();
    assert!(err.to_string().contains("no object store configured"), "err={}", err);
}

#[tokio::test]
async fn inline_manifest_gets_generated_name_and_token() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("manifest.json");
    let resolver = ManifestResolver::new(&out);
    let source = ManifestSource::Inline("apiVersion: batch/v1\nkind: Job\nspec:\n  backoffLimit: 0\n".into());

    let doc = resolver.resolve(request(&source, "tok-inline")).await.unwrap();
    assert_eq!(doc.generate_name(), Some("cfn-mystack-"));

    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(written["metadata"]["generateName"], "cfn-mystack-");
    assert_eq!(written["metadata"]["annotations"][TOKEN_ANNOTATION], "tok-inline");
    assert_eq!(written["spec"]["backoffLimit"], 0);
}

#[tokio::test]
async fn inline_manifest_reuses_previous_name() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ManifestResolver::new(dir.path().join("manifest.json"));
    let source = ManifestSource::Inline("apiVersion: batch/v1\nkind: Job\n".into());
    let req = ResolveRequest {
        source: &source,
        previous_identity: Some("/apis/batch/v1/namespaces/default/jobs/cfn-mystack-q7x2k"),
        stack_name: "MyStack",
        client_token: "tok",
    };
    let doc = resolver.resolve(req).await.unwrap();
    assert_eq!(doc.name(), Some("cfn-mystack-q7x2k"));
    assert_eq!(doc.generate_name(), None);
}

#[tokio::test]
async fn invalid_manifest_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = ManifestResolver::new(dir.path().join("manifest.json"));
    let source = ManifestSource::Inline("kind: Job\n".into());
    let err = resolver.resolve(request(&source, "tok")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(_)), "err={:?}", err);
}

#[tokio::test]
async fn quoted_timestamps_are_written_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("manifest.json");
    let resolver = ManifestResolver::new(&out);
    let source = ManifestSource::Inline(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: release\ndata:\n  release: \"2024-03-01 09:30:00+02:00\"\n  cut: 2024-03-01 09:30:00+02:00\n".into(),
    );
    resolver.resolve(request(&source, "tok")).await.unwrap();

    let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
    assert_eq!(written["data"]["release"], "2024-03-01 09:30:00+02:00");
    assert_eq!(written["data"]["cut"], "2024-03-01T07:30:00Z");
}

#[tokio::test]
async fn resolver_enforces_configured_limits() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("manifest.json");
    let resolver = ManifestResolver::new(&out).with_limits(ManifestLimits { max_bytes: 64, max_nodes: 100 });
    let source = ManifestSource::Inline(CONFIG_MAP.into());
    let err = resolver.resolve(request(&source, "tok")).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(ref m) if m.contains("too large")), "err={:?}", err);
    assert!(!out.exists());

    let resolver = ManifestResolver::new(&out).with_limits(ManifestLimits { max_bytes: 4096, max_nodes: 3 });
    let err = resolver.resolve(request(&source, "tok")).await.unwrap_err();
    assert!(err.to_string().contains("too complex"), "err={}", err);
}
