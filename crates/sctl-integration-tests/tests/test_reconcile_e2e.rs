//! End-to-end reconciliation through the running controller.
//!
//! An upstream is simulated with wiremock. The controller is bootstrapped
//! from a manifest, started on ephemeral ports, and the published
//! artifact is fetched back through its own file server.

use std::time::Duration;

use clap::Parser;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sctl_core::{sha256_digest, ObjectRef, ResourceKind, SourceObject};
use sctl_reconcile::InMemorySourceStore;
use sctl_server::{bootstrap, Config, Environment};

const INDEX: &str = "apiVersion: v1\nentries:\n  podinfo:\n    - version: 6.5.0\n";

fn config(storage: &std::path::Path, manifest: &std::path::Path) -> Config {
    Config::try_parse_from([
        "source-controller",
        "--storage-path",
        storage.to_str().unwrap(),
        "--storage-address",
        "127.0.0.1:0",
        "--metrics-address",
        "127.0.0.1:0",
        "--manifest",
        manifest.to_str().unwrap(),
    ])
    .unwrap()
}

/// Poll `store` until `id` reports ready, or give up after ten seconds.
async fn wait_ready(store: &InMemorySourceStore, id: &ObjectRef) -> SourceObject {
    for _ in 0..200 {
        if let Some(object) = store.snapshot(id) {
            if object.status.is_ready() {
                return object;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{id} never became ready: {:?}", store.snapshot(id));
}

// -- Full flow ----------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sources_are_fetched_stored_and_served() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/archive/main.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"repository snapshot".to_vec()))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/charts/index.yaml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INDEX))
        .mount(&upstream)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("sources.yaml");
    std::fs::write(
        &manifest,
        format!(
            "- kind: GitRepository\n  metadata: {{name: podinfo, namespace: flux-system}}\n  spec:\n    url: {0}/archive/main.tar.gz\n    reference: main\n\
             - kind: HelmRepository\n  metadata: {{name: charts, namespace: flux-system}}\n  spec:\n    url: {0}/charts\n",
            upstream.uri()
        ),
    )
    .unwrap();

    let runtime = bootstrap(config(&tmp.path().join("bin"), &manifest), Environment::default()).unwrap();
    let store = runtime.store().clone();
    let running = runtime.start().await.unwrap();
    let client = reqwest::Client::new();

    let git = ObjectRef::new(ResourceKind::GitRepository, "flux-system", "podinfo").unwrap();
    let object = wait_ready(&store, &git).await;
    let artifact = object.status.artifact.unwrap();
    assert_eq!(artifact.checksum, sha256_digest(b"repository snapshot"));
    assert!(artifact.revision.as_str().starts_with("main/"));
    assert_eq!(object.status.observed_generation, object.generation);

    let relative = artifact
        .url
        .split_once("/gitrepository/")
        .map(|(_, rest)| format!("gitrepository/{rest}"))
        .unwrap();
    let served = client
        .get(format!("http://{}/{relative}", running.storage_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(served.status(), 200);
    assert_eq!(&served.bytes().await.unwrap()[..], b"repository snapshot");

    let helm = ObjectRef::new(ResourceKind::HelmRepository, "flux-system", "charts").unwrap();
    let object = wait_ready(&store, &helm).await;
    let artifact = object.status.artifact.unwrap();
    assert_eq!(artifact.revision.as_str(), sha256_digest(INDEX.as_bytes()).to_hex());
    assert!(artifact.url.ends_with(".yaml"));

    // The pointer file is never served.
    let hidden = client
        .get(format!(
            "http://{}/gitrepository/flux-system/podinfo/.current",
            running.storage_addr()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(hidden.status(), 404);

    let ready = client
        .get(format!("http://{}/readyz", running.metrics_addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_fetch_is_reported_on_status() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&upstream)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("sources.yaml");
    std::fs::write(
        &manifest,
        format!(
            "- kind: GitRepository\n  metadata: {{name: broken}}\n  spec:\n    url: {}/missing.tar.gz\n",
            upstream.uri()
        ),
    )
    .unwrap();

    let runtime = bootstrap(config(tmp.path(), &manifest), Environment::default()).unwrap();
    let store = runtime.store().clone();
    let running = runtime.start().await.unwrap();

    let id = ObjectRef::new(ResourceKind::GitRepository, "default", "broken").unwrap();
    let mut reported = None;
    for _ in 0..200 {
        let condition = store
            .snapshot(&id)
            .and_then(|o| o.status.ready_condition().cloned());
        if condition.is_some() {
            reported = condition;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let condition = reported.expect("failure was never published");
    assert_eq!(condition.status, sctl_core::ConditionStatus::False);
    assert_eq!(condition.reason, sctl_core::ConditionReason::FetchFailed);
    assert!(store.snapshot(&id).unwrap().status.artifact.is_none());

    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_deleting_a_source_removes_its_artifacts() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"snapshot".to_vec()))
        .mount(&upstream)
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("sources.yaml");
    std::fs::write(
        &manifest,
        format!(
            "- kind: GitRepository\n  metadata: {{name: short-lived}}\n  spec:\n    url: {}/a.tar.gz\n",
            upstream.uri()
        ),
    )
    .unwrap();

    let runtime = bootstrap(config(tmp.path(), &manifest), Environment::default()).unwrap();
    let store = runtime.store().clone();
    let storage = runtime.storage().clone();
    let running = runtime.start().await.unwrap();

    let id = ObjectRef::new(ResourceKind::GitRepository, "default", "short-lived").unwrap();
    wait_ready(&store, &id).await;
    assert!(storage.owner_dir(&id).is_dir());

    store.remove(&id);
    for _ in 0..200 {
        if !storage.owner_dir(&id).exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!storage.owner_dir(&id).exists());

    running.shutdown().await;
}
