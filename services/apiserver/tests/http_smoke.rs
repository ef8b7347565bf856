//! End-to-end smoke of the HTTP surface over a file-backed registry.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use osprey_apiserver::registry::{build_registry, Registry, StorageBackend};
use osprey_apiserver::server::build_router;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_registry(dir: &TempDir) -> Arc<Registry> {
    let backend = StorageBackend::File {
        root: dir.path().to_path_buf(),
    };
    Arc::new(build_registry(&backend).expect("registry"))
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn read_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn version_and_discovery() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/version")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("version");
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["gitVersion"], "v1.19.0");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/apis")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("apis");
    let payload = read_json(response).await;
    let groups: Vec<&str> = payload["groups"]
        .as_array()
        .expect("groups")
        .iter()
        .filter_map(|g| g["name"].as_str())
        .collect();
    assert!(groups.contains(&"networking.k8s.io"));
    assert!(groups.contains(&"gateway.networking.k8s.io"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("core discovery");
    let payload = read_json(response).await;
    let names: Vec<&str> = payload["resources"]
        .as_array()
        .expect("resources")
        .iter()
        .filter_map(|r| r["name"].as_str())
        .collect();
    assert!(names.contains(&"configmaps"));
    assert!(names.contains(&"secrets"));

    registry.destroy_all();
}

#[tokio::test]
async fn configmap_crud_over_http() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));
    let base = "/api/v1/namespaces/osprey-system/configmaps";

    let create = json_request(
        "POST",
        base,
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm1"},
            "data": {"a": "1"},
        }),
    );
    let response = app.clone().oneshot(create).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    assert_eq!(created["metadata"]["resourceVersion"], "1");
    assert_eq!(created["metadata"]["namespace"], "osprey-system");

    let duplicate = json_request(
        "POST",
        base,
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm1"},
        }),
    );
    let response = app.clone().oneshot(duplicate).await.expect("duplicate");
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let status = read_json(response).await;
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["reason"], "AlreadyExists");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("{base}/cm1"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("get");
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = read_json(response).await;
    assert_eq!(fetched["data"]["a"], "1");

    // Stale resourceVersion on PUT is a conflict.
    let stale = json_request(
        "PUT",
        &format!("{base}/cm1"),
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm1", "resourceVersion": "42"},
            "data": {"a": "2"},
        }),
    );
    let response = app.clone().oneshot(stale).await.expect("stale put");
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Merge patch bumps the version.
    let patch = json_request(
        "PATCH",
        &format!("{base}/cm1"),
        serde_json::json!({"data": {"b": "2"}}),
    );
    let response = app.clone().oneshot(patch).await.expect("patch");
    assert_eq!(response.status(), StatusCode::OK);
    let patched = read_json(response).await;
    assert_eq!(patched["data"]["a"], "1");
    assert_eq!(patched["data"]["b"], "2");
    assert_eq!(patched["metadata"]["resourceVersion"], "2");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("{base}?labelSelector="))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    let list = read_json(response).await;
    assert_eq!(list["kind"], "ConfigMapList");
    assert_eq!(list["items"].as_array().expect("items").len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("{base}/cm1"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("delete");
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("{base}/cm1"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("get after delete");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let status = read_json(response).await;
    assert_eq!(status["reason"], "NotFound");

    registry.destroy_all();
}

#[tokio::test]
async fn yaml_bodies_are_accepted() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));

    let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: from-yaml\ndata:\n  a: \"1\"\n";
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/namespaces/osprey-system/configmaps")
        .header("content-type", "application/yaml")
        .body(Body::from(yaml))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    assert_eq!(created["metadata"]["name"], "from-yaml");

    registry.destroy_all();
}

#[tokio::test]
async fn ingress_group_routes_and_unknown_resources() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));

    let create = json_request(
        "POST",
        "/apis/networking.k8s.io/v1/namespaces/osprey-system/ingresses",
        serde_json::json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": {"name": "web"},
            "spec": {"rules": [{"host": "a.example.com"}]},
        }),
    );
    let response = app.clone().oneshot(create).await.expect("create");
    assert_eq!(response.status(), StatusCode::CREATED);

    // The file carries the flat form.
    let raw =
        std::fs::read_to_string(dir.path().join("ingresses/web.yaml")).expect("ingress file");
    assert!(raw.contains("rules:"));
    assert!(!raw.contains("apiVersion"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/apis/networking.k8s.io/v1/namespaces/osprey-system/ingresses/web")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("get");
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = read_json(response).await;
    assert_eq!(fetched["spec"]["rules"][0]["host"], "a.example.com");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/apis/widgets.example.com/v1/widgets")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("unknown resource");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    registry.destroy_all();
}

#[tokio::test]
async fn subject_access_review_always_allows() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));

    let request = json_request(
        "POST",
        "/apis/authorization.k8s.io/v1/subjectaccessreviews",
        serde_json::json!({
            "apiVersion": "authorization.k8s.io/v1",
            "kind": "SubjectAccessReview",
            "spec": {"user": "anyone"},
        }),
    );
    let response = app.clone().oneshot(request).await.expect("review");
    assert_eq!(response.status(), StatusCode::CREATED);
    let review = read_json(response).await;
    assert_eq!(review["status"]["allowed"], true);

    registry.destroy_all();
}

#[tokio::test]
async fn crd_catalog_is_read_only() {
    let dir = TempDir::new().expect("tempdir");
    let registry = test_registry(&dir);
    let app = build_router(Arc::clone(&registry));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/apis/apiextensions.k8s.io/v1/customresourcedefinitions")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    assert_eq!(response.status(), StatusCode::OK);

    let create = json_request(
        "POST",
        "/apis/apiextensions.k8s.io/v1/customresourcedefinitions",
        serde_json::json!({"metadata": {"name": "x"}}),
    );
    let response = app.clone().oneshot(create).await.expect("create");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    registry.destroy_all();
}
