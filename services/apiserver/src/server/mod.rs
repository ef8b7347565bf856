//! HTTP surface: standard Kubernetes resource endpoints over the registry.
//!
//! # Purpose
//! Routes `/api/v1/...` and `/apis/<group>/<version>/...` requests to the
//! registered storages, translates categorized storage errors into
//! Kubernetes `Status` responses, streams watches as newline-delimited JSON
//! and serves the minimal discovery documents clients need. Authentication
//! and authorization are a stub: every request is allowed, and
//! `subjectaccessreviews` always answers `allowed`.

use crate::registry::{DynStorage, Registry};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use osprey_kube::{ListOptions, RequestContext, StorageError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Version reported to clients; 1.19 makes them prefer
/// `networking.k8s.io/v1` over the deprecated beta Ingress group.
const REPORTED_VERSION: &str = "v1.19.0";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

pub fn build_router(registry: Arc<Registry>) -> Router {
    let state = AppState { registry };
    Router::new()
        .route("/version", get(version))
        .route("/api", get(api_versions))
        .route("/apis", get(api_groups))
        .route("/api/v1", get(core_discovery))
        .route(
            "/apis/authorization.k8s.io/v1/subjectaccessreviews",
            post(subject_access_review),
        )
        .route(
            "/api/v1/:resource",
            get(core_collection_get)
                .post(core_collection_post)
                .delete(core_collection_delete),
        )
        .route(
            "/api/v1/:resource/:name",
            get(core_item_get)
                .put(core_item_put)
                .patch(core_item_patch)
                .delete(core_item_delete),
        )
        .route(
            "/api/v1/namespaces/:namespace/:resource",
            get(core_ns_collection_get)
                .post(core_ns_collection_post)
                .delete(core_ns_collection_delete),
        )
        .route(
            "/api/v1/namespaces/:namespace/:resource/:name",
            get(core_ns_item_get)
                .put(core_ns_item_put)
                .patch(core_ns_item_patch)
                .delete(core_ns_item_delete),
        )
        .route("/apis/:group/:version", get(group_discovery))
        .route(
            "/apis/:group/:version/:resource",
            get(group_collection_get)
                .post(group_collection_post)
                .delete(group_collection_delete),
        )
        .route(
            "/apis/:group/:version/:resource/:name",
            get(group_item_get)
                .put(group_item_put)
                .patch(group_item_patch)
                .delete(group_item_delete),
        )
        .route(
            "/apis/:group/:version/namespaces/:namespace/:resource",
            get(group_ns_collection_get)
                .post(group_ns_collection_post)
                .delete(group_ns_collection_delete),
        )
        .route(
            "/apis/:group/:version/namespaces/:namespace/:resource/:name",
            get(group_ns_item_get)
                .put(group_ns_item_put)
                .patch(group_ns_item_patch)
                .delete(group_ns_item_delete),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error translation

fn status_body(code: u16, reason: &str, message: String) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    })
}

fn error_response(err: StorageError) -> Response {
    let (status, reason) = match &err {
        StorageError::NotFound { .. } => (StatusCode::NOT_FOUND, "NotFound"),
        StorageError::Conflict { reason, .. } => {
            if reason.contains("already exists") {
                (StatusCode::CONFLICT, "AlreadyExists")
            } else {
                (StatusCode::CONFLICT, "Conflict")
            }
        }
        StorageError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
        StorageError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable"),
        StorageError::Internal(_) => {
            tracing::error!(error = %err, "storage error");
            (StatusCode::INTERNAL_SERVER_ERROR, "InternalError")
        }
    };
    (
        status,
        Json(status_body(status.as_u16(), reason, err.to_string())),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Shared request plumbing

fn lookup(
    state: &AppState,
    group: &str,
    version: &str,
    resource: &str,
) -> Result<Arc<dyn DynStorage>, Response> {
    state.registry.get(group, version, resource).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(status_body(
                404,
                "NotFound",
                format!("the server could not find the requested resource {resource:?}"),
            )),
        )
            .into_response()
    })
}

fn list_options(params: &HashMap<String, String>) -> ListOptions {
    ListOptions {
        label_selector: params.get("labelSelector").cloned(),
        field_selector: params.get("fieldSelector").cloned(),
    }
}

fn request_context(namespace: Option<String>) -> RequestContext {
    RequestContext { namespace }
}

/// Accepts JSON and, because clients occasionally post manifests verbatim,
/// YAML bodies.
fn parse_body(body: &Bytes) -> Result<Value, Response> {
    serde_yaml::from_slice::<Value>(body).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(status_body(
                400,
                "BadRequest",
                format!("unparsable request body: {err}"),
            )),
        )
            .into_response()
    })
}

async fn handle_collection_get(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    params: HashMap<String, String>,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    let ctx = request_context(namespace);
    let options = list_options(&params);

    let watching = params
        .get("watch")
        .is_some_and(|v| v == "true" || v == "1");
    if watching {
        return match storage.watch(&ctx, &options).await {
            Ok(stream) => {
                let body = stream.map(|event| {
                    let line = json!({
                        "type": event.event_type,
                        "object": event.object,
                    });
                    Ok::<_, std::convert::Infallible>(Bytes::from(format!("{line}\n")))
                });
                Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from_stream(body))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(err) => error_response(err),
        };
    }

    match storage.list(&ctx, &options).await {
        Ok(list) => Json(list).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_create(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    body: Bytes,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    let payload = match parse_body(&body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    match storage.create(&request_context(namespace), payload).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_collection_delete(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    params: HashMap<String, String>,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    match storage
        .delete_collection(&request_context(namespace), &list_options(&params))
        .await
    {
        Ok(deleted) => Json(deleted).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_item_get(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: String,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    match storage.get(&request_context(namespace), &name).await {
        Ok(obj) => Json(obj).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_item_put(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: String,
    body: Bytes,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    let payload = match parse_body(&body) {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    match storage
        .update(&request_context(namespace), &name, payload)
        .await
    {
        Ok((updated, created)) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(updated)).into_response()
        }
        Err(err) => error_response(err),
    }
}

/// RFC 7386 JSON merge patch.
fn json_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch_map) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Some(target_map) = target.as_object_mut() {
                for (key, value) in patch_map {
                    if value.is_null() {
                        target_map.remove(key);
                    } else {
                        json_merge_patch(
                            target_map.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

async fn handle_item_patch(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: String,
    body: Bytes,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    let patch = match parse_body(&body) {
        Ok(patch) => patch,
        Err(response) => return response,
    };
    let ctx = request_context(namespace);
    let mut current = match storage.get(&ctx, &name).await {
        Ok(current) => current,
        Err(err) => return error_response(err),
    };
    json_merge_patch(&mut current, &patch);
    match storage.update(&ctx, &name, current).await {
        Ok((updated, _)) => Json(updated).into_response(),
        Err(err) => error_response(err),
    }
}

async fn handle_item_delete(
    state: AppState,
    group: String,
    version: String,
    resource: String,
    namespace: Option<String>,
    name: String,
) -> Response {
    let storage = match lookup(&state, &group, &version, &resource) {
        Ok(storage) => storage,
        Err(response) => return response,
    };
    match storage.delete(&request_context(namespace), &name).await {
        Ok(deleted) => Json(deleted).into_response(),
        Err(err) => error_response(err),
    }
}

// ---------------------------------------------------------------------------
// Route adapters (core group)

async fn core_collection_get(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_get(state, String::new(), "v1".into(), resource, None, params).await
}

async fn core_collection_post(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    body: Bytes,
) -> Response {
    handle_create(state, String::new(), "v1".into(), resource, None, body).await
}

async fn core_collection_delete(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_delete(state, String::new(), "v1".into(), resource, None, params).await
}

async fn core_item_get(
    State(state): State<AppState>,
    Path((resource, name)): Path<(String, String)>,
) -> Response {
    handle_item_get(state, String::new(), "v1".into(), resource, None, name).await
}

async fn core_item_put(
    State(state): State<AppState>,
    Path((resource, name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    handle_item_put(state, String::new(), "v1".into(), resource, None, name, body).await
}

async fn core_item_patch(
    State(state): State<AppState>,
    Path((resource, name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    handle_item_patch(state, String::new(), "v1".into(), resource, None, name, body).await
}

async fn core_item_delete(
    State(state): State<AppState>,
    Path((resource, name)): Path<(String, String)>,
) -> Response {
    handle_item_delete(state, String::new(), "v1".into(), resource, None, name).await
}

async fn core_ns_collection_get(
    State(state): State<AppState>,
    Path((namespace, resource)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_get(state, String::new(), "v1".into(), resource, Some(namespace), params)
        .await
}

async fn core_ns_collection_post(
    State(state): State<AppState>,
    Path((namespace, resource)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    handle_create(state, String::new(), "v1".into(), resource, Some(namespace), body).await
}

async fn core_ns_collection_delete(
    State(state): State<AppState>,
    Path((namespace, resource)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_delete(
        state,
        String::new(),
        "v1".into(),
        resource,
        Some(namespace),
        params,
    )
    .await
}

async fn core_ns_item_get(
    State(state): State<AppState>,
    Path((namespace, resource, name)): Path<(String, String, String)>,
) -> Response {
    handle_item_get(state, String::new(), "v1".into(), resource, Some(namespace), name).await
}

async fn core_ns_item_put(
    State(state): State<AppState>,
    Path((namespace, resource, name)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    handle_item_put(
        state,
        String::new(),
        "v1".into(),
        resource,
        Some(namespace),
        name,
        body,
    )
    .await
}

async fn core_ns_item_patch(
    State(state): State<AppState>,
    Path((namespace, resource, name)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    handle_item_patch(
        state,
        String::new(),
        "v1".into(),
        resource,
        Some(namespace),
        name,
        body,
    )
    .await
}

async fn core_ns_item_delete(
    State(state): State<AppState>,
    Path((namespace, resource, name)): Path<(String, String, String)>,
) -> Response {
    handle_item_delete(state, String::new(), "v1".into(), resource, Some(namespace), name).await
}

// ---------------------------------------------------------------------------
// Route adapters (named groups)

async fn group_collection_get(
    State(state): State<AppState>,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_get(state, group, version, resource, None, params).await
}

async fn group_collection_post(
    State(state): State<AppState>,
    Path((group, version, resource)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    handle_create(state, group, version, resource, None, body).await
}

async fn group_collection_delete(
    State(state): State<AppState>,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_delete(state, group, version, resource, None, params).await
}

async fn group_item_get(
    State(state): State<AppState>,
    Path((group, version, resource, name)): Path<(String, String, String, String)>,
) -> Response {
    handle_item_get(state, group, version, resource, None, name).await
}

async fn group_item_put(
    State(state): State<AppState>,
    Path((group, version, resource, name)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    handle_item_put(state, group, version, resource, None, name, body).await
}

async fn group_item_patch(
    State(state): State<AppState>,
    Path((group, version, resource, name)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    handle_item_patch(state, group, version, resource, None, name, body).await
}

async fn group_item_delete(
    State(state): State<AppState>,
    Path((group, version, resource, name)): Path<(String, String, String, String)>,
) -> Response {
    handle_item_delete(state, group, version, resource, None, name).await
}

async fn group_ns_collection_get(
    State(state): State<AppState>,
    Path((group, version, namespace, resource)): Path<(String, String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_get(state, group, version, resource, Some(namespace), params).await
}

async fn group_ns_collection_post(
    State(state): State<AppState>,
    Path((group, version, namespace, resource)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Response {
    handle_create(state, group, version, resource, Some(namespace), body).await
}

async fn group_ns_collection_delete(
    State(state): State<AppState>,
    Path((group, version, namespace, resource)): Path<(String, String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    handle_collection_delete(state, group, version, resource, Some(namespace), params).await
}

async fn group_ns_item_get(
    State(state): State<AppState>,
    Path((group, version, namespace, resource, name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Response {
    handle_item_get(state, group, version, resource, Some(namespace), name).await
}

async fn group_ns_item_put(
    State(state): State<AppState>,
    Path((group, version, namespace, resource, name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    body: Bytes,
) -> Response {
    handle_item_put(state, group, version, resource, Some(namespace), name, body).await
}

async fn group_ns_item_patch(
    State(state): State<AppState>,
    Path((group, version, namespace, resource, name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    body: Bytes,
) -> Response {
    handle_item_patch(state, group, version, resource, Some(namespace), name, body).await
}

async fn group_ns_item_delete(
    State(state): State<AppState>,
    Path((group, version, namespace, resource, name)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Response {
    handle_item_delete(state, group, version, resource, Some(namespace), name).await
}

// ---------------------------------------------------------------------------
// Discovery and stubs

async fn version() -> Json<Value> {
    Json(json!({
        "major": "1",
        "minor": "19",
        "gitVersion": REPORTED_VERSION,
        "platform": std::env::consts::OS,
    }))
}

async fn api_versions() -> Json<Value> {
    Json(json!({
        "kind": "APIVersions",
        "versions": ["v1"],
        "serverAddressByClientCIDRs": [],
    }))
}

async fn api_groups(State(state): State<AppState>) -> Json<Value> {
    let mut groups: Vec<Value> = Vec::new();
    for (group, version) in state.registry.group_versions() {
        if group.is_empty() {
            continue;
        }
        let group_version = format!("{group}/{version}");
        groups.push(json!({
            "name": group,
            "versions": [{"groupVersion": group_version, "version": version}],
            "preferredVersion": {"groupVersion": group_version, "version": version},
        }));
    }
    Json(json!({"kind": "APIGroupList", "apiVersion": "v1", "groups": groups}))
}

fn resource_list(state: &AppState, group: &str, version: &str) -> Value {
    let group_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    let mut resources: Vec<Value> = state
        .registry
        .iter()
        .filter(|storage| storage.info().group == group && storage.info().version == version)
        .map(|storage| {
            let info = storage.info();
            json!({
                "name": info.plural,
                "singularName": info.singular,
                "namespaced": info.namespaced,
                "kind": info.kind,
                "verbs": ["create", "delete", "deletecollection", "get", "list", "patch", "update", "watch"],
            })
        })
        .collect();
    resources.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
    json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": group_version,
        "resources": resources,
    })
}

async fn core_discovery(State(state): State<AppState>) -> Json<Value> {
    Json(resource_list(&state, "", "v1"))
}

async fn group_discovery(
    State(state): State<AppState>,
    Path((group, version)): Path<(String, String)>,
) -> Json<Value> {
    Json(resource_list(&state, &group, &version))
}

/// Always-allow authorization stub.
async fn subject_access_review(body: Bytes) -> Response {
    let mut review = match parse_body(&body) {
        Ok(review) => review,
        Err(response) => return response,
    };
    let Some(fields) = review.as_object_mut() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(status_body(
                400,
                "BadRequest",
                "request body is not an object".to_string(),
            )),
        )
            .into_response();
    };
    fields.insert("status".to_string(), json!({"allowed": true}));
    (StatusCode::CREATED, Json(review)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_patch_follows_rfc_7386() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        let patch = json!({"a": {"b": 9, "c": null}, "e": 4});
        json_merge_patch(&mut target, &patch);
        assert_eq!(target, json!({"a": {"b": 9}, "d": 3, "e": 4}));
    }

    #[test]
    fn merge_patch_replaces_non_objects() {
        let mut target = json!({"a": [1, 2]});
        json_merge_patch(&mut target, &json!({"a": [3]}));
        assert_eq!(target, json!({"a": [3]}));

        let mut scalar = json!(5);
        json_merge_patch(&mut scalar, &json!({"x": 1}));
        assert_eq!(scalar, json!({"x": 1}));
    }

    #[test]
    fn status_body_shape() {
        let body = status_body(404, "NotFound", "missing".to_string());
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["code"], 404);
        assert_eq!(body["reason"], "NotFound");
    }
}
