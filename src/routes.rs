use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{ServerConfig, Timeouts};
use crate::crd::{CrdResolver, CustomResourceHandler};
use crate::error::{Error, Result};
use crate::events::involved_object_events;
use crate::handler::{ResourceHandler, object_namespace};
use crate::model::{
    BatchReport, BatchRestartRequest, DrainOptions, NamespaceScope, ScaleRequest, TaintRequest,
    UntaintRequest,
};
use crate::node::{HostConfig, NodeOperations, NodeService};
use crate::pod::PodOperations;
use crate::registry::ResourceRegistry;
use crate::workload::WorkloadOperations;

#[derive(Clone)]
pub struct AppState {
    client: Client,
    registry: Arc<ResourceRegistry>,
    crds: CrdResolver,
    pods: PodOperations,
    nodes: NodeOperations,
    timeouts: Timeouts,
}

impl AppState {
    pub fn new(client: Client, config: &ServerConfig) -> Self {
        Self {
            registry: Arc::new(ResourceRegistry::new(client.clone())),
            crds: CrdResolver::new(client.clone()),
            pods: PodOperations::new(client.clone()),
            nodes: NodeOperations::new(client.clone(), config),
            timeouts: config.timeouts,
            client,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/api/v1/{resource}",
            get(list_cluster_wide).post(create_cluster_wide),
        )
        .route(
            "/api/v1/{resource}/{namespace}",
            get(list_resources).post(create_resource),
        )
        .route(
            "/api/v1/{resource}/{namespace}/{name}",
            get(get_resource)
                .put(update_resource)
                .delete(delete_resource)
                .post(batch_restart),
        )
        .route(
            "/api/v1/{resource}/{namespace}/{name}/{action}",
            get(resource_query).post(resource_action),
        )
        .with_state(state)
}

enum Resolved {
    Builtin(Arc<dyn ResourceHandler>),
    Custom(CustomResourceHandler),
}

impl Resolved {
    fn handler(&self) -> &dyn ResourceHandler {
        match self {
            Resolved::Builtin(handler) => handler.as_ref(),
            Resolved::Custom(handler) => handler,
        }
    }
}

async fn resolve(state: &AppState, resource: &str) -> Result<Resolved> {
    if let Some(handler) = state.registry.get(resource) {
        return Ok(Resolved::Builtin(handler));
    }
    let handler = state.crds.handler(resource).await?;
    debug!(
        resource,
        crd = %handler.resource_type().crd_name,
        "dispatching to custom resource handler"
    );
    Ok(Resolved::Custom(handler))
}

async fn bounded<T>(limit: Duration, operation: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| Error::Timeout)?
}

/// Empty bodies decode as `{}` so option-only actions can be posted bare.
fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let raw = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(raw)
        .map_err(|error| Error::bad_request(format!("invalid request body: {error}")))
}

fn namespace_of<'a>(kind: &str, scope: &'a NamespaceScope) -> Result<&'a str> {
    object_namespace(kind, true, scope)?
        .ok_or_else(|| Error::bad_request(format!("namespace is required for {kind}")))
}

async fn list_cluster_wide(
    State(state): State<AppState>,
    Path(resource): Path<String>,
) -> Result<Json<Value>> {
    list_in(&state, &resource, NamespaceScope::All).await
}

async fn list_resources(
    State(state): State<AppState>,
    Path((resource, namespace)): Path<(String, String)>,
) -> Result<Json<Value>> {
    list_in(&state, &resource, NamespaceScope::from_segment(&namespace)).await
}

async fn list_in(state: &AppState, resource: &str, scope: NamespaceScope) -> Result<Json<Value>> {
    bounded(state.timeouts.request, async {
        let resolved = resolve(state, resource).await?;
        resolved.handler().list(&scope).await.map(Json)
    })
    .await
}

async fn create_cluster_wide(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    create_in(&state, &resource, NamespaceScope::All, &body).await
}

async fn create_resource(
    State(state): State<AppState>,
    Path((resource, namespace)): Path<(String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    create_in(&state, &resource, NamespaceScope::from_segment(&namespace), &body).await
}

async fn create_in(
    state: &AppState,
    resource: &str,
    scope: NamespaceScope,
    body: &[u8],
) -> Result<(StatusCode, Json<Value>)> {
    let body: Value = parse_body(body)?;
    bounded(state.timeouts.request, async {
        let resolved = resolve(state, resource).await?;
        let created = resolved.handler().create(&scope, body).await?;
        Ok((StatusCode::CREATED, Json(created)))
    })
    .await
}

async fn get_resource(
    State(state): State<AppState>,
    Path((resource, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    let scope = NamespaceScope::from_segment(&namespace);
    bounded(state.timeouts.request, async {
        let resolved = resolve(&state, &resource).await?;
        resolved.handler().get(&scope, &name).await.map(Json)
    })
    .await
}

async fn update_resource(
    State(state): State<AppState>,
    Path((resource, namespace, name)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<Json<Value>> {
    let scope = NamespaceScope::from_segment(&namespace);
    let body: Value = parse_body(&body)?;
    bounded(state.timeouts.request, async {
        let resolved = resolve(&state, &resource).await?;
        resolved.handler().update(&scope, &name, body).await.map(Json)
    })
    .await
}

async fn delete_resource(
    State(state): State<AppState>,
    Path((resource, namespace, name)): Path<(String, String, String)>,
) -> Result<Json<Value>> {
    let scope = NamespaceScope::from_segment(&namespace);
    bounded(state.timeouts.request, async {
        let resolved = resolve(&state, &resource).await?;
        let handler = resolved.handler();
        handler.delete(&scope, &name).await?;
        Ok(Json(json!({
            "message": format!("{} {name} deleted", handler.kind()),
        })))
    })
    .await
}

/// `POST /api/v1/{pods|deployments}/batch/restart`; the batch deadline is
/// enforced per item inside the runner.
async fn batch_restart(
    State(state): State<AppState>,
    Path((resource, namespace, name)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchReport>)> {
    if namespace != "batch" || name != "restart" {
        return Err(Error::not_found(format!(
            "no POST operation at /api/v1/{resource}/{namespace}/{name}"
        )));
    }
    let request: BatchRestartRequest = parse_body(&body)?;
    if request.items.is_empty() {
        return Err(Error::bad_request("no items to restart"));
    }

    let deadline = state.timeouts.batch;
    let report = match resource.as_str() {
        "pods" => state.pods.batch_restart(request.items, deadline).await,
        "deployments" => {
            WorkloadOperations::<Deployment>::new(state.client.clone())
                .batch_restart(request.items, deadline)
                .await
        }
        other => {
            return Err(Error::bad_request(format!(
                "batch restart is not supported for {other}"
            )));
        }
    };
    Ok((report.status_code(), Json(report)))
}

async fn resource_query(
    State(state): State<AppState>,
    Path((resource, namespace, name, action)): Path<(String, String, String, String)>,
) -> Result<Json<Value>> {
    let scope = NamespaceScope::from_segment(&namespace);
    if resource == "nodes" {
        object_namespace("Node", false, &scope)?;
        let config = match action.as_str() {
            "events" => {
                return bounded(state.timeouts.request, state.nodes.events(&name))
                    .await
                    .map(Json);
            }
            "containerd-config" => HostConfig::Containerd,
            "cni-config" => HostConfig::Cni,
            _ => return Err(unknown_action(&resource, &action)),
        };
        // The reader pod is awaited for up to the request timeout on its own.
        return bounded(state.timeouts.batch, state.nodes.read_host_config(&name, config))
            .await
            .map(Json);
    }

    bounded(state.timeouts.request, async {
        match (resolve(&state, &resource).await?, action.as_str()) {
            (Resolved::Custom(handler), "related") => {
                let related = handler.related(&scope, &name).await?;
                Ok(Json(serde_json::to_value(related)?))
            }
            (Resolved::Custom(handler), "events") => handler.events(&scope, &name).await.map(Json),
            (Resolved::Builtin(handler), "events") => {
                let namespace = object_namespace(handler.kind(), handler.namespaced(), &scope)?;
                involved_object_events(state.client.clone(), namespace, handler.kind(), &name)
                    .await
                    .map(Json)
            }
            _ => Err(unknown_action(&resource, &action)),
        }
    })
    .await
}

async fn resource_action(
    State(state): State<AppState>,
    Path((resource, namespace, name, action)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Result<Json<Value>> {
    let scope = NamespaceScope::from_segment(&namespace);
    if resource == "nodes" {
        object_namespace("Node", false, &scope)?;
        return node_action(&state, &name, &action, &body).await.map(Json);
    }

    let client = state.client.clone();
    bounded(state.timeouts.request, async {
        let outcome = match (resource.as_str(), action.as_str()) {
            ("pods", "restart") => {
                let namespace = namespace_of("Pod", &scope)?;
                state.pods.restart(namespace, &name).await
            }
            ("deployments", "restart") => {
                let namespace = namespace_of("Deployment", &scope)?;
                WorkloadOperations::<Deployment>::new(client)
                    .restart(namespace, &name)
                    .await
            }
            ("statefulsets", "restart") => {
                let namespace = namespace_of("StatefulSet", &scope)?;
                WorkloadOperations::<StatefulSet>::new(client)
                    .restart(namespace, &name)
                    .await
            }
            ("daemonsets", "restart") => {
                let namespace = namespace_of("DaemonSet", &scope)?;
                WorkloadOperations::<DaemonSet>::new(client)
                    .restart(namespace, &name)
                    .await
            }
            ("deployments", "scale") => {
                let namespace = namespace_of("Deployment", &scope)?;
                let replicas = requested_replicas(&body)?;
                WorkloadOperations::<Deployment>::new(client)
                    .scale(namespace, &name, replicas)
                    .await
            }
            ("statefulsets", "scale") => {
                let namespace = namespace_of("StatefulSet", &scope)?;
                let replicas = requested_replicas(&body)?;
                WorkloadOperations::<StatefulSet>::new(client)
                    .scale(namespace, &name, replicas)
                    .await
            }
            (_, "restart" | "scale") => match resolve(&state, &resource).await? {
                Resolved::Custom(handler) if action == "scale" => {
                    let replicas = requested_replicas(&body)?;
                    handler.scale(&scope, &name, replicas).await
                }
                Resolved::Custom(handler) => handler.restart(&scope, &name).await,
                Resolved::Builtin(_) => Err(Error::bad_request(format!(
                    "{action} is not supported for {resource}"
                ))),
            },
            _ => Err(unknown_action(&resource, &action)),
        };
        outcome.map(Json)
    })
    .await
}

async fn node_action(state: &AppState, name: &str, action: &str, body: &[u8]) -> Result<Value> {
    let nodes = &state.nodes;
    let limit = state.timeouts.request;
    match action {
        "cordon" => bounded(limit, nodes.set_unschedulable(name, true)).await,
        "uncordon" => bounded(limit, nodes.set_unschedulable(name, false)).await,
        "taint" => {
            let request: TaintRequest = parse_body(body)?;
            bounded(limit, nodes.taint(name, request)).await
        }
        "untaint" => {
            let request: UntaintRequest = parse_body(body)?;
            bounded(limit, nodes.untaint(name, &request.key)).await
        }
        "drain" => {
            let options: DrainOptions = parse_body(body)?;
            let report = bounded(state.timeouts.batch, nodes.drain(name, options)).await?;
            Ok(serde_json::to_value(report)?)
        }
        "restart-kubelet" | "restart-kubeproxy" => {
            let service = if action == "restart-kubelet" {
                NodeService::Kubelet
            } else {
                NodeService::KubeProxy
            };
            let handle = bounded(limit, nodes.restart_service(name, service)).await?;
            Ok(serde_json::to_value(handle)?)
        }
        _ => Err(unknown_action("nodes", action)),
    }
}

fn requested_replicas(body: &[u8]) -> Result<i32> {
    let request: ScaleRequest = parse_body(body)?;
    request
        .replicas()
        .ok_or_else(|| Error::bad_request("replicas must be a non-negative integer"))
}

fn unknown_action(resource: &str, action: &str) -> Error {
    Error::not_found(format!("unknown action {action} for {resource}"))
}
