use axum::http::{Method, Request, Response, StatusCode};
use kube::Client;
use kube::client::Body;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

pub const LOG_ANNOTATION: &str = "fake.kite.dev/log";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: String,
    pub body: Value,
}

#[derive(Default)]
struct ApiState {
    objects: BTreeMap<String, Value>,
    requests: Vec<RecordedRequest>,
    revision: u64,
    failing_paths: BTreeMap<String, u16>,
    completed_pod_log: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakeApiServer {
    state: Arc<Mutex<ApiState>>,
}

enum Target {
    Collection(String),
    Object(String),
    Subresource(String, String),
}

enum Reply {
    Json(StatusCode, Value),
    Text(String),
}

impl FakeApiServer {
    pub fn with_objects(objects: impl IntoIterator<Item = Value>) -> Self {
        let server = Self::default();
        for object in objects {
            server.insert(object);
        }
        server
    }

    pub fn insert(&self, mut object: Value) {
        let path = object_path(&object);
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let revision = state.revision.to_string();
        let metadata = metadata_mut(&mut object);
        let uid = format!("uid-{}", path.replace('/', "-"));
        metadata.entry("uid").or_insert(json!(uid));
        metadata.entry("resourceVersion").or_insert(json!(revision));
        state.objects.insert(path, object);
    }

    /// Makes every request touching `path` fail with `code`.
    pub fn fail_path(&self, path: &str, code: u16) {
        let mut state = self.state.lock().unwrap();
        state.failing_paths.insert(path.to_string(), code);
    }

    /// Pods created from now on finish immediately and log `log`.
    pub fn complete_pods_with_log(&self, log: &str) {
        self.state.lock().unwrap().completed_pod_log = Some(log.to_string());
    }

    pub fn object(&self, path: &str) -> Option<Value> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn objects_under(&self, prefix: &str) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, object)| object.clone())
            .collect()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn last_request(&self, method: &str) -> Option<RecordedRequest> {
        self.requests()
            .into_iter()
            .rev()
            .find(|request| request.method == method)
    }

    pub fn client(&self) -> Client {
        let server = self.clone();
        let service = tower::service_fn(move |request: Request<Body>| {
            let server = server.clone();
            async move { Ok::<_, Infallible>(server.handle(request).await) }
        });
        Client::new(service, "default")
    }

    async fn handle(&self, request: Request<Body>) -> Response<Body> {
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let query = request.uri().query().unwrap_or_default().to_string();
        let raw = request.into_body().collect_bytes().await.unwrap_or_default();
        let body = serde_json::from_slice(&raw).unwrap_or(Value::Null);

        let reply = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(RecordedRequest {
                method: method.to_string(),
                path: path.clone(),
                query: query.clone(),
                body: body.clone(),
            });
            state.dispatch(&method, &path, &query, body)
        };

        match reply {
            Reply::Json(status, value) => Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&value).unwrap()))
                .unwrap(),
            Reply::Text(text) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Body::from(text.into_bytes()))
                .unwrap(),
        }
    }
}

impl ApiState {
    fn dispatch(&mut self, method: &Method, path: &str, query: &str, body: Value) -> Reply {
        if let Some((_, code)) = self
            .failing_paths
            .iter()
            .find(|(prefix, _)| path.starts_with(prefix.as_str()))
        {
            let code = *code;
            return failure(code, "InternalError", &format!("injected failure for {path}"));
        }

        let Some(target) = classify(path) else {
            return failure(404, "NotFound", &format!("unsupported path {path}"));
        };

        match (method.as_str(), target) {
            ("GET", Target::Collection(collection)) => {
                self.list(&collection, name_selector(query).as_deref())
            }
            ("POST", Target::Collection(collection)) => self.create(&collection, body),
            ("GET", Target::Object(object)) => match self.objects.get(&object) {
                Some(found) => Reply::Json(StatusCode::OK, found.clone()),
                None => not_found(&object),
            },
            ("PUT", Target::Object(object)) => self.replace(&object, body),
            ("PATCH", Target::Object(object)) => self.patch(&object, &body),
            ("DELETE", Target::Object(object)) => match self.objects.remove(&object) {
                Some(_) => Reply::Json(StatusCode::OK, success(200)),
                None => not_found(&object),
            },
            ("POST", Target::Subresource(object, sub)) if sub == "eviction" => {
                match self.objects.remove(&object) {
                    Some(_) => Reply::Json(StatusCode::CREATED, success(201)),
                    None => not_found(&object),
                }
            }
            ("GET", Target::Subresource(object, sub)) if sub == "log" => {
                match self.objects.get(&object) {
                    Some(found) => Reply::Text(
                        found["metadata"]["annotations"][LOG_ANNOTATION]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                    ),
                    None => not_found(&object),
                }
            }
            _ => failure(405, "MethodNotAllowed", &format!("{method} {path}")),
        }
    }

    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn list(&self, collection: &str, name: Option<&str>) -> Reply {
        let items = self
            .objects
            .iter()
            .filter(|(path, _)| in_collection(path, collection))
            .filter(|(_, object)| name.is_none_or(|name| object["metadata"]["name"] == name))
            .map(|(_, object)| object.clone())
            .collect::<Vec<_>>();
        Reply::Json(
            StatusCode::OK,
            json!({
                "apiVersion": "v1",
                "kind": "List",
                "metadata": { "resourceVersion": self.revision.to_string() },
                "items": items,
            }),
        )
    }

    fn create(&mut self, collection: &str, mut body: Value) -> Reply {
        let Some(name) = body["metadata"]["name"].as_str().map(str::to_string) else {
            return failure(422, "Invalid", "metadata.name is required");
        };
        let path = format!("{collection}/{name}");
        if self.objects.contains_key(&path) {
            return failure(409, "AlreadyExists", &format!("{path} already exists"));
        }
        let revision = self.next_revision();
        let metadata = metadata_mut(&mut body);
        metadata.insert("uid".to_string(), json!(format!("uid-{revision}")));
        metadata.insert("resourceVersion".to_string(), json!(revision));
        if collection.ends_with("/pods")
            && let Some(log) = &self.completed_pod_log
        {
            metadata_mut(&mut body)
                .entry("annotations")
                .or_insert(json!({}))[LOG_ANNOTATION] = json!(log);
            body["status"] = json!({ "phase": "Succeeded" });
        }
        self.objects.insert(path, body.clone());
        Reply::Json(StatusCode::CREATED, body)
    }

    fn replace(&mut self, path: &str, mut body: Value) -> Reply {
        let Some(current) = self.objects.get(path) else {
            return not_found(path);
        };
        let current_version = current["metadata"]["resourceVersion"].clone();
        let current_uid = current["metadata"]["uid"].clone();
        if let Some(submitted) = body["metadata"]["resourceVersion"].as_str()
            && Some(submitted) != current_version.as_str()
        {
            return failure(
                409,
                "Conflict",
                &format!("the object at {path} has been modified; please apply your changes to the latest version"),
            );
        }
        let revision = self.next_revision();
        let metadata = metadata_mut(&mut body);
        metadata.insert("uid".to_string(), current_uid);
        metadata.insert("resourceVersion".to_string(), json!(revision));
        self.objects.insert(path.to_string(), body.clone());
        Reply::Json(StatusCode::OK, body)
    }

    fn patch(&mut self, path: &str, patch: &Value) -> Reply {
        let revision = self.next_revision();
        let Some(current) = self.objects.get_mut(path) else {
            return not_found(path);
        };
        merge_patch(current, patch);
        metadata_mut(current).insert("resourceVersion".to_string(), json!(revision));
        Reply::Json(StatusCode::OK, current.clone())
    }
}

fn classify(path: &str) -> Option<Target> {
    let segments = path.trim_matches('/').split('/').collect::<Vec<_>>();
    let prefix = match segments.first() {
        Some(&"api") => 2,
        Some(&"apis") => 3,
        _ => return None,
    };
    let rest = segments.get(prefix..)?;
    let join = |count: usize| format!("/{}", segments[..prefix + count].join("/"));
    let namespaced = rest.first() == Some(&"namespaces") && rest.len() >= 3;

    match (namespaced, rest.len()) {
        (false, 1) => Some(Target::Collection(join(1))),
        (false, 2) => Some(Target::Object(join(2))),
        (false, 3) => Some(Target::Subresource(join(2), rest[2].to_string())),
        (true, 3) => Some(Target::Collection(join(3))),
        (true, 4) => Some(Target::Object(join(4))),
        (true, 5) => Some(Target::Subresource(join(4), rest[4].to_string())),
        _ => None,
    }
}

/// Only `metadata.name=<name>` field selectors are understood.
fn name_selector(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "fieldSelector")
        .and_then(|(_, value)| {
            let decoded = value.replace("%3D", "=").replace("%3d", "=");
            decoded
                .split(',')
                .find_map(|term| term.strip_prefix("metadata.name=").map(str::to_string))
        })
}

fn in_collection(object_path: &str, collection: &str) -> bool {
    let Some((parent, _)) = object_path.rsplit_once('/') else {
        return false;
    };
    if parent == collection {
        return true;
    }
    let segments = parent.split('/').collect::<Vec<_>>();
    let Some(index) = segments.iter().position(|segment| *segment == "namespaces") else {
        return false;
    };
    if index + 2 >= segments.len() {
        return false;
    }
    let mut stripped = segments.clone();
    stripped.drain(index..index + 2);
    stripped.join("/") == collection
}

fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(object) = target.as_object_mut() else {
        return;
    };
    for (key, value) in entries {
        if value.is_null() {
            object.remove(key);
        } else {
            merge_patch(object.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn metadata_mut(object: &mut Value) -> &mut Map<String, Value> {
    if !object["metadata"].is_object() {
        object["metadata"] = json!({});
    }
    object["metadata"].as_object_mut().unwrap()
}

fn object_path(object: &Value) -> String {
    let api_version = object["apiVersion"].as_str().unwrap_or("v1");
    let prefix = if api_version.contains('/') {
        format!("/apis/{api_version}")
    } else {
        format!("/api/{api_version}")
    };
    let plural = format!(
        "{}s",
        object["kind"].as_str().unwrap_or_default().to_ascii_lowercase()
    );
    let name = object["metadata"]["name"].as_str().unwrap_or_default();
    match object["metadata"]["namespace"].as_str() {
        Some(namespace) => format!("{prefix}/namespaces/{namespace}/{plural}/{name}"),
        None => format!("{prefix}/{plural}/{name}"),
    }
}

fn success(code: u16) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Success",
        "code": code,
    })
}

fn failure(code: u16, reason: &str, message: &str) -> Reply {
    Reply::Json(
        StatusCode::from_u16(code).unwrap(),
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": message,
            "reason": reason,
            "code": code,
        }),
    )
}

fn not_found(path: &str) -> Reply {
    let name = path.rsplit('/').next().unwrap_or_default();
    failure(404, "NotFound", &format!("\"{name}\" not found"))
}

pub fn pod(namespace: &str, name: &str, labels: Value, owner_kind: Option<&str>) -> Value {
    let mut pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": { "containers": [{ "name": "main", "image": "nginx" }] },
        "status": { "phase": "Running" },
    });
    if let Some(kind) = owner_kind {
        pod["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "apps/v1",
            "kind": kind,
            "name": format!("{name}-owner"),
            "uid": format!("{name}-owner-uid"),
            "controller": true,
        }]);
    }
    pod
}

pub fn node(name: &str, spec: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": { "name": name },
        "spec": spec,
    })
}

pub fn deployment(namespace: &str, name: &str, replicas: i32) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": namespace, "labels": { "app": name } },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": { "labels": { "app": name } },
                "spec": { "containers": [{ "name": "main", "image": "nginx" }] },
            },
        },
    })
}

pub fn service(namespace: &str, name: &str, labels: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "namespace": namespace, "labels": labels },
        "spec": { "ports": [{ "port": 80 }] },
    })
}

pub fn event(namespace: &str, name: &str, involved_kind: &str, involved_name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Event",
        "metadata": { "name": name, "namespace": namespace },
        "involvedObject": { "kind": involved_kind, "name": involved_name, "namespace": namespace },
        "reason": "Synced",
        "message": format!("{involved_kind} {involved_name} synced"),
        "type": "Normal",
    })
}

pub fn crd(group: &str, kind: &str, plural: &str, scope: &str, versions: &[(&str, bool)]) -> Value {
    let versions = versions
        .iter()
        .enumerate()
        .map(|(index, (name, served))| {
            json!({ "name": name, "served": served, "storage": index == versions.len() - 1 })
        })
        .collect::<Vec<_>>();
    json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": format!("{plural}.{group}") },
        "spec": {
            "group": group,
            "names": { "plural": plural, "kind": kind, "singular": kind.to_ascii_lowercase() },
            "scope": scope,
            "versions": versions,
        },
    })
}

pub fn custom_object(
    api_version: &str,
    kind: &str,
    namespace: Option<&str>,
    name: &str,
    labels: Value,
    spec: Value,
) -> Value {
    let mut object = json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name, "labels": labels },
        "spec": spec,
    });
    if let Some(namespace) = namespace {
        object["metadata"]["namespace"] = json!(namespace);
    }
    object
}

#[cfg(test)]
mod tests {
    use super::{Target, classify, in_collection, merge_patch, name_selector, object_path, pod};
    use serde_json::json;

    #[test]
    fn paths_classify_by_shape() {
        assert!(matches!(classify("/api/v1/pods"), Some(Target::Collection(_))));
        assert!(matches!(
            classify("/api/v1/namespaces/default/pods/web"),
            Some(Target::Object(_))
        ));
        assert!(matches!(
            classify("/api/v1/namespaces/default/pods/web/eviction"),
            Some(Target::Subresource(_, _))
        ));
        assert!(matches!(classify("/api/v1/namespaces/default"), Some(Target::Object(_))));
    }

    #[test]
    fn all_namespace_lists_include_namespaced_objects() {
        let path = object_path(&pod("default", "web", json!({}), None));
        assert_eq!(path, "/api/v1/namespaces/default/pods/web");
        assert!(in_collection(&path, "/api/v1/pods"));
        assert!(in_collection(&path, "/api/v1/namespaces/default/pods"));
        assert!(!in_collection(&path, "/api/v1/namespaces/other/pods"));
        assert!(!in_collection(&path, "/api/v1/services"));
    }

    #[test]
    fn name_field_selector_is_decoded() {
        assert_eq!(
            name_selector("fieldSelector=metadata.name%3Dkite-read&limit=500").as_deref(),
            Some("kite-read")
        );
        assert_eq!(name_selector("fieldSelector=spec.nodeName%3Dnode-1"), None);
        assert_eq!(name_selector(""), None);
    }

    #[test]
    fn merge_patch_removes_nulls() {
        let mut target = json!({ "spec": { "a": 1, "b": 2 } });
        merge_patch(&mut target, &json!({ "spec": { "a": null, "c": 3 } }));
        assert_eq!(target, json!({ "spec": { "b": 2, "c": 3 } }));
    }
}
