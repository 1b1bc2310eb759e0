use async_trait::async_trait;
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::NamespaceScope;
use crate::unstructured::remove_nested_field;

#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Kind name as it appears in `involvedObject.kind` (`Pod`, `Widget`).
    fn kind(&self) -> &str;

    fn namespaced(&self) -> bool;

    async fn list(&self, scope: &NamespaceScope) -> Result<Value>;

    async fn get(&self, scope: &NamespaceScope, name: &str) -> Result<Value>;

    async fn create(&self, scope: &NamespaceScope, body: Value) -> Result<Value>;

    async fn update(&self, scope: &NamespaceScope, name: &str, body: Value) -> Result<Value>;

    async fn delete(&self, scope: &NamespaceScope, name: &str) -> Result<()>;
}

pub trait ScopeKind {
    const NAMESPACED: bool;

    fn scoped_api<K>(client: Client, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>;
}

impl ScopeKind for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn scoped_api<K>(client: Client, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::namespaced(client, namespace)
    }
}

impl ScopeKind for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn scoped_api<K>(client: Client, _namespace: &str) -> Api<K>
    where
        K: Resource<Scope = Self, DynamicType = ()>,
    {
        Api::all(client)
    }
}

pub fn object_namespace<'a>(
    kind: &str,
    namespaced: bool,
    scope: &'a NamespaceScope,
) -> Result<Option<&'a str>> {
    match (namespaced, scope) {
        (true, NamespaceScope::Named(namespace)) => Ok(Some(namespace)),
        (true, NamespaceScope::All) => Err(Error::bad_request(format!(
            "namespace is required for namespaced resource {kind}"
        ))),
        (false, NamespaceScope::All) => Ok(None),
        (false, NamespaceScope::Named(namespace)) => Err(Error::bad_request(format!(
            "{kind} is cluster-scoped and cannot be addressed in namespace {namespace}"
        ))),
    }
}

pub fn list_namespace<'a>(
    kind: &str,
    namespaced: bool,
    scope: &'a NamespaceScope,
) -> Result<Option<&'a str>> {
    match (namespaced, scope) {
        (_, NamespaceScope::All) => Ok(None),
        (true, NamespaceScope::Named(namespace)) => Ok(Some(namespace)),
        (false, NamespaceScope::Named(namespace)) => Err(Error::bad_request(format!(
            "{kind} is cluster-scoped and cannot be listed in namespace {namespace}"
        ))),
    }
}

/// Drops server bookkeeping that the dashboard never renders.
pub fn to_response<T: Serialize>(object: &T) -> Result<Value> {
    let mut value = serde_json::to_value(object)?;
    remove_nested_field(&mut value, &["metadata", "managedFields"]);
    let items = match &mut value {
        Value::Array(items) => Some(items),
        Value::Object(object) => object.get_mut("items").and_then(Value::as_array_mut),
        _ => None,
    };
    for item in items.into_iter().flatten() {
        remove_nested_field(item, &["metadata", "managedFields"]);
    }
    Ok(value)
}

pub fn decode_body<T: DeserializeOwned>(kind: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(|error| Error::bad_request(format!("invalid {kind} body: {error}")))
}

pub fn overlay_identity<K: Resource>(
    kind: &str,
    name: &str,
    current: &K,
    submitted: &mut K,
) -> Result<()> {
    let meta = submitted.meta_mut();
    match meta.name.as_deref() {
        None => meta.name = Some(name.to_string()),
        Some(body_name) if body_name == name => {}
        Some(body_name) => {
            return Err(Error::bad_request(format!(
                "{kind} body names {body_name} but the request targets {name}"
            )));
        }
    }
    if meta.resource_version.is_none() {
        meta.resource_version = current.meta().resource_version.clone();
    }
    if meta.uid.is_none() {
        meta.uid = current.meta().uid.clone();
    }
    Ok(())
}

pub struct GenericHandler<K> {
    client: Client,
    kind: String,
    _kind: PhantomData<fn() -> K>,
}

impl<K> GenericHandler<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new(client: Client) -> Self {
        Self {
            client,
            kind: K::kind(&()).to_string(),
            _kind: PhantomData,
        }
    }
}

impl<K> GenericHandler<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
    K::Scope: ScopeKind,
{
    fn api_for(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(namespace) => {
                <K::Scope as ScopeKind>::scoped_api(self.client.clone(), namespace)
            }
            None => Api::all(self.client.clone()),
        }
    }

    fn object_api(&self, scope: &NamespaceScope) -> Result<Api<K>> {
        let namespaced = <K::Scope as ScopeKind>::NAMESPACED;
        let namespace = object_namespace(&self.kind, namespaced, scope)?;
        Ok(self.api_for(namespace))
    }

    fn list_api(&self, scope: &NamespaceScope) -> Result<Api<K>> {
        let namespaced = <K::Scope as ScopeKind>::NAMESPACED;
        let namespace = list_namespace(&self.kind, namespaced, scope)?;
        Ok(self.api_for(namespace))
    }

    pub async fn fetch(&self, scope: &NamespaceScope, name: &str) -> Result<K> {
        Ok(self.object_api(scope)?.get(name).await?)
    }

    pub async fn merge_patch(&self, scope: &NamespaceScope, name: &str, patch: &Value) -> Result<K>
    where
        K: Serialize,
    {
        Ok(self
            .object_api(scope)?
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    pub async fn replace(&self, scope: &NamespaceScope, object: &K) -> Result<K>
    where
        K: Serialize,
    {
        let name = object.name_any();
        Ok(self
            .object_api(scope)?
            .replace(&name, &PostParams::default(), object)
            .await?)
    }
}

#[async_trait]
impl<K> ResourceHandler for GenericHandler<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    K::Scope: ScopeKind,
{
    fn kind(&self) -> &str {
        &self.kind
    }

    fn namespaced(&self) -> bool {
        <K::Scope as ScopeKind>::NAMESPACED
    }

    async fn list(&self, scope: &NamespaceScope) -> Result<Value> {
        let list = self.list_api(scope)?.list(&Default::default()).await?;
        debug!(
            kind = %self.kind,
            namespace = %scope,
            count = list.items.len(),
            "listed objects"
        );
        to_response(&list)
    }

    async fn get(&self, scope: &NamespaceScope, name: &str) -> Result<Value> {
        to_response(&self.fetch(scope, name).await?)
    }

    async fn create(&self, scope: &NamespaceScope, body: Value) -> Result<Value> {
        let api = self.object_api(scope)?;
        let mut object: K = decode_body(&self.kind, body)?;
        if let Some(namespace) = scope.namespace() {
            object.meta_mut().namespace = Some(namespace.to_string());
        }
        let created = api.create(&PostParams::default(), &object).await?;
        debug!(
            kind = %self.kind,
            namespace = %scope,
            name = %created.name_any(),
            "created object"
        );
        to_response(&created)
    }

    async fn update(&self, scope: &NamespaceScope, name: &str, body: Value) -> Result<Value> {
        let api = self.object_api(scope)?;
        let current = api.get(name).await?;
        let mut submitted: K = decode_body(&self.kind, body)?;
        overlay_identity(&self.kind, name, &current, &mut submitted)?;
        if let Some(namespace) = scope.namespace() {
            submitted.meta_mut().namespace = Some(namespace.to_string());
        }
        let updated = api.replace(name, &PostParams::default(), &submitted).await?;
        to_response(&updated)
    }

    async fn delete(&self, scope: &NamespaceScope, name: &str) -> Result<()> {
        let _ = self
            .object_api(scope)?
            .delete(name, &DeleteParams::foreground())
            .await?;
        debug!(kind = %self.kind, namespace = %scope, name, "deleted object");
        Ok(())
    }
}
