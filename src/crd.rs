use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, Pod, Service};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, TypeMeta};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::handler::{
    ResourceHandler, decode_body, list_namespace, object_namespace, overlay_identity, to_response,
};
use crate::model::{NamespaceScope, RelatedResource};
use crate::unstructured::{has_nested_field, nested_i64, set_nested_field};
use crate::workload::RESTART_ANNOTATION;

pub const COMMON_LABEL_KEYS: [&str; 4] = ["app", "component", "name", "instance"];

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CustomResourceType {
    pub crd_name: String,
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl CustomResourceType {
    pub fn from_crd(crd: &CustomResourceDefinition) -> Result<Self> {
        let spec = &crd.spec;
        let version = spec
            .versions
            .iter()
            .find(|version| version.served)
            .ok_or_else(|| {
                Error::bad_request(format!(
                    "CustomResourceDefinition {} has no served version",
                    crd.name_any()
                ))
            })?;

        Ok(Self {
            crd_name: crd.name_any(),
            group: spec.group.clone(),
            version: version.name.clone(),
            kind: spec.names.kind.clone(),
            plural: spec.names.plural.clone(),
            namespaced: spec.scope == "Namespaced",
        })
    }

    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

#[derive(Clone)]
pub struct CrdResolver {
    client: Client,
}

impl CrdResolver {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Looks up a CRD by full name (`widgets.example.com`). A bare plural
    /// (`widgets`) falls back to matching `spec.names.plural`.
    pub async fn resolve(&self, reference: &str) -> Result<CustomResourceType> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.get(reference).await {
            Ok(crd) => CustomResourceType::from_crd(&crd),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                if !reference.contains('.') {
                    let crds = api.list(&ListParams::default()).await?;
                    if let Some(crd) = crds
                        .items
                        .iter()
                        .find(|crd| crd.spec.names.plural == reference)
                    {
                        return CustomResourceType::from_crd(crd);
                    }
                }
                Err(Error::not_found(format!(
                    "CustomResourceDefinition {reference} not found"
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    pub async fn handler(&self, reference: &str) -> Result<CustomResourceHandler> {
        let resource_type = self.resolve(reference).await?;
        debug!(
            crd = %resource_type.crd_name,
            version = %resource_type.version,
            namespaced = resource_type.namespaced,
            "resolved custom resource definition"
        );
        Ok(CustomResourceHandler::new(self.client.clone(), resource_type))
    }
}

pub struct CustomResourceHandler {
    client: Client,
    resource_type: CustomResourceType,
    api_resource: ApiResource,
}

impl CustomResourceHandler {
    pub fn new(client: Client, resource_type: CustomResourceType) -> Self {
        let api_resource = resource_type.api_resource();
        Self {
            client,
            resource_type,
            api_resource,
        }
    }

    pub fn resource_type(&self) -> &CustomResourceType {
        &self.resource_type
    }

    fn api_for(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(namespace) => {
                Api::namespaced_with(self.client.clone(), namespace, &self.api_resource)
            }
            None => Api::all_with(self.client.clone(), &self.api_resource),
        }
    }

    fn object_api(&self, scope: &NamespaceScope) -> Result<Api<DynamicObject>> {
        let namespace = object_namespace(
            &self.resource_type.kind,
            self.resource_type.namespaced,
            scope,
        )?;
        Ok(self.api_for(namespace))
    }

    async fn fetch_document(&self, scope: &NamespaceScope, name: &str) -> Result<Value> {
        let object = self.object_api(scope)?.get(name).await?;
        Ok(serde_json::to_value(object)?)
    }

    async fn replace_document(
        &self,
        scope: &NamespaceScope,
        name: &str,
        document: Value,
    ) -> Result<DynamicObject> {
        let object: DynamicObject = decode_body(&self.resource_type.kind, document)?;
        Ok(self
            .object_api(scope)?
            .replace(name, &PostParams::default(), &object)
            .await?)
    }

    /// Writes `spec.replicas`; objects without that field are rejected.
    pub async fn scale(&self, scope: &NamespaceScope, name: &str, replicas: i32) -> Result<Value> {
        let mut document = self.fetch_document(scope, name).await?;
        if !has_nested_field(&document, &["spec", "replicas"]) {
            return Err(Error::bad_request(format!(
                "{} {name} has no spec.replicas field and cannot be scaled",
                self.resource_type.kind
            )));
        }
        let previous = nested_i64(&document, &["spec", "replicas"]);
        set_nested_field(&mut document, &["spec", "replicas"], json!(replicas));
        let updated = self.replace_document(scope, name, document).await?;
        info!(
            crd = %self.resource_type.crd_name,
            namespace = %scope,
            name,
            from = ?previous,
            to = replicas,
            "scaled custom resource"
        );

        Ok(json!({
            "message": format!("{} {name} scaled", self.resource_type.kind),
            "replicas": replicas,
            "resource": to_response(&updated)?,
        }))
    }

    pub async fn restart(&self, scope: &NamespaceScope, name: &str) -> Result<Value> {
        let mut document = self.fetch_document(scope, name).await?;
        let restarted_at = Utc::now().to_rfc3339();
        let path: &[&str] = if has_nested_field(&document, &["spec", "template"]) {
            &["spec", "template", "metadata", "annotations", RESTART_ANNOTATION]
        } else {
            &["metadata", "annotations", RESTART_ANNOTATION]
        };
        set_nested_field(&mut document, path, json!(restarted_at));
        let updated = self.replace_document(scope, name, document).await?;
        info!(
            crd = %self.resource_type.crd_name,
            namespace = %scope,
            name,
            "restart requested for custom resource"
        );

        Ok(json!({
            "message": format!("{} {name} restart requested", self.resource_type.kind),
            "restartedAt": restarted_at,
            "resource": to_response(&updated)?,
        }))
    }

    pub async fn related(
        &self,
        scope: &NamespaceScope,
        name: &str,
    ) -> Result<Vec<RelatedResource>> {
        let object = self.object_api(scope)?.get(name).await?;
        let labels = object.labels();
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let namespace = scope.namespace();
        let pods: Api<Pod> = match namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let mut related = pods
            .list(&ListParams::default())
            .await?
            .items
            .iter()
            .filter(|pod| labels_related(labels, name, pod.labels()))
            .map(related_resource)
            .collect::<Vec<_>>();

        if let Some(namespace) = namespace {
            let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            related.extend(
                services
                    .list(&ListParams::default())
                    .await?
                    .items
                    .iter()
                    .filter(|service| labels_related(labels, name, service.labels()))
                    .map(related_resource),
            );
        }

        debug!(
            crd = %self.resource_type.crd_name,
            name,
            count = related.len(),
            "related resources"
        );
        Ok(related)
    }

    pub async fn events(&self, scope: &NamespaceScope, name: &str) -> Result<Value> {
        // Surfaces 400 for a namespaced path on a cluster-scoped CRD.
        self.object_api(scope)?;
        let events: Api<Event> = match scope.namespace() {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let matching = events
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .filter(|event| {
                event_matches_custom_resource(
                    event.involved_object.kind.as_deref(),
                    event.involved_object.name.as_deref(),
                    name,
                    &self.resource_type.crd_name,
                )
            })
            .collect::<Vec<_>>();
        to_response(&matching)
    }
}

#[async_trait]
impl ResourceHandler for CustomResourceHandler {
    fn kind(&self) -> &str {
        &self.resource_type.kind
    }

    fn namespaced(&self) -> bool {
        self.resource_type.namespaced
    }

    async fn list(&self, scope: &NamespaceScope) -> Result<Value> {
        let namespace = list_namespace(
            &self.resource_type.kind,
            self.resource_type.namespaced,
            scope,
        )?;
        let list = self.api_for(namespace).list(&ListParams::default()).await?;
        to_response(&list)
    }

    async fn get(&self, scope: &NamespaceScope, name: &str) -> Result<Value> {
        let object = self.object_api(scope)?.get(name).await?;
        to_response(&object)
    }

    async fn create(&self, scope: &NamespaceScope, body: Value) -> Result<Value> {
        let api = self.object_api(scope)?;
        let mut object: DynamicObject = decode_body(&self.resource_type.kind, body)?;
        if object.types.is_none() {
            object.types = Some(TypeMeta {
                api_version: self.api_resource.api_version.clone(),
                kind: self.api_resource.kind.clone(),
            });
        }
        if let Some(namespace) = scope.namespace() {
            object.meta_mut().namespace = Some(namespace.to_string());
        }
        let created = api.create(&PostParams::default(), &object).await?;
        to_response(&created)
    }

    async fn update(&self, scope: &NamespaceScope, name: &str, body: Value) -> Result<Value> {
        let api = self.object_api(scope)?;
        let current = api.get(name).await?;
        let mut submitted: DynamicObject = decode_body(&self.resource_type.kind, body)?;
        overlay_identity(&self.resource_type.kind, name, &current, &mut submitted)?;
        if let Some(namespace) = scope.namespace() {
            submitted.meta_mut().namespace = Some(namespace.to_string());
        }
        if submitted.types.is_none() {
            submitted.types = current.types.clone();
        }
        let updated = api.replace(name, &PostParams::default(), &submitted).await?;
        to_response(&updated)
    }

    async fn delete(&self, scope: &NamespaceScope, name: &str) -> Result<()> {
        let _ = self
            .object_api(scope)?
            .delete(name, &DeleteParams::foreground())
            .await?;
        Ok(())
    }
}

pub fn labels_related(
    resource_labels: &BTreeMap<String, String>,
    resource_name: &str,
    candidate_labels: &BTreeMap<String, String>,
) -> bool {
    if resource_labels.is_empty() {
        return false;
    }

    let shares_pair = resource_labels
        .iter()
        .any(|(key, value)| candidate_labels.get(key) == Some(value));
    let names_resource = COMMON_LABEL_KEYS.iter().any(|key| {
        candidate_labels
            .get(*key)
            .is_some_and(|value| value == resource_name)
    });
    shares_pair || names_resource
}

/// Name must match exactly; the involved kind only has to appear inside the
/// CRD name (`Widget` in `widgets.example.com`), compared case-insensitively.
/// This is the CRD name containing the kind, not the kind containing the CRD
/// name: a kind never carries the group suffix, so the other direction
/// would never match.
pub fn event_matches_custom_resource(
    involved_kind: Option<&str>,
    involved_name: Option<&str>,
    resource_name: &str,
    crd_name: &str,
) -> bool {
    if involved_name != Some(resource_name) {
        return false;
    }
    involved_kind
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .is_some_and(|kind| {
            crd_name
                .to_ascii_lowercase()
                .contains(&kind.to_ascii_lowercase())
        })
}

fn related_resource<K>(object: &K) -> RelatedResource
where
    K: Resource<DynamicType = ()>,
{
    RelatedResource {
        kind: K::kind(&()).to_string(),
        api_version: K::api_version(&()).to_string(),
        namespace: object.meta().namespace.clone(),
        name: object.meta().name.clone().unwrap_or_default(),
    }
}
