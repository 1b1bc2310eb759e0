use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Event, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod, Secret,
    Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass, NetworkPolicy};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::handler::{GenericHandler, ResourceHandler};

/// Built-in kinds addressable by their REST resource name.
pub struct ResourceRegistry {
    handlers: BTreeMap<&'static str, Arc<dyn ResourceHandler>>,
}

impl ResourceRegistry {
    pub fn new(client: Client) -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
        };

        registry.register::<Pod>("pods", &client);
        registry.register::<Deployment>("deployments", &client);
        registry.register::<StatefulSet>("statefulsets", &client);
        registry.register::<DaemonSet>("daemonsets", &client);
        registry.register::<ReplicaSet>("replicasets", &client);
        registry.register::<Job>("jobs", &client);
        registry.register::<CronJob>("cronjobs", &client);
        registry.register::<Service>("services", &client);
        registry.register::<ConfigMap>("configmaps", &client);
        registry.register::<Secret>("secrets", &client);
        registry.register::<Ingress>("ingresses", &client);
        registry.register::<PersistentVolumeClaim>("persistentvolumeclaims", &client);
        registry.register::<ServiceAccount>("serviceaccounts", &client);
        registry.register::<Role>("roles", &client);
        registry.register::<RoleBinding>("rolebindings", &client);
        registry.register::<NetworkPolicy>("networkpolicies", &client);
        registry.register::<Event>("events", &client);

        registry.register::<Node>("nodes", &client);
        registry.register::<Namespace>("namespaces", &client);
        registry.register::<PersistentVolume>("persistentvolumes", &client);
        registry.register::<StorageClass>("storageclasses", &client);
        registry.register::<ClusterRole>("clusterroles", &client);
        registry.register::<ClusterRoleBinding>("clusterrolebindings", &client);
        registry.register::<IngressClass>("ingressclasses", &client);
        registry.register::<CustomResourceDefinition>("customresourcedefinitions", &client);

        registry
    }

    fn register<K>(&mut self, resource: &'static str, client: &Client)
    where
        GenericHandler<K>: ResourceHandler + 'static,
        K: kube::Resource<DynamicType = ()>,
    {
        self.handlers
            .insert(resource, Arc::new(GenericHandler::<K>::new(client.clone())));
    }

    pub fn get(&self, resource: &str) -> Option<Arc<dyn ResourceHandler>> {
        self.handlers.get(resource).cloned()
    }

    pub fn resources(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }
}
