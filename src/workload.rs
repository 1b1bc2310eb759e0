use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::{Client, Resource};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::fmt::Debug;
use std::time::Duration;
use tracing::info;

use crate::batch::run_batch;
use crate::error::{Error, Result};
use crate::handler::{GenericHandler, to_response};
use crate::model::{BatchReport, NamespaceScope, ObjectRef};

/// Pod-template annotation whose change makes a controller roll its pods.
pub const RESTART_ANNOTATION: &str = "kite.kubernetes.io/restartedAt";

/// Controllers that own a pod template and can be rolled.
pub trait Workload:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + DeserializeOwned
    + Serialize
    + Debug
    + Send
    + Sync
    + 'static
{
    fn replicas(&self) -> Option<i32>;

    /// Returns false for controllers without a replica count.
    fn set_replicas(&mut self, replicas: i32) -> bool;
}

impl Workload for Deployment {
    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|spec| spec.replicas)
    }

    fn set_replicas(&mut self, replicas: i32) -> bool {
        self.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        true
    }
}

impl Workload for StatefulSet {
    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|spec| spec.replicas)
    }

    fn set_replicas(&mut self, replicas: i32) -> bool {
        self.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        true
    }
}

impl Workload for DaemonSet {
    fn replicas(&self) -> Option<i32> {
        None
    }

    fn set_replicas(&mut self, _replicas: i32) -> bool {
        false
    }
}

pub fn restart_patch(restarted_at: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(RESTART_ANNOTATION.to_string(), json!(restarted_at));
    json!({ "spec": { "template": { "metadata": { "annotations": annotations } } } })
}

pub struct WorkloadOperations<K> {
    client: Client,
    handler: GenericHandler<K>,
    kind: String,
}

impl<K: Workload> WorkloadOperations<K> {
    pub fn new(client: Client) -> Self {
        Self {
            handler: GenericHandler::new(client.clone()),
            kind: K::kind(&()).to_string(),
            client,
        }
    }

    pub async fn restart(&self, namespace: &str, name: &str) -> Result<Value> {
        let restarted_at = Utc::now().to_rfc3339();
        let scope = NamespaceScope::Named(namespace.to_string());
        self.handler
            .merge_patch(&scope, name, &restart_patch(&restarted_at))
            .await?;
        info!(kind = %self.kind, namespace, name, "rolling restart requested");
        Ok(json!({
            "message": format!("{} {namespace}/{name} restarted", self.kind),
            "restartedAt": restarted_at,
        }))
    }

    pub async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<Value> {
        let scope = NamespaceScope::Named(namespace.to_string());
        let mut object = self.handler.fetch(&scope, name).await?;
        let previous = object.replicas();
        if !object.set_replicas(replicas) {
            return Err(Error::bad_request(format!("{} {name} cannot be scaled", self.kind)));
        }
        let updated = self.handler.replace(&scope, &object).await?;
        info!(
            kind = %self.kind,
            namespace,
            name,
            from = ?previous,
            to = replicas,
            "scaled workload"
        );
        Ok(json!({
            "message": format!("{} {namespace}/{name} scaled to {replicas}", self.kind),
            "replicas": replicas,
            "resource": to_response(&updated)?,
        }))
    }

    pub async fn batch_restart(&self, items: Vec<ObjectRef>, deadline: Duration) -> BatchReport {
        let client = self.client.clone();
        run_batch(items, deadline, move |item| {
            let operations = Self::new(client.clone());
            async move {
                operations.restart(&item.namespace, &item.name).await?;
                Ok(())
            }
        })
        .await
    }
}
