use k8s_openapi::api::core::v1::Pod;
use kube::api::DeleteParams;
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{info, warn};

use crate::batch::run_batch;
use crate::error::{Error, Result};
use crate::model::{BatchReport, ObjectRef};

/// Restarts pods by deleting them and letting their controller recreate them.
#[derive(Clone)]
pub struct PodOperations {
    client: Client,
}

impl PodOperations {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn restart(&self, namespace: &str, name: &str) -> Result<Value> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = api
            .get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found(format!("Pod not found: {namespace}/{name}")))?;

        let managed = !pod.owner_references().is_empty();
        if !managed {
            warn!(namespace, name, "pod has no owner and will not be recreated");
        }

        api.delete(name, &DeleteParams::foreground()).await?;
        info!(namespace, name, managed, "pod deleted for restart");
        Ok(json!({
            "message": format!("Pod {namespace}/{name} restarted"),
            "managed": managed,
        }))
    }

    pub async fn batch_restart(&self, items: Vec<ObjectRef>, deadline: Duration) -> BatchReport {
        let operations = self.clone();
        run_batch(items, deadline, move |item| {
            let operations = operations.clone();
            async move {
                operations.restart(&item.namespace, &item.name).await?;
                Ok(())
            }
        })
        .await
    }
}
