use chrono::Utc;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{
    Container, Node, Pod, PodSpec, SecurityContext, Taint, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, EvictParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::runtime::wait::await_condition;
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::events::involved_object_events;
use crate::model::{DrainOptions, DrainReport, NodeJobHandle, ObjectRef, TaintRequest};

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const NODE_OPERATION_LABEL: &str = "kite.kubernetes.io/node-operation";
const TAINT_EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NodeService {
    Kubelet,
    KubeProxy,
}

impl NodeService {
    fn purpose(self) -> &'static str {
        match self {
            NodeService::Kubelet => "restart-kubelet",
            NodeService::KubeProxy => "restart-kubeproxy",
        }
    }

    fn script(self) -> &'static str {
        match self {
            NodeService::Kubelet => "systemctl restart kubelet",
            // kube-proxy usually runs as a DaemonSet container, which the
            // kubelet restarts once the process exits.
            NodeService::KubeProxy => {
                "systemctl restart kube-proxy 2>/dev/null || pkill -x kube-proxy"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HostConfig {
    Containerd,
    Cni,
}

impl HostConfig {
    fn purpose(self) -> &'static str {
        match self {
            HostConfig::Containerd => "containerd-config",
            HostConfig::Cni => "cni-config",
        }
    }

    fn path(self) -> &'static str {
        match self {
            HostConfig::Containerd => "/etc/containerd/config.toml",
            HostConfig::Cni => "/etc/cni/net.d",
        }
    }

    fn script(self) -> &'static str {
        match self {
            HostConfig::Containerd => "cat /etc/containerd/config.toml",
            HostConfig::Cni => {
                "for f in /etc/cni/net.d/*; do echo \"==> $f <==\"; cat \"$f\"; echo; done"
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Disposition {
    Evict,
    Skip(&'static str),
    Block(String),
}

pub fn drain_disposition(pod: &Pod, options: &DrainOptions) -> Disposition {
    let reference = format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any());
    if pod.annotations().contains_key(MIRROR_POD_ANNOTATION) {
        return Disposition::Skip("mirror pod");
    }

    let finished = matches!(
        pod.status.as_ref().and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    );
    let controller = pod
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true));
    match controller {
        Some(owner) if owner.kind == "DaemonSet" => {
            return if options.ignore_daemon_sets {
                Disposition::Skip("managed by a DaemonSet")
            } else {
                Disposition::Block(format!(
                    "{reference} is managed by DaemonSet {} (set ignoreDaemonSets)",
                    owner.name
                ))
            };
        }
        None if !finished && !options.force => {
            return Disposition::Block(format!(
                "{reference} is not managed by a controller (set force)"
            ));
        }
        _ => {}
    }

    let uses_empty_dir = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|volume| volume.empty_dir.is_some()));
    if uses_empty_dir && !finished && !options.delete_empty_dir_data {
        return Disposition::Block(format!(
            "{reference} uses emptyDir storage (set deleteEmptyDirData)"
        ));
    }

    Disposition::Evict
}

pub fn apply_taint(node: &mut Node, taint: Taint) {
    let taints = node
        .spec
        .get_or_insert_with(Default::default)
        .taints
        .get_or_insert_with(Vec::new);
    match taints.iter_mut().find(|existing| existing.key == taint.key) {
        Some(existing) => *existing = taint,
        None => taints.push(taint),
    }
}

/// Returns false when no taint had `key`.
pub fn remove_taint(node: &mut Node, key: &str) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|spec| spec.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|taint| taint.key != key);
    taints.len() != before
}

fn operation_pod_name(purpose: &str, node: &str) -> String {
    let suffix = Utc::now().timestamp_millis().to_string();
    let mut prefix = format!("kite-{purpose}-{node}").to_ascii_lowercase();
    prefix.truncate(62 - suffix.len());
    format!("{}-{suffix}", prefix.trim_end_matches(['-', '.']))
}

fn pod_finished(pod: Option<&Pod>) -> bool {
    matches!(
        pod.and_then(|pod| pod.status.as_ref())
            .and_then(|status| status.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

#[derive(Clone)]
pub struct NodeOperations {
    client: Client,
    image: String,
    namespace: String,
    wait_timeout: Duration,
}

impl NodeOperations {
    pub fn new(client: Client, config: &ServerConfig) -> Self {
        Self {
            client,
            image: config.node_operation_image.clone(),
            namespace: config.node_operation_namespace.clone(),
            wait_timeout: config.timeouts.request,
        }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn operation_pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    pub async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<Value> {
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        let action = if unschedulable { "cordoned" } else { "uncordoned" };
        info!(node = name, action, "updated node scheduling");
        Ok(json!({ "message": format!("Node {name} {action}") }))
    }

    pub async fn taint(&self, name: &str, request: TaintRequest) -> Result<Value> {
        if request.key.trim().is_empty() {
            return Err(Error::bad_request("taint key is required"));
        }
        if !TAINT_EFFECTS.contains(&request.effect.as_str()) {
            return Err(Error::bad_request(format!(
                "invalid taint effect {}, expected one of {}",
                request.effect,
                TAINT_EFFECTS.join(", ")
            )));
        }

        let mut node = self.nodes().get(name).await?;
        let key = request.key.clone();
        apply_taint(
            &mut node,
            Taint {
                key: request.key,
                value: request.value,
                effect: request.effect,
                ..Default::default()
            },
        );
        self.nodes()
            .replace(name, &PostParams::default(), &node)
            .await?;
        info!(node = name, key = %key, "node tainted");
        Ok(json!({ "message": format!("Node {name} tainted with {key}") }))
    }

    pub async fn untaint(&self, name: &str, key: &str) -> Result<Value> {
        let mut node = self.nodes().get(name).await?;
        if !remove_taint(&mut node, key) {
            return Err(Error::not_found(format!("taint {key} not found on node {name}")));
        }
        self.nodes()
            .replace(name, &PostParams::default(), &node)
            .await?;
        info!(node = name, key, "node taint removed");
        Ok(json!({ "message": format!("Taint {key} removed from node {name}") }))
    }

    /// Cordons the node and evicts its pods. Does not wait for the evicted
    /// pods to terminate.
    pub async fn drain(&self, name: &str, options: DrainOptions) -> Result<DrainReport> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let bound = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={name}")))
            .await?
            .items
            .into_iter()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()) == Some(name)
            });

        let mut report = DrainReport {
            node: name.to_string(),
            ..Default::default()
        };
        let mut to_evict = Vec::new();
        let mut blocked = Vec::new();
        for pod in bound {
            let reference = ObjectRef {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            };
            match drain_disposition(&pod, &options) {
                Disposition::Evict => to_evict.push(reference),
                Disposition::Skip(reason) => {
                    debug!(node = name, pod = %reference.name, reason, "skipping pod");
                    report.skipped.push(reference);
                }
                Disposition::Block(reason) => blocked.push(reason),
            }
        }
        if !blocked.is_empty() {
            return Err(Error::bad_request(format!(
                "cannot drain node {name}: {}",
                blocked.join("; ")
            )));
        }

        self.set_unschedulable(name, true).await?;

        let params = EvictParams {
            delete_options: Some(DeleteParams {
                grace_period_seconds: options
                    .grace_period_seconds
                    .and_then(|seconds| u32::try_from(seconds).ok()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let params = &params;
        let outcomes = join_all(to_evict.iter().map(|pod| {
            let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
            async move {
                api.evict(&pod.name, params)
                    .await
                    .map_err(|error| format!("{}/{}: {error}", pod.namespace, pod.name))
            }
        }))
        .await;
        let failures = outcomes
            .into_iter()
            .filter_map(|outcome| outcome.err())
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            return Err(Error::Internal(format!(
                "failed to evict pods from node {name}: {}",
                failures.join("; ")
            )));
        }

        info!(
            node = name,
            evicted = to_evict.len(),
            skipped = report.skipped.len(),
            "node drained"
        );
        report.evicted = to_evict;
        Ok(report)
    }

    pub async fn restart_service(&self, name: &str, service: NodeService) -> Result<NodeJobHandle> {
        self.nodes().get(name).await?;
        let pod_name = operation_pod_name(service.purpose(), name);
        let pod = self.operation_pod(name, &pod_name, service.purpose(), service.script());
        self.operation_pods()
            .create(&PostParams::default(), &pod)
            .await?;
        info!(node = name, pod = %pod_name, job = service.purpose(), "node job started");
        Ok(NodeJobHandle {
            message: format!("{} scheduled on node {name}", service.purpose()),
            node: name.to_string(),
            pod_name,
            namespace: self.namespace.clone(),
        })
    }

    pub async fn events(&self, name: &str) -> Result<Value> {
        involved_object_events(self.client.clone(), None, "Node", name).await
    }

    /// Runs a reader pod on the node and returns its output. The pod is
    /// removed afterwards whether or not the read succeeded.
    pub async fn read_host_config(&self, name: &str, config: HostConfig) -> Result<Value> {
        self.nodes().get(name).await?;
        let pods = self.operation_pods();
        let pod_name = operation_pod_name(config.purpose(), name);
        let pod = self.operation_pod(name, &pod_name, config.purpose(), config.script());
        pods.create(&PostParams::default(), &pod).await?;

        let outcome = self.collect_output(&pods, &pod_name).await;
        if let Err(error) = pods.delete(&pod_name, &DeleteParams::background()).await {
            warn!(node = name, pod = %pod_name, %error, "failed to clean up node job pod");
        }
        let content = outcome?;
        Ok(json!({
            "node": name,
            "path": config.path(),
            "content": content,
        }))
    }

    async fn collect_output(&self, pods: &Api<Pod>, pod_name: &str) -> Result<String> {
        let finished = tokio::time::timeout(
            self.wait_timeout,
            await_condition(pods.clone(), pod_name, pod_finished),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|error| Error::Internal(format!("failed waiting for pod {pod_name}: {error}")))?;

        let content = pods.logs(pod_name, &LogParams::default()).await?;
        let failed = finished
            .and_then(|pod| pod.status)
            .and_then(|status| status.phase)
            .is_some_and(|phase| phase == "Failed");
        if failed {
            return Err(Error::Internal(format!("pod {pod_name} failed: {content}")));
        }
        Ok(content)
    }

    fn operation_pod(&self, node: &str, pod_name: &str, purpose: &str, script: &str) -> Pod {
        let mut command = ["nsenter", "-t", "1", "-m", "-u", "-i", "-n", "-p", "--", "sh", "-c"]
            .map(str::to_string)
            .to_vec();
        command.push(script.to_string());

        Pod {
            metadata: ObjectMeta {
                name: Some(pod_name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("app.kubernetes.io/managed-by".to_string(), "kite".to_string()),
                    (NODE_OPERATION_LABEL.to_string(), purpose.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                host_pid: Some(true),
                host_network: Some(true),
                restart_policy: Some("Never".to_string()),
                tolerations: Some(vec![Toleration {
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                containers: vec![Container {
                    name: "node-operation".to_string(),
                    image: Some(self.image.clone()),
                    command: Some(command),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
