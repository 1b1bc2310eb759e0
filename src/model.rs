use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Path segment meaning "every namespace" for lists and "no namespace"
/// for single cluster-scoped objects.
pub const ALL_NAMESPACES: &str = "_all";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NamespaceScope {
    All,
    Named(String),
}

impl NamespaceScope {
    pub fn from_segment(segment: &str) -> Self {
        let trimmed = segment.trim();
        if trimmed.is_empty() || trimmed == ALL_NAMESPACES {
            Self::All
        } else {
            Self::Named(trimmed.to_string())
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Named(namespace) => Some(namespace),
        }
    }
}

impl Display for NamespaceScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "{ALL_NAMESPACES}"),
            Self::Named(namespace) => write!(f, "{namespace}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ObjectRef {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchRestartRequest {
    #[serde(alias = "pods", alias = "deployments", default)]
    pub items: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItemResult {
    pub namespace: String,
    pub name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub results: Vec<BatchItemResult>,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScaleRequest {
    pub replicas: serde_json::Value,
}

impl ScaleRequest {
    /// Replica counts must be JSON integers in `0..=i32::MAX`.
    pub fn replicas(&self) -> Option<i32> {
        self.replicas
            .as_i64()
            .filter(|value| *value >= 0)
            .and_then(|value| i32::try_from(value).ok())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelatedResource {
    pub kind: String,
    pub api_version: String,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJobHandle {
    pub message: String,
    pub node: String,
    pub pod_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainOptions {
    pub force: bool,
    pub grace_period_seconds: Option<i64>,
    pub delete_empty_dir_data: bool,
    pub ignore_daemon_sets: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub node: String,
    pub evicted: Vec<ObjectRef>,
    pub skipped: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaintRequest {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default = "default_taint_effect")]
    pub effect: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UntaintRequest {
    pub key: String,
}

fn default_taint_effect() -> String {
    "NoSchedule".to_string()
}
