use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use std::env;
use std::path::Path;
use tracing::{info, warn};

use crate::config::ServerConfig;

/// Long-lived connection to the cluster shared by every request handler.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    context: String,
    cluster: String,
    default_namespace: String,
}

impl KubeGateway {
    pub async fn connect(config: &ServerConfig) -> Result<Self> {
        let (kube_config, context) = resolve_kube_config(config.kubeconfig.as_deref()).await?;

        let cluster = kube_config.cluster_url.to_string();
        let default_namespace = kube_config.default_namespace.clone();
        let client =
            Client::try_from(kube_config).context("failed to initialize Kubernetes client")?;

        if config.disable_cache {
            info!("object cache disabled; all reads go to the API server");
        } else {
            info!("kube client performs live reads; no informer cache is kept");
        }

        Ok(Self {
            client,
            context,
            cluster,
            default_namespace,
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }
}

/// Reads a KUBECONFIG-style path list (`a.yaml:b.yaml`), merging the files
/// in order so the first file wins on conflicting entries.
fn read_kubeconfig(paths: &Path) -> Result<Kubeconfig> {
    let mut merged: Option<Kubeconfig> = None;
    for path in env::split_paths(paths.as_os_str()) {
        if path.as_os_str().is_empty() {
            continue;
        }
        let next = Kubeconfig::read_from(&path)
            .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
        merged = Some(match merged {
            Some(current) => current
                .merge(next)
                .with_context(|| format!("failed to merge kubeconfig {}", path.display()))?,
            None => next,
        });
    }
    merged.with_context(|| format!("no kubeconfig file in {}", paths.display()))
}

/// Explicit kubeconfig path first, then the default kubeconfig, then the
/// in-cluster service account.
async fn resolve_kube_config(kubeconfig_path: Option<&Path>) -> Result<(Config, String)> {
    let kubeconfig = match kubeconfig_path {
        Some(paths) => Some(read_kubeconfig(paths)?),
        None => Kubeconfig::read().ok(),
    };

    if let Some(kubeconfig) = kubeconfig {
        let context = kubeconfig
            .current_context
            .clone()
            .unwrap_or_else(|| "-".to_string());
        let config =
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load Kubernetes configuration from kubeconfig")?;
        return Ok((config, context));
    }

    warn!("no kubeconfig found, falling back to in-cluster configuration");
    let config = Config::incluster().context("failed to load in-cluster configuration")?;
    Ok((config, "in-cluster".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    const CONTEXTS: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: dev-user
"#;

    const CLUSTERS: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: dev-cluster
  cluster:
    server: https://127.0.0.1:6443
users:
- name: dev-user
  user:
    token: abc
"#;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("kite-kubeconfig-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn path_list_is_merged_in_order() {
        let contexts = write_temp("contexts.yaml", CONTEXTS);
        let clusters = write_temp("clusters.yaml", CLUSTERS);
        let joined = PathBuf::from(env::join_paths([&contexts, &clusters]).unwrap());

        let kubeconfig = read_kubeconfig(&joined).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("dev"));
        assert_eq!(kubeconfig.contexts.len(), 1);
        assert_eq!(kubeconfig.clusters.len(), 1);
        assert_eq!(kubeconfig.auth_infos.len(), 1);

        let (config, context) = resolve_kube_config(Some(&joined)).await.unwrap();
        assert_eq!(context, "dev");
        assert_eq!(config.cluster_url.host(), Some("127.0.0.1"));
    }

    #[test]
    fn single_path_still_reads_and_missing_file_is_reported() {
        let clusters = write_temp("single.yaml", CLUSTERS);
        let kubeconfig = read_kubeconfig(&clusters).unwrap();
        assert_eq!(kubeconfig.clusters.len(), 1);

        let missing = env::temp_dir().join("kite-kubeconfig-missing.yaml");
        let error = read_kubeconfig(&missing).unwrap_err();
        assert!(error.to_string().contains("failed to read kubeconfig"));
    }
}
