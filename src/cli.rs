use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "kite",
    version,
    about = "REST backend for browsing and operating on Kubernetes clusters."
)]
pub struct CliArgs {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Kubeconfig file or path list (defaults to ~/.kube/config, then in-cluster)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Always read from the API server
    #[arg(long, env = "DISABLE_CACHE")]
    pub disable_cache: bool,

    /// Image used for privileged node operation pods
    #[arg(long, env = "NODE_OPERATION_IMAGE")]
    pub node_operation_image: Option<String>,

    /// Namespace where node operation pods are created
    #[arg(long, env = "NODE_OPERATION_NAMESPACE")]
    pub node_operation_namespace: Option<String>,

    /// YAML settings file
    #[arg(long, env = "KITE_CONFIG")]
    pub config: Option<PathBuf>,

    /// tracing filter (for example: info,kite=debug)
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,
}
