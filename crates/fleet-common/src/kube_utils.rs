//! Shared Kubernetes client helpers using kube-rs

use std::path::PathBuf;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a client's kubeconfig comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KubeconfigSource {
    /// In-cluster service account or `$KUBECONFIG`
    Infer,
    /// A kubeconfig file on disk
    Path(PathBuf),
    /// Kubeconfig YAML held in memory
    Inline(String),
}

/// Create a kube client with default timeouts
pub async fn create_client(source: &KubeconfigSource, context: Option<&str>) -> Result<Client, Error> {
    create_client_with_timeout(source, context, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Build the client configuration without contacting the API server.
///
/// This is the pre-validation step for remote clusters: an unreadable
/// kubeconfig or an unknown context fails here.
pub async fn load_config(source: &KubeconfigSource, context: Option<&str>) -> Result<Config, Error> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };
    let kubeconfig = match source {
        KubeconfigSource::Infer => {
            return Config::infer().await.map_err(|e| {
                Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
            });
        }
        KubeconfigSource::Path(path) => Kubeconfig::read_from(path).map_err(|e| {
            Error::configuration(format!(
                "failed to read kubeconfig {}: {}",
                path.display(),
                e
            ))
        })?,
        KubeconfigSource::Inline(raw) => Kubeconfig::from_yaml(raw)
            .map_err(|e| Error::configuration(format!("failed to parse kubeconfig: {}", e)))?,
    };
    Config::from_custom_kubeconfig(kubeconfig, &options)
        .await
        .map_err(|e| Error::configuration(format!("failed to load kubeconfig: {}", e)))
}

/// Create a kube client with custom timeouts
pub async fn create_client_with_timeout(
    source: &KubeconfigSource,
    context: Option<&str>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = load_config(source, context).await?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Parse an apiVersion string into (group, version)
///
/// ```
/// use fleet_common::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}
