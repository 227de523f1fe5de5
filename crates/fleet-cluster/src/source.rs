//! Where cluster descriptors come from.
//!
//! A source is re-read on every registry rebuild; it returns the complete
//! current set and the registry diffs it against the live snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use fleet_common::{Error, Result};

use crate::descriptor::{ClusterDescriptor, CredentialType};
use crate::handle::ClusterHandle;
use crate::store::ListSelector;

/// Bound on listing configuration config maps
pub const CONFIGMAP_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Produces the current set of cluster descriptors
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConfigSource: Send + Sync {
    /// Every cluster that should be connected right now
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>>;
}

/// Kubeconfig files in a directory, one cluster per file
#[derive(Clone, Debug)]
pub struct PathConfigSource {
    dir: PathBuf,
    suffix: String,
    credential_type: CredentialType,
}

impl PathConfigSource {
    /// Read `dir`; fails unless it exists and is a directory
    pub fn new(
        dir: impl Into<PathBuf>,
        suffix: impl Into<String>,
        credential_type: CredentialType,
    ) -> Result<Self> {
        let dir = dir.into();
        if !dir.exists() {
            return Err(Error::configuration(format!(
                "cluster config dir {} does not exist",
                dir.display()
            )));
        }
        if !dir.is_dir() {
            return Err(Error::configuration(format!(
                "cluster config path {} is not a directory",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            suffix: suffix.into(),
            credential_type,
        })
    }

    fn descriptor(&self, path: &Path, name: String) -> Result<ClusterDescriptor> {
        match self.credential_type {
            CredentialType::File => Ok(ClusterDescriptor::from_file(
                name,
                path.to_string_lossy().into_owned(),
            )),
            CredentialType::RawString => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::configuration(format!("failed to read {}: {}", path.display(), e))
                })?;
                Ok(ClusterDescriptor::from_raw(name, content))
            }
        }
    }
}

/// Cluster name for a file, or `None` when it lacks the suffix.
///
/// `east.kubeconfig` with suffix `kubeconfig` and with suffix `.kubeconfig`
/// both name `east`.
pub fn cluster_name_for(file_name: &str, suffix: &str) -> Option<String> {
    let stem = file_name.strip_suffix(suffix)?;
    let stem = stem.strip_suffix('.').unwrap_or(stem);
    (!stem.is_empty()).then(|| stem.to_string())
}

#[async_trait]
impl ClusterConfigSource for PathConfigSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            Error::configuration(format!("failed to read {}: {}", self.dir.display(), e))
        })?;
        let mut descriptors = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::configuration(format!("failed to read entry: {}", e)))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| cluster_name_for(n, &self.suffix))
            else {
                continue;
            };
            descriptors.push(self.descriptor(&path, name)?);
        }
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(dir = %self.dir.display(), count = descriptors.len(), "read cluster configs");
        Ok(descriptors)
    }
}

/// Labeled config maps on the home cluster, one cluster per config map
pub struct ConfigMapConfigSource {
    handle: Arc<ClusterHandle>,
    namespace: String,
    labels: BTreeMap<String, String>,
    data_key: String,
    status_key: String,
}

impl ConfigMapConfigSource {
    /// Read config maps in `namespace` carrying all of `labels`
    pub fn new(
        handle: Arc<ClusterHandle>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
        data_key: impl Into<String>,
        status_key: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            namespace: namespace.into(),
            labels,
            data_key: data_key.into(),
            status_key: status_key.into(),
        }
    }
}

#[async_trait]
impl ClusterConfigSource for ConfigMapConfigSource {
    async fn get_all(&self) -> Result<Vec<ClusterDescriptor>> {
        let selector = ListSelector {
            labels: self.labels.clone(),
            fields: BTreeMap::new(),
        };
        let maps = tokio::time::timeout(
            CONFIGMAP_LIST_TIMEOUT,
            self.handle.list::<ConfigMap>(Some(&self.namespace), &selector),
        )
        .await
        .map_err(|_| Error::Timeout {
            cluster: self.handle.name().to_string(),
            operation: "list cluster configmaps".to_string(),
            timeout: CONFIGMAP_LIST_TIMEOUT,
        })??;
        Ok(descriptors_from_configmaps(
            &maps,
            &self.data_key,
            &self.status_key,
        ))
    }
}

/// Descriptors for every usable config map.
///
/// A config map without `data_key` is skipped, as is one whose `status_key`
/// is present and not `true`.
pub fn descriptors_from_configmaps(
    maps: &[ConfigMap],
    data_key: &str,
    status_key: &str,
) -> Vec<ClusterDescriptor> {
    let mut descriptors: Vec<ClusterDescriptor> = maps
        .iter()
        .filter_map(|cm| {
            let name = cm.metadata.name.clone()?;
            let data = cm.data.as_ref();
            let Some(kubeconfig) = data.and_then(|d| d.get(data_key)) else {
                warn!(configmap = %name, key = %data_key, "cluster configmap has no kubeconfig");
                return None;
            };
            if let Some(status) = data.and_then(|d| d.get(status_key)) {
                if !status.trim().eq_ignore_ascii_case("true") {
                    debug!(configmap = %name, status = %status, "cluster disabled");
                    return None;
                }
            }
            Some(ClusterDescriptor::from_raw(name, kubeconfig.clone()))
        })
        .collect();
    descriptors.sort_by(|a, b| a.name.cmp(&b.name));
    descriptors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleOptions;
    use crate::testing::InMemoryStore;
    use kube::api::ObjectMeta;

    fn configmap(name: &str, data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("fleet-system".into()),
                labels: Some([("fleet.io/cluster-config".to_string(), "true".to_string())].into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn file_names_map_to_cluster_names() {
        assert_eq!(cluster_name_for("east.kubeconfig", "kubeconfig"), Some("east".into()));
        assert_eq!(cluster_name_for("east.kubeconfig", ".kubeconfig"), Some("east".into()));
        assert_eq!(cluster_name_for("east.yaml", "kubeconfig"), None);
        assert_eq!(cluster_name_for(".kubeconfig", "kubeconfig"), None);
    }

    #[test]
    fn path_source_rejects_missing_and_non_directories() {
        assert!(PathConfigSource::new("/nonexistent/fleet", "kubeconfig", CredentialType::File).is_err());

        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let err = PathConfigSource::new(file.path(), "kubeconfig", CredentialType::File)
            .expect_err("a file is not a directory");
        assert!(err.to_string().contains("not a directory"));
    }

    #[tokio::test]
    async fn path_source_reads_matching_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("west.kubeconfig"), "west-config").expect("write");
        std::fs::write(dir.path().join("east.kubeconfig"), "east-config").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let raw = PathConfigSource::new(dir.path(), "kubeconfig", CredentialType::RawString)
            .expect("dir exists");
        let descriptors = raw.get_all().await.expect("read");
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["east", "west"]);
        assert_eq!(descriptors[0].credential, "east-config");

        let files = PathConfigSource::new(dir.path(), "kubeconfig", CredentialType::File)
            .expect("dir exists");
        let descriptors = files.get_all().await.expect("read");
        assert!(descriptors[0].credential.ends_with("east.kubeconfig"));
        assert_eq!(descriptors[0].credential_type, CredentialType::File);
    }

    #[test]
    fn configmaps_without_data_or_disabled_are_skipped() {
        let maps = vec![
            configmap("east", &[("kubeconfig", "e"), ("enabled", "TRUE")]),
            configmap("west", &[("kubeconfig", "w")]),
            configmap("north", &[("kubeconfig", "n"), ("enabled", "false")]),
            configmap("south", &[("other", "s")]),
        ];
        let descriptors = descriptors_from_configmaps(&maps, "kubeconfig", "enabled");
        let names: Vec<_> = descriptors.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["east", "west"]);
        assert!(descriptors
            .iter()
            .all(|d| d.credential_type == CredentialType::RawString));
    }

    /// Story: Member clusters are registered as labeled config maps on the
    /// home cluster; only labeled maps in the configured namespace count.
    #[tokio::test]
    async fn story_configmap_source_lists_labeled_maps_on_home_cluster() {
        let store = Arc::new(InMemoryStore::new("home"));
        store.seed(&configmap("east", &[("kubeconfig", "e")]));
        let mut unlabeled = configmap("west", &[("kubeconfig", "w")]);
        unlabeled.metadata.labels = None;
        store.seed(&unlabeled);

        let home = Arc::new(
            ClusterHandle::new(
                ClusterDescriptor::from_raw("home", "cfg"),
                store,
                HandleOptions::default(),
            )
            .expect("handle"),
        );
        let source = ConfigMapConfigSource::new(
            home,
            "fleet-system",
            [("fleet.io/cluster-config".to_string(), "true".to_string())].into(),
            "kubeconfig",
            "enabled",
        );

        let descriptors = source.get_all().await.expect("list");
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].name, "east");
    }
}
