//! Builds cluster handles from descriptors

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use fleet_common::kube_utils::{create_client_with_timeout, DEFAULT_READ_TIMEOUT};
use fleet_common::Result;

use crate::descriptor::ClusterDescriptor;
use crate::handle::{ClusterHandle, HandleOptions};
use crate::store::KubeObjectStore;

/// Turns a descriptor into a ready-to-start handle.
///
/// Building pre-validates the credential; a kubeconfig that cannot be loaded
/// fails here rather than at first use.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HandleFactory: Send + Sync {
    /// Build an unstarted handle
    async fn build(&self, descriptor: &ClusterDescriptor) -> Result<Arc<ClusterHandle>>;
}

/// [`HandleFactory`] producing kube-backed handles
#[derive(Clone, Debug, Default)]
pub struct KubeHandleFactory {
    options: HandleOptions,
}

impl KubeHandleFactory {
    /// Factory whose handles use `options`
    pub fn new(options: HandleOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl HandleFactory for KubeHandleFactory {
    async fn build(&self, descriptor: &ClusterDescriptor) -> Result<Arc<ClusterHandle>> {
        debug!(cluster = %descriptor.name, "building cluster handle");
        let client = create_client_with_timeout(
            &descriptor.kubeconfig_source(),
            descriptor.context.as_deref(),
            self.options.exec_timeout,
            DEFAULT_READ_TIMEOUT,
        )
        .await?;
        let store = Arc::new(KubeObjectStore::new(client, descriptor.name.clone()));
        Ok(Arc::new(ClusterHandle::new(
            descriptor.clone(),
            store,
            self.options.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A member cluster's kubeconfig file was removed from disk. The
    /// factory refuses to build a handle for it.
    #[tokio::test]
    async fn story_unreadable_kubeconfig_fails_the_build() {
        let factory = KubeHandleFactory::default();
        let descriptor = ClusterDescriptor::from_file("east", "/nonexistent/east.kubeconfig");

        let err = factory.build(&descriptor).await.expect_err("missing file");
        assert!(err.to_string().contains("east.kubeconfig"));
    }

    #[tokio::test]
    async fn malformed_inline_kubeconfig_fails_the_build() {
        let factory = KubeHandleFactory::default();
        let descriptor = ClusterDescriptor::from_raw("east", "clusters: [not, a, kubeconfig");
        assert!(factory.build(&descriptor).await.is_err());
    }
}
