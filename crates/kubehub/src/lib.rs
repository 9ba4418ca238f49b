//! Nodegate kubehub – in-cluster client bootstrap and the cluster facade.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    Client, Config,
};
use tracing::{debug, info};

use nodegate_core::{ClusterError, ExclusionFilter, PodEvent, PodEventKind, Result};

const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";
const SERVICE_PORT_ENV: &str = "KUBERNETES_SERVICE_PORT";
const DEFAULT_SERVICE_HOST: &str = "127.0.0.1";
const DEFAULT_SERVICE_PORT: &str = "443";

/// API servers cap watch timeouts near five minutes; kube rejects >= 295s.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

/// Stream of pod changes, already reduced to the loop's vocabulary.
pub type PodEventStream = BoxStream<'static, Result<PodEvent>>;

/// The four cluster operations the controller consumes. One in-memory fake
/// in the test suite and one kube-backed implementation here.
#[async_trait::async_trait]
pub trait ClusterFacade: Send + Sync {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet>;

    /// Strategic-merge patch of the whole object, synchronous relative to the
    /// caller. Conflicts surface as `Mutation`; the next refresh cycle
    /// re-executes the read-modify-write from scratch.
    async fn patch_daemonset(&self, namespace: &str, name: &str, body: &DaemonSet) -> Result<()>;

    async fn list_pods(&self, namespace: &str, filter: &ExclusionFilter) -> Result<Vec<Pod>>;

    /// Bounded-duration watch; the stream ends when the server closes the
    /// window. Bookmark events are filtered out before they reach the caller.
    async fn watch_pods(
        &self,
        namespace: &str,
        filter: &ExclusionFilter,
        timeout_secs: u32,
    ) -> Result<PodEventStream>;
}

#[async_trait::async_trait]
impl<T: ClusterFacade + ?Sized> ClusterFacade for std::sync::Arc<T> {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        (**self).get_daemonset(namespace, name).await
    }

    async fn patch_daemonset(&self, namespace: &str, name: &str, body: &DaemonSet) -> Result<()> {
        (**self).patch_daemonset(namespace, name, body).await
    }

    async fn list_pods(&self, namespace: &str, filter: &ExclusionFilter) -> Result<Vec<Pod>> {
        (**self).list_pods(namespace, filter).await
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        filter: &ExclusionFilter,
        timeout_secs: u32,
    ) -> Result<PodEventStream> {
        (**self).watch_pods(namespace, filter, timeout_secs).await
    }
}

/// Build an in-cluster client from the service-account token and CA cert at
/// their well-known paths. Host/port come from the standard env vars, seeded
/// with `127.0.0.1:443` when unset. Fatal if the token is unreadable.
pub fn bootstrap_client() -> Result<Client> {
    if std::env::var_os(SERVICE_HOST_ENV).is_none() {
        std::env::set_var(SERVICE_HOST_ENV, DEFAULT_SERVICE_HOST);
    }
    if std::env::var_os(SERVICE_PORT_ENV).is_none() {
        std::env::set_var(SERVICE_PORT_ENV, DEFAULT_SERVICE_PORT);
    }
    // The client re-reads the token per request; this read only front-loads
    // the fatal "no credentials" case to startup.
    std::fs::read_to_string(TOKEN_PATH)
        .with_context(|| format!("reading service account token at {TOKEN_PATH}"))
        .map_err(ClusterError::Bootstrap)?;
    let config = Config::incluster().map_err(|e| ClusterError::Bootstrap(e.into()))?;
    info!(cluster_url = %config.cluster_url, "kube configuration loaded");
    Client::try_from(config).map_err(|e| ClusterError::Bootstrap(e.into()))
}

/// Kube-backed facade. Holds the one client handle constructed at startup;
/// connections are reused across loop iterations by the underlying transport.
#[derive(Clone)]
pub struct KubeHub {
    client: Client,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn daemonsets(&self, namespace: &str) -> Api<DaemonSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn pod_node(pod: &Pod) -> Option<String> {
    pod.spec.as_ref().and_then(|s| s.node_name.clone())
}

#[async_trait::async_trait]
impl ClusterFacade for KubeHub {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        self.daemonsets(namespace)
            .get(name)
            .await
            .map_err(|e| ClusterError::Mutation(anyhow!(e).context("reading daemonset")))
    }

    async fn patch_daemonset(&self, namespace: &str, name: &str, body: &DaemonSet) -> Result<()> {
        let pp = PatchParams::default();
        self.daemonsets(namespace)
            .patch(name, &pp, &Patch::Strategic(body))
            .await
            .map_err(|e| ClusterError::Mutation(anyhow!(e).context("patching daemonset")))?;
        debug!(ns = %namespace, name = %name, "daemonset patched");
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, filter: &ExclusionFilter) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(filter.as_str());
        let list = self
            .pods(namespace)
            .list(&lp)
            .await
            .map_err(|e| ClusterError::Query(anyhow!(e).context("listing pods")))?;
        Ok(list.items)
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        filter: &ExclusionFilter,
        timeout_secs: u32,
    ) -> Result<PodEventStream> {
        let wp = WatchParams::default()
            .labels(filter.as_str())
            .timeout(timeout_secs.min(MAX_WATCH_TIMEOUT_SECS));
        let stream = self
            .pods(namespace)
            .watch(&wp, "0")
            .await
            .map_err(|e| ClusterError::Stream(anyhow!(e).context("opening pod watch")))?;
        debug!(ns = %namespace, filter = %filter, timeout_secs, "pod watch opened");
        let events = stream
            .filter_map(|ev| {
                futures::future::ready(match ev {
                    Ok(WatchEvent::Added(p)) => Some(Ok(PodEvent {
                        kind: PodEventKind::Added,
                        node: pod_node(&p),
                    })),
                    Ok(WatchEvent::Modified(p)) => Some(Ok(PodEvent {
                        kind: PodEventKind::Modified,
                        node: pod_node(&p),
                    })),
                    Ok(WatchEvent::Deleted(p)) => Some(Ok(PodEvent {
                        kind: PodEventKind::Deleted,
                        node: pod_node(&p),
                    })),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(e)) => Some(Err(ClusterError::Stream(anyhow!(e)))),
                    Err(e) => Some(Err(ClusterError::Stream(anyhow!(e)))),
                })
            })
            .boxed();
        Ok(events)
    }
}
