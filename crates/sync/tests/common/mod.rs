//! In-memory cluster fake shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use nodegate_core::{ClusterError, ExclusionFilter, PodEvent, PodEventKind, Result};
use nodegate_kubehub::{ClusterFacade, PodEventStream};

/// Scripted stand-in for the real cluster: one stored DaemonSet, a mutable
/// foreign-pod placement, and a queue of pre-recorded watch windows.
#[derive(Default)]
pub struct FakeCluster {
    pub daemonset: Mutex<DaemonSet>,
    pub pod_nodes: Mutex<Vec<Option<String>>>,
    pub patches: Mutex<Vec<DaemonSet>>,
    pub windows: Mutex<Vec<Vec<Result<PodEvent>>>>,
    pub list_calls: Mutex<usize>,
    pub fail_list: Mutex<bool>,
    pub fail_watch: Mutex<bool>,
}

impl FakeCluster {
    pub fn with_daemonset(ds: DaemonSet) -> Self {
        Self { daemonset: Mutex::new(ds), ..Default::default() }
    }

    pub fn set_pod_nodes(&self, nodes: &[Option<&str>]) {
        *self.pod_nodes.lock().unwrap() =
            nodes.iter().map(|n| n.map(|s| s.to_string())).collect();
    }

    /// Queue one watch window; each `watch_pods` call consumes the next one
    /// (an exhausted queue yields an immediately-closing empty window).
    pub fn push_window(&self, events: Vec<Result<PodEvent>>) {
        self.windows.lock().unwrap().push(events);
    }

    pub fn patch_count(&self) -> usize {
        self.patches.lock().unwrap().len()
    }

    pub fn list_count(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    pub fn stored_daemonset(&self) -> DaemonSet {
        self.daemonset.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterFacade for FakeCluster {
    async fn get_daemonset(&self, _namespace: &str, _name: &str) -> Result<DaemonSet> {
        Ok(self.daemonset.lock().unwrap().clone())
    }

    async fn patch_daemonset(&self, _namespace: &str, _name: &str, body: &DaemonSet) -> Result<()> {
        *self.daemonset.lock().unwrap() = body.clone();
        self.patches.lock().unwrap().push(body.clone());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _filter: &ExclusionFilter) -> Result<Vec<Pod>> {
        if *self.fail_list.lock().unwrap() {
            return Err(ClusterError::Query(anyhow::anyhow!("list unavailable")));
        }
        *self.list_calls.lock().unwrap() += 1;
        Ok(self
            .pod_nodes
            .lock()
            .unwrap()
            .iter()
            .map(|n| pod_on(n.as_deref()))
            .collect())
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        _filter: &ExclusionFilter,
        _timeout_secs: u32,
    ) -> Result<PodEventStream> {
        if *self.fail_watch.lock().unwrap() {
            return Err(ClusterError::Stream(anyhow::anyhow!("watch unavailable")));
        }
        let mut windows = self.windows.lock().unwrap();
        let events = if windows.is_empty() { Vec::new() } else { windows.remove(0) };
        Ok(futures::stream::iter(events).boxed())
    }
}

/// A DaemonSet named `target` in namespace `ns` selecting `app=target`, with
/// an optional pre-existing affinity value list.
pub fn target_daemonset(values: Option<&[&str]>) -> DaemonSet {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "target".to_string());
    let mut ds = DaemonSet {
        metadata: ObjectMeta {
            name: Some("target".into()),
            namespace: Some("ns".into()),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector { match_labels: Some(labels), ..Default::default() },
            ..Default::default()
        }),
        ..Default::default()
    };
    if let Some(values) = values {
        nodegate_sync::set_affinity_values(&mut ds, values.iter().map(|s| s.to_string()).collect());
    }
    ds
}

pub fn target_filter() -> ExclusionFilter {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "target".to_string());
    ExclusionFilter::from_labels(&labels)
}

pub fn pod_on(node: Option<&str>) -> Pod {
    Pod {
        spec: Some(PodSpec { node_name: node.map(|s| s.to_string()), ..Default::default() }),
        ..Default::default()
    }
}

pub fn modified_on(node: &str) -> PodEvent {
    PodEvent { kind: PodEventKind::Modified, node: Some(node.to_string()) }
}
