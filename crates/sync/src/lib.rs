//! Nodegate sync – keeps a DaemonSet's required node-affinity pinned to the
//! nodes currently hosting foreign pods in its namespace.
//!
//! Three layers, strictly sequential at runtime:
//! - [`build_node_set`] reduces a filtered pod list to node names,
//! - [`Synchronizer`] diffs that set against the live affinity and patches
//!   only on divergence,
//! - [`Controller`] owns the watch window / refresh deadline state machine.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use nodegate_core::{
    placeholder_node, ClusterError, ExclusionFilter, RefreshDeadline, Result, HOSTNAME_LABEL,
};
use nodegate_kubehub::ClusterFacade;

/// List the pods matching `filter` and reduce them to the set of nodes they
/// are bound to. Unscheduled pods (no node name yet) are dropped, duplicates
/// collapse in the set. A list failure propagates; it is never "zero nodes".
pub async fn build_node_set<C: ClusterFacade>(
    facade: &C,
    namespace: &str,
    filter: &ExclusionFilter,
) -> Result<BTreeSet<String>> {
    let pods = facade.list_pods(namespace, filter).await?;
    Ok(pods
        .into_iter()
        .filter_map(|p| p.spec.and_then(|s| s.node_name))
        .filter(|n| !n.is_empty())
        .collect())
}

/// Node names currently embedded in the DaemonSet's required node-affinity.
///
/// Reads through the single-term/single-expression shape this controller
/// writes. Any deviation (no affinity, zero terms, zero expressions, no
/// values) reads as empty; the next write self-heals into the canonical
/// shape.
pub fn affinity_values(ds: &DaemonSet) -> Vec<String> {
    ds.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|ps| ps.affinity.as_ref())
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|na| na.required_during_scheduling_ignored_during_execution.as_ref())
        .and_then(|sel| sel.node_selector_terms.first())
        .and_then(|term| term.match_expressions.as_ref())
        .and_then(|exprs| exprs.first())
        .and_then(|req| req.values.clone())
        .unwrap_or_default()
}

/// Overwrite the required node-affinity with exactly one term holding exactly
/// one `kubernetes.io/hostname In values` expression, creating any missing
/// intermediate spec structure along the way.
pub fn set_affinity_values(ds: &mut DaemonSet, values: Vec<String>) {
    let requirement = NodeSelectorRequirement {
        key: HOSTNAME_LABEL.to_string(),
        operator: "In".to_string(),
        values: Some(values),
    };
    let selector = NodeSelector {
        node_selector_terms: vec![NodeSelectorTerm {
            match_expressions: Some(vec![requirement]),
            match_fields: None,
        }],
    };
    let spec = ds.spec.get_or_insert_with(Default::default);
    let pod_spec = spec.template.spec.get_or_insert_with(Default::default);
    let affinity = pod_spec.affinity.get_or_insert_with(Default::default);
    let node_affinity = affinity.node_affinity.get_or_insert_with(Default::default);
    node_affinity.required_during_scheduling_ignored_during_execution = Some(selector);
}

/// Read-modify-write unit for one DaemonSet's node-affinity.
pub struct Synchronizer<C> {
    facade: C,
    namespace: String,
    name: String,
    filter: ExclusionFilter,
}

impl<C: ClusterFacade> Synchronizer<C> {
    pub fn new(
        facade: C,
        namespace: impl Into<String>,
        name: impl Into<String>,
        filter: ExclusionFilter,
    ) -> Self {
        Self { facade, namespace: namespace.into(), name: name.into(), filter }
    }

    /// Recompute the authoritative node set and patch the DaemonSet if it
    /// diverged. Returns whether a patch was issued.
    ///
    /// Divergence is decided on canonically sorted values, so ordering in the
    /// live object never causes a write. An empty computed set always writes:
    /// the affinity must stay non-empty, so it gets a fresh unsatisfiable
    /// placeholder each time that branch fires.
    pub async fn synchronize(&self) -> Result<bool> {
        let t0 = std::time::Instant::now();
        let mut ds = self.facade.get_daemonset(&self.namespace, &self.name).await?;
        let computed = build_node_set(&self.facade, &self.namespace, &self.filter).await?;

        let mut old = affinity_values(&ds);
        old.sort_unstable();
        // BTreeSet iteration is already the canonical lexicographic order.
        let new: Vec<String> = computed.into_iter().collect();

        let force = new.is_empty();
        let desired = if force { vec![placeholder_node()] } else { new };

        let changed = if force || old != desired {
            set_affinity_values(&mut ds, desired.clone());
            self.facade.patch_daemonset(&self.namespace, &self.name, &ds).await?;
            counter!("sync_patches_total", 1u64);
            info!(ns = %self.namespace, name = %self.name, nodes = ?desired, forced = force,
                "daemonset node-affinity updated");
            true
        } else {
            counter!("sync_noop_total", 1u64);
            debug!(ns = %self.namespace, name = %self.name, nodes = ?desired,
                "node set unchanged; no patch");
            false
        };
        histogram!("refresh_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(changed)
    }
}

/// The watch-driven refresh loop. Alternates between one optional refresh
/// and one bounded watch window; never runs the two concurrently.
pub struct Controller<C> {
    sync: Synchronizer<C>,
    retry_interval: Duration,
    refresh_interval: Duration,
}

impl<C: ClusterFacade> Controller<C> {
    /// Read the DaemonSet once to derive the exclusion filter from its own
    /// pod-selector labels. The filter is fixed for the process lifetime;
    /// changing the DaemonSet's labels requires a restart.
    pub async fn new(
        facade: C,
        namespace: impl Into<String>,
        name: impl Into<String>,
        retry_interval: Duration,
        refresh_interval: Duration,
    ) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        let ds = facade.get_daemonset(&namespace, &name).await?;
        let labels = ds
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if labels.is_empty() {
            return Err(ClusterError::Bootstrap(anyhow!(
                "daemonset {namespace}/{name} has no spec.selector.matchLabels to derive the exclusion filter from"
            )));
        }
        let filter = ExclusionFilter::from_labels(&labels);
        info!(ns = %namespace, name = %name, %filter, "exclusion filter derived");
        Ok(Self {
            sync: Synchronizer::new(facade, namespace, name, filter),
            retry_interval,
            refresh_interval,
        })
    }

    /// Run until the owning task is cancelled. Every error inside the loop is
    /// logged and absorbed; there is deliberately no backoff and no attempt
    /// bound, the watch timeout is the only pacing under sustained failure.
    pub async fn run(self) -> Result<()> {
        let mut deadline = RefreshDeadline::new(self.refresh_interval);
        loop {
            self.cycle(&mut deadline).await;
        }
    }

    /// One loop iteration: synchronize if the deadline expired, then drain
    /// one bounded watch window, coalescing any number of pod changes into a
    /// single forced refresh at the next iteration boundary.
    pub async fn cycle(&self, deadline: &mut RefreshDeadline) {
        if deadline.expired() {
            match self.sync.synchronize().await {
                Ok(changed) => {
                    debug!(changed, "synchronization complete");
                    deadline.reset();
                }
                Err(e) => {
                    // Deadline stays expired: the next iteration retries
                    // immediately instead of waiting out the interval.
                    counter!("sync_errors_total", 1u64);
                    warn!(error = %e, "synchronization failed; will retry");
                }
            }
        }

        let timeout_secs = self.retry_interval.as_secs().min(u64::from(u32::MAX)) as u32;
        let mut stream = match self
            .sync
            .facade
            .watch_pods(&self.sync.namespace, &self.sync.filter, timeout_secs)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                counter!("watch_errors_total", 1u64);
                warn!(error = %e, "failed to open pod watch; re-entering loop");
                return;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(ev) if ev.resets_deadline() => {
                    debug!(kind = ?ev.kind, node = ?ev.node, "pod change observed; refresh scheduled");
                    deadline.force();
                }
                Ok(_) => {}
                Err(e) => {
                    counter!("watch_errors_total", 1u64);
                    warn!(error = %e, "watch stream failed; re-entering loop");
                    break;
                }
            }
        }
        debug!("watch window closed");
    }
}
