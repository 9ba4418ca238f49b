//! Nodegate core types – exclusion filters, refresh deadlines, errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Label key the scheduler matches node names against.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Typed failure taxonomy. Everything except `Bootstrap` is transient and
/// absorbed by the refresh loop; `Bootstrap` aborts startup.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster query failed: {0}")]
    Query(anyhow::Error),
    #[error("cluster mutation failed: {0}")]
    Mutation(anyhow::Error),
    #[error("watch stream failed: {0}")]
    Stream(anyhow::Error),
    #[error("bootstrap failed: {0}")]
    Bootstrap(anyhow::Error),
}

/// Kind of pod change observed on the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

/// A pod change stripped down to what the refresh loop needs: the kind of
/// change and the node the pod is bound to, if scheduled yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub node: Option<String>,
}

impl PodEvent {
    /// True when the event should expire the refresh deadline. Pending pods
    /// carry no node name and are ignored until they are scheduled.
    pub fn resets_deadline(&self) -> bool {
        self.node.as_deref().map_or(false, |n| !n.is_empty())
    }
}

/// Opaque label-selector expression matching the *complement* of the label
/// set it was built from: one `key!=value` term per pair, comma-joined.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExclusionFilter(String);

impl ExclusionFilter {
    /// Render the filter from a label mapping. BTreeMap iteration order makes
    /// the expression deterministic for a given mapping.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        let expr = labels
            .iter()
            .map(|(k, v)| format!("{k}!={v}"))
            .collect::<Vec<_>>()
            .join(",");
        Self(expr)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ExclusionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

const PLACEHOLDER_LEN: usize = 32;
const PLACEHOLDER_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Synthetic node name written when the computed node set is empty.
///
/// Uppercase letters are illegal in real node names (RFC 1123 subdomains),
/// so the token can never match a node. A fresh token is generated for every
/// empty-state write rather than cached, so a stale placeholder never aliases
/// anything created later.
pub fn placeholder_node() -> String {
    let mut rng = rand::thread_rng();
    (0..PLACEHOLDER_LEN)
        .map(|_| PLACEHOLDER_ALPHABET[rng.gen_range(0..PLACEHOLDER_ALPHABET.len())] as char)
        .collect()
}

/// Tracks elapsed time since the last successful synchronization.
#[derive(Debug, Clone, Copy)]
pub struct RefreshDeadline {
    last: Option<Instant>,
    interval: Duration,
}

impl RefreshDeadline {
    /// Starts expired so the first loop iteration synchronizes unconditionally.
    pub fn new(interval: Duration) -> Self {
        Self { last: None, interval }
    }

    pub fn expired(&self) -> bool {
        self.last.map_or(true, |t| t.elapsed() > self.interval)
    }

    /// Stamp a successful synchronization, patch and no-op alike. Errors must
    /// not reset the deadline; the next iteration then retries immediately.
    pub fn reset(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Expire immediately; the next loop iteration re-synchronizes.
    pub fn force(&mut self) {
        self.last = None;
    }
}
