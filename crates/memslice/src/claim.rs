use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use crate::config::ANN_ASSIGNED;
use crate::config::ANN_ASSIGN_TIME;
use crate::config::ANN_ASSUME_TIME;
use crate::config::ANN_DEVICE_INDEX;
use crate::config::RESOURCE_MEMORY;

/// A pending workload's claim on this node's gpu-mem units, extracted from
/// the pod's resource limits and scheduler annotations. Read-only to this
/// plugin until finalized.
#[derive(Debug, Clone)]
pub struct WorkloadClaim {
    pub name: String,
    pub namespace: String,
    /// Units requested for the whole pod, summed across containers.
    pub requested_units: u64,
    /// Scheduler assume timestamp in unix nanoseconds.
    pub assume_time: Option<u64>,
    /// Raw assigned-flag annotation value, `Some("false")` for candidates.
    pub assigned: Option<String>,
    /// Device index chosen by the scheduler extender, if recorded.
    pub device_index: Option<usize>,
}

impl WorkloadClaim {
    pub fn from_pod(pod: &Pod) -> Self {
        let name = pod.metadata.name.clone().unwrap_or_default();
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let annotations = pod.metadata.annotations.as_ref();

        let assume_time = annotations
            .and_then(|a| a.get(ANN_ASSUME_TIME))
            .and_then(|value| match value.parse::<u64>() {
                Ok(nanos) => Some(nanos),
                Err(e) => {
                    tracing::warn!(
                        "failed to parse assume timestamp {value} of pod {namespace}/{name}: {e}"
                    );
                    None
                }
            });

        let device_index = annotations
            .and_then(|a| a.get(ANN_DEVICE_INDEX))
            .and_then(|value| match value.parse::<usize>() {
                Ok(index) => Some(index),
                Err(e) => {
                    tracing::warn!(
                        "failed to parse device index {value} of pod {namespace}/{name}: {e}"
                    );
                    None
                }
            });

        Self {
            requested_units: requested_units(pod),
            assume_time,
            assigned: annotations.and_then(|a| a.get(ANN_ASSIGNED)).cloned(),
            device_index,
            name,
            namespace,
        }
    }

    /// A claim is a candidate when the scheduler has assumed it here
    /// (assume timestamp present), it actually requests units, and this
    /// plugin has not finalized it yet.
    pub fn is_candidate(&self) -> bool {
        self.requested_units > 0
            && self.assume_time.is_some()
            && self.assigned.as_deref() == Some("false")
    }
}

/// Units requested by the pod, summed over all container limits.
pub fn requested_units(pod: &Pod) -> u64 {
    let Some(spec) = pod.spec.as_ref() else {
        return 0;
    };
    spec.containers
        .iter()
        .filter_map(|container| container.resources.as_ref())
        .filter_map(|resources| resources.limits.as_ref())
        .filter_map(|limits| limits.get(RESOURCE_MEMORY))
        .filter_map(|quantity| quantity.0.parse::<u64>().ok())
        .sum()
}

/// Order candidates oldest assume time first. This is the sole tie-break and
/// approximates FIFO fairness among workloads racing for the node.
pub fn order_by_assume_time<T>(candidates: &mut [(WorkloadClaim, T)]) {
    candidates.sort_by_key(|(claim, _)| claim.assume_time.unwrap_or(u64::MAX));
}

/// A copy of the pod with the finalization annotations applied:
/// assigned flag flipped to true and the assign timestamp recorded.
pub fn with_assigned_annotations(pod: &Pod, assign_time_nanos: i64) -> Pod {
    let mut updated = pod.clone();
    let annotations = updated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new);
    annotations.insert(ANN_ASSIGNED.to_string(), "true".to_string());
    annotations.insert(ANN_ASSIGN_TIME.to_string(), assign_time_nanos.to_string());
    updated
}
