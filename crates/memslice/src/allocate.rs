use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Pod;
use thiserror::Error;

use crate::catalog::DeviceNameIndex;
use crate::claim;
use crate::claim::WorkloadClaim;
use crate::store::ClaimStore;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no assumed workload requests exactly {requested} units")]
    NoMatch { requested: u64 },
    #[error("workload {namespace}/{name} carries no resolvable device index")]
    IndexUnresolved { namespace: String, name: String },
    #[error("failed to finalize workload {namespace}/{name}")]
    Finalize { namespace: String, name: String },
    #[error("failed to list candidate workloads")]
    Candidates,
}

/// The physical device chosen for a satisfied allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub device_id: String,
    pub device_index: usize,
}

/// Resolves an allocation request to the one workload the external scheduler
/// assumed onto this node for exactly that amount, and finalizes the claim.
pub struct AllocationMatcher<S> {
    store: S,
    index: DeviceNameIndex,
    physical_count: usize,
}

impl<S: ClaimStore> AllocationMatcher<S> {
    pub fn new(store: S, index: DeviceNameIndex, physical_count: usize) -> Self {
        Self {
            store,
            index,
            physical_count,
        }
    }

    /// Find the oldest assumed-but-unassigned workload requesting exactly
    /// `requested` units, mark it assigned, and resolve its device.
    ///
    /// # Errors
    ///
    /// - [`MatchError::Candidates`] if the workload store cannot be listed
    /// - [`MatchError::NoMatch`] if no claim requests exactly `requested`
    ///   units and the single-device fallback does not apply
    /// - [`MatchError::IndexUnresolved`] if the claim's recorded device index
    ///   does not resolve against the current enumeration
    /// - [`MatchError::Finalize`] if the annotation patch fails after its
    ///   single conflict retry
    pub async fn match_and_assign(
        &self,
        requested: u64,
    ) -> Result<Assignment, Report<MatchError>> {
        let pods = self
            .store
            .list_pending()
            .await
            .change_context(MatchError::Candidates)?;

        let mut candidates: Vec<(WorkloadClaim, &Pod)> = pods
            .iter()
            .filter_map(|pod| {
                let claim = WorkloadClaim::from_pod(pod);
                claim.is_candidate().then_some((claim, pod))
            })
            .collect();
        claim::order_by_assume_time(&mut candidates);

        let Some((claim, pod)) = candidates
            .iter()
            .find(|(claim, _)| claim.requested_units == requested)
        else {
            if self.physical_count == 1 {
                if let Some(device_id) = self.index.name_of(0) {
                    // Degenerate single-device node: nothing to disambiguate,
                    // assign the only device without a matching claim.
                    tracing::info!(
                        "no matching claim for {requested} units, assigning the single device {device_id} directly"
                    );
                    return Ok(Assignment {
                        device_id: device_id.to_string(),
                        device_index: 0,
                    });
                }
            }
            return Err(Report::new(MatchError::NoMatch { requested }));
        };

        tracing::info!(
            "found assumed workload {}/{} requesting {requested} units",
            claim.namespace,
            claim.name
        );

        let unresolved = || MatchError::IndexUnresolved {
            namespace: claim.namespace.clone(),
            name: claim.name.clone(),
        };
        let Some(device_index) = claim.device_index else {
            tracing::warn!(
                "workload {}/{} has no device index annotation",
                claim.namespace,
                claim.name
            );
            return Err(Report::new(unresolved()));
        };
        let Some(device_id) = self.index.name_of(device_index) else {
            tracing::warn!(
                "device index {device_index} of workload {}/{} does not resolve in the current enumeration",
                claim.namespace,
                claim.name
            );
            return Err(Report::new(unresolved()));
        };
        let device_id = device_id.to_string();

        self.finalize(claim, pod).await?;

        Ok(Assignment {
            device_id,
            device_index,
        })
    }

    /// Patch the claim assigned, retrying exactly once against a freshly
    /// fetched object when the stored version changed concurrently.
    async fn finalize(
        &self,
        claim: &WorkloadClaim,
        pod: &Pod,
    ) -> Result<(), Report<MatchError>> {
        let finalize_err = || MatchError::Finalize {
            namespace: claim.namespace.clone(),
            name: claim.name.clone(),
        };

        let updated = claim::with_assigned_annotations(pod, now_nanos());
        match self.store.update(&updated).await {
            Ok(()) => Ok(()),
            Err(e) if e.current_context().is_conflict() => {
                tracing::info!(
                    "finalizing {}/{} hit a concurrent update, retrying once",
                    claim.namespace,
                    claim.name
                );
                let fresh = self
                    .store
                    .get(&claim.namespace, &claim.name)
                    .await
                    .change_context_lazy(finalize_err)?;
                let updated = claim::with_assigned_annotations(&fresh, now_nanos());
                self.store
                    .update(&updated)
                    .await
                    .change_context_lazy(finalize_err)
            }
            Err(e) => Err(e.change_context(finalize_err())),
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
