use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::Node;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::Api;
use kube::Client;
use thiserror::Error;

use crate::config::RESOURCE_COUNT;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to read node {0}")]
    Read(String),
    #[error("failed to patch capacity of node {0}")]
    Patch(String),
}

/// Patch the node's device-count capacity and allocatable to match the
/// enumerated devices, skipping the write when already current.
///
/// # Errors
///
/// - [`NodeError::Read`] if the node object cannot be fetched
/// - [`NodeError::Patch`] if the status patch is rejected
pub async fn patch_device_count(
    client: &Client,
    node_name: &str,
    count: usize,
) -> Result<(), Report<NodeError>> {
    let nodes: Api<Node> = Api::all(client.clone());
    let node = nodes
        .get(node_name)
        .await
        .change_context_lazy(|| NodeError::Read(node_name.to_string()))?;

    if !needs_patch(&node, count) {
        tracing::info!("no need to update capacity {RESOURCE_COUNT}");
        return Ok(());
    }

    let quantity = count.to_string();
    let patch = serde_json::json!({
        "status": {
            "capacity": { RESOURCE_COUNT: quantity },
            "allocatable": { RESOURCE_COUNT: quantity },
        }
    });
    nodes
        .patch_status(node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .change_context_lazy(|| NodeError::Patch(node_name.to_string()))?;

    tracing::info!("updated capacity {RESOURCE_COUNT} to {count}");
    Ok(())
}

fn needs_patch(node: &Node, count: usize) -> bool {
    let current = node
        .status
        .as_ref()
        .and_then(|status| status.capacity.as_ref())
        .and_then(|capacity| capacity.get(RESOURCE_COUNT));
    match current {
        Some(quantity) => quantity.0 != count.to_string(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::NodeStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;

    fn node_with_capacity(capacity: Option<&str>) -> Node {
        Node {
            status: Some(NodeStatus {
                capacity: capacity.map(|value| {
                    [(RESOURCE_COUNT.to_string(), Quantity(value.to_string()))]
                        .into_iter()
                        .collect()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn patch_is_skipped_when_capacity_matches() {
        assert!(!needs_patch(&node_with_capacity(Some("2")), 2));
    }

    #[test]
    fn patch_is_needed_when_capacity_differs() {
        assert!(needs_patch(&node_with_capacity(Some("1")), 2));
    }

    #[test]
    fn patch_is_needed_when_capacity_is_absent() {
        assert!(needs_patch(&node_with_capacity(None), 2));
        assert!(needs_patch(&Node::default(), 2));
    }
}
