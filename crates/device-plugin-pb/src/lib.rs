//! Generated bindings for the kubelet device plugin wire protocol.

pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    #![allow(clippy::doc_markdown)]
    tonic::include_proto!("v1beta1");

    /// API version announced during registration.
    pub const VERSION: &str = "v1beta1";

    /// Device health value reported in [`Device::health`].
    pub const HEALTHY: &str = "Healthy";
    /// Device health value reported in [`Device::health`].
    pub const UNHEALTHY: &str = "Unhealthy";
}
