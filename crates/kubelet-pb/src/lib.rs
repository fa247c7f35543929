//! Generated tonic bindings for the kubelet APIs this plugin speaks, plus
//! the well-known kubelet paths and constants.

#![allow(clippy::doc_markdown)]

/// Device plugin API (`v1beta1`): the `DevicePlugin` service this project
/// serves and the `Registration` service it calls on the kubelet.
pub mod device_plugin {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

/// Pod-resources API (`v1`): the kubelet's resource-accounting service,
/// consumed during reconciliation.
pub mod pod_resources {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1");
}

/// Directory where the kubelet expects device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Socket the kubelet serves its `Registration` service on.
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";

/// Socket the kubelet serves the pod-resources lister on.
pub const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";

/// Device plugin API version sent when registering.
pub const DEVICE_PLUGIN_VERSION: &str = "v1beta1";

/// Health value for a serviceable device.
pub const HEALTHY: &str = "Healthy";

/// Health value for a device that must not be allocated.
pub const UNHEALTHY: &str = "Unhealthy";
