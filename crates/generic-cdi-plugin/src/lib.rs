//! A generic CDI device plugin for Kubernetes.
//!
//! Reads a CDI specification, exposes one kubelet device plugin per declared
//! device and answers allocations with CDI references the container runtime
//! resolves. The advertised capacity is synthetic; pools are reconciled
//! against the kubelet's pod-resources accounting so they track real
//! assignments.

pub mod cdi;
pub mod config;
pub mod device_pool;
pub mod logging;
pub mod mock;
pub mod plugin;
pub mod pod_resources;
pub mod registry;
pub mod server;

pub use cdi::CdiSpec;
pub use device_pool::DevicePool;
pub use plugin::CdiDevicePlugin;
pub use plugin::PluginConfig;
pub use plugin::PluginState;
pub use registry::CdiPluginRegistry;
pub use registry::PluginSettings;
pub use server::PluginServer;
pub use server::ServerSettings;
