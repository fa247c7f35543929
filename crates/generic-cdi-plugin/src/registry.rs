//! Plugin registry.
//!
//! Maps one CDI specification onto the kubelet's plugin model: one plugin
//! per declared device, named `{class}-{device}` and namespaced under the
//! spec's vendor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use thiserror::Error;
use tracing::info;

use crate::cdi::CdiSpec;
use crate::plugin::CdiDevicePlugin;
use crate::plugin::PluginConfig;
use crate::pod_resources;
use crate::pod_resources::PodResourcesClient;

/// Errors raised while constructing plugins.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid plugin name {name:?}, expected prefix {prefix:?}")]
    InvalidPluginName { name: String, prefix: String },
    #[error("Failed to connect to the pod-resources endpoint")]
    AccountingUnavailable,
}

/// How plugins reach the accounting endpoint, plus per-plugin tuning. One
/// settings value is shared by every plugin the registry creates.
#[derive(Debug, Clone)]
pub struct PluginSettings {
    pub pod_resources_socket: PathBuf,
    pub connect_timeout: Duration,
    pub max_message_size: usize,
    pub plugin_config: PluginConfig,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            pod_resources_socket: PathBuf::from(kubelet_pb::POD_RESOURCES_SOCKET),
            connect_timeout: pod_resources::CONNECT_TIMEOUT,
            max_message_size: pod_resources::MAX_MESSAGE_SIZE,
            plugin_config: PluginConfig::default(),
        }
    }
}

/// Enumerates the plugins a CDI specification calls for and builds their
/// lifecycle managers on demand.
#[derive(Debug)]
pub struct CdiPluginRegistry {
    spec: CdiSpec,
    settings: PluginSettings,
}

impl CdiPluginRegistry {
    pub fn new(spec: CdiSpec, settings: PluginSettings) -> Self {
        Self { spec, settings }
    }

    /// One plugin name per declared device, in declaration order. A spec
    /// without devices yields an empty list.
    pub fn discover(&self) -> Vec<String> {
        self.spec
            .devices
            .iter()
            .map(|device| format!("{}-{}", self.spec.class(), device.name))
            .collect()
    }

    /// Vendor under which every resource of this registry is namespaced.
    pub fn resource_namespace(&self) -> &str {
        self.spec.vendor()
    }

    /// Build the lifecycle manager for one discovered plugin name.
    ///
    /// The accounting connection is opened here; an unreachable
    /// pod-resources socket is a construction failure.
    pub async fn new_plugin(
        &self,
        name: &str,
    ) -> Result<Arc<CdiDevicePlugin>, Report<RegistryError>> {
        let prefix = format!("{}-", self.spec.class());
        let resource = name
            .strip_prefix(&prefix)
            .filter(|resource| !resource.is_empty())
            .ok_or_else(|| {
                Report::new(RegistryError::InvalidPluginName {
                    name: name.to_string(),
                    prefix: prefix.clone(),
                })
            })?;

        info!(
            class = %self.spec.class(),
            resource = %resource,
            socket = %self.settings.pod_resources_socket.display(),
            "building device plugin"
        );

        let client = PodResourcesClient::connect(
            &self.settings.pod_resources_socket,
            self.settings.connect_timeout,
            self.settings.max_message_size,
        )
        .await
        .change_context(RegistryError::AccountingUnavailable)?;

        Ok(CdiDevicePlugin::new(
            self.spec.class(),
            resource,
            client,
            self.settings.plugin_config.clone(),
        ))
    }
}
