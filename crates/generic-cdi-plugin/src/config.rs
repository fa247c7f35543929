//! Command line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::plugin::PluginConfig;
use crate::pod_resources;
use crate::registry::PluginSettings;
use crate::server::ServerSettings;

/// Serve the devices declared in a CDI specification as kubelet device
/// plugins.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the CDI specification file (JSON or YAML)
    #[arg(value_hint = clap::ValueHint::FilePath)]
    pub spec_path: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        default_value = kubelet_pb::DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
        help = "Directory the kubelet watches for device plugin sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = kubelet_pb::KUBELET_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "POD_RESOURCES_SOCKET",
        default_value = kubelet_pb::POD_RESOURCES_SOCKET,
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet pod-resources socket the reconciler queries"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        env = "RECONCILE_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Seconds between reconciliations of the advertised pool against the kubelet's accounting"
    )]
    pub reconcile_interval_secs: u64,

    #[arg(
        long,
        env = "SPARE_CAPACITY",
        default_value_t = 1,
        help = "Fresh spare devices kept in each pool ahead of demand"
    )]
    pub spare_capacity: usize,
}

impl Cli {
    pub fn plugin_settings(&self) -> PluginSettings {
        PluginSettings {
            pod_resources_socket: self.pod_resources_socket.clone(),
            connect_timeout: pod_resources::CONNECT_TIMEOUT,
            max_message_size: pod_resources::MAX_MESSAGE_SIZE,
            plugin_config: PluginConfig {
                reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
                spare_capacity: self.spare_capacity,
            },
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            device_plugin_dir: self.device_plugin_dir.clone(),
            kubelet_socket: self.kubelet_socket.clone(),
        }
    }
}
