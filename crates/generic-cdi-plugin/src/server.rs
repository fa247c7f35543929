//! Device plugin serving and kubelet registration.
//!
//! For every plugin the registry discovers this binds a gRPC endpoint in
//! the kubelet's device-plugin directory, registers it and keeps the
//! registration alive across kubelet restarts. Shutdown unwinds the
//! endpoints, stops the plugins and removes their sockets.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use kubelet_pb::device_plugin::device_plugin_server::DevicePluginServer;
use kubelet_pb::device_plugin::registration_client::RegistrationClient;
use kubelet_pb::device_plugin::RegisterRequest;
use notify::Watcher;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::plugin::CdiDevicePlugin;
use crate::pod_resources::unix_channel;
use crate::registry::CdiPluginRegistry;

/// Dial timeout for the kubelet's registration socket.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between a kubelet socket re-creation and the re-registration
/// attempts; the kubelet needs a beat before it accepts registrations.
const REREGISTER_DELAY: Duration = Duration::from_secs(1);

/// Errors raised while serving plugins.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Failed to construct plugin {name}")]
    PluginConstruction { name: String },
    #[error("Failed to bind plugin socket: {socket}")]
    Bind { socket: String },
    #[error("Failed to register {resource} with the kubelet")]
    Registration { resource: String },
    #[error("Failed to watch the kubelet socket directory")]
    WatchSetup,
}

/// Paths the serving layer operates on. Defaults are the production kubelet
/// locations; tests point them into a temp directory.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Directory the kubelet watches for plugin sockets.
    pub device_plugin_dir: PathBuf,
    /// The kubelet's registration socket.
    pub kubelet_socket: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            device_plugin_dir: PathBuf::from(kubelet_pb::DEVICE_PLUGIN_PATH),
            kubelet_socket: PathBuf::from(kubelet_pb::KUBELET_SOCKET),
        }
    }
}

/// One served plugin and the bookkeeping needed to re-register and unwind
/// it.
struct ServedPlugin {
    /// `namespace/name`, the extended resource the kubelet advertises.
    resource_name: String,
    /// Socket file name, relative to the device-plugin directory.
    endpoint: String,
    socket_path: PathBuf,
    plugin: Arc<CdiDevicePlugin>,
}

/// Serves every plugin a registry discovers until shutdown.
pub struct PluginServer {
    registry: CdiPluginRegistry,
    settings: ServerSettings,
}

impl PluginServer {
    pub fn new(registry: CdiPluginRegistry, settings: ServerSettings) -> Self {
        Self { registry, settings }
    }

    /// Discover, start, serve and register every plugin, then block until
    /// `token` fires, re-registering on kubelet restarts. On shutdown the
    /// plugins are stopped and their sockets removed.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Report<ServeError>> {
        let namespace = self.registry.resource_namespace().to_string();
        let names = self.registry.discover();
        info!(namespace = %namespace, plugins = ?names, "discovered device plugins");

        if names.is_empty() {
            warn!("the specification declares no devices, nothing to serve");
            token.cancelled().await;
            return Ok(());
        }

        let mut served = Vec::with_capacity(names.len());
        for name in &names {
            let plugin = self
                .registry
                .new_plugin(name)
                .await
                .change_context_lazy(|| ServeError::PluginConstruction { name: name.clone() })?;
            let entry = self.serve_plugin(&namespace, name, plugin, &token).await?;
            self.register(&entry).await?;
            served.push(entry);
        }

        self.watch_registrations(&served, &token).await;

        info!("shutting down device plugins");
        for entry in &served {
            entry.plugin.stop().await;
            if let Err(e) = std::fs::remove_file(&entry.socket_path) {
                debug!(
                    socket = %entry.socket_path.display(),
                    "plugin socket cleanup failed: {e}"
                );
            }
        }
        Ok(())
    }

    /// Bind the plugin's socket, seed it and spawn its gRPC server. The
    /// server drains when `token` fires.
    async fn serve_plugin(
        &self,
        namespace: &str,
        name: &str,
        plugin: Arc<CdiDevicePlugin>,
        token: &CancellationToken,
    ) -> Result<ServedPlugin, Report<ServeError>> {
        let endpoint = socket_name(namespace, name);
        let socket_path = self.settings.device_plugin_dir.join(&endpoint);

        // stale socket from a previous run
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).change_context_lazy(|| ServeError::Bind {
                socket: socket_path.display().to_string(),
            })?;
        }

        let listener = UnixListener::bind(&socket_path).change_context_lazy(|| ServeError::Bind {
            socket: socket_path.display().to_string(),
        })?;
        info!(socket = %socket_path.display(), "device plugin endpoint bound");

        plugin.start();

        let service = DevicePluginServer::from_arc(Arc::clone(&plugin));
        let shutdown = token.child_token();
        let served_socket = socket_path.clone();
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.cancelled().await;
                })
                .await;
            if let Err(e) = result {
                error!(
                    socket = %served_socket.display(),
                    "device plugin server failed: {e}"
                );
            }
        });

        Ok(ServedPlugin {
            resource_name: format!("{namespace}/{name}"),
            endpoint,
            socket_path,
            plugin,
        })
    }

    /// Announce one served plugin to the kubelet.
    async fn register(&self, entry: &ServedPlugin) -> Result<(), Report<ServeError>> {
        info!(
            resource = %entry.resource_name,
            endpoint = %entry.endpoint,
            kubelet = %self.settings.kubelet_socket.display(),
            "registering with the kubelet"
        );

        let channel = unix_channel(&self.settings.kubelet_socket, REGISTER_TIMEOUT)
            .await
            .change_context_lazy(|| ServeError::Registration {
                resource: entry.resource_name.clone(),
            })?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: kubelet_pb::DEVICE_PLUGIN_VERSION.to_string(),
            endpoint: entry.endpoint.clone(),
            resource_name: entry.resource_name.clone(),
            options: Some(CdiDevicePlugin::options()),
        };
        client
            .register(tonic::Request::new(request))
            .await
            .change_context_lazy(|| ServeError::Registration {
                resource: entry.resource_name.clone(),
            })?;
        Ok(())
    }

    /// Block until `token` fires. A kubelet restart wipes its plugin
    /// registrations, so whenever its socket is re-created every served
    /// plugin registers again.
    async fn watch_registrations(&self, served: &[ServedPlugin], token: &CancellationToken) {
        let (mut restart_rx, _watcher) =
            match spawn_restart_watcher(&self.settings.kubelet_socket) {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("kubelet restart detection unavailable: {e:?}");
                    token.cancelled().await;
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = restart_rx.recv() => match event {
                    Some(()) => {
                        info!("kubelet socket re-created, re-registering device plugins");
                        tokio::time::sleep(REREGISTER_DELAY).await;
                        for entry in served {
                            if let Err(e) = self.register(entry).await {
                                error!(
                                    resource = %entry.resource_name,
                                    "re-registration failed: {e:?}"
                                );
                            }
                        }
                    }
                    None => {
                        warn!("kubelet restart watcher stopped");
                        token.cancelled().await;
                        break;
                    }
                },
            }
        }
    }
}

/// Socket file name for one plugin endpoint; the kubelet expects it
/// relative to the device-plugin directory.
fn socket_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}.sock").replace('/', "-")
}

/// Watch the kubelet socket's directory and surface a unit event whenever
/// the socket file is created. The watcher must stay alive for events to
/// flow.
fn spawn_restart_watcher(
    kubelet_socket: &Path,
) -> Result<(mpsc::Receiver<()>, notify::RecommendedWatcher), Report<ServeError>> {
    let dir = kubelet_socket
        .parent()
        .ok_or_else(|| Report::new(ServeError::WatchSetup))?
        .to_path_buf();
    let socket = kubelet_socket.to_path_buf();

    let (tx, rx) = mpsc::channel(4);
    let mut watcher = notify::recommended_watcher(
        move |event: Result<notify::Event, notify::Error>| match event {
            Ok(event) => {
                if matches!(event.kind, notify::EventKind::Create(_))
                    && event.paths.iter().any(|path| *path == socket)
                {
                    let _ = tx.blocking_send(());
                }
            }
            Err(e) => error!("kubelet socket watch error: {e:?}"),
        },
    )
    .change_context(ServeError::WatchSetup)?;
    watcher
        .watch(&dir, notify::RecursiveMode::NonRecursive)
        .change_context(ServeError::WatchSetup)?;

    Ok((rx, watcher))
}
