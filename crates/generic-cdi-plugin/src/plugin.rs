//! Per-resource device lifecycle manager.
//!
//! One `CdiDevicePlugin` owns the advertised pool for a single
//! `class`/`resource` pair, answers the kubelet's device-plugin RPCs and,
//! between `start` and `stop`, reconciles the pool against the kubelet's
//! pod-resources accounting.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use error_stack::Report;
use futures::Stream;
use kubelet_pb::device_plugin::device_plugin_server::DevicePlugin;
use kubelet_pb::device_plugin::AllocateRequest;
use kubelet_pb::device_plugin::AllocateResponse;
use kubelet_pb::device_plugin::CdiDevice;
use kubelet_pb::device_plugin::ContainerAllocateResponse;
use kubelet_pb::device_plugin::DevicePluginOptions;
use kubelet_pb::device_plugin::Empty;
use kubelet_pb::device_plugin::ListAndWatchResponse;
use kubelet_pb::device_plugin::PreStartContainerRequest;
use kubelet_pb::device_plugin::PreStartContainerResponse;
use kubelet_pb::device_plugin::PreferredAllocationRequest;
use kubelet_pb::device_plugin::PreferredAllocationResponse;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device_pool::DevicePool;
use crate::pod_resources::PodResourcesClient;
use crate::pod_resources::PodResourcesError;

/// Lifecycle of one plugin instance. There is no transition out of
/// `Stopped`; a stopped plugin is discarded, not restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Tuning knobs shared by every plugin instance.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// How often the advertised pool is reconciled against the kubelet's
    /// accounting (a zero interval is clamped).
    pub reconcile_interval: Duration,
    /// Fresh spare devices kept in the pool ahead of demand (minimum 1).
    pub spare_capacity: usize,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(30),
            spare_capacity: 1,
        }
    }
}

/// Device lifecycle manager for one `class`/`resource` pair.
#[derive(Debug)]
pub struct CdiDevicePlugin {
    class: String,
    resource: String,
    pool: Arc<DevicePool>,
    config: PluginConfig,
    /// Level-triggered "pool changed" signal. Every watch stream holds its
    /// own receiver, so rapid mutations may coalesce into one wake-up but
    /// every subscriber sees the latest pool.
    update_tx: watch::Sender<()>,
    /// Stop signal, observed by the reconciler and every watch stream.
    stop_token: CancellationToken,
    state: Mutex<PluginState>,
    /// Accounting client. Taken on stop; dropping the last clone releases
    /// the underlying channel.
    client: Mutex<Option<PodResourcesClient>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl CdiDevicePlugin {
    /// A plugin in `Created` state with an empty pool and fresh signals.
    pub fn new(
        class: impl Into<String>,
        resource: impl Into<String>,
        client: PodResourcesClient,
        mut config: PluginConfig,
    ) -> Arc<Self> {
        // The reconcile timer needs a non-zero period.
        config.reconcile_interval = config.reconcile_interval.max(Duration::from_millis(1));
        let (update_tx, _) = watch::channel(());
        Arc::new(Self {
            class: class.into(),
            resource: resource.into(),
            pool: Arc::new(DevicePool::new(config.spare_capacity)),
            config,
            update_tx,
            stop_token: CancellationToken::new(),
            state: Mutex::new(PluginState::Created),
            client: Mutex::new(Some(client)),
            reconciler: Mutex::new(None),
        })
    }

    /// Static capability flags: no pre-start hook, no preferred allocation.
    pub fn options() -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: false,
        }
    }

    /// `class=resource`, the CDI reference handed out on allocation.
    pub fn cdi_name(&self) -> String {
        format!("{}={}", self.class, self.resource)
    }

    /// `class-resource`, the resource key assignment records are filtered
    /// on during reconciliation.
    pub fn accounting_resource(&self) -> String {
        format!("{}-{}", self.class, self.resource)
    }

    pub fn state(&self) -> PluginState {
        *self.state.lock().expect("plugin state lock")
    }

    /// Number of devices currently advertised.
    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// Ids currently advertised, in pool order.
    pub fn advertised_ids(&self) -> Vec<String> {
        self.pool.snapshot().into_iter().map(|d| d.id).collect()
    }

    /// Seed the pool and launch the reconciler; returns immediately.
    ///
    /// Only the `Created -> Started` transition does anything; starting a
    /// plugin twice, or after it stopped, logs and returns.
    pub fn start(self: &Arc<Self>) {
        let client = {
            let mut state = self.state.lock().expect("plugin state lock");
            if *state != PluginState::Created {
                warn!(
                    class = %self.class,
                    resource = %self.resource,
                    state = ?*state,
                    "start ignored, plugin is not freshly created"
                );
                return;
            }
            let Some(client) = self.client.lock().expect("accounting client lock").clone()
            else {
                warn!(
                    class = %self.class,
                    resource = %self.resource,
                    "start ignored, accounting client already released"
                );
                return;
            };
            *state = PluginState::Started;
            client
        };

        let minted = self.pool.replenish();
        info!(
            class = %self.class,
            resource = %self.resource,
            devices = ?minted,
            "seeded device pool"
        );

        let plugin = Arc::clone(self);
        let handle = tokio::spawn(async move { plugin.run_reconciler(client).await });
        *self.reconciler.lock().expect("reconciler handle lock") = Some(handle);
    }

    /// Raise the stop signal, wait for the reconciler to exit and release
    /// the accounting client. Active watch streams end and the pool stops
    /// being reconciled. Idempotent; a second stop returns immediately.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().expect("plugin state lock");
            match *state {
                PluginState::Created | PluginState::Started => *state = PluginState::Stopping,
                PluginState::Stopping | PluginState::Stopped => {
                    debug!(
                        class = %self.class,
                        resource = %self.resource,
                        "stop ignored, plugin is already stopping"
                    );
                    return;
                }
            }
        }

        info!(class = %self.class, resource = %self.resource, "stopping device plugin");
        self.stop_token.cancel();

        let handle = self.reconciler.lock().expect("reconciler handle lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(
                    class = %self.class,
                    resource = %self.resource,
                    "reconciler task failed: {e}"
                );
            }
        }

        // Dropping the last clone closes the accounting connection.
        self.client.lock().expect("accounting client lock").take();

        *self.state.lock().expect("plugin state lock") = PluginState::Stopped;
    }

    async fn run_reconciler(self: Arc<Self>, client: PodResourcesClient) {
        let resource = self.accounting_resource();
        info!(
            resource = %resource,
            interval = ?self.config.reconcile_interval,
            "starting pool reconciler"
        );

        // First pass one full interval after start; tick() would fire
        // immediately otherwise.
        let first = tokio::time::Instant::now() + self.config.reconcile_interval;
        let mut ticker = interval_at(first, self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.stop_token.cancelled() => {
                    info!(resource = %resource, "pool reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once(&client).await {
                        // The previous pool stays advertised; the next tick
                        // retries.
                        error!(resource = %resource, "reconcile failed: {e:?}");
                    }
                }
            }
        }
    }

    /// One reconciliation pass: read the node-wide assignments, rebuild the
    /// pool from the ids bound to this resource and publish the change.
    async fn reconcile_once(
        &self,
        client: &PodResourcesClient,
    ) -> Result<(), Report<PodResourcesError>> {
        let started = Instant::now();
        let resource = self.accounting_resource();

        let assigned = client.assigned_device_ids(&resource).await?;
        let assigned_count = assigned.len();
        let minted = self.pool.rebuild(assigned);
        // rebuild has released the pool lock by the time the signal goes
        // out, so no watcher wakes into a held lock.
        self.update_tx.send_replace(());

        debug!(
            resource = %resource,
            assigned = assigned_count,
            spares = minted.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reconciled device pool"
        );
        Ok(())
    }
}

#[tonic::async_trait]
impl DevicePlugin for CdiDevicePlugin {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!(class = %self.class, resource = %self.resource, "reporting plugin options");
        Ok(Response::new(Self::options()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the current pool immediately, then a fresh snapshot after every
    /// update signal, until the plugin stops or the subscriber hangs up.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(class = %self.class, resource = %self.resource, "watch stream opened");

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::clone(&self.pool);
        let mut update_rx = self.update_tx.subscribe();
        let stop = self.stop_token.clone();
        let class = self.class.clone();
        let resource = self.resource.clone();

        tokio::spawn(async move {
            loop {
                let devices = pool.snapshot();
                debug!(
                    class = %class,
                    resource = %resource,
                    devices = devices.len(),
                    "publishing pool snapshot"
                );
                if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                    debug!(class = %class, resource = %resource, "watch subscriber went away");
                    break;
                }
                tokio::select! {
                    _ = stop.cancelled() => {
                        info!(class = %class, resource = %resource, "watch stream closing");
                        break;
                    }
                    changed = update_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(UnboundedReceiverStream::new(rx))))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: Vec::new(),
        }))
    }

    /// Answer every requested device id with the same CDI reference and
    /// mint replacement capacity for the consumed entries.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let cdi_name = self.cdi_name();

        let mut container_responses = Vec::with_capacity(req.container_requests.len());
        for container_req in &req.container_requests {
            let mut cdi_devices = Vec::with_capacity(container_req.devices_ids.len());
            for device_id in &container_req.devices_ids {
                info!(
                    class = %self.class,
                    resource = %self.resource,
                    device_id = %device_id,
                    "allocating {cdi_name}"
                );
                cdi_devices.push(CdiDevice {
                    name: cdi_name.clone(),
                });
            }
            container_responses.push(ContainerAllocateResponse {
                cdi_devices,
                ..Default::default()
            });
        }

        let minted = self.pool.replenish();
        info!(
            class = %self.class,
            resource = %self.resource,
            devices = ?minted,
            "replenished pool after allocation"
        );
        // replenish has released the pool lock before the signal goes out.
        self.update_tx.send_replace(());

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
