//! Mock kubelet services for tests.
//!
//! Real gRPC servers bound to Unix sockets in a temp directory: a
//! pod-resources lister whose reported assignments are scripted by the test,
//! and a registration endpoint that records every request it receives.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use kubelet_pb::device_plugin::registration_server::Registration;
use kubelet_pb::device_plugin::registration_server::RegistrationServer;
use kubelet_pb::device_plugin::Empty;
use kubelet_pb::device_plugin::RegisterRequest;
use kubelet_pb::pod_resources::pod_resources_lister_server::PodResourcesLister;
use kubelet_pb::pod_resources::pod_resources_lister_server::PodResourcesListerServer;
use kubelet_pb::pod_resources::ContainerDevices;
use kubelet_pb::pod_resources::ContainerResources;
use kubelet_pb::pod_resources::ListPodResourcesRequest;
use kubelet_pb::pod_resources::ListPodResourcesResponse;
use kubelet_pb::pod_resources::PodResources;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Channel;
use tonic::Request;
use tonic::Response;
use tonic::Status;
use tracing::debug;

/// One container's worth of reported device assignments.
#[derive(Debug, Clone)]
pub struct ContainerAssignment {
    pub pod: String,
    pub namespace: String,
    pub container: String,
    pub resource: String,
    pub device_ids: Vec<String>,
}

impl ContainerAssignment {
    pub fn new(resource: &str, device_ids: &[&str]) -> Self {
        Self {
            pod: "pod-0".to_string(),
            namespace: "default".to_string(),
            container: "main".to_string(),
            resource: resource.to_string(),
            device_ids: device_ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    pub fn in_container(mut self, container: &str) -> Self {
        self.container = container.to_string();
        self
    }

    pub fn in_pod(mut self, pod: &str) -> Self {
        self.pod = pod.to_string();
        self
    }
}

/// Scriptable view of what the node's containers currently hold. Tests
/// mutate it between calls; the served lister reads it on every `List`.
#[derive(Debug, Default)]
pub struct AssignmentBook {
    assignments: Mutex<Vec<ContainerAssignment>>,
    failing: Mutex<bool>,
}

impl AssignmentBook {
    pub fn record(&self, assignment: ContainerAssignment) {
        self.assignments.lock().unwrap().push(assignment);
    }

    pub fn clear(&self) {
        self.assignments.lock().unwrap().clear();
    }

    /// When set, `List` answers with an unavailable status.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn failing(&self) -> bool {
        *self.failing.lock().unwrap()
    }

    fn response(&self) -> ListPodResourcesResponse {
        let assignments = self.assignments.lock().unwrap();
        let pod_resources = assignments
            .iter()
            .map(|assignment| PodResources {
                name: assignment.pod.clone(),
                namespace: assignment.namespace.clone(),
                containers: vec![ContainerResources {
                    name: assignment.container.clone(),
                    devices: vec![ContainerDevices {
                        resource_name: assignment.resource.clone(),
                        device_ids: assignment.device_ids.clone(),
                    }],
                }],
            })
            .collect();
        ListPodResourcesResponse { pod_resources }
    }
}

struct MockPodResourcesService {
    book: Arc<AssignmentBook>,
}

#[tonic::async_trait]
impl PodResourcesLister for MockPodResourcesService {
    async fn list(
        &self,
        _request: Request<ListPodResourcesRequest>,
    ) -> Result<Response<ListPodResourcesResponse>, Status> {
        if self.book.failing() {
            return Err(Status::unavailable("scripted failure"));
        }
        Ok(Response::new(self.book.response()))
    }
}

/// Bind `socket` and serve a scripted pod-resources lister until the
/// returned task is aborted.
pub fn serve_pod_resources(socket: &Path, book: Arc<AssignmentBook>) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket).expect("bind mock pod-resources socket");
    tokio::spawn(async move {
        let service = PodResourcesListerServer::new(MockPodResourcesService { book });
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
        {
            debug!("mock pod-resources server exited: {e}");
        }
    })
}

/// Every registration request the mock kubelet has accepted, in order.
#[derive(Debug, Default)]
pub struct RegistrationLog {
    requests: Mutex<Vec<RegisterRequest>>,
}

impl RegistrationLog {
    pub fn requests(&self) -> Vec<RegisterRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct MockRegistrationService {
    log: Arc<RegistrationLog>,
}

#[tonic::async_trait]
impl Registration for MockRegistrationService {
    async fn register(&self, request: Request<RegisterRequest>) -> Result<Response<Empty>, Status> {
        self.log.requests.lock().unwrap().push(request.into_inner());
        Ok(Response::new(Empty {}))
    }
}

/// Bind `socket` and serve a registration endpoint that records requests
/// into `log` until the returned task is aborted.
pub fn serve_registration(socket: &Path, log: Arc<RegistrationLog>) -> JoinHandle<()> {
    let listener = UnixListener::bind(socket).expect("bind mock registration socket");
    tokio::spawn(async move {
        let service = RegistrationServer::new(MockRegistrationService { log });
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(service)
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
        {
            debug!("mock registration server exited: {e}");
        }
    })
}

/// Channel to a Unix socket, for driving served plugins from tests.
pub async fn connect_unix(socket: &Path) -> Channel {
    crate::pod_resources::unix_channel(socket, Duration::from_secs(5))
        .await
        .expect("connect to unix socket")
}
