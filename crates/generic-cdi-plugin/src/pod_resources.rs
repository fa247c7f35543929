//! Client for the kubelet pod-resources API.
//!
//! The reconciler treats this endpoint as the source of truth for which
//! device ids are actually assigned to containers on the node.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use kubelet_pb::pod_resources::pod_resources_lister_client::PodResourcesListerClient;
use kubelet_pb::pod_resources::ListPodResourcesRequest;
use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;
use tracing::debug;

/// Dial timeout for the pod-resources socket.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest `List` response the client will decode.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Errors talking to the pod-resources endpoint.
#[derive(Debug, Error)]
pub enum PodResourcesError {
    #[error("Failed to connect to pod-resources socket: {socket}")]
    ConnectionFailed { socket: String },
    #[error("Pod-resources List query failed")]
    QueryFailed,
}

/// gRPC channel over a Unix socket. The URI authority is a placeholder;
/// the connector dials the socket path.
pub(crate) async fn unix_channel(
    socket: &Path,
    connect_timeout: Duration,
) -> Result<Channel, tonic::transport::Error> {
    let socket = socket.to_path_buf();
    Endpoint::try_from("http://[::]:50051")?
        .connect_timeout(connect_timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
}

/// Thin wrapper over the generated lister client. Clones share the
/// underlying channel; dropping the last clone releases the connection.
#[derive(Debug, Clone)]
pub struct PodResourcesClient {
    inner: PodResourcesListerClient<Channel>,
}

impl PodResourcesClient {
    /// Connect over the kubelet's pod-resources Unix socket.
    pub async fn connect<P: Into<PathBuf>>(
        socket: P,
        connect_timeout: Duration,
        max_message_size: usize,
    ) -> Result<Self, Report<PodResourcesError>> {
        let socket = socket.into();
        let channel = unix_channel(&socket, connect_timeout)
            .await
            .change_context_lazy(|| PodResourcesError::ConnectionFailed {
                socket: socket.display().to_string(),
            })?;

        let inner =
            PodResourcesListerClient::new(channel).max_decoding_message_size(max_message_size);

        Ok(Self { inner })
    }

    /// Distinct device ids currently assigned to `resource`, across every
    /// pod and container on the node.
    pub async fn assigned_device_ids(
        &self,
        resource: &str,
    ) -> Result<BTreeSet<String>, Report<PodResourcesError>> {
        let mut client = self.inner.clone();
        let response = client
            .list(tonic::Request::new(ListPodResourcesRequest {}))
            .await
            .change_context(PodResourcesError::QueryFailed)?
            .into_inner();

        let mut assigned = BTreeSet::new();
        for pod in &response.pod_resources {
            for container in &pod.containers {
                for device in &container.devices {
                    if device.resource_name != resource {
                        continue;
                    }
                    debug!(
                        pod = %pod.name,
                        namespace = %pod.namespace,
                        container = %container.name,
                        device_ids = ?device.device_ids,
                        "found assigned devices"
                    );
                    assigned.extend(device.device_ids.iter().cloned());
                }
            }
        }
        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mock::AssignmentBook;
    use crate::mock::ContainerAssignment;

    #[tokio::test]
    async fn test_assigned_device_ids_filters_on_resource_name() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let socket = dir.path().join("pod-resources.sock");

        let book = Arc::new(AssignmentBook::default());
        book.record(ContainerAssignment::new("acme-gpu-dev0", &["id-a", "id-b"]));
        book.record(ContainerAssignment::new("other.vendor/disk", &["id-c"]));
        let server = crate::mock::serve_pod_resources(&socket, book);

        let client = PodResourcesClient::connect(&socket, Duration::from_secs(5), MAX_MESSAGE_SIZE)
            .await
            .expect("should connect to the mock socket");

        let assigned = client
            .assigned_device_ids("acme-gpu-dev0")
            .await
            .expect("List should succeed");
        assert_eq!(
            assigned,
            BTreeSet::from(["id-a".to_string(), "id-b".to_string()]),
            "only ids bound to the requested resource should be returned"
        );

        server.abort();
    }

    #[tokio::test]
    async fn test_assigned_device_ids_deduplicates_across_containers() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let socket = dir.path().join("pod-resources.sock");

        let book = Arc::new(AssignmentBook::default());
        book.record(ContainerAssignment::new("acme-gpu-dev0", &["id-a"]));
        book.record(
            ContainerAssignment::new("acme-gpu-dev0", &["id-a", "id-b"]).in_container("sidecar"),
        );
        let server = crate::mock::serve_pod_resources(&socket, book);

        let client = PodResourcesClient::connect(&socket, Duration::from_secs(5), MAX_MESSAGE_SIZE)
            .await
            .expect("should connect to the mock socket");

        let assigned = client
            .assigned_device_ids("acme-gpu-dev0")
            .await
            .expect("List should succeed");
        assert_eq!(
            assigned.len(),
            2,
            "an id reported by two containers should appear once"
        );

        server.abort();
    }

    #[tokio::test]
    async fn test_query_failure_is_reported() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let socket = dir.path().join("pod-resources.sock");

        let book = Arc::new(AssignmentBook::default());
        book.set_failing(true);
        let server = crate::mock::serve_pod_resources(&socket, book);

        let client = PodResourcesClient::connect(&socket, Duration::from_secs(5), MAX_MESSAGE_SIZE)
            .await
            .expect("should connect to the mock socket");

        let err = client
            .assigned_device_ids("acme-gpu-dev0")
            .await
            .expect_err("a failing endpoint should surface an error");
        assert!(matches!(
            err.current_context(),
            PodResourcesError::QueryFailed
        ));

        server.abort();
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let socket = dir.path().join("absent.sock");

        let err = PodResourcesClient::connect(&socket, Duration::from_millis(200), MAX_MESSAGE_SIZE)
            .await
            .expect_err("connecting to a nonexistent socket should fail");
        assert!(matches!(
            err.current_context(),
            PodResourcesError::ConnectionFailed { .. }
        ));
    }
}
