use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use device_plugin_pb::api;
use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::Mount;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use futures::Stream;
use hyper_util::rt::TokioIo;
use kube::Client;
use nvml_wrapper::Nvml;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;

use crate::allocate::AllocationMatcher;
use crate::allocate::Assignment;
use crate::catalog::DeviceCatalog;
use crate::config::Cli;
use crate::config::ENV_MPS_ACTIVE_THREAD_PERCENTAGE;
use crate::config::ENV_MPS_PIPE_DIRECTORY;
use crate::config::ENV_RESOURCE_BY_CONTAINER;
use crate::config::ENV_RESOURCE_BY_DEV;
use crate::config::ENV_RESOURCE_BY_POD;
use crate::config::ENV_RESOURCE_INDEX;
use crate::config::ENV_VISIBLE_DEVICES;
use crate::config::RESOURCE_MEMORY;
use crate::device::MemoryUnit;
use crate::device::VirtualUnit;
use crate::health;
use crate::node;
use crate::store::load_kubelet_token;
use crate::store::ClaimStore;
use crate::store::KubeClaimStore;
use crate::store::KubeletClient;

/// Timeout for the readiness self-connect and the registration dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// CUDA MPS settings handed to allocated containers.
#[derive(Debug, Clone)]
pub struct MpsConfig {
    pub pipe_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PluginState {
    Stopped,
    Starting,
    Serving,
}

/// The device plugin: owns the unit list built by one catalog enumeration
/// and speaks the kubelet's device-plugin protocol over a unix socket.
/// Constructed fresh per lifetime; a restart discards and rebuilds
/// everything.
pub struct PluginServer<S> {
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    units: Arc<Mutex<Vec<VirtualUnit>>>,
    update_tx: Arc<watch::Sender<u64>>,
    matcher: Arc<AllocationMatcher<S>>,
    /// Physical identities, for fault-event registration.
    device_ids: Vec<String>,
    unit_capacity: u64,
    memory_unit: MemoryUnit,
    mps: Option<MpsConfig>,
    health_check: bool,
    nvml: Option<Arc<Nvml>>,
    state: Mutex<PluginState>,
    cancel: CancellationToken,
    /// Dedicated stop channel for the health subsystem; dropped on stop.
    health_stop: Mutex<Option<std_mpsc::Sender<()>>>,
}

impl PluginServer<KubeClaimStore> {
    /// Enumerate devices, patch the node's device-count capacity, and wire
    /// up the workload store. Any failure here is fatal to this lifetime.
    pub async fn new(cli: &Cli, nvml: Arc<Nvml>, client: Client) -> anyhow::Result<Self> {
        let catalog = DeviceCatalog::enumerate(&nvml, cli.memory_unit)?;

        node::patch_device_count(&client, &cli.node_name, catalog.devices.len())
            .await
            .map_err(|e| anyhow::anyhow!("failed to patch node device count: {e:?}"))?;

        let kubelet = if cli.query_kubelet {
            let token = load_kubelet_token(cli.kubelet_token.as_deref())
                .map_err(|e| anyhow::anyhow!("failed to load kubelet token: {e:?}"))?;
            Some(
                KubeletClient::new(
                    &cli.kubelet_address,
                    cli.kubelet_port,
                    token,
                    Duration::from_secs(cli.kubelet_timeout),
                )
                .map_err(|e| anyhow::anyhow!("failed to build kubelet client: {e:?}"))?,
            )
        } else {
            None
        };
        let store = KubeClaimStore::new(client, cli.node_name.clone(), kubelet);

        let mps = cli.enable_mps.then(|| MpsConfig {
            pipe_dir: cli.mps_pipe_dir.clone(),
        });

        Ok(Self::from_parts(
            catalog,
            store,
            cli.plugin_socket(),
            cli.kubelet_socket(),
            cli.health_check,
            mps,
            Some(nvml),
        ))
    }
}

impl<S: ClaimStore + 'static> PluginServer<S> {
    pub(crate) fn from_parts(
        catalog: DeviceCatalog,
        store: S,
        socket_path: PathBuf,
        kubelet_socket: PathBuf,
        health_check: bool,
        mps: Option<MpsConfig>,
        nvml: Option<Arc<Nvml>>,
    ) -> Self {
        let device_ids = catalog.devices.iter().map(|d| d.uuid.clone()).collect();
        let device_count = catalog.devices.len();
        let matcher = Arc::new(AllocationMatcher::new(store, catalog.index, device_count));
        let (update_tx, _) = watch::channel(0u64);

        Self {
            socket_path,
            kubelet_socket,
            units: Arc::new(Mutex::new(catalog.units)),
            update_tx: Arc::new(update_tx),
            matcher,
            device_ids,
            unit_capacity: catalog.unit_capacity,
            memory_unit: catalog.memory_unit,
            mps,
            health_check,
            nvml,
            state: Mutex::new(PluginState::Stopped),
            cancel: CancellationToken::new(),
            health_stop: Mutex::new(None),
        }
    }

    /// Start the gRPC server and register with the kubelet. A registration
    /// failure rolls the plugin back to Stopped.
    pub async fn serve(&self) -> anyhow::Result<()> {
        self.start().await?;
        tracing::info!("starting to serve on {}", self.socket_path.display());

        if let Err(e) = self.register().await {
            tracing::warn!("could not register device plugin: {e:#}");
            self.stop().await?;
            return Err(e);
        }
        tracing::info!("registered device plugin with kubelet");
        Ok(())
    }

    /// Bind the plugin socket, serve, confirm readiness with a blocking
    /// self-connect, then launch the health subsystem.
    async fn start(&self) -> anyhow::Result<()> {
        self.set_state(PluginState::Starting);

        remove_socket(&self.socket_path)?;
        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;

        let service = DevicePluginService {
            units: self.units.clone(),
            update_tx: self.update_tx.clone(),
            matcher: self.matcher.clone(),
            alloc_gate: Arc::new(tokio::sync::Mutex::new(())),
            cancel: self.cancel.clone(),
            unit_capacity: self.unit_capacity,
            memory_unit: self.memory_unit,
            mps: self.mps.clone(),
        };
        let server = DevicePluginServer::new(service);

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                cancel.cancelled().await;
                tracing::info!("shutting down device plugin server");
            };
            let result = tonic::transport::Server::builder()
                .add_service(server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    shutdown,
                )
                .await;
            if let Err(e) = result {
                tracing::error!("device plugin server failed: {e}");
            }
        });

        // Wait for the server by launching a blocking connection.
        let channel = tokio::time::timeout(DIAL_TIMEOUT, dial_uds(self.socket_path.clone()))
            .await
            .context("timed out waiting for the plugin socket to accept connections")??;
        drop(channel);

        if self.health_check {
            if let Some(nvml) = &self.nvml {
                let (stop_tx, stop_rx) = std_mpsc::channel();
                *self.health_stop.lock().expect("health stop lock poisoned") = Some(stop_tx);
                health::spawn(
                    nvml.clone(),
                    self.device_ids.clone(),
                    self.units.clone(),
                    self.update_tx.clone(),
                    self.cancel.clone(),
                    stop_rx,
                )
                .context("failed to spawn health threads")?;
            }
        }

        self.set_state(PluginState::Serving);
        Ok(())
    }

    /// Announce this plugin's resource and socket to the kubelet.
    async fn register(&self) -> anyhow::Result<()> {
        tracing::info!(
            "registering device plugin with kubelet: {}",
            self.kubelet_socket.display()
        );
        let channel = tokio::time::timeout(DIAL_TIMEOUT, dial_uds(self.kubelet_socket.clone()))
            .await
            .context("timed out dialing the kubelet registration socket")??;
        let mut client = RegistrationClient::new(channel);

        let endpoint = self
            .socket_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let request = RegisterRequest {
            version: api::VERSION.to_string(),
            endpoint,
            resource_name: RESOURCE_MEMORY.to_string(),
            options: Some(DevicePluginOptions::default()),
        };

        client
            .register(Request::new(request))
            .await
            .context("registration failed")?;
        Ok(())
    }

    /// Stop serving, tear down the health subsystem, and remove the socket.
    /// Calling it when already stopped is a no-op.
    pub async fn stop(&self) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("plugin state lock poisoned");
            if *state == PluginState::Stopped {
                return Ok(());
            }
            *state = PluginState::Stopped;
        }

        self.cancel.cancel();
        self.health_stop
            .lock()
            .expect("health stop lock poisoned")
            .take();
        remove_socket(&self.socket_path)?;
        Ok(())
    }

    fn set_state(&self, state: PluginState) {
        *self.state.lock().expect("plugin state lock poisoned") = state;
    }
}

fn remove_socket(path: &PathBuf) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove socket {}", path.display())),
    }
}

/// Create a unix domain socket client connection.
async fn dial_uds(socket_path: PathBuf) -> anyhow::Result<Channel> {
    // The HTTP URL is a placeholder since we're using a unix socket connector.
    let channel = Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;
    Ok(channel)
}

/// DevicePlugin service implementation backing one plugin lifetime.
pub(crate) struct DevicePluginService<S> {
    pub(crate) units: Arc<Mutex<Vec<VirtualUnit>>>,
    pub(crate) update_tx: Arc<watch::Sender<u64>>,
    pub(crate) matcher: Arc<AllocationMatcher<S>>,
    /// Serializes every Allocate's whole match-and-patch sequence; two
    /// concurrent requests must never claim the same workload.
    pub(crate) alloc_gate: Arc<tokio::sync::Mutex<()>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) unit_capacity: u64,
    pub(crate) memory_unit: MemoryUnit,
    pub(crate) mps: Option<MpsConfig>,
}

impl<S> DevicePluginService<S> {
    fn base_envs(&self, pod_units: u64, container_units: u64) -> HashMap<String, String> {
        let mut envs = HashMap::new();
        envs.insert(ENV_RESOURCE_BY_POD.to_string(), pod_units.to_string());
        envs.insert(
            ENV_RESOURCE_BY_CONTAINER.to_string(),
            container_units.to_string(),
        );
        envs.insert(
            ENV_RESOURCE_BY_DEV.to_string(),
            self.unit_capacity.to_string(),
        );
        if let Some(mps) = &self.mps {
            envs.insert(
                ENV_MPS_ACTIVE_THREAD_PERCENTAGE.to_string(),
                (100 * container_units / self.unit_capacity.max(1)).to_string(),
            );
            envs.insert(ENV_MPS_PIPE_DIRECTORY.to_string(), mps.pipe_dir.clone());
        }
        envs
    }

    fn build_response(
        &self,
        req: &AllocateRequest,
        pod_units: u64,
        assignment: &Assignment,
    ) -> AllocateResponse {
        let mut container_responses = Vec::new();
        for container_req in &req.container_requests {
            let container_units = container_req.devices_i_ds.len() as u64;
            let mut envs = self.base_envs(pod_units, container_units);
            envs.insert(
                ENV_VISIBLE_DEVICES.to_string(),
                assignment.device_id.clone(),
            );
            envs.insert(
                ENV_RESOURCE_INDEX.to_string(),
                assignment.device_index.to_string(),
            );

            let mut mounts = Vec::new();
            if let Some(mps) = &self.mps {
                mounts.push(Mount {
                    container_path: mps.pipe_dir.clone(),
                    host_path: mps.pipe_dir.clone(),
                    read_only: false,
                });
            }

            container_responses.push(ContainerAllocateResponse {
                envs,
                mounts,
                ..Default::default()
            });
        }
        AllocateResponse {
            container_responses,
        }
    }

    /// A well-formed response whose environment communicates the
    /// unsatisfiable request, so the workload fails predictably instead of
    /// blocking on a transport error.
    fn build_err_response(&self, req: &AllocateRequest, pod_units: u64) -> AllocateResponse {
        let mut container_responses = Vec::new();
        for container_req in &req.container_requests {
            let container_units = container_req.devices_i_ds.len() as u64;
            let mut envs = self.base_envs(pod_units, container_units);
            envs.insert(
                ENV_VISIBLE_DEVICES.to_string(),
                format!("no-gpu-has-{pod_units}{}-to-run", self.memory_unit.suffix()),
            );
            envs.insert(ENV_RESOURCE_INDEX.to_string(), "-1".to_string());

            container_responses.push(ContainerAllocateResponse {
                envs,
                ..Default::default()
            });
        }
        AllocateResponse {
            container_responses,
        }
    }
}

#[tonic::async_trait]
impl<S: ClaimStore + 'static> DevicePlugin for DevicePluginService<S> {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(DevicePluginOptions::default()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Send the full device list immediately, then again on every health
    /// transition, until the plugin stops.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        tracing::info!("starting to watch device list");

        let (tx, rx) = mpsc::unbounded_channel();
        let units = self.units.clone();
        let mut updates = self.update_tx.subscribe();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let snapshot = |units: &Arc<Mutex<Vec<VirtualUnit>>>| {
                let units = units.lock().expect("unit list lock poisoned");
                units
                    .iter()
                    .map(|unit| api::Device {
                        id: unit.id.as_str().to_string(),
                        health: unit.health.as_str().to_string(),
                        topology: None,
                    })
                    .collect::<Vec<_>>()
            };

            if tx
                .send(Ok(ListAndWatchResponse {
                    devices: snapshot(&units),
                }))
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let response = ListAndWatchResponse { devices: snapshot(&units) };
                        if tx.send(Ok(response)).is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("device watch task stopped");
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        tracing::debug!("getting preferred device allocation: {:?}", request.into_inner());
        Ok(Response::new(PreferredAllocationResponse {
            container_responses: vec![],
        }))
    }

    /// Resolve the request against the assumed workloads and hand the chosen
    /// device to every container via the environment contract.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        let pod_units: u64 = req
            .container_requests
            .iter()
            .map(|r| r.devices_i_ds.len() as u64)
            .sum();
        tracing::info!(
            "allocating {pod_units} {} of gpu memory for a pod",
            self.memory_unit.suffix()
        );

        let _gate = self.alloc_gate.lock().await;

        let response = match self.matcher.match_and_assign(pod_units).await {
            Ok(assignment) => {
                tracing::info!(
                    "assigned device {} (index {}) for {pod_units} units",
                    assignment.device_id,
                    assignment.device_index
                );
                self.build_response(&req, pod_units, &assignment)
            }
            Err(e) => {
                tracing::warn!("allocation of {pod_units} units cannot be satisfied: {e:?}");
                self.build_err_response(&req, pod_units)
            }
        };
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::join;

    use super::*;
    use crate::allocate::tests::MockStore;
    use crate::catalog::DeviceCatalog;
    use crate::claim::tests::assumed_pod;
    use crate::config::MemoryUnitArg;
    use crate::device::PhysicalDevice;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn test_catalog() -> DeviceCatalog {
        DeviceCatalog::build(
            vec![
                PhysicalDevice {
                    uuid: "GPU-aaaa".to_string(),
                    index: 0,
                    total_memory: 16 * GIB,
                    minor: 0,
                },
                PhysicalDevice {
                    uuid: "GPU-bbbb".to_string(),
                    index: 1,
                    total_memory: 16 * GIB,
                    minor: 1,
                },
            ],
            MemoryUnitArg::GiB,
        )
    }

    fn test_service(store: MockStore, mps: Option<MpsConfig>) -> DevicePluginService<MockStore> {
        let catalog = test_catalog();
        let device_count = catalog.devices.len();
        let (update_tx, _) = watch::channel(0u64);
        DevicePluginService {
            units: Arc::new(Mutex::new(catalog.units)),
            update_tx: Arc::new(update_tx),
            matcher: Arc::new(AllocationMatcher::new(store, catalog.index, device_count)),
            alloc_gate: Arc::new(tokio::sync::Mutex::new(())),
            cancel: CancellationToken::new(),
            unit_capacity: catalog.unit_capacity,
            memory_unit: catalog.memory_unit,
            mps,
        }
    }

    fn allocate_request(container_units: &[usize]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: container_units
                .iter()
                .map(|count| device_plugin_pb::api::ContainerAllocateRequest {
                    devices_i_ds: (0..*count).map(|i| format!("unit-{i}")).collect(),
                })
                .collect(),
        })
    }

    fn env_of<'a>(
        response: &'a AllocateResponse,
        container: usize,
        key: &str,
    ) -> Option<&'a str> {
        response.container_responses[container]
            .envs
            .get(key)
            .map(String::as_str)
    }

    #[tokio::test]
    async fn allocate_emits_the_env_contract() {
        let store = MockStore::new(vec![assumed_pod("w1", 4, 50, "false", Some(1))]);
        let service = test_service(store, None);

        let response = service
            .allocate(allocate_request(&[3, 1]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(response.container_responses.len(), 2);
        assert_eq!(env_of(&response, 0, ENV_VISIBLE_DEVICES), Some("GPU-bbbb"));
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_INDEX), Some("1"));
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_BY_POD), Some("4"));
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_BY_CONTAINER), Some("3"));
        assert_eq!(env_of(&response, 1, ENV_RESOURCE_BY_CONTAINER), Some("1"));
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_BY_DEV), Some("16"));
    }

    #[tokio::test]
    async fn unsatisfiable_allocate_returns_a_diagnostic_response() {
        let service = test_service(MockStore::new(Vec::new()), None);

        let response = service
            .allocate(allocate_request(&[4]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            env_of(&response, 0, ENV_VISIBLE_DEVICES),
            Some("no-gpu-has-4GiB-to-run")
        );
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_INDEX), Some("-1"));
        assert_eq!(env_of(&response, 0, ENV_RESOURCE_BY_DEV), Some("16"));
    }

    #[tokio::test]
    async fn mps_envs_and_mount_are_added_when_enabled() {
        let store = MockStore::new(vec![assumed_pod("w1", 4, 50, "false", Some(0))]);
        let service = test_service(
            store,
            Some(MpsConfig {
                pipe_dir: "/tmp/nvidia-mps".to_string(),
            }),
        );

        let response = service
            .allocate(allocate_request(&[4]))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(
            env_of(&response, 0, ENV_MPS_ACTIVE_THREAD_PERCENTAGE),
            Some("25")
        );
        assert_eq!(
            env_of(&response, 0, ENV_MPS_PIPE_DIRECTORY),
            Some("/tmp/nvidia-mps")
        );
        let mounts = &response.container_responses[0].mounts;
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].host_path, "/tmp/nvidia-mps");
    }

    #[tokio::test]
    async fn concurrent_allocates_satisfy_exactly_one_caller() {
        // One claim, two racing requests: the serialized match-and-patch
        // sequence must hand the claim to exactly one of them.
        let store = MockStore::new(vec![assumed_pod("w1", 4, 50, "false", Some(0))]);
        let service = Arc::new(test_service(store, None));

        let (left, right) = join!(
            service.allocate(allocate_request(&[4])),
            service.allocate(allocate_request(&[4]))
        );
        let left = left.unwrap().into_inner();
        let right = right.unwrap().into_inner();

        let succeeded = [&left, &right]
            .iter()
            .filter(|response| env_of(response, 0, ENV_RESOURCE_INDEX) != Some("-1"))
            .count();
        assert_eq!(succeeded, 1);
    }

    #[tokio::test]
    async fn list_and_watch_pushes_health_transitions() {
        let service = test_service(MockStore::new(Vec::new()), None);
        let units = service.units.clone();
        let update_tx = service.update_tx.clone();

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.devices.len(), 32);
        assert!(initial.devices.iter().all(|d| d.health == api::HEALTHY));

        {
            let mut units = units.lock().unwrap();
            health::mark_unhealthy(&mut units, Some("GPU-aaaa"));
        }
        update_tx.send_modify(|version| *version += 1);

        let updated = stream.next().await.unwrap().unwrap();
        let unhealthy = updated
            .devices
            .iter()
            .filter(|d| d.health == api::UNHEALTHY)
            .count();
        assert_eq!(unhealthy, 16);
    }

    #[tokio::test]
    async fn ambiguous_fault_shows_every_unit_unhealthy_in_the_next_push() {
        let service = test_service(MockStore::new(Vec::new()), None);
        let units = service.units.clone();
        let update_tx = service.update_tx.clone();

        let mut stream = service
            .list_and_watch(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        let _ = stream.next().await.unwrap().unwrap();

        {
            let mut units = units.lock().unwrap();
            health::mark_unhealthy(&mut units, None);
        }
        update_tx.send_modify(|version| *version += 1);

        let updated = stream.next().await.unwrap().unwrap();
        assert!(updated.devices.iter().all(|d| d.health == api::UNHEALTHY));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = PluginServer::from_parts(
            test_catalog(),
            MockStore::new(Vec::new()),
            dir.path().join("memslice.sock"),
            dir.path().join("kubelet.sock"),
            false,
            None,
            None,
        );

        plugin.start().await.unwrap();
        assert!(dir.path().join("memslice.sock").exists());

        plugin.stop().await.unwrap();
        assert!(!dir.path().join("memslice.sock").exists());
        // A second stop is a no-op, not an error.
        plugin.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = PluginServer::from_parts(
            test_catalog(),
            MockStore::new(Vec::new()),
            dir.path().join("memslice.sock"),
            dir.path().join("kubelet.sock"),
            false,
            None,
            None,
        );
        plugin.stop().await.unwrap();
    }
}
