use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use utils::version;

/// Resource advertised to the kubelet, one unit per slice of GPU memory.
pub const RESOURCE_MEMORY: &str = "memslice.io/gpu-mem";
/// Node capacity resource counting physical devices.
pub const RESOURCE_COUNT: &str = "memslice.io/gpu-count";

/// File name of this plugin's socket inside the device-plugin directory.
pub const PLUGIN_SOCKET_NAME: &str = "memslice.sock";
/// File name of the kubelet's registration socket.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Annotation written by the external scheduler when it assumes a pod onto a
/// node, and flipped to `"true"` by this plugin on finalization.
pub const ANN_ASSIGNED: &str = "memslice.io/gpu-assigned";
/// Annotation carrying the scheduler's assume timestamp in unix nanoseconds.
pub const ANN_ASSUME_TIME: &str = "memslice.io/gpu-assume-time";
/// Annotation written by this plugin when a claim is finalized.
pub const ANN_ASSIGN_TIME: &str = "memslice.io/gpu-assign-time";
/// Annotation carrying the device index chosen by the scheduler extender.
pub const ANN_DEVICE_INDEX: &str = "memslice.io/gpu-index";

pub const ENV_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
pub const ENV_RESOURCE_INDEX: &str = "MEMSLICE_GPU_MEM_IDX";
pub const ENV_RESOURCE_BY_POD: &str = "MEMSLICE_GPU_MEM_POD";
pub const ENV_RESOURCE_BY_CONTAINER: &str = "MEMSLICE_GPU_MEM_CONTAINER";
pub const ENV_RESOURCE_BY_DEV: &str = "MEMSLICE_GPU_MEM_DEV";
pub const ENV_MPS_PIPE_DIRECTORY: &str = "CUDA_MPS_PIPE_DIRECTORY";
pub const ENV_MPS_ACTIVE_THREAD_PERCENTAGE: &str = "CUDA_MPS_ACTIVE_THREAD_PERCENTAGE";

/// Token file mounted into every in-cluster pod.
pub const SERVICEACCOUNT_TOKEN_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Memory-unit selection for the advertised gpu-mem units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MemoryUnitArg {
    /// Decide from the first measured device and keep that choice for the
    /// whole process lifetime.
    #[value(name = "auto")]
    Auto,
    /// One unit per GiB of device memory.
    #[value(name = "GiB")]
    GiB,
    /// One unit per MiB of device memory.
    #[value(name = "MiB")]
    MiB,
}

#[derive(Parser)]
#[command(about, long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on, used to filter assumed pods"
    )]
    pub node_name: String,

    #[arg(
        long,
        default_value = "auto",
        help = "Memory unit of the advertised gpu-mem resource, 'GiB', 'MiB' or 'auto'"
    )]
    pub memory_unit: MemoryUnitArg,

    #[arg(
        long,
        help = "Enable XID-based device health checking",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub health_check: bool,

    #[arg(
        long,
        help = "Enable CUDA MPS integration for allocated containers",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub enable_mps: bool,

    #[arg(
        long,
        default_value = "/tmp/nvidia-mps",
        help = "CUDA MPS pipe directory mounted into allocated containers"
    )]
    pub mps_pipe_dir: String,

    #[arg(
        long,
        help = "Query pending pods from the kubelet instead of the API server",
        default_value_t = false,
        action = clap::ArgAction::Set
    )]
    pub query_kubelet: bool,

    #[arg(
        long,
        default_value = "127.0.0.1",
        help = "Kubelet address for the read-only pods query"
    )]
    pub kubelet_address: String,

    #[arg(long, default_value_t = 10250, help = "Kubelet listened port")]
    pub kubelet_port: u16,

    #[arg(
        long,
        help = "Kubelet client bearer token (defaults to the serviceaccount token)"
    )]
    pub kubelet_token: Option<String>,

    #[arg(
        long,
        default_value_t = 10,
        help = "Kubelet client http timeout in seconds"
    )]
    pub kubelet_timeout: u64,

    #[arg(
        long,
        env = "KUBECONFIG",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to kubeconfig file (defaults to cluster config or ~/.kube/config)"
    )]
    pub kubeconfig: Option<PathBuf>,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Directory holding the kubelet and device-plugin sockets"
    )]
    pub device_plugin_path: PathBuf,

    #[arg(
        long,
        default_value = "/var/log/memslice",
        help = "Directory for diagnostic stack dumps written on SIGQUIT"
    )]
    pub stack_dump_dir: PathBuf,
}

impl Cli {
    /// Full path of this plugin's socket.
    pub fn plugin_socket(&self) -> PathBuf {
        self.device_plugin_path.join(PLUGIN_SOCKET_NAME)
    }

    /// Full path of the kubelet registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.device_plugin_path.join(KUBELET_SOCKET_NAME)
    }
}
