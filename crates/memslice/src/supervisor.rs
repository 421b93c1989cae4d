use std::path::Path;
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use notify::Event;
use notify::EventKind;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use nvml_wrapper::Nvml;
use thiserror::Error;
use tokio::signal::unix::signal;
use tokio::signal::unix::Signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;

use crate::catalog;
use crate::config::Cli;
use crate::diagnostics;
use crate::plugin::PluginServer;
use crate::store;
use crate::store::KubeClaimStore;

/// How often the driver is re-probed while awaiting hardware.
const HARDWARE_PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to construct device plugin: {0:#}")]
    Construct(anyhow::Error),
    #[error("failed to serve device plugin: {0:#}")]
    Serve(anyhow::Error),
    #[error("supervisor setup failed: {0:#}")]
    Setup(anyhow::Error),
}

impl SupervisorError {
    /// Distinct exit code per failure stage, so operators can tell the
    /// cause from the exit status alone.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Construct(_) => 1,
            Self::Serve(_) => 2,
            Self::Setup(_) => 3,
        }
    }
}

struct Signals {
    hangup: Signal,
    quit: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl Signals {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }
}

/// Top-level control loop. Starts the plugin, restarts it when the kubelet
/// socket is recreated or SIGHUP arrives, dumps diagnostics on SIGQUIT, and
/// stops cleanly on SIGINT/SIGTERM. Construction and serve failures are
/// fatal; a non-functional plugin must not linger.
pub async fn run(cli: &Cli) -> Result<(), SupervisorError> {
    let mut signals = Signals::new().map_err(SupervisorError::Setup)?;

    let Some(nvml) = await_hardware(&mut signals).await else {
        return Ok(());
    };

    let client = store::init_kube_client(cli.kubeconfig.clone())
        .await
        .map_err(|e| SupervisorError::Setup(anyhow::anyhow!("{e:?}")))?;

    let (_watcher, mut fs_events) =
        watch_plugin_dir(&cli.device_plugin_path).map_err(SupervisorError::Setup)?;
    let kubelet_socket = cli.kubelet_socket();

    let mut plugin: Option<PluginServer<KubeClaimStore>> = None;
    let mut restart = true;
    loop {
        if restart {
            if let Some(previous) = plugin.take() {
                if let Err(e) = previous.stop().await {
                    tracing::warn!("failed to stop previous device plugin: {e:#}");
                }
            }
            tracing::info!("starting new device plugin instance");
            let next = PluginServer::new(cli, nvml.clone(), client.clone())
                .await
                .map_err(SupervisorError::Construct)?;
            next.serve().await.map_err(SupervisorError::Serve)?;
            plugin = Some(next);
            restart = false;
        }

        tokio::select! {
            Some(event) = fs_events.recv() => {
                if is_socket_creation(&event, &kubelet_socket) {
                    tracing::info!(
                        "inotify: {} created, restarting",
                        kubelet_socket.display()
                    );
                    restart = true;
                }
            }
            _ = signals.hangup.recv() => {
                tracing::info!("received SIGHUP, restarting");
                restart = true;
            }
            _ = signals.quit.recv() => {
                tracing::info!("received SIGQUIT, writing diagnostic dump");
                if let Err(e) = diagnostics::dump(&cli.stack_dump_dir) {
                    tracing::warn!("failed to write diagnostic dump: {e}");
                }
            }
            _ = signals.terminate.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = signals.interrupt.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    if let Some(plugin) = plugin {
        if let Err(e) = plugin.stop().await {
            tracing::warn!("failed to stop device plugin: {e:#}");
        }
    }
    Ok(())
}

/// Probe the driver until devices appear, observable through logs and
/// cancellable by termination signals. Returns `None` when told to exit.
async fn await_hardware(signals: &mut Signals) -> Option<Arc<Nvml>> {
    loop {
        match catalog::init_nvml() {
            Ok(nvml) => match nvml.device_count() {
                Ok(count) if count > 0 => {
                    tracing::info!("driver ready with {count} devices");
                    return Some(Arc::new(nvml));
                }
                Ok(_) => tracing::info!("no devices found, awaiting hardware"),
                Err(e) => tracing::warn!("device count query failed ({e}), awaiting hardware"),
            },
            Err(e) => tracing::warn!(
                "driver init failed ({e}), awaiting hardware; if this is a GPU node, \
                 is the container runtime set up for the driver?"
            ),
        }

        tokio::select! {
            _ = tokio::time::sleep(HARDWARE_PROBE_INTERVAL) => {}
            _ = signals.terminate.recv() => return None,
            _ = signals.interrupt.recv() => return None,
        }
    }
}

/// Watch the device-plugin directory, bridging notify's callback thread into
/// an async channel. Watch errors are logged and the loop continues.
fn watch_plugin_dir(dir: &Path) -> anyhow::Result<(RecommendedWatcher, mpsc::Receiver<Event>)> {
    let (tx, rx) = std_mpsc::channel();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => {
                tracing::warn!("inotify: {e}");
            }
        },
        notify::Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    let (fs_tx, fs_rx) = mpsc::channel(16);
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = rx.recv() {
            if tokio::runtime::Handle::current()
                .block_on(fs_tx.send(event))
                .is_err()
            {
                break;
            }
        }
    });

    Ok((watcher, fs_rx))
}

/// A kubelet restart shows up as its registration socket being recreated.
fn is_socket_creation(event: &Event, socket: &PathBuf) -> bool {
    matches!(event.kind, EventKind::Create(_)) && event.paths.iter().any(|path| path == socket)
}

#[cfg(test)]
mod tests {
    use notify::event::CreateKind;
    use notify::event::ModifyKind;

    use super::*;

    #[test]
    fn socket_creation_is_detected() {
        let socket = PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock");
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(socket.clone());
        assert!(is_socket_creation(&event, &socket));
    }

    #[test]
    fn other_sockets_and_kinds_are_ignored() {
        let socket = PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock");

        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/var/lib/kubelet/device-plugins/other.sock"));
        assert!(!is_socket_creation(&other, &socket));

        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(socket.clone());
        assert!(!is_socket_creation(&modify, &socket));
    }
}
