use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::device::Health;
use crate::device::VirtualUnit;

/// XID codes reported for application-level faults rather than hardware
/// failures; the device stays healthy.
/// http://docs.nvidia.com/deploy/xid-errors/index.html#topic_4
const APPLICATION_XIDS: [u64; 3] = [31, 43, 45];

/// How long one event wait blocks before re-checking for shutdown.
const FAULT_WAIT_TIMEOUT_MS: u32 = 5000;

/// A critical fault reported by the driver. `device_id` is absent when the
/// event carries no usable identity, in which case every device is suspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub device_id: Option<String>,
}

/// Start the health subsystem: a monitor thread watching driver fault events
/// and a dispatch thread applying them to the shared unit list.
///
/// The channel between the two is an unbuffered rendezvous, so the monitor
/// blocks until each fault has actually been consumed and no event is ever
/// dropped. Teardown is signalled through the cancellation token and the
/// `stop_rx` channel; dropping the plugin's sender half unblocks the monitor.
pub fn spawn(
    nvml: Arc<Nvml>,
    device_ids: Vec<String>,
    units: Arc<Mutex<Vec<VirtualUnit>>>,
    update_tx: Arc<watch::Sender<u64>>,
    cancel: CancellationToken,
    stop_rx: mpsc::Receiver<()>,
) -> std::io::Result<()> {
    let (fault_tx, fault_rx) = mpsc::sync_channel::<FaultEvent>(0);

    thread::Builder::new()
        .name("memslice-health".to_string())
        .spawn(move || {
            if let Err(e) = watch_faults(&nvml, &device_ids, &fault_tx, &cancel, &stop_rx) {
                tracing::warn!("fault watch stopped: {e:#}");
            }
        })?;

    thread::Builder::new()
        .name("memslice-health-dispatch".to_string())
        .spawn(move || dispatch_faults(&fault_rx, &units, &update_tx))?;

    Ok(())
}

/// Register every device for critical-XID events and forward faults until
/// shutdown. Devices whose driver cannot register events are reported
/// unhealthy immediately instead of being silently assumed healthy.
fn watch_faults(
    nvml: &Nvml,
    device_ids: &[String],
    fault_tx: &mpsc::SyncSender<FaultEvent>,
    cancel: &CancellationToken,
    stop_rx: &mpsc::Receiver<()>,
) -> anyhow::Result<()> {
    let mut event_set = nvml.create_event_set()?;

    for device_id in device_ids {
        let device = match nvml.device_by_uuid(device_id.as_str()) {
            Ok(device) => device,
            Err(e) => {
                tracing::warn!("cannot reacquire device {device_id} for health watch: {e}");
                continue;
            }
        };

        let supported = device
            .supported_event_types()
            .unwrap_or_else(|_| EventTypes::empty());
        if !supported.contains(EventTypes::CRITICAL_XID_ERROR) {
            tracing::warn!(
                "device {device_id} is too old to support health checking, marking it unhealthy"
            );
            fault_tx.send(FaultEvent {
                device_id: Some(device_id.clone()),
            })?;
            continue;
        }

        event_set = device.register_events(EventTypes::CRITICAL_XID_ERROR, event_set)?;
    }

    loop {
        if cancel.is_cancelled() || should_stop(stop_rx) {
            return Ok(());
        }

        let event = match event_set.wait(FAULT_WAIT_TIMEOUT_MS) {
            Ok(event) => event,
            Err(NvmlError::Timeout) => continue,
            Err(e) => {
                tracing::warn!("event wait failed: {e}");
                continue;
            }
        };

        if !event.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
            continue;
        }
        if let Some(XidError::Value(xid)) = event.event_data {
            if APPLICATION_XIDS.contains(&xid) {
                continue;
            }
        }

        let device_id = match event.device.uuid() {
            Ok(uuid) if !uuid.is_empty() => Some(uuid),
            // No usable identity on the event: every device is suspect.
            _ => None,
        };

        fault_tx.send(FaultEvent { device_id })?;
    }
}

fn should_stop(stop_rx: &mpsc::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Apply each fault to the unit list and wake the ListAndWatch streams.
/// Exits once the monitor's sender half is gone.
fn dispatch_faults(
    fault_rx: &mpsc::Receiver<FaultEvent>,
    units: &Mutex<Vec<VirtualUnit>>,
    update_tx: &watch::Sender<u64>,
) {
    while let Ok(fault) = fault_rx.recv() {
        let marked = {
            let mut units = units.lock().expect("unit list lock poisoned");
            mark_unhealthy(&mut units, fault.device_id.as_deref())
        };
        if marked > 0 {
            tracing::warn!(
                "marked {marked} units unhealthy for device {}",
                fault.device_id.as_deref().unwrap_or("<all>")
            );
            update_tx.send_modify(|version| *version += 1);
        }
    }
}

/// Mark the units of `device_id` unhealthy, or every unit when the fault has
/// no identity. Returns how many units actually transitioned; there is no
/// transition back within this plugin lifetime.
pub(crate) fn mark_unhealthy(units: &mut [VirtualUnit], device_id: Option<&str>) -> usize {
    let mut marked = 0;
    for unit in units.iter_mut() {
        if unit.health == Health::Unhealthy {
            continue;
        }
        if device_id.is_none_or(|id| unit.id.physical_id() == id) {
            unit.health = Health::Unhealthy;
            marked += 1;
        }
    }
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UnitId;

    fn units_of(devices: &[(&str, u64)]) -> Vec<VirtualUnit> {
        let mut units = Vec::new();
        for (uuid, count) in devices {
            for ordinal in 0..*count {
                units.push(VirtualUnit {
                    id: UnitId::new(uuid, ordinal).unwrap(),
                    health: Health::Healthy,
                });
            }
        }
        units
    }

    #[test]
    fn fault_with_identity_marks_only_that_device() {
        let mut units = units_of(&[("GPU-aaaa", 2), ("GPU-bbbb", 2)]);

        let marked = mark_unhealthy(&mut units, Some("GPU-aaaa"));

        assert_eq!(marked, 2);
        for unit in &units {
            let expected = if unit.id.physical_id() == "GPU-aaaa" {
                Health::Unhealthy
            } else {
                Health::Healthy
            };
            assert_eq!(unit.health, expected, "{}", unit.id);
        }
    }

    #[test]
    fn ambiguous_fault_marks_every_unit() {
        let mut units = units_of(&[("GPU-aaaa", 2), ("GPU-bbbb", 3)]);

        let marked = mark_unhealthy(&mut units, None);

        assert_eq!(marked, 5);
        assert!(units.iter().all(|u| u.health == Health::Unhealthy));
    }

    #[test]
    fn already_unhealthy_units_are_not_recounted() {
        let mut units = units_of(&[("GPU-aaaa", 2)]);
        assert_eq!(mark_unhealthy(&mut units, Some("GPU-aaaa")), 2);
        assert_eq!(mark_unhealthy(&mut units, Some("GPU-aaaa")), 0);
        assert_eq!(mark_unhealthy(&mut units, None), 0);
    }

    #[test]
    fn unknown_device_marks_nothing() {
        let mut units = units_of(&[("GPU-aaaa", 2)]);
        assert_eq!(mark_unhealthy(&mut units, Some("GPU-zzzz")), 0);
        assert!(units.iter().all(|u| u.health == Health::Healthy));
    }

    #[test]
    fn dispatch_bumps_the_watch_version_and_exits_on_disconnect() {
        let units = Mutex::new(units_of(&[("GPU-aaaa", 2)]));
        let (update_tx, update_rx) = watch::channel(0u64);
        let (fault_tx, fault_rx) = mpsc::sync_channel::<FaultEvent>(0);

        let handle = std::thread::spawn({
            move || {
                fault_tx
                    .send(FaultEvent {
                        device_id: Some("GPU-aaaa".to_string()),
                    })
                    .unwrap();
                // Dropping the sender terminates the dispatch loop.
            }
        });

        dispatch_faults(&fault_rx, &units, &update_tx);
        handle.join().unwrap();

        assert_eq!(*update_rx.borrow(), 1);
        assert!(units
            .lock()
            .unwrap()
            .iter()
            .all(|u| u.health == Health::Unhealthy));
    }
}
