use std::collections::HashMap;

use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use thiserror::Error;

use crate::config::MemoryUnitArg;
use crate::device::Health;
use crate::device::MemoryUnit;
use crate::device::PhysicalDevice;
use crate::device::UnitId;
use crate::device::VirtualUnit;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to query device count from the driver")]
    DeviceCount(#[source] NvmlError),
}

/// Bidirectional mapping between a physical identity and its small integer
/// index, used to translate the scheduler's device-index annotation into the
/// identity handed to containers. Built once per plugin instance.
#[derive(Debug, Clone, Default)]
pub struct DeviceNameIndex {
    by_name: HashMap<String, usize>,
    by_index: HashMap<usize, String>,
}

impl DeviceNameIndex {
    fn insert(&mut self, name: String, index: usize) {
        self.by_name.insert(name.clone(), index);
        self.by_index.insert(index, name);
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, index: usize) -> Option<&str> {
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

/// The enumerated device pool: physical devices, their virtual units, and
/// the sizing fixed at build time.
#[derive(Debug)]
pub struct DeviceCatalog {
    pub devices: Vec<PhysicalDevice>,
    pub units: Vec<VirtualUnit>,
    pub index: DeviceNameIndex,
    pub memory_unit: MemoryUnit,
    /// Advertised units per device, taken from the first enumerated device.
    pub unit_capacity: u64,
}

impl DeviceCatalog {
    /// Enumerate the node's devices and synthesize the virtual unit list.
    ///
    /// A failing device-count query is fatal; a single device that cannot be
    /// queried is skipped with a warning, degrading capacity instead of
    /// aborting.
    ///
    /// # Errors
    ///
    /// - [`CatalogError::DeviceCount`] if the driver cannot report how many
    ///   devices exist
    pub fn enumerate(nvml: &Nvml, unit_arg: MemoryUnitArg) -> Result<Self, CatalogError> {
        let count = nvml.device_count().map_err(CatalogError::DeviceCount)?;

        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            match probe_device(nvml, i as usize) {
                Ok(device) => {
                    tracing::info!(
                        "device {} at {} with {} bytes of memory",
                        device.uuid,
                        device.dev_path(),
                        device.total_memory
                    );
                    devices.push(device);
                }
                Err(e) => {
                    tracing::warn!("skipping device {i}, driver query failed: {e}");
                }
            }
        }

        Ok(Self::build(devices, unit_arg))
    }

    /// Build the catalog from already-probed devices. The memory unit and the
    /// per-device unit capacity are fixed from the first device and never
    /// revisited; a later device that disagrees is advertised at the first
    /// device's capacity.
    pub fn build(devices: Vec<PhysicalDevice>, unit_arg: MemoryUnitArg) -> Self {
        let memory_unit = devices
            .first()
            .map(|d| MemoryUnit::resolve(unit_arg, d.total_memory))
            .unwrap_or(MemoryUnit::GiB);
        let unit_capacity = devices
            .first()
            .map(|d| d.total_memory / memory_unit.bytes())
            .unwrap_or(0);

        let mut units = Vec::new();
        let mut index = DeviceNameIndex::default();
        for device in &devices {
            let own_capacity = device.total_memory / memory_unit.bytes();
            if own_capacity != unit_capacity {
                tracing::warn!(
                    "device {} holds {} {} units but the node advertises {} per device; \
                     mixed-memory nodes are not supported",
                    device.uuid,
                    own_capacity,
                    memory_unit.suffix(),
                    unit_capacity
                );
            }
            index.insert(device.uuid.clone(), device.index);
            for ordinal in 0..unit_capacity {
                match UnitId::new(&device.uuid, ordinal) {
                    Ok(id) => units.push(VirtualUnit {
                        id,
                        health: Health::Healthy,
                    }),
                    Err(e) => {
                        tracing::warn!("skipping units of device {}: {e}", device.uuid);
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "catalog holds {} devices, {} units of {} each",
            devices.len(),
            units.len(),
            memory_unit.suffix()
        );

        Self {
            devices,
            units,
            index,
            memory_unit,
            unit_capacity,
        }
    }
}

/// Initialize NVML, falling back to an explicit library path for hosts where
/// the default lookup fails.
pub fn init_nvml() -> Result<Nvml, NvmlError> {
    match Nvml::init() {
        Ok(nvml) => Ok(nvml),
        Err(_) => {
            tracing::warn!("standard NVML init failed, trying with explicit library path");
            Nvml::builder()
                .lib_path(std::ffi::OsStr::new("libnvidia-ml.so.1"))
                .init()
        }
    }
}

fn probe_device(nvml: &Nvml, index: usize) -> Result<PhysicalDevice, NvmlError> {
    let device = nvml.device_by_index(index as u32)?;
    let uuid = device.uuid()?;
    let memory = device.memory_info()?;
    let minor = device.minor_number()?;
    Ok(PhysicalDevice {
        uuid,
        index,
        total_memory: memory.total,
        minor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn device(index: usize, uuid: &str, total_memory: u64) -> PhysicalDevice {
        PhysicalDevice {
            uuid: uuid.to_string(),
            index,
            total_memory,
            minor: index as u32,
        }
    }

    #[test]
    fn sixteen_gib_device_yields_sixteen_units() {
        let catalog = DeviceCatalog::build(
            vec![device(0, "GPU-aaaa", 16 * GIB)],
            MemoryUnitArg::GiB,
        );

        assert_eq!(catalog.unit_capacity, 16);
        assert_eq!(catalog.units.len(), 16);
        assert_eq!(catalog.memory_unit, MemoryUnit::GiB);
        for unit in &catalog.units {
            assert_eq!(unit.id.physical_id(), "GPU-aaaa");
            assert_eq!(unit.health, Health::Healthy);
        }
    }

    #[test]
    fn unit_count_is_floor_of_memory_over_unit_size() {
        // 15.5 GiB of memory still advertises 15 whole units.
        let catalog = DeviceCatalog::build(
            vec![device(0, "GPU-aaaa", 15 * GIB + GIB / 2)],
            MemoryUnitArg::GiB,
        );
        assert_eq!(catalog.unit_capacity, 15);
        assert_eq!(catalog.units.len(), 15);
    }

    #[test]
    fn every_unit_maps_back_to_its_device() {
        let catalog = DeviceCatalog::build(
            vec![
                device(0, "GPU-aaaa", 2 * GIB),
                device(1, "GPU-bbbb", 2 * GIB),
            ],
            MemoryUnitArg::GiB,
        );

        assert_eq!(catalog.units.len(), 4);
        let owners: Vec<&str> = catalog.units.iter().map(|u| u.id.physical_id()).collect();
        assert_eq!(owners, ["GPU-aaaa", "GPU-aaaa", "GPU-bbbb", "GPU-bbbb"]);
    }

    #[test]
    fn auto_unit_is_fixed_by_the_first_device() {
        let catalog = DeviceCatalog::build(
            vec![device(0, "GPU-aaaa", 16 * GIB)],
            MemoryUnitArg::Auto,
        );
        assert_eq!(catalog.memory_unit, MemoryUnit::GiB);

        let catalog = DeviceCatalog::build(
            vec![device(0, "GPU-tiny", 512 * 1024 * 1024)],
            MemoryUnitArg::Auto,
        );
        assert_eq!(catalog.memory_unit, MemoryUnit::MiB);
        assert_eq!(catalog.unit_capacity, 512);
    }

    #[test_log::test]
    fn heterogeneous_devices_advertise_the_first_capacity() {
        let catalog = DeviceCatalog::build(
            vec![
                device(0, "GPU-aaaa", 8 * GIB),
                device(1, "GPU-bbbb", 16 * GIB),
            ],
            MemoryUnitArg::GiB,
        );

        assert_eq!(catalog.unit_capacity, 8);
        // Both devices advertise 8 units, the second is clamped.
        assert_eq!(catalog.units.len(), 16);
    }

    #[test]
    fn name_index_is_bidirectional() {
        let catalog = DeviceCatalog::build(
            vec![
                device(0, "GPU-aaaa", GIB),
                device(1, "GPU-bbbb", GIB),
            ],
            MemoryUnitArg::GiB,
        );

        assert_eq!(catalog.index.len(), 2);
        assert_eq!(catalog.index.index_of("GPU-bbbb"), Some(1));
        assert_eq!(catalog.index.name_of(0), Some("GPU-aaaa"));
        assert_eq!(catalog.index.name_of(7), None);
        assert_eq!(catalog.index.index_of("GPU-cccc"), None);
    }

    #[test]
    fn empty_catalog_is_well_formed() {
        let catalog = DeviceCatalog::build(Vec::new(), MemoryUnitArg::Auto);
        assert!(catalog.units.is_empty());
        assert!(catalog.index.is_empty());
        assert_eq!(catalog.unit_capacity, 0);
    }
}
