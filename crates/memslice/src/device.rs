use std::fmt;

use thiserror::Error;

use crate::config::MemoryUnitArg;

/// Separator between the physical identity and the slice ordinal inside a
/// synthetic unit ID. A physical identity must never contain this token,
/// otherwise the encoding would not be reversible.
const UNIT_ID_SEPARATOR: &str = "-_-";

/// Devices reporting more memory than this (in MiB) get GiB granularity when
/// the memory unit is left on `auto`.
const UNIT_INFER_THRESHOLD_MIB: u64 = 1024;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("physical device id `{0}` contains the reserved separator `{UNIT_ID_SEPARATOR}`")]
    ReservedSeparator(String),
}

/// A real accelerator as enumerated from the driver. Immutable within one
/// plugin lifetime; re-enumerated on restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub uuid: String,
    pub index: usize,
    /// Total memory in bytes.
    pub total_memory: u64,
    pub minor: u32,
}

impl PhysicalDevice {
    /// Host path of the device node.
    pub fn dev_path(&self) -> String {
        format!("/dev/nvidia{}", self.minor)
    }
}

/// Synthetic ID of one virtual unit, encoded as `{physical-id}-_-{ordinal}`.
///
/// The encoding is reversible: [`UnitId::physical_id`] recovers the owning
/// physical identity without ambiguity because the separator is rejected in
/// physical identities at construction time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnitId {
    encoded: String,
}

impl UnitId {
    pub fn new(physical_id: &str, ordinal: u64) -> Result<Self, DeviceIdError> {
        if physical_id.contains(UNIT_ID_SEPARATOR) {
            return Err(DeviceIdError::ReservedSeparator(physical_id.to_string()));
        }
        Ok(Self {
            encoded: format!("{physical_id}{UNIT_ID_SEPARATOR}{ordinal}"),
        })
    }

    /// The owning physical identity.
    pub fn physical_id(&self) -> &str {
        physical_id_of(&self.encoded)
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

/// Recover the physical identity from an encoded unit ID string, e.g. one
/// handed back by the kubelet in an allocate request.
pub fn physical_id_of(encoded: &str) -> &str {
    encoded.split(UNIT_ID_SEPARATOR).next().unwrap_or(encoded)
}

/// Health of a virtual unit. There is no transition back to `Healthy` within
/// one plugin lifetime; recovery requires a full restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => device_plugin_pb::api::HEALTHY,
            Self::Unhealthy => device_plugin_pb::api::UNHEALTHY,
        }
    }
}

/// One allocatable slice of a physical device's memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualUnit {
    pub id: UnitId,
    pub health: Health,
}

/// Granularity of the advertised gpu-mem units. Fixed once per process, at
/// catalog build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryUnit {
    GiB,
    MiB,
}

impl MemoryUnit {
    pub const fn bytes(self) -> u64 {
        match self {
            Self::GiB => GIB,
            Self::MiB => MIB,
        }
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            Self::GiB => "GiB",
            Self::MiB => "MiB",
        }
    }

    /// Resolve the configured unit against the first measured device. The
    /// result is never revisited, even if later devices would disagree.
    pub fn resolve(arg: MemoryUnitArg, first_total_memory: u64) -> Self {
        match arg {
            MemoryUnitArg::GiB => Self::GiB,
            MemoryUnitArg::MiB => Self::MiB,
            MemoryUnitArg::Auto => {
                if first_total_memory / MIB > UNIT_INFER_THRESHOLD_MIB {
                    Self::GiB
                } else {
                    Self::MiB
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_id_encodes_identity_and_ordinal() {
        let id = UnitId::new("GPU-fef8089b-4820-abfc-e83e-94318197576e", 3).unwrap();
        assert_eq!(
            id.as_str(),
            "GPU-fef8089b-4820-abfc-e83e-94318197576e-_-3"
        );
        assert_eq!(
            id.physical_id(),
            "GPU-fef8089b-4820-abfc-e83e-94318197576e"
        );
    }

    #[test]
    fn unit_id_rejects_reserved_separator() {
        let result = UnitId::new("GPU-bad-_-id", 0);
        assert!(matches!(result, Err(DeviceIdError::ReservedSeparator(_))));
    }

    #[test]
    fn unit_id_round_trips_arbitrary_identities() {
        // Identity strings a driver could plausibly report, none containing
        // the separator; every one must survive encode -> decode unchanged.
        let identities = [
            "GPU-fef8089b-4820-abfc-e83e-94318197576e",
            "MIG-GPU-12345678-1234-1234-1234-123456789abc/1/0",
            "0000:3b:00.0",
            "gpu_0",
            "a",
            "GPU--doubled--dashes",
            "GPU-ümlaut-идентичность",
            "-_leading-underscore",
            "trailing-_",
        ];
        for identity in identities {
            for ordinal in [0u64, 1, 15, u64::MAX] {
                let id = UnitId::new(identity, ordinal).unwrap();
                assert_eq!(id.physical_id(), identity, "identity {identity:?}");
                assert_eq!(physical_id_of(id.as_str()), identity);
            }
        }
    }

    #[test]
    fn physical_id_of_plain_string_is_identity() {
        assert_eq!(physical_id_of("no-separator-here"), "no-separator-here");
    }

    #[test]
    fn memory_unit_resolution() {
        assert_eq!(MemoryUnit::resolve(MemoryUnitArg::GiB, 0), MemoryUnit::GiB);
        assert_eq!(MemoryUnit::resolve(MemoryUnitArg::MiB, 0), MemoryUnit::MiB);
        // 16 GiB card: large MiB count implies GiB granularity.
        assert_eq!(
            MemoryUnit::resolve(MemoryUnitArg::Auto, 16 * GIB),
            MemoryUnit::GiB
        );
        // Tiny device stays at MiB granularity.
        assert_eq!(
            MemoryUnit::resolve(MemoryUnitArg::Auto, 512 * MIB),
            MemoryUnit::MiB
        );
    }
}
