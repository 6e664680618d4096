//! Error types for configuration access and device enablement.

use alloc::boxed::Box;
use core::fmt;

use crate::access::ConfigWidth;
use crate::address::PciAddress;
use crate::device::DeviceId;
use crate::resource::ResourceIndex;

/// Outcome of a failed configuration-space transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The device is disconnected or did not answer the transaction.
    DeviceNotFound,
    /// The offset is unaligned for its width or outside the device's
    /// configuration space.
    BadRegister {
        /// Requested register offset.
        offset: u16,
        /// Requested access width.
        width: ConfigWidth,
    },
    /// The transport failed for a reason other than an absent device.
    SetFailed,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotFound => f.write_str("device not found"),
            Self::BadRegister { offset, width } => {
                write!(f, "bad register {offset:#05x} for {}-bit access", width.bits())
            }
            Self::SetFailed => f.write_str("configuration transaction failed"),
        }
    }
}

/// Failure reported by the power-state collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerError {
    /// Benign: the device is already in the target state or has no power
    /// management support. Treated as success by the enable path.
    Io,
    /// The transition failed with a collaborator-specific code.
    Failed(i32),
}

impl PowerError {
    /// Returns `true` for the indication that enable treats as success.
    #[must_use]
    pub const fn is_benign(self) -> bool {
        matches!(self, Self::Io)
    }
}

impl fmt::Display for PowerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io => f.write_str("device already in target power state"),
            Self::Failed(code) => write!(f, "power state transition failed ({code})"),
        }
    }
}

/// Errors returned by the enable/disable operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnableError {
    /// A configuration access hit a disconnected or absent device.
    DeviceNotFound,
    /// A selected resource has no address assigned.
    ResourceNotAssigned {
        /// Offending resource slot.
        index: ResourceIndex,
    },
    /// A selected resource is not registered in the address-space tree.
    ResourceNotClaimed {
        /// Offending resource slot.
        index: ResourceIndex,
    },
    /// The device could not be brought to D0.
    PowerState(PowerError),
    /// An upstream bridge could not be enabled.
    BridgeActivationFailed {
        /// Address of the bridge that failed.
        bridge: PciAddress,
        /// Why the bridge failed.
        source: Box<EnableError>,
    },
    /// The bridge chain above the device is cyclic or deeper than allowed.
    MalformedTopology {
        /// Device whose ancestry was rejected.
        device: PciAddress,
    },
    /// `disable` was called on a device that is not enabled.
    NotEnabled {
        /// Device that was disabled once too often.
        device: PciAddress,
    },
    /// The id does not name a device in the table.
    InvalidDevice(DeviceId),
    /// Any other configuration-space failure.
    Config(ConfigError),
}

impl From<ConfigError> for EnableError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::DeviceNotFound => Self::DeviceNotFound,
            other => Self::Config(other),
        }
    }
}

impl From<PowerError> for EnableError {
    fn from(err: PowerError) -> Self {
        Self::PowerState(err)
    }
}

impl fmt::Display for EnableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotFound => f.write_str("device not found"),
            Self::ResourceNotAssigned { index } => {
                write!(f, "{index} not assigned; can't enable device")
            }
            Self::ResourceNotClaimed { index } => {
                write!(f, "{index} not claimed; can't enable device")
            }
            Self::PowerState(err) => write!(f, "{err}"),
            Self::BridgeActivationFailed { bridge, source } => {
                write!(f, "upstream bridge {bridge} failed to enable: {source}")
            }
            Self::MalformedTopology { device } => {
                write!(f, "bridge chain above {device} is cyclic or too deep")
            }
            Self::NotEnabled { device } => write!(f, "{device} is not enabled"),
            Self::InvalidDevice(id) => write!(f, "no device with id {}", id.index()),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

/// Errors from parsing a `bb:dd.f` address string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressParseError {
    /// Missing `:` or `.` separator.
    Format,
    /// Bus is not a hexadecimal byte.
    Bus,
    /// Device is not hexadecimal or exceeds 0x1f.
    Device,
    /// Function is not a decimal number in 0..=7.
    Function,
}

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format => f.write_str("expected bb:dd.f"),
            Self::Bus => f.write_str("invalid bus number"),
            Self::Device => f.write_str("invalid device number"),
            Self::Function => f.write_str("invalid function number"),
        }
    }
}

// Display already renders the whole cause chain, so none of these report a
// separate source().
impl core::error::Error for ConfigError {}
impl core::error::Error for PowerError {}
impl core::error::Error for EnableError {}
impl core::error::Error for AddressParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_maps_into_enable_error() {
        assert_eq!(
            EnableError::from(ConfigError::DeviceNotFound),
            EnableError::DeviceNotFound
        );
        assert_eq!(
            EnableError::from(ConfigError::SetFailed),
            EnableError::Config(ConfigError::SetFailed)
        );
    }

    #[test]
    fn display_resource_errors() {
        assert_eq!(
            format!(
                "{}",
                EnableError::ResourceNotAssigned {
                    index: ResourceIndex::BAR2
                }
            ),
            "BAR 2 not assigned; can't enable device"
        );
        assert_eq!(
            format!(
                "{}",
                EnableError::ResourceNotClaimed {
                    index: ResourceIndex::ROM
                }
            ),
            "ROM not claimed; can't enable device"
        );
    }

    #[test]
    fn display_bridge_failure_includes_cause() {
        let err = EnableError::BridgeActivationFailed {
            bridge: PciAddress::new(0, 0x1c, 0),
            source: Box::new(EnableError::PowerState(PowerError::Failed(-5))),
        };
        assert_eq!(
            format!("{err}"),
            "upstream bridge 00:1c.0 failed to enable: power state transition failed (-5)"
        );
    }

    #[test]
    fn bad_register_display() {
        let err = ConfigError::BadRegister {
            offset: 0x103,
            width: ConfigWidth::Dword,
        };
        assert_eq!(format!("{err}"), "bad register 0x103 for 32-bit access");
    }

    #[test]
    fn power_error_benign() {
        assert!(PowerError::Io.is_benign());
        assert!(!PowerError::Failed(-19).is_benign());
    }
}
