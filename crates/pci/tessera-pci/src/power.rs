//! Power-state collaborator.
//!
//! The enable path only ever asks for D0; the mechanics of getting there
//! (PM capability writes, platform firmware calls, delays) belong to the
//! implementation of [`PowerControl`].

use core::fmt;

use crate::device::PciDevice;
use crate::error::PowerError;

/// PCI device power states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PowerState {
    /// Fully on.
    D0,
    /// Light sleep.
    D1,
    /// Deeper sleep.
    D2,
    /// Off, auxiliary power present.
    D3Hot,
    /// Off, no power.
    D3Cold,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::D0 => "D0",
            Self::D1 => "D1",
            Self::D2 => "D2",
            Self::D3Hot => "D3hot",
            Self::D3Cold => "D3cold",
        })
    }
}

/// Moves a device between power states.
pub trait PowerControl: Sync {
    /// Requests a transition of `dev` to `state`.
    ///
    /// # Errors
    ///
    /// [`PowerError::Io`] when the device is already in `state` or cannot
    /// be power-managed at all; [`PowerError::Failed`] for a real failure.
    fn set_power_state(&self, dev: &PciDevice, state: PowerState) -> Result<(), PowerError>;
}

/// A platform without PCI power management: every device is always in D0.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPowerManagement;

impl PowerControl for NoPowerManagement {
    fn set_power_state(&self, _dev: &PciDevice, _state: PowerState) -> Result<(), PowerError> {
        Err(PowerError::Io)
    }
}
