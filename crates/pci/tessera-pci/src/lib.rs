//! PCI device enablement for Tessera.
//!
//! Takes a discovered PCI function from "present but inert" to "decoding its
//! address space": validates the selected BARs against their allocation
//! state, activates upstream bridges first, commits the Command register with
//! a single read-modify-write and keeps a per-device enable count so nested
//! callers share one physical activation.
//!
//! Configuration-space transactions, power-state transitions and address
//! mapping are collaborators supplied by the caller through the
//! [`ConfigTransport`], [`PowerControl`] and [`IoMapper`] traits.
//!
//! ```text
//! PciEnabler::enable_device_flags
//!   ├── enable upstream bridge (recursive, bounded)
//!   ├── PowerControl::set_power_state(D0)
//!   ├── ResourceEnabler::enable_resources   ── ResourceTable eligibility
//!   ├── INTx reconciliation                 ── ConfigAccessor
//!   └── CapabilityScanner (MSI / MSI-X off) ── ConfigAccessor
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod address;
pub mod capability;
pub mod config;
pub mod device;
pub mod enable;
pub mod error;
pub mod iomap;
pub mod logger;
pub mod power;
pub mod regs;
pub mod resource;
pub mod sim;

pub use access::{ConfigAccessor, ConfigTransport, ConfigWidth};
pub use address::PciAddress;
pub use capability::CapabilityScanner;
pub use config::EnableConfig;
pub use device::{DeviceId, DeviceTable, PciDevice};
pub use enable::{PciEnabler, ResourceEnabler, ResourceKinds, ResourceMask};
pub use error::{ConfigError, EnableError, PowerError};
pub use iomap::{IoMapper, MappedRegion};
pub use power::{PowerControl, PowerState};
pub use resource::{Resource, ResourceIndex, ResourceKind, ResourceTable};
