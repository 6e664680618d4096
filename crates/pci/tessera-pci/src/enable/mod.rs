//! Resource and device enablement.
//!
//! [`ResourceEnabler`] turns a [`ResourceMask`] into Command register decode
//! bits; [`PciEnabler`] drives the whole reference-counted enable sequence
//! on top of it.

mod device;
mod resources;

pub use device::PciEnabler;
pub use resources::ResourceEnabler;

use bitflags::bitflags;

use crate::resource::{ResourceIndex, ResourceKind, ResourceTable};

bitflags! {
    /// Selects resource slots; bit *n* is slot *n* (BAR0-5, then the ROM).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceMask: u32 {
        /// BAR 0.
        const BAR0 = 1 << 0;
        /// BAR 1.
        const BAR1 = 1 << 1;
        /// BAR 2.
        const BAR2 = 1 << 2;
        /// BAR 3.
        const BAR3 = 1 << 3;
        /// BAR 4.
        const BAR4 = 1 << 4;
        /// BAR 5.
        const BAR5 = 1 << 5;
        /// Expansion ROM.
        const ROM = 1 << 6;
    }
}

impl ResourceMask {
    /// Returns the mask bit for one slot.
    #[must_use]
    pub const fn of(index: ResourceIndex) -> Self {
        Self::from_bits_retain(1 << index.slot())
    }

    /// Returns `true` if `index` is selected.
    #[must_use]
    pub const fn selects(self, index: ResourceIndex) -> bool {
        self.contains(Self::of(index))
    }

    /// Selects every slot of `table` whose kind is in `kinds`.
    #[must_use]
    pub fn select(table: &ResourceTable, kinds: ResourceKinds) -> Self {
        table
            .iter()
            .filter(|(_, res)| kinds.includes(res.kind()))
            .fold(Self::empty(), |mask, (index, _)| mask | Self::of(index))
    }
}

bitflags! {
    /// Address spaces an enable request asks for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceKinds: u32 {
        /// I/O port space.
        const IO = 1 << 0;
        /// Memory space.
        const MEMORY = 1 << 1;
    }
}

impl ResourceKinds {
    /// Returns `true` if resources of `kind` are requested.
    #[must_use]
    pub const fn includes(self, kind: ResourceKind) -> bool {
        match kind {
            ResourceKind::Memory => self.contains(Self::MEMORY),
            ResourceKind::Io => self.contains(Self::IO),
            ResourceKind::Unused => false,
        }
    }
}
