//! Per-device resource descriptors.
//!
//! Each function owns [`PCI_NUM_RESOURCES`] slots: the six standard BARs and
//! the expansion ROM. A slot records what kind of address space it decodes,
//! whether an address has been assigned and whether the range has been
//! claimed in the system address-space tree. Assignment and claiming are
//! done by the resource allocator; this crate only reads them.

use core::fmt;

use bitflags::bitflags;

/// Number of standard BARs in a type 0 header.
pub const PCI_STD_NUM_BARS: usize = 6;

/// Number of resource slots tracked per device (BAR0-5 plus the ROM).
pub const PCI_NUM_RESOURCES: usize = PCI_STD_NUM_BARS + 1;

/// Identifies a resource slot.
///
/// Only valid slots can be named: the six BAR constants, [`Self::ROM`], or
/// the checked [`Self::bar`] / [`Self::from_slot`] constructors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIndex(u8);

impl ResourceIndex {
    /// Slot number of the expansion ROM.
    pub const ROM_SLOT: usize = PCI_STD_NUM_BARS;

    /// BAR 0.
    pub const BAR0: Self = Self(0);
    /// BAR 1.
    pub const BAR1: Self = Self(1);
    /// BAR 2.
    pub const BAR2: Self = Self(2);
    /// BAR 3.
    pub const BAR3: Self = Self(3);
    /// BAR 4.
    pub const BAR4: Self = Self(4);
    /// BAR 5.
    pub const BAR5: Self = Self(5);
    /// Expansion ROM.
    pub const ROM: Self = Self(Self::ROM_SLOT as u8);

    /// Standard BAR `n`, or `None` unless `n` is in `0..6`.
    #[must_use]
    pub const fn bar(n: u8) -> Option<Self> {
        if (n as usize) < PCI_STD_NUM_BARS {
            Some(Self(n))
        } else {
            None
        }
    }

    /// Returns the slot number (BARs `0..6`, ROM `6`). This is also the bit
    /// position of the slot in a resource mask.
    #[must_use]
    pub const fn slot(self) -> usize {
        self.0 as usize
    }

    /// Converts a slot number back into an index.
    #[must_use]
    pub const fn from_slot(slot: usize) -> Option<Self> {
        if slot < PCI_NUM_RESOURCES {
            Some(Self(slot as u8))
        } else {
            None
        }
    }

    /// Iterates every slot in order, ROM last.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..PCI_NUM_RESOURCES).filter_map(Self::from_slot)
    }

    /// Returns `true` for the expansion ROM slot.
    #[must_use]
    pub const fn is_rom(self) -> bool {
        self.slot() == Self::ROM_SLOT
    }
}

impl fmt::Display for ResourceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_rom() {
            f.write_str("ROM")
        } else {
            write!(f, "BAR {}", self.0)
        }
    }
}

/// Address space a resource decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    /// Memory space.
    Memory,
    /// I/O port space.
    Io,
    /// Slot not implemented (or the upper half of a 64-bit BAR).
    Unused,
}

bitflags! {
    /// State flags carried by a [`Resource`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResourceFlags: u32 {
        /// No address has been assigned yet.
        const UNSET = 1 << 0;
        /// Prefetchable memory.
        const PREFETCH = 1 << 1;
        /// 64-bit memory BAR.
        const MEM_64 = 1 << 2;
        /// ROM address decoding is enabled (ROM slot only).
        const ROM_ENABLE = 1 << 3;
    }
}

/// Why a resource may or may not be activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// The resource may be activated; the payload says which decode bit.
    Enable(ResourceKind),
    /// Neither memory nor I/O: outside any activation request.
    SkipUnused,
    /// ROM slot whose decoding is switched off.
    SkipRomDisabled,
    /// No address assigned. Fatal for the request.
    NotAssigned,
    /// Not present in the address-space tree. Fatal for the request.
    NotClaimed,
}

/// One address-space region of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resource {
    kind: ResourceKind,
    start: u64,
    size: u64,
    flags: ResourceFlags,
    /// Enclosing node in the address-space tree; `Some` once claimed.
    parent: Option<u32>,
}

impl Resource {
    /// An unimplemented slot.
    pub const UNUSED: Self = Self {
        kind: ResourceKind::Unused,
        start: 0,
        size: 0,
        flags: ResourceFlags::empty(),
        parent: None,
    };

    /// A memory region at `start`, not yet claimed.
    #[must_use]
    pub const fn memory(start: u64, size: u64) -> Self {
        Self {
            kind: ResourceKind::Memory,
            start,
            size,
            flags: ResourceFlags::empty(),
            parent: None,
        }
    }

    /// An I/O port region at `start`, not yet claimed.
    #[must_use]
    pub const fn io(start: u64, size: u64) -> Self {
        Self {
            kind: ResourceKind::Io,
            start,
            size,
            flags: ResourceFlags::empty(),
            parent: None,
        }
    }

    /// Marks the resource as having no assigned address.
    #[must_use]
    pub const fn unset(mut self) -> Self {
        self.flags = self.flags.union(ResourceFlags::UNSET);
        self
    }

    /// Records the address-space tree node the resource was claimed under.
    #[must_use]
    pub const fn claimed(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets or clears ROM address decoding.
    #[must_use]
    pub const fn with_rom_enabled(mut self, enabled: bool) -> Self {
        self.flags = if enabled {
            self.flags.union(ResourceFlags::ROM_ENABLE)
        } else {
            self.flags.difference(ResourceFlags::ROM_ENABLE)
        };
        self
    }

    /// Adds state flags.
    #[must_use]
    pub const fn with_flags(mut self, flags: ResourceFlags) -> Self {
        self.flags = self.flags.union(flags);
        self
    }

    /// Address space kind.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Base address.
    #[must_use]
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// Length in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// State flags.
    #[must_use]
    pub const fn flags(&self) -> ResourceFlags {
        self.flags
    }

    /// Parent node in the address-space tree, if claimed.
    #[must_use]
    pub const fn parent(&self) -> Option<u32> {
        self.parent
    }

    /// Returns `true` if no address has been assigned.
    #[must_use]
    pub const fn is_unset(&self) -> bool {
        self.flags.contains(ResourceFlags::UNSET)
    }

    /// Returns `true` once the range is registered in the address-space tree.
    #[must_use]
    pub const fn is_claimed(&self) -> bool {
        self.parent.is_some()
    }

    /// Returns `true` if ROM decoding is on.
    #[must_use]
    pub const fn rom_enabled(&self) -> bool {
        self.flags.contains(ResourceFlags::ROM_ENABLE)
    }

    /// Classifies the resource for activation in slot `index`.
    ///
    /// Checks run in a fixed order: kind, ROM decode, assignment, claim.
    #[must_use]
    pub const fn eligibility(&self, index: ResourceIndex) -> Eligibility {
        if matches!(self.kind, ResourceKind::Unused) {
            return Eligibility::SkipUnused;
        }
        if index.is_rom() && !self.rom_enabled() {
            return Eligibility::SkipRomDisabled;
        }
        if self.is_unset() {
            return Eligibility::NotAssigned;
        }
        if !self.is_claimed() {
            return Eligibility::NotClaimed;
        }
        Eligibility::Enable(self.kind)
    }

    /// Returns `true` if the resource in slot `index` may be activated.
    #[must_use]
    pub const fn is_enableable(&self, index: ResourceIndex) -> bool {
        matches!(self.eligibility(index), Eligibility::Enable(_))
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::UNUSED
    }
}

/// Decoded PCI Base Address Register, as produced by BAR sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciBar {
    /// Memory-mapped BAR.
    Memory {
        /// Base physical address.
        base: u64,
        /// Size in bytes.
        size: u64,
        /// Whether the region is prefetchable.
        prefetchable: bool,
        /// Whether this is a 64-bit BAR (consumes two BAR slots).
        is_64bit: bool,
    },
    /// I/O port BAR.
    Io {
        /// Base I/O port address.
        base: u32,
        /// Size in bytes.
        size: u32,
    },
    /// BAR slot is unused or consumed by the upper half of a 64-bit BAR.
    Unused,
}

impl From<PciBar> for Resource {
    /// Builds an unclaimed resource; a zero base means firmware left the BAR
    /// unassigned.
    fn from(bar: PciBar) -> Self {
        let res = match bar {
            PciBar::Memory {
                base,
                size,
                prefetchable,
                is_64bit,
            } => {
                let mut flags = ResourceFlags::empty();
                flags.set(ResourceFlags::PREFETCH, prefetchable);
                flags.set(ResourceFlags::MEM_64, is_64bit);
                Self::memory(base, size).with_flags(flags)
            }
            PciBar::Io { base, size } => Self::io(u64::from(base), u64::from(size)),
            PciBar::Unused => return Self::UNUSED,
        };
        if res.start == 0 { res.unset() } else { res }
    }
}

/// The resource slots of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceTable {
    slots: [Resource; PCI_NUM_RESOURCES],
}

impl ResourceTable {
    /// A table with every slot unused.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [Resource::UNUSED; PCI_NUM_RESOURCES],
        }
    }

    /// Builds a table from decoded BARs; the ROM slot stays unused.
    #[must_use]
    pub fn from_bars(bars: &[PciBar; PCI_STD_NUM_BARS]) -> Self {
        let mut table = Self::new();
        for (slot, bar) in table.slots.iter_mut().zip(bars) {
            *slot = Resource::from(*bar);
        }
        table
    }

    /// Returns the resource in `index`.
    #[must_use]
    pub fn get(&self, index: ResourceIndex) -> &Resource {
        &self.slots[index.slot()]
    }

    /// Returns the resource in `index` for the allocator to update.
    pub fn get_mut(&mut self, index: ResourceIndex) -> &mut Resource {
        &mut self.slots[index.slot()]
    }

    /// Replaces the resource in `index`.
    pub fn set(&mut self, index: ResourceIndex, res: Resource) {
        self.slots[index.slot()] = res;
    }

    /// Returns `true` if the resource in `index` may be activated.
    #[must_use]
    pub fn is_enableable(&self, index: ResourceIndex) -> bool {
        self.get(index).is_enableable(index)
    }

    /// Iterates all slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceIndex, &Resource)> {
        ResourceIndex::all().zip(self.slots.iter())
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_numbering() {
        assert_eq!(ResourceIndex::BAR0.slot(), 0);
        assert_eq!(ResourceIndex::BAR5.slot(), 5);
        assert_eq!(ResourceIndex::ROM.slot(), 6);
        assert_eq!(ResourceIndex::from_slot(6), Some(ResourceIndex::ROM));
        assert_eq!(ResourceIndex::from_slot(7), None);
        assert_eq!(ResourceIndex::all().count(), PCI_NUM_RESOURCES);
    }

    #[test]
    fn bar_constructor_rejects_rom_and_beyond() {
        assert_eq!(ResourceIndex::bar(5), Some(ResourceIndex::BAR5));
        assert_eq!(ResourceIndex::bar(6), None);
        assert_eq!(ResourceIndex::bar(7), None);
        assert_eq!(ResourceIndex::bar(u8::MAX), None);
        assert!(ResourceIndex::all().all(|i| i.slot() < PCI_NUM_RESOURCES));
        assert_eq!(ResourceIndex::BAR3.to_string(), "BAR 3");
        assert_eq!(ResourceIndex::ROM.to_string(), "ROM");
    }

    #[test]
    fn claimed_memory_is_enableable() {
        let res = Resource::memory(0xFE00_0000, 0x1000).claimed(1);
        assert_eq!(
            res.eligibility(ResourceIndex::BAR0),
            Eligibility::Enable(ResourceKind::Memory)
        );
    }

    #[test]
    fn unused_slot_is_skipped() {
        assert_eq!(
            Resource::UNUSED.eligibility(ResourceIndex::BAR3),
            Eligibility::SkipUnused
        );
    }

    #[test]
    fn rom_needs_decode_enabled() {
        let rom = Resource::memory(0xFEB0_0000, 0x4_0000).claimed(1);
        assert_eq!(
            rom.eligibility(ResourceIndex::ROM),
            Eligibility::SkipRomDisabled
        );
        assert!(rom.with_rom_enabled(true).is_enableable(ResourceIndex::ROM));
        // The ROM flag means nothing in a BAR slot.
        assert!(rom.is_enableable(ResourceIndex::BAR0));
    }

    #[test]
    fn unset_is_reported_before_unclaimed() {
        let res = Resource::io(0xC000, 0x20).unset();
        assert_eq!(
            res.eligibility(ResourceIndex::BAR1),
            Eligibility::NotAssigned
        );
        let res = Resource::io(0xC000, 0x20);
        assert_eq!(
            res.eligibility(ResourceIndex::BAR1),
            Eligibility::NotClaimed
        );
    }

    #[test]
    fn bar_conversion() {
        let res = Resource::from(PciBar::Memory {
            base: 0x8000_0000,
            size: 0x10_0000,
            prefetchable: true,
            is_64bit: true,
        });
        assert_eq!(res.kind(), ResourceKind::Memory);
        assert!(res.flags().contains(ResourceFlags::PREFETCH | ResourceFlags::MEM_64));
        assert!(!res.is_unset());
        assert!(!res.is_claimed());

        let res = Resource::from(PciBar::Io { base: 0, size: 0x20 });
        assert_eq!(res.kind(), ResourceKind::Io);
        assert!(res.is_unset());

        assert_eq!(Resource::from(PciBar::Unused), Resource::UNUSED);
    }

    #[test]
    fn table_from_bars() {
        let mut bars = [PciBar::Unused; PCI_STD_NUM_BARS];
        bars[2] = PciBar::Io {
            base: 0xC040,
            size: 0x40,
        };
        let table = ResourceTable::from_bars(&bars);
        assert_eq!(table.get(ResourceIndex::BAR2).kind(), ResourceKind::Io);
        assert_eq!(table.get(ResourceIndex::ROM), &Resource::UNUSED);
        assert!(!table.is_enableable(ResourceIndex::BAR2));
    }
}
