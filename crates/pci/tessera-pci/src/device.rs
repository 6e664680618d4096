//! Device descriptors and the device table.
//!
//! Discovery (outside this crate) builds one [`PciDevice`] per function and
//! inserts them into a [`DeviceTable`]. The table is index-addressed: a
//! device names its upstream bridge by [`DeviceId`], never by reference, so
//! the bridge chain can be walked without ownership cycles and a malformed
//! chain can be detected instead of followed forever.
//!
//! After construction the table is shared immutably; everything the enable
//! path mutates lives in atomics (or, for allocator-owned resource state,
//! behind a lock) inside the descriptor.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use spin::{Mutex, MutexGuard};

use crate::address::PciAddress;
use crate::config::PCI_CFG_SPACE_SIZE;
use crate::resource::{Resource, ResourceIndex, ResourceTable};

/// Index of a device in a [`DeviceTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Builds an id from a raw table index. The id is only meaningful for
    /// the table that handed out that index.
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw table index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Number of enable requests currently holding a device active.
///
/// Only increment-and-return and decrement-and-return are exposed, so every
/// caller observes a unique transition. `AcqRel` on both sides orders the
/// activation work done after a 0→1 transition before any later 1→0.
#[derive(Debug, Default)]
pub struct EnableCount(AtomicU32);

impl EnableCount {
    /// Creates a zero count.
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Increments and returns the new value.
    pub fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements and returns the new value, or `None` if the count was
    /// already zero (the count is left untouched).
    pub fn decrement(&self) -> Option<u32> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    /// Returns the current value.
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
}

/// Capability offsets found in configuration space. `None` = not present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityOffsets {
    /// MSI capability.
    pub msi: Option<u8>,
    /// MSI-X capability.
    pub msix: Option<u8>,
}

/// A discovered PCI function.
#[derive(Debug)]
pub struct PciDevice {
    address: PciAddress,
    parent: Option<DeviceId>,
    is_bridge: bool,
    cfg_size: u16,
    resources: Mutex<ResourceTable>,
    enable_cnt: EnableCount,
    // Held by a child while it takes or drops its reference on this bridge.
    bridge_lock: Mutex<()>,
    disconnected: AtomicBool,
    is_busmaster: AtomicBool,
    caps_probed: AtomicBool,
    // 0 = absent; real capabilities never live below 0x40.
    msi_cap: AtomicU8,
    msix_cap: AtomicU8,
}

impl PciDevice {
    /// Creates a descriptor for a conventional function with no resources.
    #[must_use]
    pub fn new(address: PciAddress) -> Self {
        Self {
            address,
            parent: None,
            is_bridge: false,
            cfg_size: PCI_CFG_SPACE_SIZE,
            resources: Mutex::new(ResourceTable::new()),
            enable_cnt: EnableCount::new(),
            bridge_lock: Mutex::new(()),
            disconnected: AtomicBool::new(false),
            is_busmaster: AtomicBool::new(false),
            caps_probed: AtomicBool::new(false),
            msi_cap: AtomicU8::new(0),
            msix_cap: AtomicU8::new(0),
        }
    }

    /// Sets the upstream bridge.
    #[must_use]
    pub fn with_parent(mut self, parent: DeviceId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Marks the function as a PCI-to-PCI bridge.
    #[must_use]
    pub fn bridge(mut self) -> Self {
        self.is_bridge = true;
        self
    }

    /// Sets the configuration space size (256 or 4096).
    #[must_use]
    pub fn with_cfg_size(mut self, size: u16) -> Self {
        self.cfg_size = size;
        self
    }

    /// Replaces the whole resource table.
    #[must_use]
    pub fn with_resources(self, table: ResourceTable) -> Self {
        *self.resources.lock() = table;
        self
    }

    /// Sets a single resource slot.
    #[must_use]
    pub fn with_resource(self, index: ResourceIndex, res: Resource) -> Self {
        self.resources.lock().set(index, res);
        self
    }

    /// Bus position.
    #[must_use]
    pub fn address(&self) -> PciAddress {
        self.address
    }

    /// Upstream bridge, if any.
    #[must_use]
    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Returns `true` for PCI-to-PCI bridges.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.is_bridge
    }

    /// Configuration space size in bytes.
    #[must_use]
    pub fn cfg_size(&self) -> u16 {
        self.cfg_size
    }

    /// Returns a snapshot of one resource slot.
    #[must_use]
    pub fn resource(&self, index: ResourceIndex) -> Resource {
        *self.resources.lock().get(index)
    }

    /// Locks the resource table.
    ///
    /// Used by the resource allocator to assign and claim ranges, and by the
    /// enable path to validate a whole mask against one consistent view.
    pub fn resources(&self) -> MutexGuard<'_, ResourceTable> {
        self.resources.lock()
    }

    /// The enable reference count.
    #[must_use]
    pub fn enable_count(&self) -> &EnableCount {
        &self.enable_cnt
    }

    /// Serialises children acquiring and releasing this device as their
    /// upstream bridge, so a child only proceeds once the bridge is fully
    /// activated and mastering. Locks are always taken child before parent.
    pub(crate) fn lock_bridge(&self) -> MutexGuard<'_, ()> {
        self.bridge_lock.lock()
    }

    /// Returns `true` while at least one enable request is outstanding.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enable_cnt.get() > 0
    }

    /// Marks the device as gone. Terminal: every later configuration access
    /// short-circuits with `DeviceNotFound`.
    pub fn set_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    /// Returns `true` once the device has been disconnected.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Returns `true` if bus mastering was last enabled through this crate.
    #[must_use]
    pub fn is_busmaster(&self) -> bool {
        self.is_busmaster.load(Ordering::Acquire)
    }

    pub(crate) fn set_busmaster_flag(&self, enable: bool) {
        self.is_busmaster.store(enable, Ordering::Release);
    }

    /// Returns the recorded capability offsets, or `None` if capabilities
    /// have not been probed yet.
    #[must_use]
    pub fn capabilities(&self) -> Option<CapabilityOffsets> {
        if !self.caps_probed.load(Ordering::Acquire) {
            return None;
        }
        Some(CapabilityOffsets {
            msi: nonzero(self.msi_cap.load(Ordering::Relaxed)),
            msix: nonzero(self.msix_cap.load(Ordering::Relaxed)),
        })
    }

    pub(crate) fn record_capabilities(&self, caps: CapabilityOffsets) {
        self.msi_cap.store(caps.msi.unwrap_or(0), Ordering::Relaxed);
        self.msix_cap.store(caps.msix.unwrap_or(0), Ordering::Relaxed);
        self.caps_probed.store(true, Ordering::Release);
    }
}

fn nonzero(offset: u8) -> Option<u8> {
    (offset != 0).then_some(offset)
}

fn next_id(len: usize) -> Option<DeviceId> {
    u32::try_from(len).ok().map(DeviceId)
}

/// Why an ancestor walk was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestryFault {
    /// The chain revisits this device.
    Cycle(DeviceId),
    /// The chain is longer than the configured bound.
    TooDeep,
    /// A parent id does not exist in the table.
    Dangling(DeviceId),
}

/// Index-addressed collection of every known device.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<PciDevice>,
}

impl DeviceTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Adds a device and returns its id, or `None` once every id is taken.
    pub fn insert(&mut self, dev: PciDevice) -> Option<DeviceId> {
        let id = next_id(self.devices.len())?;
        self.devices.push(dev);
        Some(id)
    }

    /// Re-points a device at a different upstream bridge (hot-plug
    /// re-enumeration). Returns `false` if `id` does not exist.
    pub fn set_parent(&mut self, id: DeviceId, parent: Option<DeviceId>) -> bool {
        match self.devices.get_mut(id.index()) {
            Some(dev) => {
                dev.parent = parent;
                true
            }
            None => false,
        }
    }

    /// Looks up a device.
    #[must_use]
    pub fn get(&self, id: DeviceId) -> Option<&PciDevice> {
        self.devices.get(id.index())
    }

    /// Returns the upstream bridge of `id`.
    #[must_use]
    pub fn parent(&self, id: DeviceId) -> Option<DeviceId> {
        self.get(id).and_then(PciDevice::parent)
    }

    /// Finds a device by bus position.
    #[must_use]
    pub fn find(&self, address: PciAddress) -> Option<DeviceId> {
        self.iter()
            .find(|(_, dev)| dev.address == address)
            .map(|(id, _)| id)
    }

    /// Iterates all devices with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &PciDevice)> {
        (0u32..).map(DeviceId).zip(self.devices.iter())
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Walks the bridge chain above `id` and returns its length.
    ///
    /// The walk stops after `max_depth` bridges and remembers every device
    /// it passed, so a cyclic or dangling chain is reported instead of
    /// followed.
    pub fn check_ancestry(&self, id: DeviceId, max_depth: usize) -> Result<usize, AncestryFault> {
        let mut visited = Vec::with_capacity(4);
        visited.push(id);

        let mut current = id;
        while let Some(parent) = self.parent(current) {
            if self.get(parent).is_none() {
                return Err(AncestryFault::Dangling(parent));
            }
            if visited.contains(&parent) {
                return Err(AncestryFault::Cycle(parent));
            }
            if visited.len() > max_depth {
                return Err(AncestryFault::TooDeep);
            }
            visited.push(parent);
            current = parent;
        }
        Ok(visited.len() - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(len: usize) -> (DeviceTable, Vec<DeviceId>) {
        let mut table = DeviceTable::new();
        let mut ids = Vec::new();
        for i in 0..len {
            let mut dev = PciDevice::new(PciAddress::new(i as u8, 0, 0));
            if let Some(&parent) = ids.last() {
                dev = dev.with_parent(parent);
            }
            ids.push(table.insert(dev.bridge()).unwrap());
        }
        (table, ids)
    }

    #[test]
    fn ids_run_out_at_u32_max() {
        assert_eq!(next_id(0), Some(DeviceId(0)));
        assert_eq!(next_id(u32::MAX as usize), Some(DeviceId(u32::MAX)));
        assert_eq!(next_id(u32::MAX as usize + 1), None);

        let mut table = DeviceTable::new();
        assert_eq!(table.insert(PciDevice::new(PciAddress::new(0, 1, 0))), Some(DeviceId(0)));
        assert_eq!(table.insert(PciDevice::new(PciAddress::new(0, 2, 0))), Some(DeviceId(1)));
    }

    #[test]
    fn enable_count_transitions() {
        let cnt = EnableCount::new();
        assert_eq!(cnt.increment(), 1);
        assert_eq!(cnt.increment(), 2);
        assert_eq!(cnt.decrement(), Some(1));
        assert_eq!(cnt.decrement(), Some(0));
        assert_eq!(cnt.decrement(), None);
        assert_eq!(cnt.get(), 0);
    }

    #[test]
    fn lookup_by_address() {
        let (table, ids) = chain(3);
        assert_eq!(table.find(PciAddress::new(2, 0, 0)), Some(ids[2]));
        assert_eq!(table.find(PciAddress::new(9, 0, 0)), None);
        assert_eq!(table.parent(ids[2]), Some(ids[1]));
        assert_eq!(table.parent(ids[0]), None);
    }

    #[test]
    fn ancestry_depth() {
        let (table, ids) = chain(4);
        assert_eq!(table.check_ancestry(ids[0], 8), Ok(0));
        assert_eq!(table.check_ancestry(ids[3], 8), Ok(3));
        assert_eq!(table.check_ancestry(ids[3], 3), Ok(3));
        assert_eq!(table.check_ancestry(ids[3], 2), Err(AncestryFault::TooDeep));
    }

    #[test]
    fn ancestry_detects_cycle() {
        let (mut table, ids) = chain(3);
        table.set_parent(ids[0], Some(ids[2]));
        assert_eq!(
            table.check_ancestry(ids[2], 32),
            Err(AncestryFault::Cycle(ids[2]))
        );
    }

    #[test]
    fn ancestry_detects_self_parent_and_dangling() {
        let (mut table, ids) = chain(2);
        table.set_parent(ids[0], Some(ids[0]));
        assert_eq!(
            table.check_ancestry(ids[0], 32),
            Err(AncestryFault::Cycle(ids[0]))
        );
        table.set_parent(ids[0], Some(DeviceId(42)));
        assert_eq!(
            table.check_ancestry(ids[1], 32),
            Err(AncestryFault::Dangling(DeviceId(42)))
        );
    }

    #[test]
    fn capabilities_unprobed_until_recorded() {
        let dev = PciDevice::new(PciAddress::new(0, 1, 0));
        assert_eq!(dev.capabilities(), None);
        dev.record_capabilities(CapabilityOffsets {
            msi: Some(0x50),
            msix: None,
        });
        assert_eq!(
            dev.capabilities(),
            Some(CapabilityOffsets {
                msi: Some(0x50),
                msix: None
            })
        );
    }

    #[test]
    fn resources_are_snapshots() {
        let dev = PciDevice::new(PciAddress::new(0, 1, 0))
            .with_resource(ResourceIndex::BAR0, Resource::memory(0x1000, 0x100));
        let before = dev.resource(ResourceIndex::BAR0);
        dev.resources().set(ResourceIndex::BAR0, before.claimed(7));
        assert!(!before.is_claimed());
        assert!(dev.resource(ResourceIndex::BAR0).is_claimed());
    }
}
