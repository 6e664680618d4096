//! Reference-counted device enable and disable.
//!
//! Only the caller that moves a device's enable count from 0 to 1 does the
//! activation work, and only the caller that moves it back to 0 tears it
//! down. Everyone else takes the lock-free fast path. Activation runs in a
//! fixed order:
//!
//! 1. validate the bridge chain above the device;
//! 2. enable the upstream bridge (recursively) and make it a bus master;
//! 3. bring the device to D0;
//! 4. commit the requested resources;
//! 5. re-enable legacy INTx if the device has an interrupt pin;
//! 6. switch MSI / MSI-X off.
//!
//! Any failure restores the enable count and drops the bridge reference
//! taken in step 2, so a failed enable is invisible to later callers.
//!
//! Step 2 and its undo run under the bridge's own lock. Two children of one
//! bridge can both be on their slow path; the second must not see the
//! bridge's count at 2 and carry on while the first is still committing the
//! bridge's Command register.

use alloc::boxed::Box;

use crate::access::{ConfigAccessor, ConfigTransport, ConfigWidth};
use crate::capability::CapabilityScanner;
use crate::config::EnableConfig;
use crate::device::{AncestryFault, CapabilityOffsets, DeviceId, DeviceTable, PciDevice};
use crate::enable::{ResourceEnabler, ResourceKinds, ResourceMask};
use crate::error::{ConfigError, EnableError};
use crate::iomap::{self, IoMapper, MappedRegion};
use crate::power::{PowerControl, PowerState};
use crate::regs::{self, Command};
use crate::resource::ResourceIndex;

/// Enables and disables the devices of one [`DeviceTable`].
///
/// The table is immutable while the enabler owns it; all per-device state
/// the enabler changes lives in atomics inside [`PciDevice`], so the enabler
/// can be shared between threads.
#[derive(Debug)]
pub struct PciEnabler<T, P> {
    devices: DeviceTable,
    transport: T,
    power: P,
    config: EnableConfig,
}

impl<T: ConfigTransport, P: PowerControl> PciEnabler<T, P> {
    /// Creates an enabler with the default [`EnableConfig`].
    #[must_use]
    pub fn new(devices: DeviceTable, transport: T, power: P) -> Self {
        Self {
            devices,
            transport,
            power,
            config: EnableConfig::new(),
        }
    }

    /// Replaces the runtime configuration.
    #[must_use]
    pub fn with_config(mut self, config: EnableConfig) -> Self {
        self.config = config;
        self
    }

    /// The device table.
    #[must_use]
    pub fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// The configuration transport.
    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The power-state collaborator.
    #[must_use]
    pub fn power(&self) -> &P {
        &self.power
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> EnableConfig {
        self.config
    }

    /// Looks up a device.
    ///
    /// # Errors
    ///
    /// [`EnableError::InvalidDevice`] if `id` is not in the table.
    pub fn device(&self, id: DeviceId) -> Result<&PciDevice, EnableError> {
        self.devices.get(id).ok_or(EnableError::InvalidDevice(id))
    }

    fn cfg(&self) -> ConfigAccessor<'_, T> {
        ConfigAccessor::new(&self.transport)
    }

    fn scanner(&self) -> CapabilityScanner<'_, T> {
        CapabilityScanner::with_ttl(self.cfg(), self.config.capability_ttl)
    }

    // -- Enable ---------------------------------------------------------------

    /// Enables the I/O and memory resources of a device.
    ///
    /// # Errors
    ///
    /// See [`enable_device_flags`](Self::enable_device_flags).
    pub fn enable_device(&self, id: DeviceId) -> Result<(), EnableError> {
        self.enable_device_flags(id, ResourceKinds::IO | ResourceKinds::MEMORY)
    }

    /// Enables only the memory resources of a device.
    ///
    /// # Errors
    ///
    /// See [`enable_device_flags`](Self::enable_device_flags).
    pub fn enable_device_mem(&self, id: DeviceId) -> Result<(), EnableError> {
        self.enable_device_flags(id, ResourceKinds::MEMORY)
    }

    /// Enables only the I/O resources of a device.
    ///
    /// # Errors
    ///
    /// See [`enable_device_flags`](Self::enable_device_flags).
    pub fn enable_device_io(&self, id: DeviceId) -> Result<(), EnableError> {
        self.enable_device_flags(id, ResourceKinds::IO)
    }

    /// Takes an enable reference on a device, activating it if this is the
    /// first one.
    ///
    /// `kinds` selects which resources are committed; every slot (BARs and
    /// ROM) whose kind is requested is included.
    ///
    /// # Errors
    ///
    /// - [`EnableError::InvalidDevice`] for an unknown id.
    /// - [`EnableError::MalformedTopology`] if the bridge chain is cyclic or
    ///   too deep.
    /// - [`EnableError::BridgeActivationFailed`] if an upstream bridge could
    ///   not be enabled.
    /// - [`EnableError::PowerState`] if the device could not reach D0.
    /// - [`EnableError::ResourceNotAssigned`] / [`EnableError::ResourceNotClaimed`]
    ///   for invalid resources.
    /// - [`EnableError::DeviceNotFound`] / [`EnableError::Config`] for
    ///   configuration access failures.
    ///
    /// On error the enable count is unchanged.
    pub fn enable_device_flags(
        &self,
        id: DeviceId,
        kinds: ResourceKinds,
    ) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        let count = dev.enable_count().increment();
        if count > 1 {
            log::trace!("{}: already enabled (count {count})", dev.address());
            return Ok(());
        }

        log::debug!("{}: enable count 0 -> 1", dev.address());
        if let Err(err) = self.activate(id, dev, kinds) {
            dev.enable_count().decrement();
            return Err(err);
        }
        Ok(())
    }

    fn activate(
        &self,
        id: DeviceId,
        dev: &PciDevice,
        kinds: ResourceKinds,
    ) -> Result<(), EnableError> {
        self.check_topology(id, dev)?;
        let bridge = self.enable_bridge(dev)?;

        let mask = ResourceMask::select(&dev.resources(), kinds);
        let result = self
            .do_enable(dev, mask)
            .and_then(|()| self.scanner().quiesce_msi(dev).map_err(EnableError::from));
        if result.is_err() {
            if let Some(bridge) = bridge {
                self.release_bridge(bridge);
            }
        }
        result
    }

    fn check_topology(&self, id: DeviceId, dev: &PciDevice) -> Result<(), EnableError> {
        match self.devices.check_ancestry(id, self.config.max_bridge_depth) {
            Ok(_) => Ok(()),
            Err(fault) => {
                match fault {
                    AncestryFault::Cycle(at) => log::error!(
                        "{}: bridge chain loops back at id {}",
                        dev.address(),
                        at.index()
                    ),
                    AncestryFault::TooDeep => log::error!(
                        "{}: more than {} bridges upstream",
                        dev.address(),
                        self.config.max_bridge_depth
                    ),
                    AncestryFault::Dangling(at) => log::error!(
                        "{}: upstream bridge id {} does not exist",
                        dev.address(),
                        at.index()
                    ),
                }
                Err(EnableError::MalformedTopology {
                    device: dev.address(),
                })
            }
        }
    }

    /// Takes a reference on the upstream bridge, if any, and makes sure it
    /// is mastering. Returns the bridge that now holds a reference.
    fn enable_bridge(&self, dev: &PciDevice) -> Result<Option<DeviceId>, EnableError> {
        let Some(bridge_id) = dev.parent() else {
            return Ok(None);
        };
        let bridge = self.device(bridge_id)?;

        let result = {
            let _guard = bridge.lock_bridge();
            let mut result = self.enable_device(bridge_id);
            if result.is_ok() && !bridge.is_busmaster() {
                result = self.set_master(bridge_id, true);
                if result.is_err() {
                    self.drop_bridge_ref(bridge_id);
                }
            }
            result
        };

        match result {
            Ok(()) => Ok(Some(bridge_id)),
            Err(err) => {
                log::error!(
                    "{}: upstream bridge {} failed to enable: {err}",
                    dev.address(),
                    bridge.address()
                );
                Err(EnableError::BridgeActivationFailed {
                    bridge: bridge.address(),
                    source: Box::new(err),
                })
            }
        }
    }

    /// Power, resources and INTx: the part of activation that a resume
    /// repeats.
    fn do_enable(&self, dev: &PciDevice, mask: ResourceMask) -> Result<(), EnableError> {
        match self.power.set_power_state(dev, PowerState::D0) {
            Ok(()) => {}
            Err(err) if err.is_benign() => {
                log::debug!("{}: {err}", dev.address());
            }
            Err(err) => {
                log::error!("{}: can't enter D0: {err}", dev.address());
                return Err(err.into());
            }
        }

        ResourceEnabler::new(self.cfg()).enable_resources(dev, mask)?;
        self.fixup_intx(dev)?;
        Ok(())
    }

    /// Clears Interrupt Disable on devices that have a legacy pin, undoing
    /// whatever firmware or a previous driver left behind.
    fn fixup_intx(&self, dev: &PciDevice) -> Result<(), EnableError> {
        let cfg = self.cfg();
        let pin = cfg.read_u8(dev, regs::INTERRUPT_PIN)?;
        if pin == regs::INTERRUPT_PIN_NONE {
            return Ok(());
        }
        let cmd = Command::from_bits_retain(cfg.read_u16(dev, regs::COMMAND)?);
        if cmd.contains(Command::INTX_DISABLE) {
            log::debug!("{}: re-enabling INTx (pin {pin})", dev.address());
            cfg.write_u16(dev, regs::COMMAND, cmd.difference(Command::INTX_DISABLE).bits())?;
        }
        Ok(())
    }

    /// Re-commits every resource of an enabled device, e.g. after resume.
    /// Does nothing for a device that is not enabled.
    ///
    /// # Errors
    ///
    /// As for [`enable_device_flags`](Self::enable_device_flags), except
    /// that the enable count is never touched.
    pub fn reenable_device(&self, id: DeviceId) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        if !dev.is_enabled() {
            return Ok(());
        }
        self.do_enable(dev, ResourceMask::all())
    }

    /// Enables the resources in `mask` without touching the enable count.
    ///
    /// # Errors
    ///
    /// See [`ResourceEnabler::enable_resources`].
    pub fn enable_resources(&self, id: DeviceId, mask: ResourceMask) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        ResourceEnabler::new(self.cfg()).enable_resources(dev, mask)
    }

    // -- Disable --------------------------------------------------------------

    /// Drops an enable reference; the last one turns off bus mastering and
    /// releases the upstream bridge.
    ///
    /// # Errors
    ///
    /// - [`EnableError::InvalidDevice`] for an unknown id.
    /// - [`EnableError::NotEnabled`] if the count is already zero; the count
    ///   stays at zero.
    /// - [`EnableError::Config`] if bus mastering could not be turned off.
    ///   The reference is dropped regardless.
    pub fn disable_device(&self, id: DeviceId) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        match dev.enable_count().decrement() {
            None => {
                log::warn!("{}: disabling already-disabled device", dev.address());
                Err(EnableError::NotEnabled {
                    device: dev.address(),
                })
            }
            Some(0) => {
                log::debug!("{}: enable count 1 -> 0", dev.address());
                let result = self.clear_master(dev);
                dev.set_busmaster_flag(false);
                if let Some(bridge) = dev.parent() {
                    self.release_bridge(bridge);
                }
                result
            }
            Some(count) => {
                log::trace!("{}: still enabled (count {count})", dev.address());
                Ok(())
            }
        }
    }

    fn clear_master(&self, dev: &PciDevice) -> Result<(), EnableError> {
        match self.write_master(dev, false) {
            // The device is gone; there is nothing left to switch off.
            Err(ConfigError::DeviceNotFound) => Ok(()),
            other => other.map_err(EnableError::from),
        }
    }

    fn release_bridge(&self, bridge: DeviceId) {
        let _guard = self.devices.get(bridge).map(PciDevice::lock_bridge);
        self.drop_bridge_ref(bridge);
    }

    /// [`release_bridge`](Self::release_bridge) for callers already holding
    /// the bridge lock.
    fn drop_bridge_ref(&self, bridge: DeviceId) {
        if let Err(err) = self.disable_device(bridge) {
            log::warn!("failed to release upstream bridge id {}: {err}", bridge.index());
        }
    }

    // -- Command register helpers ---------------------------------------------

    /// Turns bus mastering on or off.
    ///
    /// # Errors
    ///
    /// Configuration access failures.
    pub fn set_master(&self, id: DeviceId, enable: bool) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        self.write_master(dev, enable)?;
        dev.set_busmaster_flag(enable);
        Ok(())
    }

    fn write_master(&self, dev: &PciDevice, enable: bool) -> Result<(), ConfigError> {
        let cfg = self.cfg();
        let old = Command::from_bits_retain(cfg.read_u16(dev, regs::COMMAND)?);
        let mut cmd = old;
        cmd.set(Command::MASTER, enable);
        if cmd != old {
            log::info!(
                "{}: {} bus mastering",
                dev.address(),
                if enable { "enabling" } else { "disabling" }
            );
            cfg.write_u16(dev, regs::COMMAND, cmd.bits())?;
        }
        Ok(())
    }

    /// Allows (`true`) or masks (`false`) legacy INTx assertion.
    ///
    /// # Errors
    ///
    /// Configuration access failures.
    pub fn intx(&self, id: DeviceId, enable: bool) -> Result<(), EnableError> {
        let dev = self.device(id)?;
        let cfg = self.cfg();
        let old = Command::from_bits_retain(cfg.read_u16(dev, regs::COMMAND)?);
        let mut cmd = old;
        cmd.set(Command::INTX_DISABLE, !enable);
        if cmd != old {
            cfg.write_u16(dev, regs::COMMAND, cmd.bits())?;
        }
        Ok(())
    }

    // -- Queries --------------------------------------------------------------

    /// Returns `true` if the device holds at least one enable reference.
    #[must_use]
    pub fn is_enabled(&self, id: DeviceId) -> bool {
        self.devices.get(id).is_some_and(PciDevice::is_enabled)
    }

    /// Returns `true` if the device still answers configuration reads.
    #[must_use]
    pub fn is_present(&self, id: DeviceId) -> bool {
        let Some(dev) = self.devices.get(id) else {
            return false;
        };
        let ids = self.cfg().read_or_all_ones(dev, regs::VENDOR_ID, ConfigWidth::Dword);
        // All ones: nobody answered. Zero / half ones: broken or mid-reset.
        !matches!(ids, 0xFFFF_FFFF | 0x0000_0000 | 0x0000_FFFF | 0xFFFF_0000)
    }

    /// Locates MSI / MSI-X, records them in the descriptor and switches them
    /// off.
    ///
    /// # Errors
    ///
    /// Configuration access failures.
    pub fn probe_capabilities(&self, id: DeviceId) -> Result<CapabilityOffsets, EnableError> {
        let dev = self.device(id)?;
        let scanner = self.scanner();
        let caps = scanner.discover(dev)?;
        scanner.quiesce_msi(dev)?;
        Ok(caps)
    }

    /// Maps part of a memory resource, starting `offset` bytes in and at
    /// most `maxlen` bytes long.
    ///
    /// Returns `None` for an unknown device or for a resource that cannot
    /// be mapped (see [`iomap::iomap_range`]).
    pub fn iomap_range<M: IoMapper + ?Sized>(
        &self,
        id: DeviceId,
        index: ResourceIndex,
        offset: u64,
        maxlen: Option<u64>,
        mapper: &M,
    ) -> Option<MappedRegion> {
        let res = self.devices.get(id)?.resource(index);
        iomap::iomap_range(&res, offset, maxlen, mapper)
    }

    /// Maps a memory resource from its start.
    pub fn iomap<M: IoMapper + ?Sized>(
        &self,
        id: DeviceId,
        index: ResourceIndex,
        maxlen: Option<u64>,
        mapper: &M,
    ) -> Option<MappedRegion> {
        self.iomap_range(id, index, 0, maxlen, mapper)
    }
}
