//! PCI capability list walker.
//!
//! Capabilities form a singly linked list inside configuration space,
//! starting at the Capabilities Pointer (offset 0x34). The links come from
//! the device, so the walk is bounded by a hop limit and stops at any pointer
//! that falls into the header area. Also provides the MSI / MSI-X control
//! toggles used to quiesce message-signalled interrupts on enable.

use crate::access::{ConfigAccessor, ConfigTransport};
use crate::config::DEFAULT_CAPABILITY_TTL;
use crate::device::{CapabilityOffsets, PciDevice};
use crate::error::ConfigError;
use crate::regs;

/// A raw capability header: ID and its configuration-space offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawCapability {
    /// Capability ID (e.g. 0x05 for MSI, 0x11 for MSI-X).
    pub id: u8,
    /// Offset of the capability header.
    pub offset: u8,
}

/// Locates and manipulates capability blocks of a device.
pub struct CapabilityScanner<'a, T: ?Sized> {
    cfg: ConfigAccessor<'a, T>,
    ttl: u8,
}

impl<'a, T: ConfigTransport + ?Sized> CapabilityScanner<'a, T> {
    /// Creates a scanner with the default hop limit.
    #[must_use]
    pub const fn new(cfg: ConfigAccessor<'a, T>) -> Self {
        Self::with_ttl(cfg, DEFAULT_CAPABILITY_TTL)
    }

    /// Creates a scanner that visits at most `ttl` headers per walk.
    #[must_use]
    pub const fn with_ttl(cfg: ConfigAccessor<'a, T>, ttl: u8) -> Self {
        Self { cfg, ttl }
    }

    /// Returns an iterator over the capabilities of `dev`.
    ///
    /// A device without the Status "capabilities list" bit yields an empty
    /// iterator.
    ///
    /// # Errors
    ///
    /// Propagates failures reading Status or the Capabilities Pointer.
    pub fn walk<'d>(&self, dev: &'d PciDevice) -> Result<CapabilityIter<'d, 'a, T>, ConfigError> {
        let status = regs::Status::from_bits_retain(self.cfg.read_u16(dev, regs::STATUS)?);
        let start = if status.contains(regs::Status::CAP_LIST) {
            self.cfg.read_u8(dev, regs::CAPABILITY_LIST)?
        } else {
            0
        };
        Ok(CapabilityIter {
            cfg: self.cfg,
            dev,
            pos: start,
            ttl: self.ttl,
        })
    }

    /// Returns the offset of the first capability with ID `id`.
    ///
    /// `Ok(None)` means the device simply does not implement it.
    ///
    /// # Errors
    ///
    /// Propagates configuration access failures met during the walk.
    pub fn find(&self, dev: &PciDevice, id: u8) -> Result<Option<u8>, ConfigError> {
        for cap in self.walk(dev)? {
            let cap = cap?;
            if cap.id == id {
                return Ok(Some(cap.offset));
            }
        }
        Ok(None)
    }

    /// Locates the MSI and MSI-X capabilities and records them in the
    /// descriptor.
    ///
    /// # Errors
    ///
    /// Propagates configuration access failures; nothing is recorded then.
    pub fn discover(&self, dev: &PciDevice) -> Result<CapabilityOffsets, ConfigError> {
        let mut caps = CapabilityOffsets::default();
        for cap in self.walk(dev)? {
            let cap = cap?;
            match cap.id {
                regs::CAP_ID_MSI if caps.msi.is_none() => caps.msi = Some(cap.offset),
                regs::CAP_ID_MSIX if caps.msix.is_none() => caps.msix = Some(cap.offset),
                _ => {}
            }
        }
        log::debug!(
            "{}: capabilities: msi={:?} msix={:?}",
            dev.address(),
            caps.msi,
            caps.msix
        );
        dev.record_capabilities(caps);
        Ok(caps)
    }

    /// Sets or clears the MSI Enable bit of the capability at `cap`.
    ///
    /// Every other Message Control bit is preserved and nothing is written
    /// when the bit already has the requested value.
    ///
    /// # Errors
    ///
    /// Propagates configuration access failures.
    pub fn set_msi_enable(
        &self,
        dev: &PciDevice,
        cap: u8,
        enable: bool,
    ) -> Result<(), ConfigError> {
        let offset = u16::from(cap) + regs::MSI_FLAGS;
        let control = self.cfg.read_u16(dev, offset)?;
        let updated = if enable {
            control | regs::MSI_FLAGS_ENABLE
        } else {
            control & !regs::MSI_FLAGS_ENABLE
        };
        if updated != control {
            self.cfg.write_u16(dev, offset, updated)?;
        }
        Ok(())
    }

    /// Clears `clear` and then sets `set` in the MSI-X Message Control
    /// register of the capability at `cap`.
    ///
    /// # Errors
    ///
    /// Propagates configuration access failures.
    pub fn msix_clear_and_set_ctrl(
        &self,
        dev: &PciDevice,
        cap: u8,
        clear: u16,
        set: u16,
    ) -> Result<(), ConfigError> {
        let offset = u16::from(cap) + regs::MSIX_FLAGS;
        let control = self.cfg.read_u16(dev, offset)?;
        let updated = (control & !clear) | set;
        if updated != control {
            self.cfg.write_u16(dev, offset, updated)?;
        }
        Ok(())
    }

    /// Turns off MSI and MSI-X so the device starts out on legacy signalling.
    ///
    /// Uses the offsets recorded in the descriptor, discovering them first if
    /// the device has not been probed.
    ///
    /// # Errors
    ///
    /// Propagates configuration access failures.
    pub fn quiesce_msi(&self, dev: &PciDevice) -> Result<(), ConfigError> {
        let caps = match dev.capabilities() {
            Some(caps) => caps,
            None => self.discover(dev)?,
        };
        if let Some(msi) = caps.msi {
            log::trace!("{}: disabling MSI at {msi:#04x}", dev.address());
            self.set_msi_enable(dev, msi, false)?;
        }
        if let Some(msix) = caps.msix {
            log::trace!("{}: disabling MSI-X at {msix:#04x}", dev.address());
            self.msix_clear_and_set_ctrl(dev, msix, regs::MSIX_FLAGS_ENABLE, 0)?;
        }
        Ok(())
    }
}

/// Iterator over the capability headers of one device.
///
/// Yields `Err` once and then stops if a header cannot be read.
pub struct CapabilityIter<'d, 'a, T: ?Sized> {
    cfg: ConfigAccessor<'a, T>,
    dev: &'d PciDevice,
    pos: u8,
    ttl: u8,
}

impl<T: ConfigTransport + ?Sized> Iterator for CapabilityIter<'_, '_, T> {
    type Item = Result<RawCapability, ConfigError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ttl == 0 || self.pos < regs::CAPABILITY_MIN_OFFSET {
            return None;
        }
        self.ttl -= 1;

        let offset = self.pos & !3;
        let header = match self.cfg.read_u16(self.dev, u16::from(offset)) {
            Ok(header) => header,
            Err(err) => {
                self.ttl = 0;
                return Some(Err(err));
            }
        };

        let id = header as u8;
        if id == regs::CAP_ID_INVALID {
            self.ttl = 0;
            return None;
        }
        self.pos = (header >> 8) as u8;
        Some(Ok(RawCapability { id, offset }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ConfigWidth;
    use crate::address::PciAddress;
    use crate::sim::{SimBus, SimFunction};

    const ADDR: PciAddress = PciAddress::new(0, 4, 0);

    fn setup(func: SimFunction) -> (SimBus, PciDevice) {
        let bus = SimBus::new();
        bus.add_function(ADDR, func);
        (bus, PciDevice::new(ADDR))
    }

    fn msi_device() -> SimFunction {
        SimFunction::new(0x8086, 0x10d3)
            .with_capability(regs::CAP_ID_PM, 0x40, &[0x03, 0x00])
            .with_capability(regs::CAP_ID_MSI, 0x50, &[0x81, 0x00])
            .with_capability(regs::CAP_ID_MSIX, 0x70, &[0x04, 0xC0])
    }

    #[test]
    fn walks_in_list_order() {
        let (bus, dev) = setup(msi_device());
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        let ids: Vec<u8> = scanner
            .walk(&dev)
            .unwrap()
            .map(|cap| cap.unwrap().id)
            .collect();
        assert_eq!(ids, [regs::CAP_ID_PM, regs::CAP_ID_MSI, regs::CAP_ID_MSIX]);
    }

    #[test]
    fn find_present_and_absent() {
        let (bus, dev) = setup(msi_device());
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        assert_eq!(scanner.find(&dev, regs::CAP_ID_MSIX), Ok(Some(0x70)));
        assert_eq!(scanner.find(&dev, regs::CAP_ID_EXP), Ok(None));
    }

    #[test]
    fn no_cap_list_bit_means_empty() {
        let (bus, dev) = setup(SimFunction::new(0x8086, 0x7000));
        // A stale pointer must not be followed without the Status bit.
        bus.poke(ADDR, regs::CAPABILITY_LIST, ConfigWidth::Byte, 0x50);
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        assert_eq!(scanner.find(&dev, regs::CAP_ID_MSI), Ok(None));
    }

    #[test]
    fn cyclic_list_is_bounded() {
        let (bus, dev) = setup(SimFunction::new(0x1234, 0x0001).with_capability(
            regs::CAP_ID_VENDOR,
            0x40,
            &[0, 0],
        ));
        // Point the only capability back at itself.
        bus.poke(ADDR, 0x41, ConfigWidth::Byte, 0x40);
        bus.clear_log();

        let scanner = CapabilityScanner::with_ttl(ConfigAccessor::new(&bus), 8);
        assert_eq!(scanner.find(&dev, regs::CAP_ID_MSI), Ok(None));
        // Status + pointer + eight headers.
        assert_eq!(bus.transaction_count(), 10);
    }

    #[test]
    fn pointer_into_header_stops_walk() {
        let (bus, dev) = setup(msi_device());
        bus.poke(ADDR, 0x41, ConfigWidth::Byte, 0x3C);
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        assert_eq!(scanner.find(&dev, regs::CAP_ID_MSI), Ok(None));
    }

    #[test]
    fn msi_toggle_preserves_other_bits() {
        let (bus, dev) = setup(msi_device());
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));

        scanner.set_msi_enable(&dev, 0x50, false).unwrap();
        assert_eq!(bus.peek(ADDR, 0x52, ConfigWidth::Word), Some(0x0080));

        bus.clear_log();
        scanner.set_msi_enable(&dev, 0x50, false).unwrap();
        assert_eq!(bus.writes_to(ADDR, 0x52), 0);
    }

    #[test]
    fn msix_clear_and_set() {
        let (bus, dev) = setup(msi_device());
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        scanner
            .msix_clear_and_set_ctrl(&dev, 0x70, regs::MSIX_FLAGS_ENABLE, 0)
            .unwrap();
        assert_eq!(bus.peek(ADDR, 0x72, ConfigWidth::Word), Some(0x4004));
        scanner
            .msix_clear_and_set_ctrl(&dev, 0x70, regs::MSIX_FLAGS_MASKALL, regs::MSIX_FLAGS_ENABLE)
            .unwrap();
        assert_eq!(bus.peek(ADDR, 0x72, ConfigWidth::Word), Some(0x8004));
    }

    #[test]
    fn quiesce_discovers_and_records() {
        let (bus, dev) = setup(msi_device());
        let scanner = CapabilityScanner::new(ConfigAccessor::new(&bus));
        scanner.quiesce_msi(&dev).unwrap();

        assert_eq!(
            dev.capabilities(),
            Some(CapabilityOffsets {
                msi: Some(0x50),
                msix: Some(0x70)
            })
        );
        assert_eq!(bus.peek(ADDR, 0x52, ConfigWidth::Word), Some(0x0080));
        assert_eq!(bus.peek(ADDR, 0x72, ConfigWidth::Word), Some(0x4004));
    }
}
