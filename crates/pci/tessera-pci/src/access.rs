//! Configuration space access.
//!
//! [`ConfigTransport`] is the bus-level transaction service (CAM port I/O,
//! ECAM, a host bridge's indirect window, or the [`SimBus`](crate::sim::SimBus)
//! model). [`ConfigAccessor`] sits on top of it and adds the per-device
//! rules: disconnected devices never reach the transport, and offsets are
//! checked against the access width and the device's configuration space
//! size. Nothing is cached; every call is a fresh transaction.

use crate::address::PciAddress;
use crate::device::PciDevice;
use crate::error::ConfigError;

/// Width of a single configuration transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWidth {
    /// 8-bit access.
    Byte,
    /// 16-bit access (2-byte aligned).
    Word,
    /// 32-bit access (4-byte aligned).
    Dword,
}

impl ConfigWidth {
    /// Returns the access size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u16 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
        }
    }

    /// Returns the access size in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// Returns the all-ones value a read of this width produces when no
    /// device answers.
    #[must_use]
    pub const fn all_ones(self) -> u32 {
        match self {
            Self::Byte => 0xFF,
            Self::Word => 0xFFFF,
            Self::Dword => 0xFFFF_FFFF,
        }
    }

    /// Returns `true` if `offset` is naturally aligned for this width.
    #[must_use]
    pub const fn is_aligned(self, offset: u16) -> bool {
        offset & (self.bytes() - 1) == 0
    }
}

/// Bus-level configuration transaction service.
///
/// Implementations route a transaction by address. They report
/// [`ConfigError::DeviceNotFound`] when nothing answers and may return other
/// errors for transport failures; [`ConfigAccessor`] passes both through
/// unchanged. Calls are synchronous and must make writes visible to any
/// subsequent read.
pub trait ConfigTransport: Sync {
    /// Reads `width` bytes at `offset`. Only the low `width` bits of the
    /// result are significant.
    fn read(&self, addr: PciAddress, offset: u16, width: ConfigWidth) -> Result<u32, ConfigError>;

    /// Writes the low `width` bits of `value` at `offset`.
    fn write(
        &self,
        addr: PciAddress,
        offset: u16,
        width: ConfigWidth,
        value: u32,
    ) -> Result<(), ConfigError>;
}

/// Typed, per-device view of a [`ConfigTransport`].
pub struct ConfigAccessor<'a, T: ?Sized> {
    transport: &'a T,
}

impl<T: ?Sized> Clone for ConfigAccessor<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ?Sized> Copy for ConfigAccessor<'_, T> {}

impl<'a, T: ConfigTransport + ?Sized> ConfigAccessor<'a, T> {
    /// Wraps a transport.
    #[must_use]
    pub const fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Returns the underlying transport.
    #[must_use]
    pub const fn transport(&self) -> &'a T {
        self.transport
    }

    /// Reads a register of the given width.
    ///
    /// A disconnected device yields `Err(ConfigError::DeviceNotFound)`
    /// without a transaction; the value hardware would have returned is
    /// [`ConfigWidth::all_ones`].
    pub fn read(
        &self,
        dev: &PciDevice,
        offset: u16,
        width: ConfigWidth,
    ) -> Result<u32, ConfigError> {
        if dev.is_disconnected() {
            return Err(ConfigError::DeviceNotFound);
        }
        check_register(dev, offset, width)?;
        let value = self.transport.read(dev.address(), offset, width)?;
        Ok(value & width.all_ones())
    }

    /// Reads a register, substituting the all-ones sentinel on any failure.
    ///
    /// This is the raw-hardware view used by presence probes.
    pub fn read_or_all_ones(&self, dev: &PciDevice, offset: u16, width: ConfigWidth) -> u32 {
        self.read(dev, offset, width).unwrap_or_else(|_| width.all_ones())
    }

    /// Writes a register of the given width. A disconnected device is a
    /// no-op reporting `Err(ConfigError::DeviceNotFound)`.
    pub fn write(
        &self,
        dev: &PciDevice,
        offset: u16,
        width: ConfigWidth,
        value: u32,
    ) -> Result<(), ConfigError> {
        if dev.is_disconnected() {
            return Err(ConfigError::DeviceNotFound);
        }
        check_register(dev, offset, width)?;
        self.transport
            .write(dev.address(), offset, width, value & width.all_ones())
    }

    /// Reads an 8-bit register.
    pub fn read_u8(&self, dev: &PciDevice, offset: u16) -> Result<u8, ConfigError> {
        self.read(dev, offset, ConfigWidth::Byte).map(|v| v as u8)
    }

    /// Reads a 16-bit register.
    pub fn read_u16(&self, dev: &PciDevice, offset: u16) -> Result<u16, ConfigError> {
        self.read(dev, offset, ConfigWidth::Word).map(|v| v as u16)
    }

    /// Reads a 32-bit register.
    pub fn read_u32(&self, dev: &PciDevice, offset: u16) -> Result<u32, ConfigError> {
        self.read(dev, offset, ConfigWidth::Dword)
    }

    /// Writes an 8-bit register.
    pub fn write_u8(&self, dev: &PciDevice, offset: u16, value: u8) -> Result<(), ConfigError> {
        self.write(dev, offset, ConfigWidth::Byte, u32::from(value))
    }

    /// Writes a 16-bit register.
    pub fn write_u16(&self, dev: &PciDevice, offset: u16, value: u16) -> Result<(), ConfigError> {
        self.write(dev, offset, ConfigWidth::Word, u32::from(value))
    }

    /// Writes a 32-bit register.
    pub fn write_u32(&self, dev: &PciDevice, offset: u16, value: u32) -> Result<(), ConfigError> {
        self.write(dev, offset, ConfigWidth::Dword, value)
    }
}

/// Rejects unaligned offsets and accesses past the end of the device's
/// configuration space.
fn check_register(dev: &PciDevice, offset: u16, width: ConfigWidth) -> Result<(), ConfigError> {
    let in_range = offset
        .checked_add(width.bytes())
        .is_some_and(|end| end <= dev.cfg_size());
    if width.is_aligned(offset) && in_range {
        Ok(())
    } else {
        Err(ConfigError::BadRegister { offset, width })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs;
    use crate::sim::{SimBus, SimFunction};

    fn setup() -> (SimBus, PciDevice) {
        let addr = PciAddress::new(0, 3, 0);
        let bus = SimBus::new();
        bus.add_function(addr, SimFunction::new(0x8086, 0x100e).with_command(0x0007));
        (bus, PciDevice::new(addr))
    }

    #[test]
    fn widths() {
        assert_eq!(ConfigWidth::Byte.all_ones(), 0xFF);
        assert_eq!(ConfigWidth::Word.all_ones(), 0xFFFF);
        assert_eq!(ConfigWidth::Dword.all_ones(), 0xFFFF_FFFF);
        assert!(ConfigWidth::Word.is_aligned(0x04));
        assert!(!ConfigWidth::Dword.is_aligned(0x06));
    }

    #[test]
    fn read_forwards_to_transport() {
        let (bus, dev) = setup();
        let cfg = ConfigAccessor::new(&bus);
        assert_eq!(cfg.read_u16(&dev, regs::VENDOR_ID), Ok(0x8086));
        assert_eq!(cfg.read_u16(&dev, regs::COMMAND), Ok(0x0007));
        assert_eq!(cfg.read_u32(&dev, regs::VENDOR_ID), Ok(0x100e_8086));
    }

    #[test]
    fn write_then_read_back() {
        let (bus, dev) = setup();
        let cfg = ConfigAccessor::new(&bus);
        cfg.write_u16(&dev, regs::COMMAND, 0x0403).unwrap();
        assert_eq!(cfg.read_u16(&dev, regs::COMMAND), Ok(0x0403));
    }

    #[test]
    fn disconnected_device_short_circuits() {
        let (bus, dev) = setup();
        dev.set_disconnected();
        let cfg = ConfigAccessor::new(&bus);

        assert_eq!(
            cfg.read(&dev, regs::COMMAND, ConfigWidth::Word),
            Err(ConfigError::DeviceNotFound)
        );
        assert_eq!(cfg.read_or_all_ones(&dev, regs::INTERRUPT_PIN, ConfigWidth::Byte), 0xFF);
        assert_eq!(cfg.read_or_all_ones(&dev, regs::COMMAND, ConfigWidth::Word), 0xFFFF);
        assert_eq!(cfg.read_or_all_ones(&dev, regs::BAR0, ConfigWidth::Dword), 0xFFFF_FFFF);
        assert_eq!(
            cfg.write_u16(&dev, regs::COMMAND, 0),
            Err(ConfigError::DeviceNotFound)
        );
        assert_eq!(bus.transaction_count(), 0);
    }

    #[test]
    fn rejects_bad_registers() {
        let (bus, dev) = setup();
        let cfg = ConfigAccessor::new(&bus);
        assert_eq!(
            cfg.read_u32(&dev, 0x06),
            Err(ConfigError::BadRegister {
                offset: 0x06,
                width: ConfigWidth::Dword
            })
        );
        // Conventional devices stop at 0x100.
        assert_eq!(
            cfg.read_u16(&dev, 0x100),
            Err(ConfigError::BadRegister {
                offset: 0x100,
                width: ConfigWidth::Word
            })
        );
        assert_eq!(bus.transaction_count(), 0);
    }

    #[test]
    fn absent_function_reports_not_found() {
        let bus = SimBus::new();
        let dev = PciDevice::new(PciAddress::new(0, 9, 0));
        let cfg = ConfigAccessor::new(&bus);
        assert_eq!(cfg.read_u16(&dev, regs::VENDOR_ID), Err(ConfigError::DeviceNotFound));
    }
}
