//! PCI bus/device/function addressing.

use core::fmt;
use core::str::FromStr;

use crate::error::AddressParseError;

/// PCI bus/device/function address.
///
/// Configuration transactions are routed by this triple; it is the identity
/// the transport sees for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// Bus number (0-255).
    pub bus: u8,
    /// Device number (0-31).
    pub device: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Creates an address, masking device and function to their field widths.
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device: device & 0x1F,
            function: function & 0x07,
        }
    }

    /// Returns the packed device/function byte (`device << 3 | function`).
    #[must_use]
    pub const fn devfn(self) -> u8 {
        (self.device << 3) | self.function
    }

    /// Rebuilds an address from a bus number and a packed devfn byte.
    #[must_use]
    pub const fn from_devfn(bus: u8, devfn: u8) -> Self {
        Self::new(bus, devfn >> 3, devfn & 0x07)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

impl FromStr for PciAddress {
    type Err = AddressParseError;

    /// Parses `bb:dd.f` (hexadecimal bus and device, decimal function).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bus, rest) = s.split_once(':').ok_or(AddressParseError::Format)?;
        let (device, function) = rest.split_once('.').ok_or(AddressParseError::Format)?;

        let bus = u8::from_str_radix(bus, 16).map_err(|_| AddressParseError::Bus)?;
        let device = u8::from_str_radix(device, 16).map_err(|_| AddressParseError::Device)?;
        let function = function
            .parse::<u8>()
            .map_err(|_| AddressParseError::Function)?;

        if device > 0x1F {
            return Err(AddressParseError::Device);
        }
        if function > 7 {
            return Err(AddressParseError::Function);
        }
        Ok(Self::new(bus, device, function))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_format() {
        let addr = PciAddress::new(0, 0x1c, 2);
        assert_eq!(format!("{addr}"), "00:1c.2");
    }

    #[test]
    fn devfn_round_trip() {
        let addr = PciAddress::new(3, 0x1f, 7);
        assert_eq!(addr.devfn(), 0xFF);
        assert_eq!(PciAddress::from_devfn(3, 0xFF), addr);
    }

    #[test]
    fn parse_valid() {
        let addr: PciAddress = "0a:1c.3".parse().unwrap();
        assert_eq!(addr, PciAddress::new(0x0a, 0x1c, 3));
    }

    #[test]
    fn parse_rejects_out_of_range() {
        assert_eq!("00:20.0".parse::<PciAddress>(), Err(AddressParseError::Device));
        assert_eq!("00:01.8".parse::<PciAddress>(), Err(AddressParseError::Function));
        assert_eq!("zz:01.0".parse::<PciAddress>(), Err(AddressParseError::Bus));
        assert_eq!("0001.0".parse::<PciAddress>(), Err(AddressParseError::Format));
    }
}
