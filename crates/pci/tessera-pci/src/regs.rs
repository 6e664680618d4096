//! Standard PCI configuration space layout.
//!
//! Offsets are `u16` so the same constants address both the 256-byte
//! conventional space and the 4 KiB extended space.

use bitflags::bitflags;

/// Vendor ID (16-bit, offset 0x00).
pub const VENDOR_ID: u16 = 0x00;
/// Device ID (16-bit, offset 0x02).
pub const DEVICE_ID: u16 = 0x02;
/// Command register (16-bit, offset 0x04).
pub const COMMAND: u16 = 0x04;
/// Status register (16-bit, offset 0x06).
pub const STATUS: u16 = 0x06;
/// Header type (8-bit, offset 0x0E). Bit 7 = multi-function.
pub const HEADER_TYPE: u16 = 0x0E;
/// Base Address Register 0 (32-bit, offset 0x10). BAR1-5 at +4 intervals.
pub const BAR0: u16 = 0x10;
/// Expansion ROM base address for type 0 headers (32-bit, offset 0x30).
pub const ROM_ADDRESS: u16 = 0x30;
/// Capabilities Pointer (8-bit, offset 0x34).
pub const CAPABILITY_LIST: u16 = 0x34;
/// Interrupt Line (8-bit, offset 0x3C).
pub const INTERRUPT_LINE: u16 = 0x3C;
/// Interrupt Pin (8-bit, offset 0x3D). 0 = none, 1..=4 = INTA#..INTD#.
pub const INTERRUPT_PIN: u16 = 0x3D;

/// First offset a capability may live at; everything below is header.
pub const CAPABILITY_MIN_OFFSET: u8 = 0x40;

/// Expansion ROM address register: address decode enable (bit 0).
pub const ROM_ADDRESS_ENABLE: u32 = 1 << 0;

bitflags! {
    /// Command register (offset 0x04).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Command: u16 {
        /// Respond to I/O space accesses.
        const IO = 1 << 0;
        /// Respond to memory space accesses.
        const MEMORY = 1 << 1;
        /// Allow the device to initiate transactions (DMA).
        const MASTER = 1 << 2;
        /// Respond to special cycles.
        const SPECIAL = 1 << 3;
        /// Use memory write and invalidate.
        const INVALIDATE = 1 << 4;
        /// VGA palette snooping.
        const VGA_PALETTE = 1 << 5;
        /// Parity error response.
        const PARITY = 1 << 6;
        /// Address/data stepping.
        const WAIT = 1 << 7;
        /// SERR# driver enable.
        const SERR = 1 << 8;
        /// Fast back-to-back writes.
        const FAST_BACK = 1 << 9;
        /// Legacy INTx# assertion disabled.
        const INTX_DISABLE = 1 << 10;

        // Reserved bits are preserved across read-modify-write.
        const _ = !0;
    }
}

bitflags! {
    /// Status register (offset 0x06).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u16 {
        /// INTx# is currently asserted.
        const INTERRUPT = 1 << 3;
        /// A capabilities list is present at [`CAPABILITY_LIST`].
        const CAP_LIST = 1 << 4;
        /// 66 MHz capable.
        const MHZ_66 = 1 << 5;

        const _ = !0;
    }
}

// -- Capability IDs -----------------------------------------------------------

/// Power management capability ID.
pub const CAP_ID_PM: u8 = 0x01;
/// MSI capability ID.
pub const CAP_ID_MSI: u8 = 0x05;
/// Vendor-specific capability ID.
pub const CAP_ID_VENDOR: u8 = 0x09;
/// PCI Express capability ID.
pub const CAP_ID_EXP: u8 = 0x10;
/// MSI-X capability ID.
pub const CAP_ID_MSIX: u8 = 0x11;

/// Capability ID read back from a list that runs into unimplemented space.
pub const CAP_ID_INVALID: u8 = 0xFF;

// -- MSI / MSI-X message control ----------------------------------------------

/// Offset of Message Control within the MSI capability.
pub const MSI_FLAGS: u16 = 0x02;
/// MSI Message Control: MSI Enable (bit 0).
pub const MSI_FLAGS_ENABLE: u16 = 1 << 0;

/// Offset of Message Control within the MSI-X capability.
pub const MSIX_FLAGS: u16 = 0x02;
/// MSI-X Message Control: Function Mask (bit 14).
pub const MSIX_FLAGS_MASKALL: u16 = 1 << 14;
/// MSI-X Message Control: MSI-X Enable (bit 15).
pub const MSIX_FLAGS_ENABLE: u16 = 1 << 15;

// -- Interrupt pin ------------------------------------------------------------

/// Interrupt pin value for "no legacy interrupt".
pub const INTERRUPT_PIN_NONE: u8 = 0;
/// Highest valid interrupt pin value (INTD#).
pub const INTERRUPT_PIN_MAX: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_bit_positions() {
        assert_eq!(Command::IO.bits(), 0x0001);
        assert_eq!(Command::MEMORY.bits(), 0x0002);
        assert_eq!(Command::MASTER.bits(), 0x0004);
        assert_eq!(Command::INTX_DISABLE.bits(), 0x0400);
    }

    #[test]
    fn command_keeps_reserved_bits() {
        let cmd = Command::from_bits_retain(0x8001);
        assert_eq!((cmd | Command::MEMORY).bits(), 0x8003);
    }
}
