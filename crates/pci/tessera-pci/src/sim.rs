//! Software model of a PCI configuration space.
//!
//! [`SimBus`] implements [`ConfigTransport`] over per-function byte arrays
//! and logs every transaction, which lets tests assert on exactly which
//! registers were touched. [`SimPower`] records power-state requests and can
//! inject failures. Both back the host simulator as well as the tests.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::access::{ConfigTransport, ConfigWidth};
use crate::address::PciAddress;
use crate::config::{PCI_CFG_SPACE_EXP_SIZE, PCI_CFG_SPACE_SIZE};
use crate::device::PciDevice;
use crate::error::{ConfigError, PowerError};
use crate::power::{PowerControl, PowerState};
use crate::regs;

/// Configuration space contents of one simulated function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimFunction {
    space: Vec<u8>,
}

impl SimFunction {
    /// Creates a 256-byte type 0 function with the given IDs.
    #[must_use]
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut func = Self {
            space: vec![0; usize::from(PCI_CFG_SPACE_SIZE)],
        };
        func.store(regs::VENDOR_ID, ConfigWidth::Word, u32::from(vendor_id));
        func.store(regs::DEVICE_ID, ConfigWidth::Word, u32::from(device_id));
        func
    }

    /// Grows the function to the 4 KiB extended space.
    #[must_use]
    pub fn extended(mut self) -> Self {
        self.space.resize(usize::from(PCI_CFG_SPACE_EXP_SIZE), 0);
        self
    }

    /// Sets a register.
    #[must_use]
    pub fn with_register(mut self, offset: u16, width: ConfigWidth, value: u32) -> Self {
        self.store(offset, width, value);
        self
    }

    /// Sets the Command register.
    #[must_use]
    pub fn with_command(self, command: u16) -> Self {
        self.with_register(regs::COMMAND, ConfigWidth::Word, u32::from(command))
    }

    /// Sets the Interrupt Pin register.
    #[must_use]
    pub fn with_interrupt_pin(self, pin: u8) -> Self {
        self.with_register(regs::INTERRUPT_PIN, ConfigWidth::Byte, u32::from(pin))
    }

    /// Sets the header type byte (`0x01` for a PCI-to-PCI bridge).
    #[must_use]
    pub fn with_header_type(self, header_type: u8) -> Self {
        self.with_register(regs::HEADER_TYPE, ConfigWidth::Byte, u32::from(header_type))
    }

    /// Places a capability at `offset` and appends it to the capability
    /// list. `body` follows the two-byte ID/next header.
    #[must_use]
    pub fn with_capability(mut self, id: u8, offset: u8, body: &[u8]) -> Self {
        let status = self.load(regs::STATUS, ConfigWidth::Word) as u16;
        self.store(
            regs::STATUS,
            ConfigWidth::Word,
            u32::from(status | regs::Status::CAP_LIST.bits()),
        );

        // Find the last "next" pointer in the chain.
        let mut link = regs::CAPABILITY_LIST;
        loop {
            let next = self.load(link, ConfigWidth::Byte) as u8;
            if next == 0 {
                break;
            }
            link = u16::from(next) + 1;
        }
        self.store(link, ConfigWidth::Byte, u32::from(offset));

        let base = usize::from(offset);
        self.space[base] = id;
        self.space[base + 1] = 0;
        self.space[base + 2..base + 2 + body.len()].copy_from_slice(body);
        self
    }

    /// Reads a little-endian register.
    #[must_use]
    pub fn load(&self, offset: u16, width: ConfigWidth) -> u32 {
        let start = usize::from(offset);
        self.space[start..start + usize::from(width.bytes())]
            .iter()
            .rev()
            .fold(0, |acc, &b| (acc << 8) | u32::from(b))
    }

    /// Writes a little-endian register.
    pub fn store(&mut self, offset: u16, width: ConfigWidth, value: u32) {
        let start = usize::from(offset);
        let bytes = value.to_le_bytes();
        let len = usize::from(width.bytes());
        self.space[start..start + len].copy_from_slice(&bytes[..len]);
    }

    fn size(&self) -> usize {
        self.space.len()
    }
}

/// Direction of a logged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Configuration read.
    Read,
    /// Configuration write.
    Write,
}

/// One logged configuration transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    /// Read or write.
    pub access: Access,
    /// Target function.
    pub address: PciAddress,
    /// Register offset.
    pub offset: u16,
    /// Access width.
    pub width: ConfigWidth,
    /// Value read or written.
    pub value: u32,
}

/// In-memory configuration transport.
#[derive(Debug, Default)]
pub struct SimBus {
    functions: Mutex<BTreeMap<PciAddress, SimFunction>>,
    log: Mutex<Vec<Transaction>>,
}

impl SimBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a function.
    pub fn add_function(&self, addr: PciAddress, func: SimFunction) {
        self.functions.lock().insert(addr, func);
    }

    /// Removes a function; later transactions to it fail with
    /// `DeviceNotFound`, as after a surprise removal.
    pub fn remove_function(&self, addr: PciAddress) -> Option<SimFunction> {
        self.functions.lock().remove(&addr)
    }

    /// Inspects a register without logging a transaction.
    #[must_use]
    pub fn peek(&self, addr: PciAddress, offset: u16, width: ConfigWidth) -> Option<u32> {
        self.functions
            .lock()
            .get(&addr)
            .map(|f| f.load(offset, width))
    }

    /// Modifies a register without logging a transaction.
    pub fn poke(&self, addr: PciAddress, offset: u16, width: ConfigWidth, value: u32) {
        if let Some(func) = self.functions.lock().get_mut(&addr) {
            func.store(offset, width, value);
        }
    }

    /// Returns the Command register of `addr` without logging.
    #[must_use]
    pub fn command(&self, addr: PciAddress) -> Option<regs::Command> {
        self.peek(addr, regs::COMMAND, ConfigWidth::Word)
            .map(|v| regs::Command::from_bits_retain(v as u16))
    }

    /// Returns a copy of the transaction log.
    #[must_use]
    pub fn transactions(&self) -> Vec<Transaction> {
        self.log.lock().clone()
    }

    /// Number of logged transactions.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        self.log.lock().len()
    }

    /// Number of logged writes that touched `offset` of `addr`.
    #[must_use]
    pub fn writes_to(&self, addr: PciAddress, offset: u16) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|t| t.access == Access::Write && t.address == addr && t.offset == offset)
            .count()
    }

    /// Empties the transaction log.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn record(
        &self,
        access: Access,
        address: PciAddress,
        offset: u16,
        width: ConfigWidth,
        value: u32,
    ) {
        self.log.lock().push(Transaction {
            access,
            address,
            offset,
            width,
            value,
        });
    }
}

impl ConfigTransport for SimBus {
    fn read(&self, addr: PciAddress, offset: u16, width: ConfigWidth) -> Result<u32, ConfigError> {
        let result = {
            let functions = self.functions.lock();
            match functions.get(&addr) {
                Some(f) if usize::from(offset) + usize::from(width.bytes()) <= f.size() => {
                    Ok(f.load(offset, width))
                }
                Some(_) => Err(ConfigError::BadRegister { offset, width }),
                None => Err(ConfigError::DeviceNotFound),
            }
        };
        let value = *result.as_ref().unwrap_or(&width.all_ones());
        self.record(Access::Read, addr, offset, width, value);
        result
    }

    fn write(
        &self,
        addr: PciAddress,
        offset: u16,
        width: ConfigWidth,
        value: u32,
    ) -> Result<(), ConfigError> {
        self.record(Access::Write, addr, offset, width, value);
        let mut functions = self.functions.lock();
        match functions.get_mut(&addr) {
            Some(f) if usize::from(offset) + usize::from(width.bytes()) <= f.size() => {
                f.store(offset, width, value);
                Ok(())
            }
            Some(_) => Err(ConfigError::BadRegister { offset, width }),
            None => Err(ConfigError::DeviceNotFound),
        }
    }
}

/// Recording power-state collaborator.
#[derive(Debug, Default)]
pub struct SimPower {
    calls: Mutex<Vec<(PciAddress, PowerState)>>,
    faults: Mutex<BTreeMap<PciAddress, PowerError>>,
}

impl SimPower {
    /// Creates a collaborator that accepts every transition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every transition of `addr` fail with `err`.
    pub fn fail(&self, addr: PciAddress, err: PowerError) {
        self.faults.lock().insert(addr, err);
    }

    /// Removes an injected failure.
    pub fn clear_fault(&self, addr: PciAddress) {
        self.faults.lock().remove(&addr);
    }

    /// All requested transitions, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(PciAddress, PowerState)> {
        self.calls.lock().clone()
    }

    /// Number of transitions requested for `addr`.
    #[must_use]
    pub fn calls_for(&self, addr: PciAddress) -> usize {
        self.calls.lock().iter().filter(|(a, _)| *a == addr).count()
    }
}

impl PowerControl for SimPower {
    fn set_power_state(&self, dev: &PciDevice, state: PowerState) -> Result<(), PowerError> {
        self.calls.lock().push((dev.address(), state));
        match self.faults.lock().get(&dev.address()) {
            Some(err) => Err(*err),
            None => Ok(()),
        }
    }
}
