//! Committing resource decode bits to the Command register.

use crate::access::{ConfigAccessor, ConfigTransport};
use crate::device::PciDevice;
use crate::enable::ResourceMask;
use crate::error::EnableError;
use crate::regs::{self, Command};
use crate::resource::{Eligibility, ResourceKind};

/// Validates selected resources and turns on their decoding.
pub struct ResourceEnabler<'a, T: ?Sized> {
    cfg: ConfigAccessor<'a, T>,
}

impl<'a, T: ConfigTransport + ?Sized> ResourceEnabler<'a, T> {
    /// Creates an enabler issuing transactions through `cfg`.
    #[must_use]
    pub const fn new(cfg: ConfigAccessor<'a, T>) -> Self {
        Self { cfg }
    }

    /// Enables I/O and/or memory decoding for every resource in `mask`.
    ///
    /// Unused slots and a ROM with decoding switched off are skipped. The
    /// whole mask is validated before anything is written, and the Command
    /// register is written at most once, only when a bit actually changes.
    ///
    /// # Errors
    ///
    /// - [`EnableError::ResourceNotAssigned`] for a selected resource without
    ///   an address.
    /// - [`EnableError::ResourceNotClaimed`] for a selected resource outside
    ///   the address-space tree.
    /// - Configuration access failures reading or writing Command.
    pub fn enable_resources(&self, dev: &PciDevice, mask: ResourceMask) -> Result<(), EnableError> {
        let old = Command::from_bits_retain(self.cfg.read_u16(dev, regs::COMMAND)?);
        let mut cmd = old;

        {
            let table = dev.resources();
            for (index, res) in table.iter() {
                if !mask.selects(index) {
                    continue;
                }
                match res.eligibility(index) {
                    Eligibility::SkipUnused | Eligibility::SkipRomDisabled => {}
                    Eligibility::NotAssigned => {
                        log::error!(
                            "{}: {index} {:#x}-{:#x}: not assigned; can't enable device",
                            dev.address(),
                            res.start(),
                            res.start().wrapping_add(res.size()).wrapping_sub(1)
                        );
                        return Err(EnableError::ResourceNotAssigned { index });
                    }
                    Eligibility::NotClaimed => {
                        log::error!(
                            "{}: {index} {:#x}-{:#x}: not claimed; can't enable device",
                            dev.address(),
                            res.start(),
                            res.start().wrapping_add(res.size()).wrapping_sub(1)
                        );
                        return Err(EnableError::ResourceNotClaimed { index });
                    }
                    Eligibility::Enable(ResourceKind::Io) => cmd |= Command::IO,
                    Eligibility::Enable(ResourceKind::Memory) => cmd |= Command::MEMORY,
                    Eligibility::Enable(ResourceKind::Unused) => {}
                }
            }
        }

        if cmd != old {
            log::info!(
                "{}: enabling device ({:04x} -> {:04x})",
                dev.address(),
                old.bits(),
                cmd.bits()
            );
            self.cfg.write_u16(dev, regs::COMMAND, cmd.bits())?;
        }
        Ok(())
    }
}
