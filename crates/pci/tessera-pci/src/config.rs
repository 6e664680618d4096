//! Engine configuration.
//!
//! Compile-time defaults plus a small runtime [`EnableConfig`] that the
//! embedding environment may override (the host simulator reads it from its
//! topology file).

/// Size of the conventional configuration space in bytes.
pub const PCI_CFG_SPACE_SIZE: u16 = 256;

/// Size of the PCI Express extended configuration space in bytes.
pub const PCI_CFG_SPACE_EXP_SIZE: u16 = 4096;

/// Default bound on the number of bridges walked above a device.
///
/// Bus numbers are 8 bits wide, so a well-formed hierarchy cannot nest
/// deeper than 255; real systems stay far below this.
pub const DEFAULT_MAX_BRIDGE_DEPTH: usize = 32;

/// Default hop limit for capability-list walks.
///
/// 48 is the most capabilities (4 bytes each) that fit between offset 0x40
/// and the end of conventional space.
pub const DEFAULT_CAPABILITY_TTL: u8 = 48;

/// Runtime tunables for [`PciEnabler`](crate::enable::PciEnabler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnableConfig {
    /// Maximum number of upstream bridges walked before the topology is
    /// declared malformed.
    pub max_bridge_depth: usize,
    /// Maximum number of capability headers visited per list walk.
    pub capability_ttl: u8,
}

impl EnableConfig {
    /// Returns the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_bridge_depth: DEFAULT_MAX_BRIDGE_DEPTH,
            capability_ttl: DEFAULT_CAPABILITY_TTL,
        }
    }

    /// Overrides the bridge depth bound.
    #[must_use]
    pub const fn with_max_bridge_depth(mut self, depth: usize) -> Self {
        self.max_bridge_depth = depth;
        self
    }

    /// Overrides the capability hop limit.
    #[must_use]
    pub const fn with_capability_ttl(mut self, ttl: u8) -> Self {
        self.capability_ttl = ttl;
        self
    }
}

impl Default for EnableConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EnableConfig::default();
        assert_eq!(cfg.max_bridge_depth, DEFAULT_MAX_BRIDGE_DEPTH);
        assert_eq!(cfg.capability_ttl, DEFAULT_CAPABILITY_TTL);
    }

    #[test]
    fn overrides() {
        let cfg = EnableConfig::new()
            .with_max_bridge_depth(4)
            .with_capability_ttl(8);
        assert_eq!(cfg.max_bridge_depth, 4);
        assert_eq!(cfg.capability_ttl, 8);
    }
}
