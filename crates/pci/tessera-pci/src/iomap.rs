//! Mapping of memory BARs.
//!
//! The engine never maps anything itself. [`iomap_range`] decides which
//! physical window of a resource a driver may see and hands it to an
//! [`IoMapper`] supplied by the memory manager.

use crate::resource::{Resource, ResourceKind};

/// A mapped memory-space region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRegion {
    phys_base: u64,
    virt_base: usize,
    size: u64,
}

impl MappedRegion {
    /// Creates a new region descriptor.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `virt_base` maps `phys_base` for `size` bytes.
    /// - The mapping stays valid for the lifetime of the region.
    #[must_use]
    pub const unsafe fn new(phys_base: u64, virt_base: usize, size: u64) -> Self {
        Self {
            phys_base,
            virt_base,
            size,
        }
    }

    /// Returns the physical base address.
    #[must_use]
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }

    /// Returns the virtual base address.
    #[must_use]
    pub const fn virt_base(&self) -> usize {
        self.virt_base
    }

    /// Returns the size of the region in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns a pointer to the given byte offset within the region.
    ///
    /// Returns `None` if the offset is out of bounds or the address would
    /// wrap.
    #[must_use]
    pub const fn ptr_at(&self, offset: u64) -> Option<*mut u8> {
        if offset >= self.size {
            return None;
        }
        match self.virt_base.checked_add(offset as usize) {
            Some(addr) => Some(addr as *mut u8),
            None => None,
        }
    }
}

/// Maps physical memory ranges into the caller's address space.
pub trait IoMapper {
    /// Maps `len` bytes at `phys`. Returns `None` if the mapping failed.
    fn map(&self, phys: u64, len: u64) -> Option<MappedRegion>;
}

/// Maps `[start + offset, start + offset + len)` of a memory resource.
///
/// `len` is what remains of the resource past `offset`, capped at `maxlen`
/// when given. Returns `None` for I/O or unused resources, for resources
/// without an assigned address, when `offset` lies past the end and when
/// the window would run past the top of the physical address space.
pub fn iomap_range<M: IoMapper + ?Sized>(
    res: &Resource,
    offset: u64,
    maxlen: Option<u64>,
    mapper: &M,
) -> Option<MappedRegion> {
    if res.kind() != ResourceKind::Memory || res.is_unset() || res.start() == 0 {
        return None;
    }
    if res.size() <= offset {
        return None;
    }
    let mut len = res.size() - offset;
    if let Some(max) = maxlen {
        len = len.min(max);
    }
    let phys = res.start().checked_add(offset)?;
    phys.checked_add(len.saturating_sub(1))?;
    mapper.map(phys, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    /// Identity mapper that remembers the last request.
    struct Identity {
        last: Cell<Option<(u64, u64)>>,
    }

    impl IoMapper for Identity {
        fn map(&self, phys: u64, len: u64) -> Option<MappedRegion> {
            self.last.set(Some((phys, len)));
            // SAFETY: test-only, the region is never dereferenced.
            Some(unsafe { MappedRegion::new(phys, phys as usize, len) })
        }
    }

    fn mapper() -> Identity {
        Identity {
            last: Cell::new(None),
        }
    }

    #[test]
    fn maps_whole_bar() {
        let m = mapper();
        let res = Resource::memory(0xFEBC_0000, 0x2_0000).claimed(1);
        let region = iomap_range(&res, 0, None, &m).unwrap();
        assert_eq!(region.phys_base(), 0xFEBC_0000);
        assert_eq!(region.size(), 0x2_0000);
    }

    #[test]
    fn offset_and_maxlen() {
        let m = mapper();
        let res = Resource::memory(0xFEBC_0000, 0x2_0000);
        iomap_range(&res, 0x1000, Some(0x100), &m).unwrap();
        assert_eq!(m.last.get(), Some((0xFEBC_1000, 0x100)));
        iomap_range(&res, 0x1_F000, Some(0x8000), &m).unwrap();
        assert_eq!(m.last.get(), Some((0xFEBD_F000, 0x1000)));
    }

    #[test]
    fn rejects_unmappable() {
        let m = mapper();
        assert!(iomap_range(&Resource::io(0xC000, 0x20), 0, None, &m).is_none());
        assert!(iomap_range(&Resource::UNUSED, 0, None, &m).is_none());
        assert!(iomap_range(&Resource::memory(0, 0x1000), 0, None, &m).is_none());
        assert!(iomap_range(&Resource::memory(0xE000_0000, 0x1000).unset(), 0, None, &m).is_none());
        assert!(iomap_range(&Resource::memory(0xE000_0000, 0x1000), 0x1000, None, &m).is_none());
        assert!(iomap_range(&Resource::memory(0xE000_0000, 0), 0, None, &m).is_none());
        assert_eq!(m.last.get(), None);
    }

    #[test]
    fn rejects_window_past_top_of_address_space() {
        let m = mapper();
        // Malformed: the range wraps.
        let res = Resource::memory(u64::MAX - 0xFFF, 0x10_0000);
        assert!(iomap_range(&res, 0x2000, None, &m).is_none());
        assert!(iomap_range(&res, 0, None, &m).is_none());
        assert_eq!(m.last.get(), None);

        // A window capped below the top is still fine.
        iomap_range(&res, 0x800, Some(0x800), &m).unwrap();
        assert_eq!(m.last.get(), Some((u64::MAX - 0x7FF, 0x800)));
    }

    #[test]
    fn region_ptr_at() {
        // SAFETY: test-only, no real hardware.
        let region = unsafe { MappedRegion::new(0x1000, 0x1000, 4096) };
        assert!(region.ptr_at(0).is_some());
        assert!(region.ptr_at(4095).is_some());
        assert!(region.ptr_at(4096).is_none());

        // SAFETY: as above.
        let top = unsafe { MappedRegion::new(0, usize::MAX - 1, 16) };
        assert!(top.ptr_at(1).is_some());
        assert!(top.ptr_at(2).is_none());
    }
}
