//! Utilities to help walk an Intel 4-level page table

use crate::addrs::PhysAddr;

/// Mask of the physical address bits of a page table entry
const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Various flags corresponding to a page table entry.
#[derive(Debug, Copy, Clone)]
pub struct EntryFlags {
    /// Set if this entry is present
    present: bool,

    /// Set if this entry is for an extended page size (For example, 1GB or 2MB)
    page_size: bool,
}

impl EntryFlags {
    /// Returns `true` if the `present` bit is set in the [`EntryFlags`]
    pub fn present(&self) -> bool {
        self.present
    }

    /// Returns `true` if the `page_size` bit is set in the [`EntryFlags`]
    pub fn page_size(&self) -> bool {
        self.page_size
    }
}

impl From<Entry> for EntryFlags {
    #[inline]
    fn from(entry: Entry) -> Self {
        Self {
            present: entry.0 & (1 << 0) > 0,
            page_size: entry.0 & (1 << 7) > 0,
        }
    }
}

impl From<u64> for Entry {
    fn from(val: u64) -> Self {
        Self(val)
    }
}

/// A page table entry
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(pub u64);

impl Entry {
    /// Get the [`EntryFlags`] for this [`Entry`]
    #[inline]
    pub fn flags(self) -> EntryFlags {
        EntryFlags::from(self)
    }

    /// Get the [`PhysAddr`] address for this [`Entry`]
    #[inline]
    pub fn address(self) -> PhysAddr {
        PhysAddr(self.0 & ADDRESS_MASK)
    }

    /// Set the [`PhysAddr`] address for this [`Entry`]
    #[inline]
    pub fn set_address(&mut self, addr: PhysAddr) {
        // Clear the old address
        self.0 &= !ADDRESS_MASK;

        // Set the new address
        self.0 |= addr.0 & ADDRESS_MASK;
    }

    /// Set the present bit in the given entry
    pub fn set_present(&mut self) {
        self.0 |= 1 << 0;
    }

    /// Set the writable bit in the given entry
    pub fn set_writable(&mut self) {
        self.0 |= 1 << 1;
    }
}

/// The size of the memory containing the translated address
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageSize {
    /// A page with 1 gigabyte (1GiB), mapped by a PDPT entry
    Size1G,

    /// A page with 2 megabytes (2MiB), mapped by a PD entry
    Size2M,

    /// A page with 4 kilobytes (4KiB)
    Size4K,
}

impl PageSize {
    /// The number of bytes covered by a page of this size
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size1G => 1024 * 1024 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size4K => 4 * 1024,
        }
    }
}

/// The result of a virtual address translation containing the page size and physical
/// address
#[derive(Debug, Copy, Clone)]
pub struct Translation {
    /// The physical address of the translation, if found
    phys_addr: Option<PhysAddr>,

    /// The size of the translation page
    pub page_size: Option<PageSize>,
}

impl Translation {
    /// Create a new [`Translation`] mapped to `phys_addr`
    pub fn new(phys_addr: PhysAddr, page_size: PageSize) -> Self {
        Self {
            phys_addr: Some(phys_addr),
            page_size: Some(page_size),
        }
    }

    /// Create a new [`Translation`] for an address that is not present in the page
    /// table
    pub fn new_not_present() -> Self {
        Self {
            phys_addr: None,
            page_size: None,
        }
    }

    /// Get the [`PhysAddr`] for this translation
    pub fn phys_addr(&self) -> Option<PhysAddr> {
        self.phys_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_flags_and_address() {
        let mut entry = Entry::default();
        assert!(!entry.flags().present());

        entry.set_address(PhysAddr(0x1234_5678));
        entry.set_present();
        entry.set_writable();

        assert_eq!(entry.address(), PhysAddr(0x1234_5000));
        assert_eq!(entry.0 & 0b11, 0b11);
        assert!(entry.flags().present());
        assert!(!entry.flags().page_size());
    }

    #[test]
    fn large_page_bit_and_nx_stay_out_of_the_address() {
        let entry = Entry(1 | (1 << 7) | (1 << 63) | 0x4020_0000);
        assert!(entry.flags().page_size());
        assert_eq!(entry.address(), PhysAddr(0x4020_0000));
    }
}
