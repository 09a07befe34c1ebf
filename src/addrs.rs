//! Address types and the execution-context handle used for guest memory access

use serde::{Deserialize, Serialize};

/// Size of a 4KiB page
pub const PAGE_SIZE: u64 = 0x1000;

/// A guest physical address
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Return a [`PhysAddr`] `offset` byte away from `self`
    ///
    /// Example:
    ///
    /// ```
    /// # use snappatch::PhysAddr;
    /// let page = PhysAddr(0xdead_0000);
    /// let entry = page.offset(0x1234);
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn offset(self, offset: u64) -> PhysAddr {
        PhysAddr(self.0 + offset)
    }

    /// Return the page that contains this [`PhysAddr`]
    #[must_use]
    pub const fn page(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }
}

impl std::ops::Deref for PhysAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A guest virtual address
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize, Hash)]
pub struct VirtAddr(pub u64);

impl From<u64> for VirtAddr {
    fn from(val: u64) -> VirtAddr {
        VirtAddr(val)
    }
}

impl VirtAddr {
    /// Return a [`VirtAddr`] `offset` byte away from `self`, or `None` if the result
    /// wraps the address space
    ///
    /// Example:
    ///
    /// ```
    /// # use snappatch::VirtAddr;
    /// let page = VirtAddr(0xdead_0000);
    /// let entry = page.checked_offset(0x1234).unwrap();
    /// assert!(entry.0 == 0xdead_1234);
    /// ```
    #[must_use]
    pub const fn checked_offset(self, offset: u64) -> Option<VirtAddr> {
        match self.0.checked_add(offset) {
            Some(addr) => Some(VirtAddr(addr)),
            None => None,
        }
    }

    /// Get the 4 page table indexes that this [`VirtAddr`] maps with when translating
    /// via a 4-level page table
    #[must_use]
    pub const fn table_indexes(self) -> [usize; 4] {
        [
            ((self.0 >> 39) & 0x1ff) as usize,
            ((self.0 >> 30) & 0x1ff) as usize,
            ((self.0 >> 21) & 0x1ff) as usize,
            ((self.0 >> 12) & 0x1ff) as usize,
        ]
    }

    /// Return the page that contains this [`VirtAddr`]
    ///
    /// Example:
    ///
    /// ```
    /// # use snappatch::VirtAddr;
    /// let addr = VirtAddr(0xdead_1234);
    /// assert!(addr.page().0 == 0xdead_1000);
    /// ```
    #[must_use]
    pub const fn page(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Number of bytes from this address to the end of its 4KiB page
    #[must_use]
    pub const fn bytes_left_in_page(self) -> u64 {
        PAGE_SIZE - (self.0 & (PAGE_SIZE - 1))
    }
}

impl std::ops::Deref for VirtAddr {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Remove a single `0x` or `0X` prefix
fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s)
}

impl std::str::FromStr for VirtAddr {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Attempt to parse the hex digit
        Ok(VirtAddr(u64::from_str_radix(strip_hex_prefix(s), 16)?))
    }
}

/// A wrapper around the cr3
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct Cr3(pub u64);

impl Cr3 {
    /// The physical address of the top level page table, with the PCID and flag bits
    /// cleared
    #[must_use]
    pub const fn table(self) -> PhysAddr {
        PhysAddr(self.0 & 0x000f_ffff_ffff_f000)
    }
}

impl std::ops::Deref for Cr3 {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::str::FromStr for Cr3 {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Cr3(u64::from_str_radix(strip_hex_prefix(s), 16)?))
    }
}

/// Non-owning handle to the vCPU whose view of guest memory is being patched.
///
/// The vCPU itself belongs to the hypervisor. This handle only carries what is needed
/// to address guest memory as that vCPU sees it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vcpu {
    /// Index of the vCPU in the VM
    pub id: u32,

    /// Page table root of the guest context being patched
    pub cr3: Cr3,
}

impl Vcpu {
    /// Create a handle for vCPU `id` translating through `cr3`
    #[must_use]
    pub const fn new(id: u32, cr3: Cr3) -> Self {
        Self { id, cr3 }
    }
}
