//! Guest virtual memory access
//!
//! [`GuestMemory`] is the contract the patcher uses to touch guest code. [`Memory`] is
//! the implementation over a raw physical memory snapshot, translating guest virtual
//! addresses through the guest's own 4-level page tables.

use anyhow::{Context, Result};

use crate::addrs::{Cr3, PhysAddr, VirtAddr, Vcpu, PAGE_SIZE};
use crate::page_table::{Entry, PageSize, Translation};

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::Path;

/// Synchronous access to the guest virtual address space as seen by one vCPU.
///
/// The guest is paused for the duration of every call.
pub trait GuestMemory {
    /// Read `buf.len()` bytes starting at `virt_addr`
    ///
    /// # Errors
    ///
    /// * Any byte in the range is unmapped or outside of guest memory
    fn read_bytes(&self, virt_addr: VirtAddr, buf: &mut [u8], vcpu: Vcpu) -> Result<(), Error>;

    /// Write all of `buf` starting at `virt_addr`
    ///
    /// # Errors
    ///
    /// * Any byte in the range is unmapped or outside of guest memory
    fn write_bytes(&mut self, virt_addr: VirtAddr, buf: &[u8], vcpu: Vcpu) -> Result<(), Error>;

    /// Returns `true` if `virt_addr` currently translates to guest memory
    fn is_mapped(&self, virt_addr: VirtAddr, vcpu: Vcpu) -> bool;
}

/// Custom errors [`Memory`] can throw
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Attempted to write to an unmapped virtual address
    #[error("WriteToUnmappedVirtualAddress_{0:x?}_{1:x?}")]
    WriteToUnmappedVirtualAddress(VirtAddr, Cr3),

    /// Attempted to read from an unmapped virtual address
    #[error("ReadFromUnmappedVirtualAddress_{0:x?}_{1:x?}")]
    ReadFromUnmappedVirtualAddress(VirtAddr, Cr3),

    /// Attempted to read out of bounds of the physical memory
    #[error("ReadPhysicalAddressOutOfBounds_{0:x?}")]
    ReadPhysicalAddressOutOfBounds(PhysAddr),

    /// Attempted to write out of bounds of the physical memory
    #[error("WritePhysicalAddressOutOfBounds_{0:x?}")]
    WritePhysicalAddressOutOfBounds(PhysAddr),

    /// Accessing the range would wrap the virtual address space
    #[error("Access at {0:x?} wraps the virtual address space")]
    AddressSpaceOverflow(VirtAddr),

    /// No physical page allocator was set up before mapping new pages
    #[error("Physical page allocation requested without a starting page")]
    AllocatorNotInitialized,

    /// No physical memory left to back a new page
    #[error("Out of guest physical memory while allocating a page")]
    OutOfPhysicalPages,

    /// A clean snapshot used to reset this memory has a different size
    #[error("Clean snapshot is {found:#x} bytes, expected {expected:#x}")]
    SnapshotSizeMismatch {
        /// Size of this memory
        expected: usize,

        /// Size of the given clean snapshot
        found: usize,
    },
}

/// Storage behind the guest physical address space
enum Backing {
    /// Heap allocated physical memory
    Owned(Vec<u8>),

    /// Shared writable mapping of a physical memory snapshot file. Writes land in the
    /// file.
    Mapped(memmap::MmapMut),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Owned(bytes) => bytes.as_slice(),
            Backing::Mapped(map) => &map[..],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Owned(bytes) => bytes.as_mut_slice(),
            Backing::Mapped(map) => &mut map[..],
        }
    }
}

/// Guest physical memory with virtual address translation
pub struct Memory {
    /// The physical memory itself
    backing: Backing,

    /// Pages that have been dirtied by writes
    pub dirty_pages: BTreeSet<PhysAddr>,

    /// Next available physical page handed out by [`Memory::allocate_phys_page`]
    next_avail_phys_page: Option<PhysAddr>,
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.size())
            .field("dirty_pages", &self.dirty_pages.len())
            .finish()
    }
}

impl Memory {
    /// Create a `Memory` owning the given physical memory contents
    #[must_use]
    pub fn from_vec(physmem: Vec<u8>) -> Self {
        Self {
            backing: Backing::Owned(physmem),
            dirty_pages: BTreeSet::new(),
            next_avail_phys_page: None,
        }
    }

    /// Create a zeroed `Memory` of `size` bytes
    #[must_use]
    pub fn zeroed(size: usize) -> Self {
        Self::from_vec(vec![0; size])
    }

    /// Map the physical memory snapshot at `path` as shared and writable. Writes
    /// through this `Memory` modify the snapshot file.
    ///
    /// # Errors
    ///
    /// * Fail to open or map the physical memory file
    pub fn from_file(path: &Path) -> Result<Self> {
        // Open the physical memory backing for this snapshot
        let physmem_file = OpenOptions::new()
            .write(true)
            .read(true)
            .open(path)
            .with_context(|| format!("Failed to open physical memory {path:?}"))?;

        // UNSAFE: The mapping is only sound as long as nothing else truncates the
        // snapshot file while it is mapped
        let map = unsafe { memmap::MmapMut::map_mut(&physmem_file) }
            .with_context(|| format!("Failed to map physical memory {path:?}"))?;

        log::info!("Mapped physical memory {path:?}: {:#x} bytes", map.len());

        Ok(Self {
            backing: Backing::Mapped(map),
            dirty_pages: BTreeSet::new(),
            next_avail_phys_page: None,
        })
    }

    /// Get the size of the physical memory
    #[must_use]
    pub fn size(&self) -> usize {
        self.backing.bytes().len()
    }

    /// Get the raw physical memory
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.backing.bytes()
    }

    /// Flush a file backed memory to disk. No-op for owned memory.
    ///
    /// # Errors
    ///
    /// * The underlying `msync` failed
    pub fn flush(&self) -> Result<()> {
        if let Backing::Mapped(map) = &self.backing {
            map.flush().context("Failed to flush physical memory")?;
        }

        Ok(())
    }

    /// Read bytes from the [`PhysAddr`] into the given `buf`
    ///
    /// # Errors
    ///
    /// * The given physical address is out of bounds of the physical memory
    pub fn read_phys_bytes(&self, phys_addr: PhysAddr, buf: &mut [u8]) -> Result<(), Error> {
        let range = self
            .phys_range(phys_addr, buf.len())
            .ok_or(Error::ReadPhysicalAddressOutOfBounds(phys_addr))?;

        buf.copy_from_slice(&self.backing.bytes()[range]);
        Ok(())
    }

    /// Write the bytes in `buf` to the [`PhysAddr`]
    ///
    /// # Errors
    ///
    /// * The given physical address is out of bounds of the physical memory
    pub fn write_phys_bytes(&mut self, phys_addr: PhysAddr, buf: &[u8]) -> Result<(), Error> {
        let range = self
            .phys_range(phys_addr, buf.len())
            .ok_or(Error::WritePhysicalAddressOutOfBounds(phys_addr))?;

        self.backing.bytes_mut()[range].copy_from_slice(buf);
        Ok(())
    }

    /// Read a little endian `u64` from the given [`PhysAddr`]
    ///
    /// # Errors
    ///
    /// * The given physical address is out of bounds of the physical memory
    pub fn read_phys_u64(&self, phys_addr: PhysAddr) -> Result<u64, Error> {
        let mut bytes = [0_u8; size_of::<u64>()];
        self.read_phys_bytes(phys_addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Get the byte range into the backing for `size` bytes at `phys_addr`
    fn phys_range(&self, phys_addr: PhysAddr, size: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(phys_addr.0).ok()?;
        let end = start.checked_add(size)?;

        if end > self.size() {
            return None;
        }

        Some(start..end)
    }

    /// Get a translation for `virt_addr` using the page table found at `cr3`.
    ///
    /// Page table entries pointing outside of physical memory are treated as not
    /// present rather than trusted.
    #[must_use]
    pub fn translate(&self, virt_addr: VirtAddr, cr3: Cr3) -> Translation {
        // Get the offsets into the table for each page table level
        //
        // Each offset is 9 bits
        // VirtAddr: 0baaaa_aaaa_abbb_bbbb_bbcc_cccc_cccd_dddd_dddd_0000_0000_0000
        //             [Lvl1index][Lvl2index][Lvl3index][Lvl4index]
        let table_indexes = virt_addr.table_indexes();

        let mut table = cr3.table();

        for (level, index) in table_indexes.iter().enumerate() {
            let entry_addr = table.offset((index * size_of::<u64>()) as u64);

            let Ok(raw) = self.read_phys_u64(entry_addr) else {
                return Translation::new_not_present();
            };

            let entry = Entry(raw);
            let flags = entry.flags();

            if !flags.present() {
                return Translation::new_not_present();
            }

            if flags.page_size() {
                let page_size = match level {
                    1 => PageSize::Size1G,
                    2 => PageSize::Size2M,
                    // PS is reserved in the PML4 and is the PAT bit in a PTE
                    _ => return Translation::new_not_present(),
                };

                let offset = virt_addr.0 & (page_size.bytes() - 1);
                let base = PhysAddr(entry.address().0 & !(page_size.bytes() - 1));

                return Translation::new(base.offset(offset), page_size);
            }

            table = entry.address();
        }

        // Get the offset into the 4k page for the requested virtual address
        let offset = virt_addr.0 & (PAGE_SIZE - 1);

        Translation::new(table.offset(offset), PageSize::Size4K)
    }

    /// Split `size` bytes starting at `virt_addr` into chunks that never straddle a
    /// 4KiB page, since neighbouring virtual pages are not necessarily contiguous
    /// physically.
    ///
    /// # Errors
    ///
    /// * The range wraps the virtual address space
    fn page_chunks(virt_addr: VirtAddr, size: usize) -> Result<Vec<(VirtAddr, usize)>, Error> {
        let mut chunks = Vec::new();

        let mut curr = virt_addr;
        let mut left = size as u64;

        while left > 0 {
            let chunk = left.min(curr.bytes_left_in_page());
            chunks.push((curr, chunk as usize));
            left -= chunk;

            if left > 0 {
                curr = curr
                    .checked_offset(chunk)
                    .ok_or(Error::AddressSpaceOverflow(virt_addr))?;
            }
        }

        Ok(chunks)
    }

    /// Set the first physical page handed out when mapping new virtual pages
    pub fn set_next_avail_phys_page(&mut self, phys_addr: PhysAddr) {
        self.next_avail_phys_page = Some(phys_addr.page());
    }

    /// Allocate a zeroed physical page
    ///
    /// # Errors
    ///
    /// * No starting page was set with [`Memory::set_next_avail_phys_page`]
    /// * The allocator ran past the end of physical memory
    pub fn allocate_phys_page(&mut self) -> Result<PhysAddr, Error> {
        let page = self
            .next_avail_phys_page
            .ok_or(Error::AllocatorNotInitialized)?;

        self.write_phys_bytes(page, &[0; PAGE_SIZE as usize])
            .map_err(|_| Error::OutOfPhysicalPages)?;

        self.next_avail_phys_page = Some(page.offset(PAGE_SIZE));

        Ok(page)
    }

    /// Map a fresh 4KiB physical page at `virt_addr` in the page table at `cr3`,
    /// allocating any missing intermediate tables. Returns the physical page backing
    /// `virt_addr`, whether it was just allocated or already mapped.
    ///
    /// # Errors
    ///
    /// * Allocating a page table or the page itself failed
    pub fn map_virt_addr_4k(&mut self, virt_addr: VirtAddr, cr3: Cr3) -> Result<PhysAddr, Error> {
        // Check if the mapping already exists.
        if let Some(phys_addr) = self.translate(virt_addr, cr3).phys_addr() {
            return Ok(phys_addr.page());
        }

        let mut table = cr3.table();

        for index in virt_addr.table_indexes() {
            let entry_addr = table.offset((index * size_of::<u64>()) as u64);
            let mut entry = Entry(self.read_phys_u64(entry_addr)?);

            if !entry.flags().present() {
                let new_page = self.allocate_phys_page()?;

                entry.set_address(new_page);
                entry.set_present();
                entry.set_writable();

                self.write_phys_bytes(entry_addr, &entry.0.to_le_bytes())?;
            }

            table = entry.address();
        }

        Ok(table)
    }

    /// Copy every dirtied page back from the `clean` snapshot and clear the dirty list
    ///
    /// # Errors
    ///
    /// * The clean snapshot is not the same size as this memory
    pub fn reset_dirty_pages(&mut self, clean: &[u8]) -> Result<(), Error> {
        if clean.len() != self.size() {
            return Err(Error::SnapshotSizeMismatch {
                expected: self.size(),
                found: clean.len(),
            });
        }

        let dirty = std::mem::take(&mut self.dirty_pages);
        log::debug!("Resetting {} dirty pages", dirty.len());

        for page in dirty {
            if let Some(range) = self.phys_range(page, PAGE_SIZE as usize) {
                self.backing.bytes_mut()[range.clone()].copy_from_slice(&clean[range]);
            }
        }

        Ok(())
    }
}

impl GuestMemory for Memory {
    fn read_bytes(&self, virt_addr: VirtAddr, buf: &mut [u8], vcpu: Vcpu) -> Result<(), Error> {
        let mut offset = 0_usize;

        for (chunk_addr, size) in Self::page_chunks(virt_addr, buf.len())? {
            let phys_addr = self
                .translate(chunk_addr, vcpu.cr3)
                .phys_addr()
                .ok_or(Error::ReadFromUnmappedVirtualAddress(chunk_addr, vcpu.cr3))?;

            self.read_phys_bytes(phys_addr, &mut buf[offset..offset + size])?;
            offset += size;
        }

        Ok(())
    }

    fn write_bytes(&mut self, virt_addr: VirtAddr, buf: &[u8], vcpu: Vcpu) -> Result<(), Error> {
        let chunks = Self::page_chunks(virt_addr, buf.len())?;

        // Translate every chunk before writing any so a partially unmapped range is
        // rejected without modifying memory
        let mut targets = Vec::with_capacity(chunks.len());
        for (chunk_addr, size) in chunks {
            let phys_addr = self
                .translate(chunk_addr, vcpu.cr3)
                .phys_addr()
                .ok_or(Error::WriteToUnmappedVirtualAddress(chunk_addr, vcpu.cr3))?;

            if self.phys_range(phys_addr, size).is_none() {
                return Err(Error::WritePhysicalAddressOutOfBounds(phys_addr));
            }

            targets.push((phys_addr, size));
        }

        let mut offset = 0_usize;
        for (phys_addr, size) in targets {
            self.write_phys_bytes(phys_addr, &buf[offset..offset + size])?;

            // Dirty the physical page
            self.dirty_pages.insert(phys_addr.page());
            offset += size;
        }

        Ok(())
    }

    fn is_mapped(&self, virt_addr: VirtAddr, vcpu: Vcpu) -> bool {
        self.translate(virt_addr, vcpu.cr3)
            .phys_addr()
            .map_or(false, |phys_addr| self.phys_range(phys_addr, 1).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CR3: Cr3 = Cr3(0x1000);
    const VCPU: Vcpu = Vcpu::new(0, CR3);

    fn memory() -> Memory {
        let mut memory = Memory::zeroed(0x40_000);
        memory.set_next_avail_phys_page(PhysAddr(0x2000));
        memory
    }

    #[test]
    fn unmapped_until_mapped() {
        let mut memory = memory();
        let addr = VirtAddr(0x7fff_1234_5000);

        assert!(!memory.is_mapped(addr, VCPU));
        let phys = memory.map_virt_addr_4k(addr, CR3).unwrap();
        assert!(memory.is_mapped(addr, VCPU));
        assert!(memory.is_mapped(VirtAddr(addr.0 + 0xfff), VCPU));
        assert!(!memory.is_mapped(VirtAddr(addr.0 + 0x1000), VCPU));

        // Mapping again returns the same page
        assert_eq!(memory.map_virt_addr_4k(addr, CR3).unwrap(), phys);
    }

    #[test]
    fn read_write_across_page_boundary() {
        let mut memory = memory();
        memory.map_virt_addr_4k(VirtAddr(0x40_0000), CR3).unwrap();
        memory.map_virt_addr_4k(VirtAddr(0x40_1000), CR3).unwrap();

        let data = [0x41, 0x42, 0x43, 0x44];
        memory
            .write_bytes(VirtAddr(0x40_0ffe), &data, VCPU)
            .unwrap();

        let mut out = [0_u8; 4];
        memory.read_bytes(VirtAddr(0x40_0ffe), &mut out, VCPU).unwrap();
        assert_eq!(out, data);
        assert_eq!(memory.dirty_pages.len(), 2);
    }

    #[test]
    fn straddling_write_into_unmapped_page_writes_nothing() {
        let mut memory = memory();
        memory.map_virt_addr_4k(VirtAddr(0x40_0000), CR3).unwrap();

        let res = memory.write_bytes(VirtAddr(0x40_0ffe), &[1, 2, 3, 4], VCPU);
        assert_eq!(
            res,
            Err(Error::WriteToUnmappedVirtualAddress(VirtAddr(0x40_1000), CR3))
        );

        let mut out = [0xff_u8; 2];
        memory.read_bytes(VirtAddr(0x40_0ffe), &mut out, VCPU).unwrap();
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn large_page_translation() {
        let mut memory = memory();

        // PML4[0] -> PDPT at 0x2000, PDPT[0] -> PD at 0x3000, PD[1] is a 2MiB page
        // at physical 0x0
        memory
            .write_phys_bytes(PhysAddr(0x1000), &(0x2000_u64 | 0b11).to_le_bytes())
            .unwrap();
        memory
            .write_phys_bytes(PhysAddr(0x2000), &(0x3000_u64 | 0b11).to_le_bytes())
            .unwrap();
        memory
            .write_phys_bytes(PhysAddr(0x3008), &(0b1000_0011_u64).to_le_bytes())
            .unwrap();

        let translation = memory.translate(VirtAddr(0x20_1234), CR3);
        assert_eq!(translation.phys_addr(), Some(PhysAddr(0x1234)));
        assert_eq!(translation.page_size, Some(PageSize::Size2M));
    }

    #[test]
    fn reset_dirty_pages_restores_clean_bytes() {
        let mut memory = memory();
        memory.map_virt_addr_4k(VirtAddr(0x40_0000), CR3).unwrap();
        memory.dirty_pages.clear();

        let clean = memory.as_bytes().to_vec();

        memory
            .write_bytes(VirtAddr(0x40_0010), &[0xcc; 8], VCPU)
            .unwrap();
        assert_ne!(memory.as_bytes(), &clean[..]);

        memory.reset_dirty_pages(&clean).unwrap();
        assert_eq!(memory.as_bytes(), &clean[..]);
        assert!(memory.dirty_pages.is_empty());

        assert!(matches!(
            memory.reset_dirty_pages(&clean[..0x1000]),
            Err(Error::SnapshotSizeMismatch { .. })
        ));
    }

    #[test]
    fn allocator_must_be_initialized() {
        let mut memory = Memory::zeroed(0x4000);
        assert_eq!(
            memory.map_virt_addr_4k(VirtAddr(0x1000), Cr3(0)),
            Err(Error::AllocatorNotInitialized)
        );
    }
}
