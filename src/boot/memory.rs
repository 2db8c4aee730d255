//! Guest physical memory backed by the vm-memory crate.
//!
//! Wraps `vm_memory::GuestMemoryMmap`, the standard guest-memory
//! abstraction of the rust-vmm ecosystem, into the small API the rest
//! of the hypervisor needs: a single contiguous region starting at
//! guest-physical address 0, with bounds-checked byte and u64 access.
//!
//! The region *is* the guest's physical address space. The paging setup
//! writes its tables into the low pages through this view, and the
//! image loader copies the guest binary to its start address the same
//! way; nothing in the crate touches the mapping through raw pointers.

use super::BootError;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Guest physical memory region.
///
/// The underlying memory is an anonymous private mmap. KVM translates
/// guest-physical accesses to it through the slot registered at
/// construction time, so host-side writes are immediately visible to
/// the guest and vice versa.
pub struct GuestMemory {
    /// The underlying vm-memory guest memory.
    inner: GuestMemoryMmap,
    /// Size of the memory region in bytes.
    size: u64,
}

impl GuestMemory {
    /// Allocate a new guest memory region of `size` bytes at
    /// guest-physical address 0.
    pub fn new(size: u64) -> Result<Self, BootError> {
        let regions = vec![(GuestAddress(0), size as usize)];

        let inner = GuestMemoryMmap::from_ranges(&regions).map_err(|e| {
            BootError::MemoryAllocation(std::io::Error::other(format!(
                "Failed to create guest memory: {}",
                e
            )))
        })?;

        Ok(Self { inner, size })
    }

    /// Get raw parts for KVM memory region registration.
    ///
    /// Returns (host_virtual_address, size) for use with
    /// `set_user_memory_region`.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while this GuestMemory exists.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        let host_addr = region.as_ptr() as u64;
        (host_addr, self.size)
    }

    /// Write bytes at a guest physical address.
    ///
    /// Fails if the write would exceed the region.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), BootError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| BootError::MemoryAccess { addr })
    }

    /// Read bytes from a guest physical address into a buffer.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), BootError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| BootError::MemoryAccess { addr })
    }

    /// Write a 64-bit value at a guest physical address (little-endian).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), BootError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read a 64-bit value from a guest physical address (little-endian).
    pub fn read_u64(&self, addr: u64) -> Result<u64, BootError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    #[test]
    fn test_allocate() {
        let mem = GuestMemory::new(4096).unwrap();
        let (_, size) = mem.as_raw_parts();
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_u64_round_trip() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u64(0x100, 0x123456789abcdef0).unwrap();
        assert_eq!(mem.read_u64(0x100).unwrap(), 0x123456789abcdef0);
        assert_eq!(
            read_vec(&mem, 0x100, 8),
            vec![0xf0, 0xde, 0xbc, 0x9a, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());
    }

    #[test]
    fn test_read_out_of_bounds() {
        let mem = GuestMemory::new(100).unwrap();
        let mut buf = [0u8; 2];
        assert!(mem.read(99, &mut buf).is_err());
    }
}
