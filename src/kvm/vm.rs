//! Virtual machine creation and memory registration.
//!
//! A VM here is deliberately bare: no in-kernel IRQ chip, no PIT, no
//! TSS relocation. The guests never take interrupts and never leave the
//! two emulated ports, so the only VM-level state that matters is the
//! guest physical memory slot and the single vCPU.
//!
//! # Memory regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a
//! range of guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ 0x00000000   │ ────► │ mmap'd region│
//! │              │       │              │
//! │ mem_size-1   │       │              │
//! └──────────────┘       └──────────────┘
//! ```
//!
//! This hypervisor uses exactly one slot (slot 0) starting at
//! guest-physical 0, so a guest-physical address is simply an offset
//! into the host mapping.

use super::{KvmError, VcpuFd};
use kvm_bindings::kvm_userspace_memory_region;

/// Wrapper around the KVM VM file descriptor.
pub struct VmFd {
    /// The underlying KVM VM file descriptor.
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    /// Create a new VmFd wrapper.
    pub fn new(vm: kvm_ioctls::VmFd) -> Self {
        Self { vm }
    }

    /// Register a guest memory region with KVM.
    ///
    /// Maps a range of guest physical addresses to a region of host
    /// virtual memory. After registration, guest accesses to these
    /// physical addresses transparently access the host memory.
    ///
    /// # Arguments
    ///
    /// * `slot` - Memory slot number (0 for the main region)
    /// * `guest_addr` - Starting guest physical address (0 here)
    /// * `memory_size` - Size of the region in bytes
    /// * `userspace_addr` - Host virtual address of the memory (from mmap)
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - The host memory region remains valid for the lifetime of the VM
    /// - The memory is not freed while the VM is running
    /// - The region doesn't overlap with other registered regions
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(KvmError::SetMemoryRegion)
        }
    }

    /// Create the virtual CPU.
    ///
    /// Every guest has exactly one vCPU with id 0. `kvm-ioctls` maps the
    /// per-vCPU shared communication region as part of this call; exits
    /// are later consumed through that mapping.
    pub fn create_vcpu(&self, id: u64) -> Result<VcpuFd, KvmError> {
        let vcpu = self.vm.create_vcpu(id).map_err(KvmError::CreateVcpu)?;
        Ok(VcpuFd::new(vcpu))
    }
}
