//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! This module provides a safe Rust interface to Linux KVM for
//! hardware-assisted virtualization. The hypervisor talks to KVM through
//! ioctls on three file descriptors:
//!
//! - `/dev/kvm` - System-level operations (query capabilities, create VMs)
//! - VM file descriptor - VM-level operations (create vCPUs, set memory)
//! - vCPU file descriptor - vCPU-level operations (run, get/set registers)
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │   xenon      │                   │   KVM Module     │
//! │              │    ioctl()        │  ┌────────────┐  │
//! │  VmFd ───────┼──────────────────►│  │ VM State   │  │
//! │              │                   │  └────────────┘  │
//! │  VcpuFd ─────┼──────────────────►│  ┌────────────┐  │
//! │              │                   │  │ vCPU State │  │
//! └──────────────┘                   │  └────────────┘  │
//!                                    └──────────────────┘
//! ```
//!
//! # Execution model
//!
//! Each guest runs on one vCPU driven by a loop:
//!
//! 1. VMM calls `vcpu.run()` - control transfers to guest
//! 2. Guest executes until a "VM exit" occurs
//! 3. KVM returns control to the VMM with an exit reason
//! 4. VMM handles the exit (port I/O, HLT, ...)
//! 5. VMM calls `vcpu.run()` again
//!
//! The guests here are bare flat binaries that only touch two I/O ports
//! and eventually HLT. No in-kernel IRQ chip is created: with one, HLT
//! parks the vCPU inside the kernel waiting for an interrupt that never
//! comes, instead of exiting back to us.

mod vcpu;
mod vm;

pub use vcpu::{IoData, IoHandler, VcpuExit, VcpuFd};
pub use vm::VmFd;

use kvm_ioctls::Kvm;
use thiserror::Error;

/// Errors that can occur during KVM operations.
#[derive(Error, Debug)]
pub enum KvmError {
    /// Failed to open /dev/kvm device.
    ///
    /// This usually means:
    /// - KVM is not available (not running on Linux, or KVM module not loaded)
    /// - Insufficient permissions (user not in kvm group)
    /// - Running in a VM without nested virtualization enabled
    #[error("Failed to open /dev/kvm: {0}")]
    Open(#[source] kvm_ioctls::Error),

    /// Failed to query the size of the per-vCPU shared region.
    #[error("Failed to query vCPU mmap size: {0}")]
    VcpuMmapSize(#[source] kvm_ioctls::Error),

    /// Failed to create a new VM.
    #[error("Failed to create VM: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    /// Failed to create a vCPU.
    #[error("Failed to create vCPU: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    /// Failed to register guest memory with KVM.
    #[error("Failed to set user memory region: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    /// Failed to get CPU registers.
    #[error("Failed to get registers: {0}")]
    GetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to set CPU registers.
    #[error("Failed to set registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    /// Failed to run vCPU.
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),
}

/// Process-wide handle on the KVM control device.
///
/// Opened once at startup and shared by reference across all guest
/// construction. Caches the size of the per-vCPU shared communication
/// region, which KVM requires userspace to query before any vCPU can be
/// mapped (`kvm-ioctls` performs the actual mapping when the vCPU is
/// created).
pub struct Hypervisor {
    /// The underlying /dev/kvm handle.
    kvm: Kvm,
    /// Size in bytes of the per-vCPU shared region (KVM_GET_VCPU_MMAP_SIZE).
    vcpu_mmap_size: usize,
}

impl Hypervisor {
    /// Open `/dev/kvm` and cache the per-vCPU shared-region size.
    ///
    /// # Errors
    ///
    /// `KvmError::Open` if the control device cannot be opened,
    /// `KvmError::VcpuMmapSize` if the size query fails afterwards.
    pub fn open() -> Result<Self, KvmError> {
        let kvm = Kvm::new().map_err(KvmError::Open)?;

        let vcpu_mmap_size = kvm.get_vcpu_mmap_size().map_err(KvmError::VcpuMmapSize)?;

        Ok(Self {
            kvm,
            vcpu_mmap_size,
        })
    }

    /// Size in bytes of the shared region KVM maps for each vCPU.
    pub fn vcpu_shared_size(&self) -> usize {
        self.vcpu_mmap_size
    }

    /// Create a new virtual machine.
    pub fn create_vm(&self) -> Result<VmFd, KvmError> {
        let vm = self.kvm.create_vm().map_err(KvmError::CreateVm)?;
        Ok(VmFd::new(vm))
    }
}
