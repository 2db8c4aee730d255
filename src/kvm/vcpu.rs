//! Virtual CPU management and execution.
//!
//! A vCPU represents a virtual processor that executes guest
//! instructions using hardware-assisted virtualization (Intel VT-x or
//! AMD-V).
//!
//! # VM exits
//!
//! When the guest performs certain operations, the CPU exits back to
//! the VMM. The exits this hypervisor cares about:
//!
//! - **I/O port access**: the guest used IN/OUT instructions. Devices
//!   are synchronous: the handler runs to completion before the vCPU
//!   re-enters the guest, so the guest observes every port access as an
//!   atomic device operation.
//! - **HLT**: the guest is done.
//! - **Shutdown**: triple fault or explicit shutdown.
//! - **Internal error**: KVM gave up on the guest.
//!
//! Everything else is surfaced with its raw exit-reason number and
//! treated as fatal by the run loop.
//!
//! # I/O handling
//!
//! When the guest accesses an I/O port, KVM exits with the port number,
//! direction, and a data window inside the shared vCPU region. The
//! `IoHandler` trait provides the device seam. It uses fixed-size
//! arrays (max 4 bytes) to avoid heap allocation; x86 IN/OUT supports
//! 1, 2, or 4 byte operations and the devices here dispatch on that
//! access width.

use super::KvmError;
use kvm_bindings::{
    KVM_EXIT_DEBUG, KVM_EXIT_EXCEPTION, KVM_EXIT_HYPERCALL, KVM_EXIT_IRQ_WINDOW_OPEN,
    KVM_EXIT_MMIO, KVM_EXIT_UNKNOWN,
};
use kvm_bindings::{kvm_regs, kvm_sregs};
use kvm_ioctls::VcpuExit as KvmVcpuExit;

/// Maximum size for I/O operations (x86 supports 1, 2, or 4 byte I/O).
pub const MAX_IO_SIZE: usize = 4;

/// Fixed-size I/O data buffer to avoid heap allocation.
///
/// Holds the payload of one IN or OUT access. Only the first `len`
/// bytes are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct IoData {
    /// The data bytes (only first `len` bytes are valid).
    data: [u8; MAX_IO_SIZE],
    /// Number of valid bytes (1, 2, or 4).
    len: u8,
}

impl IoData {
    /// Create a new IoData with the specified length.
    #[inline]
    pub fn new(len: usize) -> Self {
        debug_assert!(len <= MAX_IO_SIZE);
        Self {
            data: [0; MAX_IO_SIZE],
            len: len as u8,
        }
    }

    /// Create IoData from a slice.
    #[inline]
    pub fn from_slice(slice: &[u8]) -> Self {
        let len = slice.len().min(MAX_IO_SIZE);
        let mut data = [0u8; MAX_IO_SIZE];
        data[..len].copy_from_slice(&slice[..len]);
        Self {
            data,
            len: len as u8,
        }
    }

    /// Get the data as a slice.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Get the length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Set a byte at index.
    #[inline]
    pub fn set(&mut self, index: usize, value: u8) {
        if index < self.len as usize {
            self.data[index] = value;
        }
    }
}

impl Default for IoData {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Wrapper around the KVM vCPU file descriptor.
pub struct VcpuFd {
    /// The underlying KVM vCPU file descriptor.
    vcpu: kvm_ioctls::VcpuFd,
}

/// Exit reasons from vCPU execution.
///
/// When `run_with_io()` returns, it indicates why the guest stopped
/// executing. The run loop decides whether to re-enter the guest.
#[derive(Debug)]
pub enum VcpuExit {
    /// I/O port operation was handled by the `IoHandler`; just continue.
    Io,

    /// Guest executed HLT.
    Hlt,

    /// Guest requested shutdown (triple fault or explicit).
    Shutdown,

    /// KVM internal error. The suberror code stays inside the kernel
    /// interface and is not surfaced by `kvm-ioctls`.
    InternalError,

    /// Failed to enter guest mode.
    ///
    /// Contains the hardware-specific failure reason code.
    FailEntry(u64),

    /// System event (e.g. reset). Contains the event type code.
    SystemEvent(u32),

    /// Any exit reason this hypervisor has no handler for.
    ///
    /// Contains the raw `KVM_EXIT_*` number.
    Unknown(u32),
}

/// Trait for handling I/O port operations.
///
/// When the guest executes IN or OUT instructions, KVM exits to the
/// VMM. The IoHandler processes these operations by emulating a device
/// behind the port.
pub trait IoHandler {
    /// Handle an I/O port read (IN instruction).
    ///
    /// The guest is reading from `port`. Fill `data` with the response
    /// (`data.len()` bytes, pre-sized to the access width).
    fn io_read(&mut self, port: u16, data: &mut IoData);

    /// Handle an I/O port write (OUT instruction).
    ///
    /// The guest is writing `data` to `port`.
    fn io_write(&mut self, port: u16, data: &IoData);
}

impl VcpuFd {
    /// Create a new VcpuFd wrapper.
    pub fn new(vcpu: kvm_ioctls::VcpuFd) -> Self {
        Self { vcpu }
    }

    /// Get the current general-purpose registers.
    pub fn get_regs(&self) -> Result<kvm_regs, KvmError> {
        self.vcpu.get_regs().map_err(KvmError::GetRegisters)
    }

    /// Set the general-purpose registers.
    pub fn set_regs(&self, regs: &kvm_regs) -> Result<(), KvmError> {
        self.vcpu.set_regs(regs).map_err(KvmError::SetRegisters)
    }

    /// Get the special registers.
    pub fn get_sregs(&self) -> Result<kvm_sregs, KvmError> {
        self.vcpu.get_sregs().map_err(KvmError::GetRegisters)
    }

    /// Set the special registers.
    pub fn set_sregs(&self, sregs: &kvm_sregs) -> Result<(), KvmError> {
        self.vcpu.set_sregs(sregs).map_err(KvmError::SetRegisters)
    }

    /// Run the vCPU until it exits, servicing port I/O with `handler`.
    ///
    /// For I/O exits the handler is called before returning and data is
    /// exchanged with the shared vCPU region, so `VcpuExit::Io` means
    /// the access has already been fully emulated.
    pub fn run_with_io<H: IoHandler>(&mut self, handler: &mut H) -> Result<VcpuExit, KvmError> {
        match self.vcpu.run().map_err(KvmError::Run)? {
            KvmVcpuExit::IoIn(port, data) => {
                let mut io_data = IoData::new(data.len());
                handler.io_read(port, &mut io_data);
                let copy_len = io_data.len().min(data.len());
                data[..copy_len].copy_from_slice(&io_data.as_slice()[..copy_len]);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::IoOut(port, data) => {
                let io_data = IoData::from_slice(data);
                handler.io_write(port, &io_data);
                Ok(VcpuExit::Io)
            }

            KvmVcpuExit::Hlt => Ok(VcpuExit::Hlt),
            KvmVcpuExit::Shutdown => Ok(VcpuExit::Shutdown),
            KvmVcpuExit::InternalError => Ok(VcpuExit::InternalError),
            KvmVcpuExit::SystemEvent(event, _) => Ok(VcpuExit::SystemEvent(event)),
            KvmVcpuExit::FailEntry(reason, _) => Ok(VcpuExit::FailEntry(reason)),

            // The guests map all their memory up front, so MMIO means a
            // stray access to an unmapped address.
            KvmVcpuExit::MmioRead(..) => Ok(VcpuExit::Unknown(KVM_EXIT_MMIO)),
            KvmVcpuExit::MmioWrite(..) => Ok(VcpuExit::Unknown(KVM_EXIT_MMIO)),

            KvmVcpuExit::Hypercall(_) => Ok(VcpuExit::Unknown(KVM_EXIT_HYPERCALL)),
            KvmVcpuExit::Debug(_) => Ok(VcpuExit::Unknown(KVM_EXIT_DEBUG)),
            KvmVcpuExit::Exception => Ok(VcpuExit::Unknown(KVM_EXIT_EXCEPTION)),
            KvmVcpuExit::IrqWindowOpen => Ok(VcpuExit::Unknown(KVM_EXIT_IRQ_WINDOW_OPEN)),
            KvmVcpuExit::Unsupported(reason) => Ok(VcpuExit::Unknown(reason)),
            _ => Ok(VcpuExit::Unknown(KVM_EXIT_UNKNOWN)),
        }
    }
}
