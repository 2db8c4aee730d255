//! A single guest VM and its run loop.
//!
//! Each guest owns a VM, one vCPU, its physical memory, and the two
//! port devices. Construction happens on the main thread; the run loop
//! then drives the vCPU on the guest's own OS thread until a terminal
//! exit. Guests share nothing but the file-port lock.

use crate::boot::{self, layout, GuestConfig, GuestMemory};
use crate::devices::{CharChannel, DebugPort, FileLock, FilePort, DEBUG_PORT, FILE_PORT};
use crate::kvm::{Hypervisor, IoData, IoHandler, KvmError, VcpuExit, VcpuFd, VmFd};
use std::sync::Arc;
use thiserror::Error;

/// Fatal conditions that stop a single guest.
#[derive(Error, Debug)]
pub enum GuestError {
    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("KVM internal error")]
    InternalError,

    #[error("unknown exit reason {0}")]
    UnknownExit(u32),

    #[error("failed to enter guest: reason {0:#x}")]
    FailEntry(u64),

    #[error("unexpected system event {0}")]
    SystemEvent(u32),

    #[error("unsupported I/O port {0:#x}")]
    InvalidPort(u16),
}

/// How a guest ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestExit {
    /// The guest executed HLT.
    Halt,
    /// The guest shut down (triple fault or explicit).
    Shutdown,
}

/// Devices reachable from the guest's I/O ports.
///
/// Accesses to any other port are answered with 0xFF and remembered so
/// the run loop can stop the guest.
struct GuestDevices {
    console: DebugPort,
    files: FilePort,
    invalid_port: Option<u16>,
}

impl IoHandler for GuestDevices {
    fn io_read(&mut self, port: u16, data: &mut IoData) {
        match port {
            DEBUG_PORT => self.console.read(data),
            FILE_PORT => self.files.handle_in(data),
            _ => {
                for i in 0..data.len() {
                    data.set(i, 0xff);
                }
                self.invalid_port = Some(port);
            }
        }
    }

    fn io_write(&mut self, port: u16, data: &IoData) {
        match port {
            DEBUG_PORT => self.console.write(data),
            FILE_PORT => self.files.handle_out(data),
            _ => self.invalid_port = Some(port),
        }
    }
}

/// One virtual machine with a single vCPU.
pub struct Guest {
    id: u32,
    /// Keeps the VM fd open for the vCPU's lifetime.
    _vm: VmFd,
    vcpu: VcpuFd,
    /// Owns the guest physical address space registered with KVM; the
    /// mapping must outlive the VM.
    _memory: GuestMemory,
    devices: GuestDevices,
}

impl Guest {
    /// Build a guest: VM, memory slot 0, vCPU, long mode, entry
    /// registers, and the loaded image.
    pub fn new(
        hypervisor: &Hypervisor,
        config: &GuestConfig,
        image_path: &str,
        id: u32,
        channel: Box<dyn CharChannel>,
        file_lock: Arc<FileLock>,
    ) -> Result<Self, boot::BootError> {
        config.validate()?;

        let vm = hypervisor.create_vm()?;

        let memory = GuestMemory::new(config.mem_size)?;
        let (host_addr, size) = memory.as_raw_parts();
        // Safety: the Guest owns `memory`, so the mapping outlives the VM.
        unsafe {
            vm.set_user_memory_region(0, 0, size, host_addr)?;
        }

        let vcpu = vm.create_vcpu(0)?;

        let start_address =
            boot::setup_long_mode(&vcpu, &memory, config.mem_size, config.page_size)?;
        boot::setup_registers(&vcpu)?;

        let loaded = boot::load_image(&memory, start_address, image_path)?;
        eprintln!(
            "[Boot] guest {}: {} bytes of {} at {:#x}, stack top {:#x}",
            id,
            loaded,
            image_path,
            start_address,
            layout::GUEST_STACK_TOP
        );

        Ok(Self {
            id,
            _vm: vm,
            vcpu,
            _memory: memory,
            devices: GuestDevices {
                console: DebugPort::new(id, channel),
                files: FilePort::new(id, ".", file_lock),
                invalid_port: None,
            },
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Drive the vCPU until a terminal exit.
    ///
    /// Device handlers run to completion before the vCPU re-enters the
    /// guest, so port accesses are synchronous from the guest's point
    /// of view. The terminating line for the guest goes to stdout:
    /// `KVM_EXIT_HLT`, `Shutdown`, or `Unknown exit reason N`.
    pub fn run(&mut self) -> Result<GuestExit, GuestError> {
        loop {
            match self.vcpu.run_with_io(&mut self.devices)? {
                VcpuExit::Io => {
                    if let Some(port) = self.devices.invalid_port.take() {
                        eprintln!("[VMM] guest {}: invalid port {:#x}", self.id, port);
                        return Err(GuestError::InvalidPort(port));
                    }
                }
                VcpuExit::Hlt => {
                    println!("KVM_EXIT_HLT");
                    return Ok(GuestExit::Halt);
                }
                VcpuExit::Shutdown => {
                    println!("Shutdown");
                    if let Ok(regs) = self.vcpu.get_regs() {
                        eprintln!("[VMM] guest {}: final RIP {:#x}", self.id, regs.rip);
                    }
                    return Ok(GuestExit::Shutdown);
                }
                VcpuExit::InternalError => {
                    eprintln!("[VMM] guest {}: KVM internal error", self.id);
                    return Err(GuestError::InternalError);
                }
                VcpuExit::FailEntry(reason) => {
                    eprintln!(
                        "[VMM] guest {}: failed to enter guest: reason {:#x}",
                        self.id, reason
                    );
                    return Err(GuestError::FailEntry(reason));
                }
                VcpuExit::SystemEvent(event) => {
                    eprintln!("[VMM] guest {}: system event {}", self.id, event);
                    return Err(GuestError::SystemEvent(event));
                }
                VcpuExit::Unknown(reason) => {
                    println!("Unknown exit reason {}", reason);
                    return Err(GuestError::UnknownExit(reason));
                }
            }
        }
    }
}
