//! Guest bring-up: memory, long-mode paging, and image loading.
//!
//! The guests are flat binaries link-edited to run at virtual address
//! 0 in 64-bit long mode. Bringing one up requires:
//!
//! 1. **Guest memory**: a single contiguous region registered at
//!    guest-physical 0, so guest-physical address G is offset G into
//!    the host mapping.
//! 2. **Page tables**: a 4-level hierarchy written into the low pages
//!    of guest memory, mapping virtual 0 onto the physical address the
//!    image is loaded at.
//! 3. **CPU state**: control registers and segments for long mode,
//!    then the agreed entry register state.
//! 4. **The image**: copied bytewise to the start address the paging
//!    setup picked.
//!
//! # Memory layout
//!
//! ```text
//! 0x0000 ┌─────────────────┐
//!        │ PML4            │
//! 0x1000 ├─────────────────┤
//!        │ PDPT            │
//! 0x2000 ├─────────────────┤
//!        │ PD              │
//! 0x3000 ├─────────────────┤
//!        │ page tables     │  4 KiB mode only, one per PD entry
//!        ├─────────────────┤
//!        │ guest image     │  at the first page after the tables
//!        │ ...             │  (2 MiB mode: at the 2 MiB boundary)
//! mem_sz └─────────────────┘
//! ```
//!
//! Virtual address 0 maps to the physical start address, so the image
//! always *sees* itself at 0 regardless of where it physically lands.

mod image;
mod memory;
mod paging;

pub use image::load_image;
pub use memory::GuestMemory;
pub use paging::{setup_long_mode, setup_registers, PageSize};

use crate::kvm::KvmError;
use thiserror::Error;

/// Guest physical memory layout constants.
pub mod layout {
    /// PML4 (Page Map Level 4) table address. Pointed to by CR3.
    pub const PML4_START: u64 = 0x0000;

    /// PDPT (Page Directory Pointer Table) address.
    pub const PDPT_START: u64 = 0x1000;

    /// PD (Page Directory) address.
    ///
    /// In 2 MiB mode its entries are leaf mappings with the PS bit; in
    /// 4 KiB mode they point at page tables bump-allocated from
    /// `PT_POOL_START`.
    pub const PD_START: u64 = 0x2000;

    /// First page available to the 4 KiB-mode page-table bump allocator.
    pub const PT_POOL_START: u64 = 0x3000;

    /// One 2 MiB large page.
    pub const SIZE_2MIB: u64 = 2 * 1024 * 1024;

    /// One 4 KiB page.
    pub const SIZE_4KIB: u64 = 0x1000;

    /// Initial stack pointer (virtual).
    ///
    /// Exactly the top of the first 2 MiB page. In 2 MiB mode the first
    /// mapped page also *starts* at physical 2 MiB, so the stack sits on
    /// the boundary between unmapped and mapped memory; guests are
    /// linked against this exact layout.
    pub const GUEST_STACK_TOP: u64 = 1 << 21;
}

/// Errors that can occur while building a guest.
#[derive(Error, Debug)]
pub enum BootError {
    #[error("Failed to allocate guest memory: {0}")]
    MemoryAllocation(#[source] std::io::Error),

    #[error("Guest memory size {0:#x} is not a positive multiple of 2 MiB")]
    InvalidMemorySize(u64),

    #[error("KVM error: {0}")]
    Kvm(#[from] KvmError),

    #[error("Failed to read guest image {path}: {source}")]
    ReadImage {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Guest image {path} does not fit in guest memory")]
    ImageTooLarge { path: String },

    #[error("Failed to write to guest memory at {addr:#x}")]
    MemoryAccess { addr: u64 },
}

/// Per-guest build configuration.
#[derive(Debug, Clone, Copy)]
pub struct GuestConfig {
    /// Guest physical memory size in bytes; a positive multiple of 2 MiB.
    pub mem_size: u64,

    /// Granularity of the leaf page mappings.
    pub page_size: PageSize,
}

impl GuestConfig {
    /// Reject sizes the paging layout cannot represent.
    pub fn validate(&self) -> Result<(), BootError> {
        if self.mem_size == 0 || self.mem_size % layout::SIZE_2MIB != 0 {
            return Err(BootError::InvalidMemorySize(self.mem_size));
        }
        Ok(())
    }
}
