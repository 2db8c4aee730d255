//! Long-mode page tables and CPU register state.
//!
//! # x86_64 long mode requirements
//!
//! To run 64-bit code the vCPU must have:
//!
//! 1. **Paging enabled** (CR0.PG = 1) on top of protected mode (CR0.PE)
//! 2. **Physical Address Extension** (CR4.PAE = 1)
//! 3. **Long Mode Enable/Active** in the EFER MSR
//! 4. **Page tables** set up with CR3 pointing to the PML4
//! 5. Flat 64-bit code and data segments
//!
//! # Page table structure
//!
//! ```text
//! CR3 → PML4 → PDPT → PD (PS bit) ──────────► 2 MiB physical page
//!                     PD ──► PT ────────────► 4 KiB physical page
//! ```
//!
//! Only entry 0 of the PML4 and PDPT are populated; the guests live
//! entirely inside the first gigabyte. The mapping is *offset* rather
//! than identity: the first populated leaf points at the physical
//! address the guest image is loaded at, so the image runs at virtual
//! address 0 wherever it physically sits.
//!
//! In 2 MiB mode the image lands on the first 2 MiB boundary and the
//! page directory maps `mem_size/2MiB - 1` large pages from there. In
//! 4 KiB mode one page table per directory entry is bump-allocated
//! from 0x3000, and the image lands on the next page after the tables;
//! the leaf entries then walk the remaining physical pages until
//! `mem_size` is exhausted.

use super::layout::{
    GUEST_STACK_TOP, PDPT_START, PD_START, PML4_START, PT_POOL_START, SIZE_2MIB, SIZE_4KIB,
};
use super::memory::GuestMemory;
use super::BootError;
use crate::kvm::VcpuFd;
use kvm_bindings::{kvm_regs, kvm_segment};

/// Page table entry: present.
const PDE64_PRESENT: u64 = 1;
/// Page table entry: writable.
const PDE64_RW: u64 = 1 << 1;
/// Page table entry: user-accessible.
const PDE64_USER: u64 = 1 << 2;
/// Page directory entry: 2 MiB leaf (page size).
const PDE64_PS: u64 = 1 << 7;

/// CR0.PE - protection enable.
const X86_CR0_PE: u64 = 0x1;
/// CR0.PG - paging enable.
const X86_CR0_PG: u64 = 0x8000_0000;
/// CR4.PAE - physical address extension, required for long mode.
const X86_CR4_PAE: u64 = 0x20;
/// EFER.LME - long mode enable.
const EFER_LME: u64 = 0x100;
/// EFER.LMA - long mode active.
const EFER_LMA: u64 = 0x400;

/// RFLAGS reserved bit 1, always set.
const RFLAGS_RESERVED: u64 = 0x2;

/// Flags shared by every table entry.
const ENTRY_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER;

/// Granularity of the leaf page mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 2 MiB large pages; the PD entries are leaves.
    Mb2,
    /// 4 KiB pages behind one page table per PD entry.
    Kb4,
}

/// Write the PML4/PDPT/PD (and, in 4 KiB mode, the page tables) into
/// guest memory.
///
/// Returns the guest-physical start address: the first byte the guest
/// image must be loaded at, which the first leaf entry maps to virtual
/// address 0.
pub fn write_page_tables(
    memory: &GuestMemory,
    mem_size: u64,
    page_size: PageSize,
) -> Result<u64, BootError> {
    memory.write_u64(PML4_START, ENTRY_FLAGS | PDPT_START)?;
    memory.write_u64(PDPT_START, ENTRY_FLAGS | PD_START)?;

    match page_size {
        PageSize::Mb2 => {
            // First 2 MiB boundary above the fixed tables.
            let base = (PT_POOL_START / SIZE_2MIB + 1) * SIZE_2MIB;
            let mut page_address = base;
            for i in 0..mem_size / SIZE_2MIB - 1 {
                memory.write_u64(PD_START + i * 8, ENTRY_FLAGS | PDE64_PS | page_address)?;
                page_address += SIZE_2MIB;
            }
            Ok(base)
        }
        PageSize::Kb4 => {
            // One page table per directory entry, bump-allocated from
            // the pool.
            let pd_entries = mem_size / SIZE_2MIB;
            let mut page = PT_POOL_START;
            for i in 0..pd_entries {
                memory.write_u64(PD_START + i * 8, ENTRY_FLAGS | page)?;
                page += SIZE_4KIB;
            }

            // The leaves continue where the bump allocator stopped, so
            // virtual 0 maps to the first page after the tables. An
            // entry pointing exactly at mem_size is still written; the
            // cutoff only fires strictly beyond it.
            let mut page_address = page;
            for i in 0..pd_entries {
                let pt_addr = PT_POOL_START + i * SIZE_4KIB;
                for j in 0..512 {
                    if page_address > mem_size {
                        break;
                    }
                    memory.write_u64(pt_addr + j * 8, ENTRY_FLAGS | page_address)?;
                    page_address += SIZE_4KIB;
                }
            }
            Ok(page)
        }
    }
}

/// Build the flat 64-bit code segment.
///
/// Base 0, limit 0xFFFFFFFF, DPL 0, type 11 (execute/read, accessed),
/// S=1, L=1, G=1. Long mode ignores base and limit but the descriptor
/// must still be well-formed for VM entry.
fn code_segment() -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffffffff,
        type_: 11,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 1,
        g: 1,
        ..Default::default()
    }
}

/// Data segments are the code segment with type 3 (read/write, accessed).
fn data_segment() -> kvm_segment {
    kvm_segment {
        type_: 3,
        ..code_segment()
    }
}

/// Put the vCPU into 64-bit long mode over the tables written by
/// [`write_page_tables`].
///
/// Returns the guest-physical start address for the image loader.
pub fn setup_long_mode(
    vcpu: &VcpuFd,
    memory: &GuestMemory,
    mem_size: u64,
    page_size: PageSize,
) -> Result<u64, BootError> {
    let start_address = write_page_tables(memory, mem_size, page_size)?;

    let mut sregs = vcpu.get_sregs()?;

    sregs.cr3 = PML4_START;
    sregs.cr4 |= X86_CR4_PAE;
    sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
    sregs.efer |= EFER_LME | EFER_LMA;

    sregs.cs = code_segment();
    let data = data_segment();
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    vcpu.set_sregs(&sregs)?;

    Ok(start_address)
}

/// Set the general-purpose registers to the entry state.
///
/// Everything zeroed except:
/// - `rip = 0` - the image is mapped at virtual 0
/// - `rsp = 2 MiB` - top of the first large page
/// - `rflags = 2` - the reserved-one bit
pub fn setup_registers(vcpu: &VcpuFd) -> Result<(), BootError> {
    let regs = kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: 0,
        rsp: GUEST_STACK_TOP,
        ..Default::default()
    };

    vcpu.set_regs(&regs)?;

    Ok(())
}
