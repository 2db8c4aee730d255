//! xenon - a minimal multi-guest KVM hypervisor.
//!
//! Launches one or more flat-binary guest images, each in its own VM
//! with a single vCPU running in 64-bit long mode, and mediates two
//! synthetic ports: a debug console and a host file protocol.
//!
//! This VMM requires Linux with KVM support. It will not run on other
//! platforms.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod guest;
#[cfg(target_os = "linux")]
mod kvm;

use clap::{Parser, ValueEnum};
use std::process::ExitCode;

/// Debug-port console backing.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ConsoleKind {
    /// The hypervisor's own stdin/stdout, shared by all guests.
    Stdio,
    /// A dedicated pseudo-terminal per guest.
    Pty,
}

#[derive(Parser, Debug)]
#[command(name = "xenon")]
#[command(about = "A minimal multi-guest KVM hypervisor")]
struct Args {
    /// Guest memory in MiB (a positive multiple of 2)
    #[arg(short, long)]
    memory: u64,

    /// Leaf page granularity: 4 selects 4 KiB pages, any other value 2 MiB
    #[arg(short, long, default_value = "2")]
    page: u64,

    /// Guest image paths (flat binaries linked at virtual address 0)
    #[arg(short, long, num_args = 0.., value_name = "IMAGE")]
    guest: Vec<String>,

    /// Accepted for compatibility with wrapper scripts and ignored
    #[arg(long, num_args = 0.., value_name = "PATH")]
    file: Vec<String>,

    /// Debug-port console backing
    #[arg(long, value_enum, default_value = "stdio")]
    console: ConsoleKind,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

#[cfg(target_os = "linux")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use boot::{GuestConfig, PageSize};
    use devices::{CharChannel, FileLock, PtyChannel, StdioChannel};
    use guest::Guest;
    use kvm::Hypervisor;
    use std::sync::Arc;
    use std::thread;

    let page_size = if args.page == 4 {
        PageSize::Kb4
    } else {
        PageSize::Mb2
    };
    let config = GuestConfig {
        mem_size: args.memory * 1024 * 1024,
        page_size,
    };
    // Reject bad sizes before any guest exists.
    config.validate()?;

    if args.guest.is_empty() {
        return Err("no guest images given (use --guest <image>...)".into());
    }
    if !args.file.is_empty() {
        eprintln!("[VMM] ignoring --file {:?}", args.file);
    }

    eprintln!("[VMM] xenon starting...");
    eprintln!(
        "[VMM] Memory: {} MiB, {} pages, {} guest(s)",
        args.memory,
        match page_size {
            PageSize::Mb2 => "2 MiB",
            PageSize::Kb4 => "4 KiB",
        },
        args.guest.len()
    );

    let hypervisor = Hypervisor::open()?;
    eprintln!(
        "[VMM] vCPU shared region: {} bytes",
        hypervisor.vcpu_shared_size()
    );

    // One lock for file operations across all guests.
    let file_lock = Arc::new(FileLock::new());

    // Guests are built (and images loaded) up front; ids follow the
    // order the images were given.
    let mut guests = Vec::new();
    for (id, path) in args.guest.iter().enumerate() {
        let id = id as u32;
        let channel: Box<dyn CharChannel> = match args.console {
            ConsoleKind::Stdio => Box::new(StdioChannel),
            ConsoleKind::Pty => {
                let (chan, pts) = PtyChannel::open()?;
                eprintln!("[Console] guest {}: terminal at {}", id, pts.display());
                Box::new(chan)
            }
        };

        let guest = Guest::new(
            &hypervisor,
            &config,
            path,
            id,
            channel,
            Arc::clone(&file_lock),
        )?;
        guests.push(guest);
    }

    // One OS thread per guest; a fatal exit stops only that guest.
    let mut handles = Vec::new();
    for mut guest in guests {
        let id = guest.id();
        let handle = thread::Builder::new()
            .name(format!("guest-{id}"))
            .spawn(move || guest.run())
            .map_err(|e| format!("failed to spawn thread for guest {id}: {e}"))?;
        handles.push((id, handle));
    }

    for (id, handle) in handles {
        match handle.join() {
            Ok(Ok(exit)) => eprintln!("[VMM] guest {} stopped: {:?}", id, exit),
            Ok(Err(e)) => eprintln!("[VMM] guest {} failed: {}", id, e),
            Err(_) => eprintln!("[VMM] guest {} thread panicked", id),
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn run(_args: Args) -> Result<(), Box<dyn std::error::Error>> {
    Err("xenon requires Linux with KVM support. This platform is not supported.".into())
}
