//! Debug-port console (port 0xE9).
//!
//! The guest reads and writes single bytes on port 0xE9; the host side
//! shuttles them to a character channel. No buffering beyond the single
//! byte, no echo, no line discipline.
//!
//! Two channels are provided: the process's own stdio, and a dedicated
//! pseudo-terminal per guest so several guests can have distinct
//! consoles a terminal emulator attaches to.

use crate::kvm::IoData;
use nix::pty::{openpty, Winsize};
use nix::sys::termios::Termios;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

/// Blocking byte channel behind the debug port.
pub trait CharChannel: Send {
    /// Deliver one guest byte to the channel.
    fn put(&mut self, byte: u8) -> io::Result<()>;

    /// Take one byte from the channel, blocking until available.
    fn get(&mut self) -> io::Result<u8>;
}

/// Channel over the hypervisor's own stdin/stdout.
pub struct StdioChannel;

impl CharChannel for StdioChannel {
    fn put(&mut self, byte: u8) -> io::Result<()> {
        let mut out = io::stdout();
        out.write_all(&[byte])?;
        out.flush()
    }

    fn get(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        io::stdin().read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// Channel over a dedicated pseudo-terminal.
///
/// The guest talks to the master side; the slave side is left open for
/// a terminal to attach to. Its path is reported at creation.
pub struct PtyChannel {
    master: File,
    /// Keeps the slave end alive so reads on the master don't hit EOF
    /// before a terminal attaches.
    _slave: OwnedFd,
}

impl PtyChannel {
    /// Allocate a pseudo-terminal pair and return the channel together
    /// with the slave device path.
    pub fn open() -> io::Result<(Self, PathBuf)> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>).map_err(io::Error::from)?;

        let path = std::fs::read_link(format!("/proc/self/fd/{}", pty.slave.as_raw_fd()))?;

        Ok((
            Self {
                master: File::from(pty.master),
                _slave: pty.slave,
            },
            path,
        ))
    }
}

impl CharChannel for PtyChannel {
    fn put(&mut self, byte: u8) -> io::Result<()> {
        self.master.write_all(&[byte])
    }

    fn get(&mut self) -> io::Result<u8> {
        let mut byte = [0u8; 1];
        self.master.read_exact(&mut byte)?;
        Ok(byte[0])
    }
}

/// The port-0xE9 device: a one-byte shuttle between the guest and a
/// character channel.
pub struct DebugPort {
    guest_id: u32,
    channel: Box<dyn CharChannel>,
}

impl DebugPort {
    pub fn new(guest_id: u32, channel: Box<dyn CharChannel>) -> Self {
        Self { guest_id, channel }
    }

    /// OUT: forward the guest byte to the channel.
    pub fn write(&mut self, data: &IoData) {
        if let Some(&byte) = data.as_slice().first() {
            if let Err(e) = self.channel.put(byte) {
                eprintln!("[Console] guest {}: dropped output byte: {}", self.guest_id, e);
            }
        }
    }

    /// IN: pull one byte from the channel into the guest.
    ///
    /// A closed channel reads as 0.
    pub fn read(&mut self, data: &mut IoData) {
        let byte = self.channel.get().unwrap_or(0);
        data.set(0, byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory channel: scripted input, captured output.
    struct ScriptedChannel {
        input: VecDeque<u8>,
        output: Arc<Mutex<Vec<u8>>>,
    }

    impl CharChannel for ScriptedChannel {
        fn put(&mut self, byte: u8) -> io::Result<()> {
            self.output.lock().unwrap().push(byte);
            Ok(())
        }

        fn get(&mut self) -> io::Result<u8> {
            self.input
                .pop_front()
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
        }
    }

    fn scripted(input: &[u8]) -> (DebugPort, Arc<Mutex<Vec<u8>>>) {
        let output = Arc::new(Mutex::new(Vec::new()));
        let port = DebugPort::new(
            0,
            Box::new(ScriptedChannel {
                input: input.iter().copied().collect(),
                output: Arc::clone(&output),
            }),
        );
        (port, output)
    }

    #[test]
    fn test_out_shuttles_bytes() {
        let (mut port, output) = scripted(&[]);
        for b in b"hi\n" {
            port.write(&IoData::from_slice(&[*b]));
        }
        assert_eq!(*output.lock().unwrap(), b"hi\n");
    }

    #[test]
    fn test_in_pulls_bytes() {
        let (mut port, _) = scripted(b"ab");
        let mut data = IoData::new(1);
        port.read(&mut data);
        assert_eq!(data.as_slice(), b"a");
        port.read(&mut data);
        assert_eq!(data.as_slice(), b"b");
    }

    #[test]
    fn test_in_on_closed_channel_reads_zero() {
        let (mut port, _) = scripted(&[]);
        let mut data = IoData::new(1);
        port.read(&mut data);
        assert_eq!(data.as_slice(), &[0]);
    }
}
