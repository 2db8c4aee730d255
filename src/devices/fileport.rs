//! Host file protocol on port 0x278.
//!
//! Guests request file operations against the host filesystem through a
//! stateful command stream on a single port. A 32-bit OUT selects the
//! operation (`OPEN=1, CLOSE=2, READ=3, WRITE=4`); further accesses
//! feed it arguments and collect results; `FINISH=0` (or, for OPEN,
//! delivery of the file descriptor) ends it.
//!
//! Per-guest decoder state:
//!
//! ```text
//!         OPEN ┌──────┐ fd delivered (IN, 4B)
//!        ┌────►│ Open │─────────────────────────┐
//!        │     └──────┘                         ▼
//! ┌──────┴┐    ┌───────┐ ┌──────┐ ┌───────┐ ┌──────┐
//! │ Idle  │───►│ Close │ │ Read │ │ Write │ │ Idle │
//! └───────┘    └───┬───┘ └──┬───┘ └───┬───┘ └──────┘
//!                  └────────┴─────────┴──► FINISH (OUT, 4B)
//! ```
//!
//! Entering any operation acquires a process-wide lock shared by all
//! guests; returning to `Idle` releases it. Holding the lock across a
//! suspended guest is intentional: only one guest at a time may drive
//! host file state. A guest that never sends FINISH therefore starves
//! the others' file traffic.
//!
//! # Name isolation
//!
//! Host files a guest writes live under the per-guest prefix
//! `vm_<id>_<name>`. A write-capable open with no private copy first
//! materializes an empty one; a read-only open with no private copy
//! falls through to the shared bare `<name>`. Writes are thus isolated
//! per guest at file granularity while reads share the original.

use crate::kvm::IoData;
use nix::fcntl::{open, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use std::borrow::Cow;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

/// Command opcodes, sent by the guest as 32-bit OUTs.
mod opcode {
    pub const FINISH: i32 = 0;
    pub const OPEN: i32 = 1;
    pub const CLOSE: i32 = 2;
    pub const READ: i32 = 3;
    pub const WRITE: i32 = 4;
}

/// End-of-file sentinel delivered on byte reads (-1 as a signed byte).
pub const EOF_BYTE: u8 = 0xFF;

/// Bound on the guest-supplied filename, terminator included.
const MAX_NAME_LEN: usize = 50;

/// Open flags that make an open "write-capable" for the purpose of
/// materializing a private per-guest copy.
const WRITE_CAPABLE: i32 = libc::O_RDWR | libc::O_WRONLY | libc::O_TRUNC | libc::O_APPEND;

/// Binary semaphore serializing file operations across all guests.
///
/// Unlike a `MutexGuard`, acquisition and release happen in different
/// run-loop iterations (an operation spans many port exits), so this is
/// a plain flag under a mutex with a condvar.
pub struct FileLock {
    held: Mutex<bool>,
    available: Condvar,
}

impl FileLock {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    /// Block until the lock is free, then take it.
    pub fn acquire(&self) {
        let mut held = self.held.lock().expect("file lock poisoned");
        while *held {
            held = self.available.wait(held).expect("file lock poisoned");
        }
        *held = true;
    }

    /// Release the lock and wake one waiter.
    pub fn release(&self) {
        let mut held = self.held.lock().expect("file lock poisoned");
        *held = false;
        self.available.notify_one();
    }
}

impl Default for FileLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder state; the tag is the operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PortState {
    Idle,
    Open,
    Close,
    Read,
    Write,
}

/// One entry in a guest's file table.
///
/// Created on the `Idle → Open` transition, populated during the OPEN
/// handshake, removed on CLOSE (or when the guest goes away).
struct FileEntry {
    /// The host file, if the open succeeded.
    handle: Option<File>,
    /// Raw guest-supplied open flags; `None` until the first 32-bit
    /// argument arrives.
    flags: Option<i32>,
    /// Raw guest-supplied mode.
    mode: Option<u32>,
    /// Filename bytes as sent, terminating NUL included.
    name: Vec<u8>,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            handle: None,
            flags: None,
            mode: None,
            name: Vec::new(),
        }
    }

    /// The descriptor value the guest sees: the host fd, or -1 if the
    /// open failed.
    fn guest_fd(&self) -> i32 {
        self.handle.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    /// Filename up to (not including) the stored terminator.
    fn name_str(&self) -> Cow<'_, str> {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end])
    }
}

/// The port-0x278 device: per-guest protocol decoder and file table.
pub struct FilePort {
    guest_id: u32,
    /// Directory host paths resolve against (the working directory in
    /// production).
    dir: PathBuf,
    lock: Arc<FileLock>,
    state: PortState,
    table: Vec<FileEntry>,
    /// Index of the entry the operation in flight acts on.
    current: Option<usize>,
}

impl FilePort {
    pub fn new(guest_id: u32, dir: impl Into<PathBuf>, lock: Arc<FileLock>) -> Self {
        Self {
            guest_id,
            dir: dir.into(),
            lock,
            state: PortState::Idle,
            table: Vec::new(),
            current: None,
        }
    }

    /// Handle an OUT on the file port.
    pub fn handle_out(&mut self, data: &IoData) {
        match data.len() {
            4 => {
                if let Ok(bytes) = data.as_slice().try_into() {
                    self.word_out(i32::from_le_bytes(bytes));
                }
            }
            1 => self.byte_out(data.as_slice()[0]),
            _ => {}
        }
    }

    /// Handle an IN on the file port.
    pub fn handle_in(&mut self, data: &mut IoData) {
        match data.len() {
            4 => match self.state {
                PortState::Open => {
                    let fd = self.current_entry().map(FileEntry::guest_fd).unwrap_or(-1);
                    put_word(data, fd);
                    self.finish_operation();
                }
                PortState::Close => {
                    let status = self.close_current();
                    put_word(data, status);
                }
                _ => {}
            },
            1 => {
                if self.state == PortState::Read {
                    data.set(0, self.read_current_byte());
                }
            }
            _ => {}
        }
    }

    fn word_out(&mut self, value: i32) {
        match self.state {
            PortState::Idle => self.start_operation(value),
            // During OPEN the 32-bit arguments are flags then mode;
            // FINISH is not part of that exchange.
            PortState::Open => self.set_flags_or_mode(value),
            _ if value == opcode::FINISH => self.finish_operation(),
            // CLOSE/READ/WRITE: the argument selects the target entry.
            // A descriptor of 0 is unreachable here because 0 reads as
            // FINISH; the host never hands out fd 0 while stdin is open.
            _ => self.current = self.table.iter().position(|e| e.guest_fd() == value),
        }
    }

    fn byte_out(&mut self, byte: u8) {
        match self.state {
            PortState::Open => {
                if let Some(entry) = self.current_entry_mut() {
                    if entry.name.len() < MAX_NAME_LEN {
                        entry.name.push(byte);
                    }
                }
            }
            PortState::Write => {
                // No active entry: the byte is dropped.
                if let Some(file) = self.current_entry_mut().and_then(|e| e.handle.as_mut()) {
                    let _ = file.write_all(&[byte]);
                }
            }
            _ => {}
        }
    }

    /// `Idle` + 32-bit OUT: begin the named operation under the shared
    /// lock. Anything outside the opcode alphabet is ignored.
    fn start_operation(&mut self, value: i32) {
        let next = match value {
            opcode::OPEN => PortState::Open,
            opcode::CLOSE => PortState::Close,
            opcode::READ => PortState::Read,
            opcode::WRITE => PortState::Write,
            _ => return,
        };

        self.lock.acquire();
        self.state = next;

        if next == PortState::Open {
            self.table.push(FileEntry::new());
            self.current = Some(self.table.len() - 1);
        }
    }

    /// Return to `Idle` and let the next guest at the port.
    fn finish_operation(&mut self) {
        self.state = PortState::Idle;
        self.current = None;
        self.lock.release();
    }

    /// OPEN argument sequence: first word is the flags, second the
    /// mode; the mode's arrival triggers the host-side open.
    fn set_flags_or_mode(&mut self, value: i32) {
        let Some(idx) = self.current else { return };

        if self.table[idx].flags.is_none() {
            self.table[idx].flags = Some(value);
        } else {
            self.table[idx].mode = Some(value as u32);
            self.open_host_file(idx);
        }
    }

    /// Resolve the guest name against the host filesystem.
    ///
    /// 1. An existing private copy `vm_<id>_<name>` wins.
    /// 2. A write-capable open materializes an empty private copy
    ///    (mode 0777) and opens it.
    /// 3. A read-only open falls through to the shared bare `<name>`.
    fn open_host_file(&mut self, idx: usize) {
        let entry = &self.table[idx];
        let flags = entry.flags.unwrap_or(0);
        let mode = entry.mode.unwrap_or(0);
        let name = entry.name_str().into_owned();
        let private = self.dir.join(format!("vm_{}_{}", self.guest_id, name));

        let handle = if private.exists() {
            open_host(&private, flags, mode)
        } else if flags & WRITE_CAPABLE != 0 {
            let _ = open_host(&private, libc::O_CREAT, 0o777);
            open_host(&private, flags, mode)
        } else {
            open_host(&self.dir.join(&name), flags, mode)
        };

        if let Err(e) = &handle {
            eprintln!("[Files] guest {}: open {:?} failed: {}", self.guest_id, name, e);
        }

        self.table[idx].handle = handle.ok();
    }

    /// CLOSE result: host close status, -1 for an unknown descriptor or
    /// a failed open. The entry leaves the table either way.
    fn close_current(&mut self) -> i32 {
        match self.current.take() {
            Some(idx) => {
                let entry = self.table.remove(idx);
                match entry.handle {
                    Some(file) => match nix::unistd::close(file.into_raw_fd()) {
                        Ok(()) => 0,
                        Err(_) => -1,
                    },
                    None => -1,
                }
            }
            None => -1,
        }
    }

    /// READ result: the next byte of the active entry, or EOF.
    fn read_current_byte(&mut self) -> u8 {
        if let Some(file) = self.current_entry_mut().and_then(|e| e.handle.as_mut()) {
            let mut byte = [0u8; 1];
            if let Ok(1) = file.read(&mut byte) {
                return byte[0];
            }
        }
        EOF_BYTE
    }

    fn current_entry(&self) -> Option<&FileEntry> {
        self.current.and_then(|i| self.table.get(i))
    }

    fn current_entry_mut(&mut self) -> Option<&mut FileEntry> {
        self.current.and_then(|i| self.table.get_mut(i))
    }
}

impl Drop for FilePort {
    /// A guest that dies mid-operation must not strand the other
    /// guests: release the shared lock if this decoder holds it. The
    /// table's file handles close with the entries.
    fn drop(&mut self) {
        if self.state != PortState::Idle {
            self.state = PortState::Idle;
            self.lock.release();
        }
    }
}

/// Host `open(2)` with the guest's raw flag and mode bits.
fn open_host(path: &Path, flags: i32, mode: u32) -> nix::Result<File> {
    let fd = open(
        path,
        OFlag::from_bits_truncate(flags),
        Mode::from_bits_truncate(mode as libc::mode_t),
    )?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn put_word(data: &mut IoData, value: i32) {
    for (i, b) in value.to_le_bytes().iter().enumerate() {
        data.set(i, *b);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    const O_WRONLY: i32 = libc::O_WRONLY;
    const O_CREAT: i32 = libc::O_CREAT;
    const O_TRUNC: i32 = libc::O_TRUNC;

    /// Scratch directory that cleans up after itself.
    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "xenon-fileport-{}-{}",
                std::process::id(),
                tag
            ));
            std::fs::create_dir_all(&path).unwrap();
            ScratchDir(path)
        }

        fn path(&self) -> &Path {
            &self.0
        }

        fn file(&self, name: &str) -> PathBuf {
            self.0.join(name)
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn port(id: u32, dir: &ScratchDir, lock: &Arc<FileLock>) -> FilePort {
        FilePort::new(id, dir.path(), Arc::clone(lock))
    }

    fn word_out(fp: &mut FilePort, value: i32) {
        fp.handle_out(&IoData::from_slice(&value.to_le_bytes()));
    }

    fn byte_out(fp: &mut FilePort, byte: u8) {
        fp.handle_out(&IoData::from_slice(&[byte]));
    }

    fn word_in(fp: &mut FilePort) -> i32 {
        let mut data = IoData::new(4);
        fp.handle_in(&mut data);
        i32::from_le_bytes(data.as_slice().try_into().unwrap())
    }

    fn byte_in(fp: &mut FilePort) -> u8 {
        let mut data = IoData::new(1);
        fp.handle_in(&mut data);
        data.as_slice()[0]
    }

    /// Drive a full OPEN handshake, returning the delivered descriptor.
    fn open_file(fp: &mut FilePort, name: &str, flags: i32, mode: i32) -> i32 {
        word_out(fp, opcode::OPEN);
        for b in name.bytes() {
            byte_out(fp, b);
        }
        byte_out(fp, 0);
        word_out(fp, flags);
        word_out(fp, mode);
        word_in(fp)
    }

    fn close_file(fp: &mut FilePort, fd: i32) -> i32 {
        word_out(fp, opcode::CLOSE);
        word_out(fp, fd);
        let status = word_in(fp);
        word_out(fp, opcode::FINISH);
        status
    }

    #[test]
    fn test_open_write_close_lifecycle() {
        let dir = ScratchDir::new("lifecycle");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "out.txt", O_WRONLY | O_CREAT | O_TRUNC, 0o777);
        assert!(fd >= 0);
        assert_eq!(fp.table.len(), 1);

        word_out(&mut fp, opcode::WRITE);
        word_out(&mut fp, fd);
        byte_out(&mut fp, b'G');
        byte_out(&mut fp, b'0');
        word_out(&mut fp, opcode::FINISH);

        assert_eq!(close_file(&mut fp, fd), 0);
        assert!(fp.table.is_empty());

        assert_eq!(std::fs::read(dir.file("vm_0_out.txt")).unwrap(), b"G0");
        assert!(!dir.file("out.txt").exists());
    }

    #[test]
    fn test_read_only_falls_through_to_shared_file() {
        let dir = ScratchDir::new("fallthrough");
        std::fs::write(dir.file("primer.txt"), b"ABCDE").unwrap();
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "primer.txt", libc::O_RDONLY, 0);
        assert!(fd >= 0);

        word_out(&mut fp, opcode::READ);
        word_out(&mut fp, fd);
        let mut bytes = Vec::new();
        loop {
            let b = byte_in(&mut fp);
            if b == EOF_BYTE {
                break;
            }
            bytes.push(b);
        }
        word_out(&mut fp, opcode::FINISH);

        assert_eq!(bytes, b"ABCDE");
        // Read-only access must not materialize a private copy.
        assert!(!dir.file("vm_0_primer.txt").exists());
    }

    #[test]
    fn test_private_copy_wins_over_shared_file() {
        let dir = ScratchDir::new("private-wins");
        std::fs::write(dir.file("data.txt"), b"shared").unwrap();
        std::fs::write(dir.file("vm_0_data.txt"), b"mine").unwrap();
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "data.txt", libc::O_RDONLY, 0);
        assert!(fd >= 0);

        word_out(&mut fp, opcode::READ);
        word_out(&mut fp, fd);
        assert_eq!(byte_in(&mut fp), b'm');
        word_out(&mut fp, opcode::FINISH);
    }

    #[test]
    fn test_writes_are_isolated_per_guest() {
        let dir = ScratchDir::new("isolation");
        let lock = Arc::new(FileLock::new());
        let mut a = port(0, &dir, &lock);
        let mut b = port(1, &dir, &lock);

        for (fp, payload) in [(&mut a, b"G0"), (&mut b, b"G1")] {
            let fd = open_file(fp, "out.txt", O_WRONLY | O_CREAT | O_TRUNC, 0o777);
            assert!(fd >= 0);
            word_out(fp, opcode::WRITE);
            word_out(fp, fd);
            for byte in payload {
                byte_out(fp, *byte);
            }
            word_out(fp, opcode::FINISH);
            assert_eq!(close_file(fp, fd), 0);
        }

        assert_eq!(std::fs::read(dir.file("vm_0_out.txt")).unwrap(), b"G0");
        assert_eq!(std::fs::read(dir.file("vm_1_out.txt")).unwrap(), b"G1");
        assert!(!dir.file("out.txt").exists());
    }

    #[test]
    fn test_write_then_read_back_round_trip() {
        let dir = ScratchDir::new("round-trip");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "notes.txt", O_WRONLY | O_CREAT | O_TRUNC, 0o777);
        word_out(&mut fp, opcode::WRITE);
        word_out(&mut fp, fd);
        for byte in b"xyz" {
            byte_out(&mut fp, *byte);
        }
        word_out(&mut fp, opcode::FINISH);
        assert_eq!(close_file(&mut fp, fd), 0);

        let fd = open_file(&mut fp, "notes.txt", libc::O_RDONLY, 0);
        word_out(&mut fp, opcode::READ);
        word_out(&mut fp, fd);
        assert_eq!(byte_in(&mut fp), b'x');
        assert_eq!(byte_in(&mut fp), b'y');
        assert_eq!(byte_in(&mut fp), b'z');
        assert_eq!(byte_in(&mut fp), EOF_BYTE);
        word_out(&mut fp, opcode::FINISH);
        assert_eq!(close_file(&mut fp, fd), 0);
    }

    #[test]
    fn test_open_missing_file_read_only() {
        let dir = ScratchDir::new("missing");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "absent.txt", libc::O_RDONLY, 0);
        assert_eq!(fd, -1);
        // The failed entry still occupies the table until closed.
        assert_eq!(fp.table.len(), 1);
        assert_eq!(close_file(&mut fp, -1), -1);
        assert!(fp.table.is_empty());
    }

    #[test]
    fn test_close_unknown_fd() {
        let dir = ScratchDir::new("unknown-close");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        let fd = open_file(&mut fp, "keep.txt", O_WRONLY | O_CREAT | O_TRUNC, 0o777);
        assert!(fd >= 0);

        assert_eq!(close_file(&mut fp, 9999), -1);
        // Nothing was removed.
        assert_eq!(fp.table.len(), 1);
        assert_eq!(close_file(&mut fp, fd), 0);
    }

    #[test]
    fn test_read_without_open_yields_eof() {
        let dir = ScratchDir::new("eof");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        word_out(&mut fp, opcode::READ);
        word_out(&mut fp, 1234);
        assert_eq!(byte_in(&mut fp), EOF_BYTE);
        word_out(&mut fp, opcode::FINISH);
    }

    #[test]
    fn test_write_without_open_is_dropped() {
        let dir = ScratchDir::new("dropped");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        word_out(&mut fp, opcode::WRITE);
        word_out(&mut fp, 1234);
        byte_out(&mut fp, b'x');
        word_out(&mut fp, opcode::FINISH);

        // The lock came back; a fresh operation runs without blocking.
        let fd = open_file(&mut fp, "after.txt", O_WRONLY | O_CREAT | O_TRUNC, 0o777);
        assert!(fd >= 0);
        assert_eq!(close_file(&mut fp, fd), 0);
    }

    #[test]
    fn test_stray_opcode_in_idle_is_ignored() {
        let dir = ScratchDir::new("stray");
        let lock = Arc::new(FileLock::new());
        let mut fp = port(0, &dir, &lock);

        // FINISH and an out-of-alphabet value with nothing in flight.
        word_out(&mut fp, opcode::FINISH);
        word_out(&mut fp, 7);
        assert_eq!(fp.state, PortState::Idle);

        // The lock must still be free.
        lock.acquire();
        lock.release();
    }

    #[test]
    fn test_lock_held_until_finish() {
        let dir = ScratchDir::new("exclusion");
        let lock = Arc::new(FileLock::new());
        let mut a = port(0, &dir, &lock);

        word_out(&mut a, opcode::WRITE); // acquires

        let (tx, rx) = mpsc::channel();
        let contender = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            contender.acquire();
            tx.send(()).unwrap();
            contender.release();
        });

        // The contender must not get through while the write is open.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        word_out(&mut a, opcode::FINISH);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn test_drop_mid_operation_releases_lock() {
        let dir = ScratchDir::new("drop-release");
        let lock = Arc::new(FileLock::new());

        {
            let mut fp = port(0, &dir, &lock);
            word_out(&mut fp, opcode::WRITE); // acquires, never finishes
        }

        // Dropping the decoder released the lock.
        lock.acquire();
        lock.release();
    }
}
