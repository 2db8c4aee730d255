//! Synthetic device surface exposed to the guests.
//!
//! Exactly two ports exist:
//!
//! - `0xE9` - byte-granular bidirectional debug console
//! - `0x278` - the stateful host file protocol
//!
//! Both are driven synchronously from the run loop; a guest never sees
//! a port access complete before its device effect has happened.

mod console;
mod fileport;

pub use console::{CharChannel, DebugPort, PtyChannel, StdioChannel};
pub use fileport::{FileLock, FilePort};

/// Debug console port.
pub const DEBUG_PORT: u16 = 0xE9;

/// File protocol port (the "parallel" port).
pub const FILE_PORT: u16 = 0x278;
