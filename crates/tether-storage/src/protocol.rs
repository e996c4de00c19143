//! Top-level worker request buffer.
//!
//! Each worker connection owns one [`WordBuffer`] of [`word::WORDS`] words:
//!
//! ```text
//! [0] opcode          IDLE (0) while no request is outstanding
//! [1] arg0            overwritten by the primary response value
//! [2] arg1            overwritten by the secondary response value
//! [3] arg2
//! ```
//!
//! The worker writes the arguments, then swaps the opcode in from `IDLE`, notifies and blocks
//! while word 0 still holds that opcode. The coordinator writes the response values and stores
//! `IDLE` back. Word 0 may instead be stamped [`op::FAULT`] or [`op::DISCONNECTED`], which ends
//! the connection.
//!
//! Response values per request:
//!
//! | request      | primary              | secondary            |
//! |--------------|----------------------|----------------------|
//! | `open_read`  | fd (0 = not found)   | [`status`]           |
//! | `open_write` | fd                   | [`status`]           |
//! | `read`       | bytes read           | [`crate::file_handle::read_done`] |
//! | `write`      | [`status`]           | bytes accepted       |
//! | `flush`      | [`status`]           | 0                    |
//! | `close`      | [`status`]           | 0                    |
//! | `delete`     | [`status`]           | 0                    |

use tether_ipc::{Region, WordBuffer};

pub mod word {
    pub const OP: usize = 0;
    pub const ARG0: usize = 1;
    pub const ARG1: usize = 2;
    pub const ARG2: usize = 3;
    pub const WORDS: usize = 4;

    pub const RESP_PRIMARY: usize = ARG0;
    pub const RESP_SECONDARY: usize = ARG1;
}

pub mod op {
    pub const IDLE: i32 = 0;
    pub const OPEN_READ: i32 = 0x01;
    pub const READ: i32 = 0x02;
    pub const OPEN_WRITE: i32 = 0x03;
    pub const WRITE: i32 = 0x04;
    pub const FLUSH: i32 = 0x05;
    pub const CLOSE: i32 = 0x06;
    pub const DELETE: i32 = 0x07;

    /// The coordinator hit a fatal protocol violation and stopped.
    pub const FAULT: i32 = -1;
    /// The connection was torn down by a disconnect or a coordinator shutdown.
    pub const DISCONNECTED: i32 = -2;
}

/// Status codes shared by the top-level buffer and write-session responses.
pub mod status {
    pub const OK: i32 = 0;
    pub const QUOTA_EXCEEDED: i32 = 1;
    pub const BAD_HANDLE: i32 = 2;
    pub const IO_ERROR: i32 = 3;
    pub const INVALID_KEY: i32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    OpenRead { key: Region },
    Read { fd: u32, ptr: u32, len: u32 },
    OpenWrite { key: Region },
    Write { fd: u32, ptr: u32, len: u32 },
    Flush { fd: u32 },
    Close { fd: u32 },
    Delete { key: Region },
}

impl Request {
    pub fn opcode(&self) -> i32 {
        match self {
            Request::OpenRead { .. } => op::OPEN_READ,
            Request::Read { .. } => op::READ,
            Request::OpenWrite { .. } => op::OPEN_WRITE,
            Request::Write { .. } => op::WRITE,
            Request::Flush { .. } => op::FLUSH,
            Request::Close { .. } => op::CLOSE,
            Request::Delete { .. } => op::DELETE,
        }
    }

    fn args(&self) -> [u32; 3] {
        match *self {
            Request::OpenRead { key } | Request::OpenWrite { key } | Request::Delete { key } => {
                [key.ptr, key.len, 0]
            }
            Request::Read { fd, ptr, len } | Request::Write { fd, ptr, len } => [fd, ptr, len],
            Request::Flush { fd } | Request::Close { fd } => [fd, 0, 0],
        }
    }

    /// Store the argument words. The opcode is published separately by the caller.
    pub fn write_args(&self, words: &WordBuffer) {
        let [a0, a1, a2] = self.args();
        words.store_u32(word::ARG0, a0);
        words.store_u32(word::ARG1, a1);
        words.store_u32(word::ARG2, a2);
    }

    /// Decode the request currently published in `words`. Returns the raw opcode if unknown.
    pub fn read_from(words: &WordBuffer) -> Result<Self, i32> {
        let a0 = words.load_u32(word::ARG0);
        let a1 = words.load_u32(word::ARG1);
        let a2 = words.load_u32(word::ARG2);
        let key = Region::new(a0, a1);
        let req = match words.load(word::OP) {
            op::OPEN_READ => Request::OpenRead { key },
            op::READ => Request::Read {
                fd: a0,
                ptr: a1,
                len: a2,
            },
            op::OPEN_WRITE => Request::OpenWrite { key },
            op::WRITE => Request::Write {
                fd: a0,
                ptr: a1,
                len: a2,
            },
            op::FLUSH => Request::Flush { fd: a0 },
            op::CLOSE => Request::Close { fd: a0 },
            op::DELETE => Request::Delete { key },
            other => return Err(other),
        };
        Ok(req)
    }
}

/// The two response words written over `arg0` and `arg1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub primary: u32,
    pub secondary: u32,
}

impl Response {
    pub fn new(primary: u32, secondary: u32) -> Self {
        Self { primary, secondary }
    }

    pub fn status(status: i32) -> Self {
        Self::new(status as u32, 0)
    }

    pub fn write_to(&self, words: &WordBuffer) {
        words.store_u32(word::RESP_PRIMARY, self.primary);
        words.store_u32(word::RESP_SECONDARY, self.secondary);
    }

    pub fn read_from(words: &WordBuffer) -> Self {
        Self::new(
            words.load_u32(word::RESP_PRIMARY),
            words.load_u32(word::RESP_SECONDARY),
        )
    }
}
