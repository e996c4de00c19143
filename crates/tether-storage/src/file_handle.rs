//! Per-session request/response slot.
//!
//! A five-word [`WordBuffer`]. The requester fills the request slot and flips `TURN` to
//! `REQUESTED`; the session service loop answers in the response slot and flips `TURN` to
//! `RESPONDED`; the requester reads the answer and returns `TURN` to `IDLE`. The turn word keeps
//! a request from ever being mistaken for a response, whatever values the two slots hold.

use tether_ipc::WordBuffer;

pub mod slot {
    pub const REQ_PTR: usize = 0;
    pub const REQ_LEN: usize = 1;
    pub const RESP_STATUS: usize = 2;
    pub const RESP_LEN: usize = 3;
    pub const TURN: usize = 4;
    pub const WORDS: usize = 5;
}

pub mod turn {
    pub const IDLE: i32 = 0;
    pub const REQUESTED: i32 = 1;
    pub const RESPONDED: i32 = 2;
}

/// Request-pointer sentinels.
pub const CLOSE: i32 = -1;
pub const FLUSH: i32 = -2;

/// `done` values returned by read sessions.
pub mod read_done {
    pub const MORE: i32 = 0;
    pub const END_OF_STREAM: i32 = 1;
    pub const BAD_HANDLE: i32 = 2;
    pub const IO_ERROR: i32 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRequest {
    Data { ptr: u32, len: u32 },
    Flush,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotResponse {
    pub status: i32,
    pub len: u32,
}

#[derive(Debug, Clone)]
pub struct FileHandle {
    words: WordBuffer,
}

impl Default for FileHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl FileHandle {
    pub fn new() -> Self {
        Self {
            words: WordBuffer::new(slot::WORDS),
        }
    }

    /// Issue one request and wait for the service loop to answer it.
    pub async fn call(&self, request: SlotRequest) -> SlotResponse {
        let (ptr, len) = match request {
            SlotRequest::Data { ptr, len } => (ptr as i32, len as i32),
            SlotRequest::Flush => (FLUSH, 0),
            SlotRequest::Close => (CLOSE, 0),
        };
        self.words.store(slot::REQ_PTR, ptr);
        self.words.store(slot::REQ_LEN, len);
        self.words.store(slot::TURN, turn::REQUESTED);
        self.words.notify();

        self.words.wait_async(slot::TURN, turn::REQUESTED).await;
        let response = SlotResponse {
            status: self.words.load(slot::RESP_STATUS),
            len: self.words.load_u32(slot::RESP_LEN),
        };
        self.words.store(slot::TURN, turn::IDLE);
        response
    }

    /// Service side: wait for the next request.
    pub async fn next_request(&self) -> SlotRequest {
        loop {
            let current = self.words.load(slot::TURN);
            if current == turn::REQUESTED {
                break;
            }
            self.words.wait_async(slot::TURN, current).await;
        }
        match self.words.load(slot::REQ_PTR) {
            CLOSE => SlotRequest::Close,
            FLUSH => SlotRequest::Flush,
            ptr => SlotRequest::Data {
                ptr: ptr as u32,
                len: self.words.load_u32(slot::REQ_LEN),
            },
        }
    }

    /// Service side: answer the outstanding request.
    pub fn respond(&self, status: i32, len: u32) {
        self.words.store(slot::RESP_STATUS, status);
        self.words.store_u32(slot::RESP_LEN, len);
        self.words.store(slot::TURN, turn::RESPONDED);
        self.words.notify();
    }
}
