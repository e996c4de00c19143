//! Self-describing event frames carried by the ring transport.
//!
//! Every frame is `[tag: u8][fields...]` with a fixed field order per tag:
//! - integers are fixed-width little-endian,
//! - byte strings are a `u32` length prefix followed by the raw bytes.
//!
//! Frames carry no outer length; a consumer walks a batch of bytes frame by frame using the tag
//! to know how much to read. This is what lets the ring itself stay header-free.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Response status line and headers of an HTTP fetch.
    ResponseHeaders {
        fetch_id: u32,
        status: u16,
        headers: Vec<(String, String)>,
    },

    /// `written` bytes of response body are ready in the pooled buffer at `pooled_buffer_ptr`.
    ResponseBodyChunk {
        fetch_id: u32,
        pooled_buffer_ptr: u32,
        written: u32,
    },

    ResponseBodyDone { fetch_id: u32 },

    /// A fetch failed; `message` is a human-readable description.
    Error { fetch_id: u32, message: String },

    /// The coordinator needs the worker to hand back a pooled buffer of `byte_length` bytes.
    BufferRequest { request_id: u32, byte_length: u32 },

    WsOpen { conn_id: u32 },
    WsClose { conn_id: u32 },

    /// A complete message no larger than the bridge's big-message threshold.
    WsSmallMessage { conn_id: u32, data: Vec<u8> },

    /// Announces a message that follows as `chunk_count` chunk frames.
    WsBigMessageStart {
        conn_id: u32,
        total_len: u32,
        chunk_count: u32,
    },

    WsBigMessageChunk { conn_id: u32, data: Vec<u8> },
}

pub mod tag {
    pub const RESPONSE_HEADERS: u8 = 0x01;
    pub const RESPONSE_BODY_CHUNK: u8 = 0x02;
    pub const RESPONSE_BODY_DONE: u8 = 0x03;
    pub const ERROR: u8 = 0x04;
    pub const BUFFER_REQUEST: u8 = 0x05;

    pub const WS_OPEN: u8 = 0x10;
    pub const WS_CLOSE: u8 = 0x11;
    pub const WS_SMALL_MESSAGE: u8 = 0x12;
    pub const WS_BIG_MESSAGE_START: u8 = 0x13;
    pub const WS_BIG_MESSAGE_CHUNK: u8 = 0x14;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame at offset {offset} needs {needed} more bytes, {remaining} remain")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown frame tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("invalid UTF-8 in frame at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::ResponseHeaders { .. } => tag::RESPONSE_HEADERS,
            Frame::ResponseBodyChunk { .. } => tag::RESPONSE_BODY_CHUNK,
            Frame::ResponseBodyDone { .. } => tag::RESPONSE_BODY_DONE,
            Frame::Error { .. } => tag::ERROR,
            Frame::BufferRequest { .. } => tag::BUFFER_REQUEST,
            Frame::WsOpen { .. } => tag::WS_OPEN,
            Frame::WsClose { .. } => tag::WS_CLOSE,
            Frame::WsSmallMessage { .. } => tag::WS_SMALL_MESSAGE,
            Frame::WsBigMessageStart { .. } => tag::WS_BIG_MESSAGE_START,
            Frame::WsBigMessageChunk { .. } => tag::WS_BIG_MESSAGE_CHUNK,
        }
    }

    /// Exact number of bytes [`Frame::encode`] produces.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Frame::ResponseHeaders { headers, .. } => {
                4 + 2
                    + 4
                    + headers
                        .iter()
                        .map(|(k, v)| 4 + k.len() + 4 + v.len())
                        .sum::<usize>()
            }
            Frame::ResponseBodyChunk { .. } => 12,
            Frame::ResponseBodyDone { .. } => 4,
            Frame::Error { message, .. } => 4 + 4 + message.len(),
            Frame::BufferRequest { .. } => 8,
            Frame::WsOpen { .. } | Frame::WsClose { .. } => 4,
            Frame::WsSmallMessage { data, .. } | Frame::WsBigMessageChunk { data, .. } => {
                4 + 4 + data.len()
            }
            Frame::WsBigMessageStart { .. } => 12,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Frame::ResponseHeaders {
                fetch_id,
                status,
                headers,
            } => {
                push_u32(out, *fetch_id);
                push_u16(out, *status);
                push_u32(out, headers.len() as u32);
                for (key, value) in headers {
                    push_bytes(out, key.as_bytes());
                    push_bytes(out, value.as_bytes());
                }
            }
            Frame::ResponseBodyChunk {
                fetch_id,
                pooled_buffer_ptr,
                written,
            } => {
                push_u32(out, *fetch_id);
                push_u32(out, *pooled_buffer_ptr);
                push_u32(out, *written);
            }
            Frame::ResponseBodyDone { fetch_id } => push_u32(out, *fetch_id),
            Frame::Error { fetch_id, message } => {
                push_u32(out, *fetch_id);
                push_bytes(out, message.as_bytes());
            }
            Frame::BufferRequest {
                request_id,
                byte_length,
            } => {
                push_u32(out, *request_id);
                push_u32(out, *byte_length);
            }
            Frame::WsOpen { conn_id } | Frame::WsClose { conn_id } => push_u32(out, *conn_id),
            Frame::WsSmallMessage { conn_id, data }
            | Frame::WsBigMessageChunk { conn_id, data } => {
                push_u32(out, *conn_id);
                push_bytes(out, data);
            }
            Frame::WsBigMessageStart {
                conn_id,
                total_len,
                chunk_count,
            } => {
                push_u32(out, *conn_id);
                push_u32(out, *total_len);
                push_u32(out, *chunk_count);
            }
        }
    }
}

/// Decode the frame at the start of `bytes`, returning it and the number of bytes it used.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    decode_frame_at(bytes, 0)
}

/// Decode a batch that must consist of whole frames only.
pub fn decode_frames(bytes: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (frame, used) = decode_frame_at(bytes, offset)?;
        frames.push(frame);
        offset += used;
    }
    Ok(frames)
}

/// Decode the frame starting at `offset`. Returns the frame and its encoded length; error
/// offsets are positions in `bytes`.
pub fn decode_frame_at(bytes: &[u8], offset: usize) -> Result<(Frame, usize), DecodeError> {
    let mut r = Reader {
        bytes,
        start: offset,
        pos: offset,
    };
    let tag = r.read_u8()?;
    let frame = match tag {
        tag::RESPONSE_HEADERS => {
            let fetch_id = r.read_u32()?;
            let status = r.read_u16()?;
            let count = r.read_u32()? as usize;
            // Each header needs at least its two length prefixes; this bounds the allocation
            // by the bytes actually present.
            r.ensure(count.saturating_mul(8))?;
            let mut headers = Vec::with_capacity(count);
            for _ in 0..count {
                let key = r.read_string()?;
                let value = r.read_string()?;
                headers.push((key, value));
            }
            Frame::ResponseHeaders {
                fetch_id,
                status,
                headers,
            }
        }
        tag::RESPONSE_BODY_CHUNK => Frame::ResponseBodyChunk {
            fetch_id: r.read_u32()?,
            pooled_buffer_ptr: r.read_u32()?,
            written: r.read_u32()?,
        },
        tag::RESPONSE_BODY_DONE => Frame::ResponseBodyDone {
            fetch_id: r.read_u32()?,
        },
        tag::ERROR => Frame::Error {
            fetch_id: r.read_u32()?,
            message: r.read_string()?,
        },
        tag::BUFFER_REQUEST => Frame::BufferRequest {
            request_id: r.read_u32()?,
            byte_length: r.read_u32()?,
        },
        tag::WS_OPEN => Frame::WsOpen {
            conn_id: r.read_u32()?,
        },
        tag::WS_CLOSE => Frame::WsClose {
            conn_id: r.read_u32()?,
        },
        tag::WS_SMALL_MESSAGE => Frame::WsSmallMessage {
            conn_id: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        },
        tag::WS_BIG_MESSAGE_START => Frame::WsBigMessageStart {
            conn_id: r.read_u32()?,
            total_len: r.read_u32()?,
            chunk_count: r.read_u32()?,
        },
        tag::WS_BIG_MESSAGE_CHUNK => Frame::WsBigMessageChunk {
            conn_id: r.read_u32()?,
            data: r.read_bytes()?.to_vec(),
        },
        _ => return Err(DecodeError::UnknownTag { tag, offset }),
    };
    Ok((frame, r.pos - offset))
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    push_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    start: usize,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::UnexpectedEof {
                offset: self.start,
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.ensure(len)?;
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_bytes()?;
        let s = core::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 {
            offset: self.start,
        })?;
        Ok(s.to_string())
    }
}
