//! Shared-memory transport between a coordinator thread and worker threads.
//!
//! - [`memory`]: a fixed-size byte region both sides read and write.
//! - [`words`]: 32-bit atomic word arrays with blocking and async wait/notify.
//! - [`ring`]: a byte ring with a single `pending` counter for backpressure.
//! - [`frame`] and [`event_bus`]: the self-describing event stream carried over a ring.
//! - [`websocket`]: connection bridging with big-message chunking.

pub mod event_bus;
pub mod frame;
pub mod layout;
pub mod memory;
pub mod ring;
pub mod websocket;
pub mod words;

pub use event_bus::{EventBus, EventBusError, EventSender};
pub use frame::{decode_frame, decode_frame_at, decode_frames, DecodeError, Frame};
pub use layout::Region;
pub use memory::{MemoryError, SharedMemory};
pub use ring::{RingBuffer, RingError, RingReader, RingSender, RingWriter};
pub use websocket::{
    AssembleError, BridgeConfig, ConnectionHandle, SocketHost, WebSocketBridge, WsAssembler,
    WsClient, WsEvent,
};
pub use words::WordBuffer;
