//! WebSocket-style connection bridge over the event ring.
//!
//! Coordinator side: each connection gets one sending loop that turns socket callbacks
//! (`open`, `message`, `close`) into frames. A message larger than the big-message threshold
//! goes out as a [`Frame::WsBigMessageStart`] declaring total length and chunk count, followed by
//! that many [`Frame::WsBigMessageChunk`] frames. Frames of one connection stay in order because
//! only its loop emits them; different connections interleave freely since every frame carries
//! its connection id.
//!
//! Worker side: [`WsAssembler`] rebuilds whole messages from the frames. Outbound traffic goes
//! the other way through a [`WsClient`]: the worker asks for a connection to a URL, blocks
//! until [`WebSocketBridge::serve`] has allocated its id, and then hands bytes for that id to
//! the [`SocketHost`] that owns the real sockets.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::event_bus::EventSender;
use crate::frame::Frame;
use crate::ring::RingError;

pub const DEFAULT_BIG_MESSAGE_THRESHOLD: usize = 64 * 1024;

/// Encoded size of a message or chunk frame carrying `payload` bytes.
pub const fn message_frame_len(payload: usize) -> usize {
    1 + 4 + 4 + payload
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Largest payload sent as a single small-message frame, and the chunk size for larger
    /// ones.
    pub big_message_threshold: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            big_message_threshold: DEFAULT_BIG_MESSAGE_THRESHOLD,
        }
    }
}

/// Split one message into the frames that carry it.
pub fn message_frames(conn_id: u32, data: &[u8], threshold: usize) -> Vec<Frame> {
    let threshold = threshold.max(1);
    if data.len() <= threshold {
        return vec![Frame::WsSmallMessage {
            conn_id,
            data: data.to_vec(),
        }];
    }

    let chunk_count = data.len().div_ceil(threshold);
    let mut frames = Vec::with_capacity(chunk_count + 1);
    frames.push(Frame::WsBigMessageStart {
        conn_id,
        total_len: data.len() as u32,
        chunk_count: chunk_count as u32,
    });
    frames.extend(data.chunks(threshold).map(|chunk| Frame::WsBigMessageChunk {
        conn_id,
        data: chunk.to_vec(),
    }));
    frames
}

#[derive(Debug)]
pub struct WebSocketBridge {
    events: EventSender,
    config: BridgeConfig,
    next_id: AtomicU32,
}

impl WebSocketBridge {
    /// Fails if the ring behind `events` cannot hold a full-size chunk frame.
    pub fn new(events: EventSender, config: BridgeConfig) -> Result<Self, RingError> {
        let needed = message_frame_len(config.big_message_threshold);
        if needed > events.max_frame_len() {
            return Err(RingError::FrameTooLarge {
                len: needed,
                capacity: events.max_frame_len(),
            });
        }
        Ok(Self {
            events,
            config,
            next_id: AtomicU32::new(1),
        })
    }

    /// Register a new connection and start its sending loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_connection(&self) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(sending_loop(
            id,
            self.events.clone(),
            self.config.big_message_threshold,
            rx,
        ));
        tracing::debug!(conn_id = id, "websocket connection registered");
        ConnectionHandle { id, tx, task }
    }

    /// Serve worker requests against `host` until every [`WsClient`] is dropped.
    ///
    /// Each open registers a connection and hands its [`ConnectionHandle`] to the host, which
    /// reports socket callbacks through it. Must be called from within a tokio runtime.
    pub fn serve<H: SocketHost>(self, mut host: H) -> (WsClient, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    WsRequest::Open { url, reply } => {
                        let conn = self.open_connection();
                        let id = conn.id();
                        host.open(&url, conn);
                        tracing::info!(conn_id = id, url = %url, "websocket opened for worker");
                        // The worker may have given up waiting.
                        let _ = reply.send(id);
                    }
                    WsRequest::Send { conn_id, data } => host.send(conn_id, data),
                }
            }
            tracing::debug!("websocket clients dropped; request loop finished");
        });
        (WsClient { tx }, task)
    }
}

#[derive(Debug)]
enum ConnectionEvent {
    Open,
    Message(Vec<u8>),
    Close,
}

/// Coordinator-side handle the socket host drives from its callbacks.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u32,
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    task: JoinHandle<Result<(), RingError>>,
}

impl ConnectionHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn on_open(&self) -> Result<(), RingError> {
        self.push(ConnectionEvent::Open)
    }

    /// Deliver one inbound message to the worker.
    pub fn send(&self, data: Vec<u8>) -> Result<(), RingError> {
        self.push(ConnectionEvent::Message(data))
    }

    /// Emit the close frame and wait for the sending loop to drain.
    pub async fn on_close(self) -> Result<(), RingError> {
        // If the loop already died its join result carries the reason.
        let _ = self.tx.send(ConnectionEvent::Close);
        match self.task.await {
            Ok(res) => res,
            Err(_) => Err(RingError::Closed),
        }
    }

    fn push(&self, event: ConnectionEvent) -> Result<(), RingError> {
        self.tx.send(event).map_err(|_| RingError::Closed)
    }
}

async fn sending_loop(
    conn_id: u32,
    events: EventSender,
    threshold: usize,
    mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> Result<(), RingError> {
    while let Some(event) = rx.recv().await {
        match event {
            ConnectionEvent::Open => events.send(&Frame::WsOpen { conn_id })?,
            ConnectionEvent::Message(data) => {
                for frame in message_frames(conn_id, &data, threshold) {
                    events.send(&frame)?;
                }
            }
            ConnectionEvent::Close => {
                events.send(&Frame::WsClose { conn_id })?;
                break;
            }
        }
    }
    tracing::debug!(conn_id, "websocket sending loop finished");
    Ok(())
}

/// The real sockets behind the bridge.
pub trait SocketHost: Send + 'static {
    /// Start connecting to `url`. Callbacks for the socket go through `conn`.
    fn open(&mut self, url: &str, conn: ConnectionHandle);

    /// Transmit `data` on connection `conn_id`. Ids the host does not know are ignored.
    fn send(&mut self, conn_id: u32, data: Vec<u8>);
}

#[derive(Debug)]
enum WsRequest {
    Open {
        url: String,
        reply: oneshot::Sender<u32>,
    },
    Send {
        conn_id: u32,
        data: Vec<u8>,
    },
}

/// Worker-side handle for outbound WebSocket traffic.
#[derive(Debug, Clone)]
pub struct WsClient {
    tx: mpsc::UnboundedSender<WsRequest>,
}

impl WsClient {
    /// Ask for a connection to `url` and block until its id is allocated.
    ///
    /// Blocks the calling thread. Must not be called from inside a tokio runtime.
    pub fn open(&self, url: &str) -> Result<u32, RingError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WsRequest::Open {
                url: url.to_string(),
                reply,
            })
            .map_err(|_| RingError::Closed)?;
        rx.blocking_recv().map_err(|_| RingError::Closed)
    }

    /// Queue `data` for transmission on `conn_id`. Does not wait for the socket.
    pub fn send(&self, conn_id: u32, data: Vec<u8>) -> Result<(), RingError> {
        self.tx
            .send(WsRequest::Send { conn_id, data })
            .map_err(|_| RingError::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsEvent {
    Open { conn_id: u32 },
    Close { conn_id: u32 },
    Message { conn_id: u32, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    #[error("connection {conn_id}: chunk without a big-message start")]
    ChunkWithoutStart { conn_id: u32 },

    #[error("connection {conn_id}: big-message start while another message is in flight")]
    OverlappingStart { conn_id: u32 },

    #[error("connection {conn_id}: message declared {total_len} bytes, got {received}")]
    LengthMismatch {
        conn_id: u32,
        total_len: u32,
        received: usize,
    },

    #[error("frame tag {tag:#04x} is not a websocket frame")]
    NotWebSocket { tag: u8 },
}

#[derive(Debug)]
struct Partial {
    total_len: u32,
    chunks_left: u32,
    data: Vec<u8>,
}

/// Worker-side reassembly of connection frames into [`WsEvent`]s.
#[derive(Debug, Default)]
pub struct WsAssembler {
    partial: HashMap<u32, Partial>,
}

impl WsAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections with a big message still in flight.
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    pub fn push(&mut self, frame: Frame) -> Result<Option<WsEvent>, AssembleError> {
        match frame {
            Frame::WsOpen { conn_id } => Ok(Some(WsEvent::Open { conn_id })),
            Frame::WsClose { conn_id } => {
                self.partial.remove(&conn_id);
                Ok(Some(WsEvent::Close { conn_id }))
            }
            Frame::WsSmallMessage { conn_id, data } => {
                if self.partial.contains_key(&conn_id) {
                    return Err(AssembleError::OverlappingStart { conn_id });
                }
                Ok(Some(WsEvent::Message { conn_id, data }))
            }
            Frame::WsBigMessageStart {
                conn_id,
                total_len,
                chunk_count,
            } => {
                if self.partial.contains_key(&conn_id) {
                    return Err(AssembleError::OverlappingStart { conn_id });
                }
                if chunk_count == 0 {
                    return finish(conn_id, total_len, Vec::new()).map(Some);
                }
                self.partial.insert(
                    conn_id,
                    Partial {
                        total_len,
                        chunks_left: chunk_count,
                        data: Vec::new(),
                    },
                );
                Ok(None)
            }
            Frame::WsBigMessageChunk { conn_id, data } => {
                let Entry::Occupied(mut entry) = self.partial.entry(conn_id) else {
                    return Err(AssembleError::ChunkWithoutStart { conn_id });
                };
                let partial = entry.get_mut();
                let received = partial.data.len() + data.len();
                if received > partial.total_len as usize {
                    let total_len = partial.total_len;
                    entry.remove();
                    return Err(AssembleError::LengthMismatch {
                        conn_id,
                        total_len,
                        received,
                    });
                }
                partial.data.extend_from_slice(&data);
                partial.chunks_left -= 1;
                if partial.chunks_left > 0 {
                    return Ok(None);
                }
                let done = entry.remove();
                finish(conn_id, done.total_len, done.data).map(Some)
            }
            other => Err(AssembleError::NotWebSocket { tag: other.tag() }),
        }
    }
}

fn finish(conn_id: u32, total_len: u32, data: Vec<u8>) -> Result<WsEvent, AssembleError> {
    if data.len() != total_len as usize {
        return Err(AssembleError::LengthMismatch {
            conn_id,
            total_len,
            received: data.len(),
        });
    }
    Ok(WsEvent::Message { conn_id, data })
}
