use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tether_ipc::{
    BridgeConfig, ConnectionHandle, EventBus, EventSender, RingBuffer, RingError, SocketHost,
    WebSocketBridge, WsAssembler, WsEvent,
};

fn conn_of(event: &WsEvent) -> u32 {
    match event {
        WsEvent::Open { conn_id } | WsEvent::Close { conn_id } => *conn_id,
        WsEvent::Message { conn_id, .. } => *conn_id,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn big_messages_reassemble_across_interleaved_connections() {
    // Ring barely larger than one chunk frame, so the bridge is throttled by the worker.
    let (writer, reader) = RingBuffer::new(40).unwrap().split();
    let (ring_tx, drain) = writer.spawn();
    let bridge = WebSocketBridge::new(
        EventSender::new(ring_tx),
        BridgeConfig {
            big_message_threshold: 16,
        },
    )
    .unwrap();

    let worker = std::thread::spawn(move || {
        let mut bus = EventBus::new(reader);
        let mut assembler = WsAssembler::new();
        let mut events = Vec::new();
        let mut closed = 0;
        while closed < 2 {
            let mut frames = Vec::new();
            bus.poll_dispatch(|f| frames.push(f)).unwrap();
            for frame in frames {
                if let Some(event) = assembler.push(frame).unwrap() {
                    if matches!(event, WsEvent::Close { .. }) {
                        closed += 1;
                    }
                    events.push(event);
                }
            }
        }
        assert_eq!(assembler.in_flight(), 0);
        events
    });

    let a = bridge.open_connection();
    let b = bridge.open_connection();
    let (a_id, b_id) = (a.id(), b.id());
    assert_ne!(a_id, b_id);

    let big_a: Vec<u8> = (0..100u32).map(|i| (i * 7) as u8).collect();
    let big_b = vec![0xAB; 40];

    a.on_open().unwrap();
    b.on_open().unwrap();
    a.send(big_a.clone()).unwrap();
    b.send(big_b.clone()).unwrap();
    a.send(vec![1, 2, 3]).unwrap();
    b.send(Vec::new()).unwrap();
    a.on_close().await.unwrap();
    b.on_close().await.unwrap();
    drop(bridge);
    drain.await.unwrap().unwrap();

    let events = worker.join().unwrap();
    let of = |id: u32| -> Vec<WsEvent> {
        events
            .iter()
            .filter(|e| conn_of(e) == id)
            .cloned()
            .collect()
    };
    assert_eq!(
        of(a_id),
        vec![
            WsEvent::Open { conn_id: a_id },
            WsEvent::Message {
                conn_id: a_id,
                data: big_a
            },
            WsEvent::Message {
                conn_id: a_id,
                data: vec![1, 2, 3]
            },
            WsEvent::Close { conn_id: a_id },
        ]
    );
    assert_eq!(
        of(b_id),
        vec![
            WsEvent::Open { conn_id: b_id },
            WsEvent::Message {
                conn_id: b_id,
                data: big_b
            },
            WsEvent::Message {
                conn_id: b_id,
                data: Vec::new()
            },
            WsEvent::Close { conn_id: b_id },
        ]
    );
}

#[tokio::test]
async fn bridge_rejects_threshold_the_ring_cannot_carry() {
    let (writer, _reader) = RingBuffer::new(32).unwrap().split();
    let (ring_tx, _drain) = writer.spawn();
    let err = WebSocketBridge::new(
        EventSender::new(ring_tx),
        BridgeConfig {
            big_message_threshold: 64,
        },
    )
    .unwrap_err();
    assert_eq!(
        err,
        RingError::FrameTooLarge {
            len: 73,
            capacity: 32
        }
    );
}

/// Opens instantly and sends every outbound message straight back as an inbound one.
struct LoopbackHost {
    urls: Arc<Mutex<Vec<String>>>,
    conns: HashMap<u32, ConnectionHandle>,
}

impl SocketHost for LoopbackHost {
    fn open(&mut self, url: &str, conn: ConnectionHandle) {
        self.urls.lock().unwrap().push(url.to_string());
        conn.on_open().unwrap();
        self.conns.insert(conn.id(), conn);
    }

    fn send(&mut self, conn_id: u32, data: Vec<u8>) {
        if let Some(conn) = self.conns.get(&conn_id) {
            conn.send(data).unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_opens_connections_and_sends_through_the_host() {
    let (writer, reader) = RingBuffer::new(64).unwrap().split();
    let (ring_tx, drain) = writer.spawn();
    let bridge = WebSocketBridge::new(
        EventSender::new(ring_tx),
        BridgeConfig {
            big_message_threshold: 16,
        },
    )
    .unwrap();
    let urls = Arc::new(Mutex::new(Vec::new()));
    let (client, serving) = bridge.serve(LoopbackHost {
        urls: urls.clone(),
        conns: HashMap::new(),
    });

    let worker = tokio::task::spawn_blocking(move || {
        let a = client.open("ws://a.test/").unwrap();
        let b = client.open("ws://b.test/").unwrap();
        client.send(a, vec![7; 40]).unwrap();
        client.send(b, b"hi".to_vec()).unwrap();
        // Unknown ids go nowhere.
        client.send(999, vec![1]).unwrap();

        let mut bus = EventBus::new(reader);
        let mut assembler = WsAssembler::new();
        let mut events = Vec::new();
        while events.len() < 4 {
            let mut frames = Vec::new();
            bus.poll_dispatch(|f| frames.push(f)).unwrap();
            for frame in frames {
                events.extend(assembler.push(frame).unwrap());
            }
        }
        (a, b, events)
    });
    let (a, b, events) = worker.await.unwrap();

    // The client was dropped with the worker, which ends the request loop and drops the host.
    serving.await.unwrap();
    drain.await.unwrap().unwrap();

    assert_eq!((a, b), (1, 2));
    assert_eq!(*urls.lock().unwrap(), vec!["ws://a.test/", "ws://b.test/"]);
    let of = |id: u32| -> Vec<WsEvent> {
        events
            .iter()
            .filter(|e| conn_of(e) == id)
            .cloned()
            .collect()
    };
    assert_eq!(
        of(a),
        vec![
            WsEvent::Open { conn_id: a },
            WsEvent::Message {
                conn_id: a,
                data: vec![7; 40]
            },
        ]
    );
    assert_eq!(
        of(b),
        vec![
            WsEvent::Open { conn_id: b },
            WsEvent::Message {
                conn_id: b,
                data: b"hi".to_vec()
            },
        ]
    );
}
