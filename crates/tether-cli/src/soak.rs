//! End-to-end exercise of both transports.
//!
//! The storage phase runs worker threads against one coordinator: each round writes a private
//! key, reads it back, deletes it, and reads a key every worker shares. The bridge phase pushes
//! mixed-size messages for several connections through one ring and reassembles them on a
//! consumer thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tether_ipc::layout::REGION_ALIGN;
use tether_ipc::{
    BridgeConfig, EventBus, EventSender, RingBuffer, SharedMemory, WebSocketBridge, WsAssembler,
    WsEvent,
};
use tether_storage::{
    ByteStreamStore, DirStore, MemLockService, MemStore, StorageClient, StorageConfig,
    StorageCoordinator, StorageError, WorkerId,
};

use crate::config::Config;

const SCRATCH_LEN: usize = 4096;
const SHARED_KEY: &str = "shared";
const BRIDGE_CONNECTIONS: u32 = 4;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageReport {
    pub rounds: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub quota_rejections: u64,
    pub mismatches: u64,
}

impl StorageReport {
    fn merge(&mut self, other: &StorageReport) {
        self.rounds += other.rounds;
        self.bytes_written += other.bytes_written;
        self.bytes_read += other.bytes_read;
        self.quota_rejections += other.quota_rejections;
        self.mismatches += other.mismatches;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeReport {
    pub connections: u32,
    pub messages: u64,
    pub bytes: u64,
    pub mismatches: u64,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub storage: StorageReport,
    pub bridge: BridgeReport,
    pub elapsed: Duration,
}

impl Report {
    pub fn mismatches(&self) -> u64 {
        self.storage.mismatches + self.bridge.mismatches
    }
}

pub fn run(cfg: &Config) -> Result<Report> {
    let started = Instant::now();
    let storage = run_storage(cfg).context("storage soak")?;
    let bridge = run_bridge(cfg).context("bridge soak")?;
    Ok(Report {
        storage,
        bridge,
        elapsed: started.elapsed(),
    })
}

fn open_store(cfg: &Config) -> Result<Arc<dyn ByteStreamStore>> {
    let store: Arc<dyn ByteStreamStore> = match (&cfg.storage_root, cfg.storage_quota_bytes) {
        (Some(root), Some(quota)) => Arc::new(DirStore::with_quota(root, quota)?),
        (Some(root), None) => Arc::new(DirStore::new(root)?),
        (None, Some(quota)) => Arc::new(MemStore::with_quota(quota)),
        (None, None) => Arc::new(MemStore::new()),
    };
    Ok(store)
}

/// Deterministic payload for `(worker, round)`, sized so some rounds span several reads.
fn payload(worker: WorkerId, round: usize) -> Vec<u8> {
    let len = (round * 997 + worker as usize * 131) % (3 * SCRATCH_LEN + 1);
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(worker) as u8)
        .collect()
}

fn shared_contents() -> Vec<u8> {
    (0..SCRATCH_LEN * 2 + 17).map(|i| (i % 251) as u8).collect()
}

fn run_storage(cfg: &Config) -> Result<StorageReport> {
    let store = open_store(cfg)?;
    // One scratch region per worker plus the seeding client.
    let memory = SharedMemory::new((cfg.workers + 1) * (SCRATCH_LEN + REGION_ALIGN))?;
    let handle = StorageCoordinator::spawn(
        StorageConfig::default(),
        store,
        Arc::new(MemLockService::new()),
        memory.clone(),
    )?;

    let shared = shared_contents();
    {
        let mut seed = StorageClient::connect(handle.control(), memory.clone(), 0, SCRATCH_LEN)?;
        let fd = seed.open_write(SHARED_KEY)?;
        seed.write(fd, &shared)?;
        seed.close(fd)?;
    }

    let mut threads = Vec::with_capacity(cfg.workers);
    for i in 0..cfg.workers {
        let worker = i as WorkerId + 1;
        let control = handle.control();
        let memory = memory.clone();
        let shared = shared.clone();
        let rounds = cfg.rounds;
        let thread = std::thread::Builder::new()
            .name(format!("soak-worker-{worker}"))
            .spawn(move || -> Result<StorageReport, StorageError> {
                let mut client = StorageClient::connect(control, memory, worker, SCRATCH_LEN)?;
                storage_worker(&mut client, rounds, &shared)
            })
            .context("spawn worker thread")?;
        threads.push(thread);
    }

    let mut report = StorageReport::default();
    for thread in threads {
        let worker_report = thread
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
        report.merge(&worker_report);
    }

    let stats = handle.stats()?;
    tracing::info!(
        sessions_opened = stats.sessions_opened,
        sessions_failed = stats.sessions_failed,
        "storage coordinator stats"
    );
    handle.shutdown()?;
    Ok(report)
}

fn storage_worker(
    client: &mut StorageClient,
    rounds: usize,
    shared: &[u8],
) -> Result<StorageReport, StorageError> {
    let worker = client.worker();
    let key = format!("worker-{worker}");
    let mut report = StorageReport::default();

    for round in 0..rounds {
        let data = payload(worker, round);
        let fd = client.open_write(&key)?;
        let written = client.write(fd, &data);
        client.close(fd)?;
        match written {
            Ok(()) => report.bytes_written += data.len() as u64,
            Err(StorageError::QuotaExceeded) => {
                report.quota_rejections += 1;
                client.delete(&key)?;
                report.rounds += 1;
                continue;
            }
            Err(err) => return Err(err),
        }

        let back = client.read_to_end(&key)?;
        if back.as_deref() != Some(&data[..]) {
            tracing::error!(worker, round, "private key read back different bytes");
            report.mismatches += 1;
        }
        report.bytes_read += data.len() as u64;
        client.delete(&key)?;
        if client.open_read(&key)?.is_some() {
            tracing::error!(worker, round, "deleted key still readable");
            report.mismatches += 1;
        }

        let seen = client.read_to_end(SHARED_KEY)?;
        if seen.as_deref() != Some(shared) {
            tracing::error!(worker, round, "shared key read back different bytes");
            report.mismatches += 1;
        }
        report.bytes_read += shared.len() as u64;
        report.rounds += 1;
    }

    tracing::debug!(worker, rounds, "storage worker finished");
    Ok(report)
}

/// Sizes around the chunking threshold, cycled per message.
fn bridge_sizes(threshold: usize) -> [usize; 5] {
    [0, 17, threshold, threshold + 1, 3 * threshold + 5]
}

fn bridge_message(conn_id: u32, index: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32 ^ conn_id.wrapping_mul(97) ^ index as u32) as u8)
        .collect()
}

fn run_bridge(cfg: &Config) -> Result<BridgeReport> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("build bridge runtime")?;

    let (writer, reader) = RingBuffer::new(cfg.ring_capacity)?.split();
    let sizes = bridge_sizes(cfg.big_message_threshold);
    let per_conn = cfg.rounds.max(1);

    let consumer = std::thread::Builder::new()
        .name("soak-bridge-consumer".to_string())
        .spawn(move || -> Result<HashMap<u32, Vec<WsEvent>>> {
            let mut bus = EventBus::new(reader);
            let mut assembler = WsAssembler::new();
            let mut by_conn: HashMap<u32, Vec<WsEvent>> = HashMap::new();
            let mut closed = 0;
            while closed < BRIDGE_CONNECTIONS {
                let mut frames = Vec::new();
                bus.poll_dispatch(|f| frames.push(f))?;
                for frame in frames {
                    let Some(event) = assembler.push(frame)? else {
                        continue;
                    };
                    let conn_id = match &event {
                        WsEvent::Open { conn_id } | WsEvent::Close { conn_id } => *conn_id,
                        WsEvent::Message { conn_id, .. } => *conn_id,
                    };
                    if matches!(event, WsEvent::Close { .. }) {
                        closed += 1;
                    }
                    by_conn.entry(conn_id).or_default().push(event);
                }
            }
            Ok(by_conn)
        })
        .context("spawn bridge consumer")?;

    let threshold = cfg.big_message_threshold;
    let ids = runtime.block_on(async move {
        let (ring_tx, drain) = writer.spawn();
        let bridge = WebSocketBridge::new(
            EventSender::new(ring_tx),
            BridgeConfig {
                big_message_threshold: threshold,
            },
        )?;
        let conns: Vec<_> = (0..BRIDGE_CONNECTIONS)
            .map(|_| bridge.open_connection())
            .collect();
        let ids: Vec<u32> = conns.iter().map(|c| c.id()).collect();
        for conn in &conns {
            conn.on_open()?;
        }
        // Round-robin so chunk sequences from different connections interleave on the ring.
        for index in 0..per_conn {
            for conn in &conns {
                let len = sizes[index % sizes.len()];
                conn.send(bridge_message(conn.id(), index, len))?;
            }
        }
        for conn in conns {
            conn.on_close().await?;
        }
        drop(bridge);
        drain.await??;
        anyhow::Ok(ids)
    })?;

    let by_conn = consumer
        .join()
        .map_err(|_| anyhow!("bridge consumer panicked"))??;

    let mut report = BridgeReport {
        connections: BRIDGE_CONNECTIONS,
        ..Default::default()
    };
    for conn_id in ids {
        let mut expected = vec![WsEvent::Open { conn_id }];
        for index in 0..per_conn {
            let data = bridge_message(conn_id, index, sizes[index % sizes.len()]);
            report.messages += 1;
            report.bytes += data.len() as u64;
            expected.push(WsEvent::Message { conn_id, data });
        }
        expected.push(WsEvent::Close { conn_id });

        let got = by_conn.get(&conn_id).map(Vec::as_slice).unwrap_or_default();
        if got != expected.as_slice() {
            tracing::error!(
                conn_id,
                expected = expected.len(),
                got = got.len(),
                "connection event sequence differs"
            );
            report.mismatches += 1;
        }
    }
    Ok(report)
}
