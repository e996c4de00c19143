use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tether_ipc::layout::MAX_RING_CAPACITY;
use tether_ipc::websocket::{message_frame_len, DEFAULT_BIG_MESSAGE_THRESHOLD};
use thiserror::Error;

pub const DEFAULT_RING_CAPACITY: usize = 1024 * 1024;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_ROUNDS: usize = 50;

#[derive(Debug, Clone, Parser)]
#[command(name = "tether-cli", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Event ring capacity in bytes.
    ///
    /// Environment variable: `TETHER_RING_CAPACITY`.
    #[arg(long, global = true, env = "TETHER_RING_CAPACITY")]
    ring_capacity: Option<usize>,

    /// Messages larger than this are sent as a chunk sequence.
    ///
    /// Environment variable: `TETHER_BIG_MESSAGE_THRESHOLD`.
    #[arg(long, global = true, env = "TETHER_BIG_MESSAGE_THRESHOLD")]
    big_message_threshold: Option<usize>,

    /// Back storage with this directory instead of memory.
    ///
    /// Environment variable: `TETHER_STORAGE_ROOT`.
    #[arg(long, global = true, env = "TETHER_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Total storage quota in bytes.
    ///
    /// Environment variable: `TETHER_STORAGE_QUOTA_BYTES`.
    #[arg(long, global = true, env = "TETHER_STORAGE_QUOTA_BYTES")]
    storage_quota_bytes: Option<u64>,

    /// Number of worker threads.
    ///
    /// Environment variable: `TETHER_WORKERS`.
    #[arg(long, global = true, env = "TETHER_WORKERS")]
    workers: Option<usize>,

    /// Rounds per worker.
    ///
    /// Environment variable: `TETHER_ROUNDS`.
    #[arg(long, global = true, env = "TETHER_ROUNDS")]
    rounds: Option<usize>,

    /// Log filter (tracing-subscriber EnvFilter syntax).
    ///
    /// Environment variable: `TETHER_LOG`.
    #[arg(long, global = true, env = "TETHER_LOG")]
    log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run workers against a coordinator and push bridge traffic through a ring, verifying
    /// every byte.
    Soak,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ring capacity {capacity} cannot hold a {needed}-byte chunk frame")]
    RingTooSmall { capacity: usize, needed: usize },

    #[error("ring capacity {0} exceeds the {MAX_RING_CAPACITY}-byte limit")]
    RingTooLarge(usize),

    #[error("big-message threshold must be at least 1")]
    ZeroThreshold,

    #[error("at least one worker is required")]
    ZeroWorkers,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub command: Command,
    pub ring_capacity: usize,
    pub big_message_threshold: usize,
    pub storage_root: Option<PathBuf>,
    pub storage_quota_bytes: Option<u64>,
    pub workers: usize,
    pub rounds: usize,
    pub log_level: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Result<Self, ConfigError> {
        let big_message_threshold = args
            .big_message_threshold
            .unwrap_or(DEFAULT_BIG_MESSAGE_THRESHOLD);
        if big_message_threshold == 0 {
            return Err(ConfigError::ZeroThreshold);
        }

        let ring_capacity = args.ring_capacity.unwrap_or(DEFAULT_RING_CAPACITY);
        if ring_capacity > MAX_RING_CAPACITY {
            return Err(ConfigError::RingTooLarge(ring_capacity));
        }
        let needed = message_frame_len(big_message_threshold);
        if ring_capacity < needed {
            return Err(ConfigError::RingTooSmall {
                capacity: ring_capacity,
                needed,
            });
        }

        let workers = args.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }

        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            command: args.command,
            ring_capacity,
            big_message_threshold,
            storage_root: args.storage_root,
            storage_quota_bytes: args.storage_quota_bytes,
            workers,
            rounds: args.rounds.unwrap_or(DEFAULT_ROUNDS),
            log_level,
        })
    }
}
