mod config;
mod soak;

use anyhow::bail;
use tracing_subscriber::EnvFilter;

use crate::config::{Command, Config};

fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cfg.command {
        Command::Soak => {
            tracing::info!(
                workers = cfg.workers,
                rounds = cfg.rounds,
                ring_capacity = cfg.ring_capacity,
                big_message_threshold = cfg.big_message_threshold,
                storage_root = ?cfg.storage_root,
                "starting soak"
            );
            let report = soak::run(&cfg)?;
            println!(
                "storage: {} rounds, {} bytes written, {} bytes read, {} quota rejections",
                report.storage.rounds,
                report.storage.bytes_written,
                report.storage.bytes_read,
                report.storage.quota_rejections,
            );
            println!(
                "bridge: {} connections, {} messages, {} bytes",
                report.bridge.connections, report.bridge.messages, report.bridge.bytes,
            );
            println!("elapsed: {:.2?}", report.elapsed);
            if report.mismatches() > 0 {
                bail!("soak found {} mismatches", report.mismatches());
            }
        }
    }
    Ok(())
}
