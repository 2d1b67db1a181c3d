//! Inspection tool for a live packet ring: attaches to the segment named in
//! the config and reports offsets, buffer level, writer activity, and the
//! registered readers.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::{config_path_from_args, AppConfig};
use shm::sync::mono_time_ns;
use shm::PacketRing;

fn main() -> Result<()> {
    let config = AppConfig::load(&config_path_from_args())?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.general.log_level))
        .init();

    let name = &config.ring.shm_name;
    let ring = PacketRing::open(name)
        .with_context(|| format!("failed to attach to packet ring {}", name))?;
    let status = ring.status();
    let now = mono_time_ns();

    info!(
        "ring {}: {} slots x {} bytes",
        name, status.geometry.num_buffers, status.geometry.packet_size
    );
    info!(
        "read_offset={} write_offset={} buffer_level={} write_in_progress={}",
        status.read_offset, status.write_offset, status.buffer_level, status.write_in_progress
    );
    info!(
        "writer last active {} ms ago",
        now.saturating_sub(status.writer_last_access_ns) / 1_000_000
    );

    if status.readers.is_empty() {
        info!("no registered readers");
    }
    for reader in &status.readers {
        info!(
            "reader {}: offset={} level={} last active {} ms ago",
            reader.id,
            reader.offset,
            reader.level,
            now.saturating_sub(reader.last_access_ns) / 1_000_000
        );
    }

    Ok(())
}
