//! Oneshot setup for the packet ring: carves out the shared memory segment
//! and writes its control block. Run once, before the writer or any reader
//! attaches.

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use common::config::{config_path_from_args, AppConfig};
use shm::layout::region_size;
use shm::PacketRing;

fn main() -> Result<()> {
    let config = AppConfig::load(&config_path_from_args())?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.general.log_level))
        .init();

    let ring_config = &config.ring;
    let geometry = ring_config.geometry();
    info!(
        "creating ring {}: {} slots of {} bytes ({} bytes mapped)",
        ring_config.shm_name,
        geometry.num_buffers,
        geometry.packet_size,
        region_size(geometry)
    );

    PacketRing::create(&ring_config.shm_name, geometry)?;
    info!("ring {} ready", ring_config.shm_name);
    Ok(())
}
