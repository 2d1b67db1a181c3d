use serde::{Deserialize, Serialize};

/// Geometry of a packet ring: fixed slot size and slot count.
///
/// Both values are immutable once a segment has been initialized; writer and
/// readers compiled separately must agree on them, which is why the geometry
/// is also stored in the segment header and validated on attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingGeometry {
    /// Bytes per packet slot.
    pub packet_size: u32,
    /// Number of packet slots in the ring.
    pub num_buffers: u32,
}

impl RingGeometry {
    pub fn new(packet_size: u32, num_buffers: u32) -> Self {
        Self {
            packet_size,
            num_buffers,
        }
    }

    /// A geometry is usable only if both dimensions are nonzero.
    pub fn is_valid(&self) -> bool {
        self.packet_size > 0 && self.num_buffers > 0
    }

    /// Total bytes of packet storage (excluding the control block).
    pub fn data_size(&self) -> usize {
        self.packet_size as usize * self.num_buffers as usize
    }
}
