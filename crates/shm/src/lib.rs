//! Shared-memory packet ring — single writer, independent readers, zero-copy
//! slot transfers. The control block, reader table, and synchronization words
//! all live inside the mapped segment; processes hold only a mapping handle.

pub mod error;
pub mod layout;
pub mod mmap;
pub mod ring;
pub mod sync;

pub use error::{RingError, RingResult};
pub use ring::{PacketRing, RingAccess, RingStatus};
