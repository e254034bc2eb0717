//! Stream multiplexing over a Slic connection.
//!
//! Stream IDs follow the QUIC numbering: bit 0 is the initiator (0 for the
//! client, 1 for the server) and bit 1 the direction (0 bidirectional, 1
//! unidirectional). Each side's first unidirectional ID is its control
//! stream, which is exempt from stream limits and cannot be reset.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod flow_control;
pub mod socket;
pub mod stream;

pub use flow_control::{Credit, FlowControl};
pub use socket::{Side, SlicSocket};
pub use stream::SlicStream;

/// Whether `id` names a bidirectional stream
#[must_use]
pub fn is_bidirectional(id: u64) -> bool {
    id & 0x02 == 0
}

/// Whether `id` names a stream opened by the client
#[must_use]
pub fn is_client_initiated(id: u64) -> bool {
    id & 0x01 == 0
}

/// Lock a std mutex, recovering the guard if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
