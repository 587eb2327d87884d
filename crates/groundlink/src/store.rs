//! The latest-frame cache shared between the link and its consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::telemetry::{Schema, TelemetryFrame};

/// Holds exactly one frame: the most recent one decoded off the link.
///
/// Starts out with a zero-valued frame stamped at construction time, so
/// readers never observe an undefined state. [`StateStore::get`] hands out a
/// copy; a later [`StateStore::set`] never changes a frame a reader already
/// holds.
#[derive(Debug)]
pub struct StateStore {
    latest: RwLock<TelemetryFrame>,
    updates: AtomicU64,
}

impl StateStore {
    /// Create a store holding a zeroed frame of `schema`.
    #[must_use]
    pub fn new(schema: Schema) -> Self {
        Self {
            latest: RwLock::new(TelemetryFrame::initial(schema)),
            updates: AtomicU64::new(0),
        }
    }

    /// Replace the cached frame.
    pub fn set(&self, frame: TelemetryFrame) {
        // A panicking writer cannot leave a half-written Copy value behind.
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = frame;
        self.updates.fetch_add(1, Ordering::Release);
    }

    /// Return a copy of the cached frame.
    #[must_use]
    pub fn get(&self) -> TelemetryFrame {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of frames stored since creation.
    ///
    /// Lets polling consumers tell a fresh frame from one they already saw.
    #[must_use]
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(Schema::default())
    }
}
