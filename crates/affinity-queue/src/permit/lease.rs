//! Scoped slot ownership: a granted slot is released exactly once, on every
//! exit path.

use std::sync::Arc;

use super::pool::{AffinityManager, SlotError};
use super::slot::SlotId;

/// Exclusive hold on one slot. The slot returns to the pool on drop unless
/// [`release`](Self::release) already returned it.
#[must_use = "dropping a SlotPermit immediately releases the slot"]
pub struct SlotPermit {
    manager: Arc<AffinityManager>,
    slot_id: SlotId,
    released: bool,
}

impl SlotPermit {
    /// Take ownership of a slot that was granted by `manager`.
    pub fn adopt(manager: Arc<AffinityManager>, slot_id: SlotId) -> Self {
        Self {
            manager,
            slot_id,
            released: false,
        }
    }

    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Release now and surface any pool error to the caller.
    pub fn release(mut self) -> Result<(), SlotError> {
        self.released = true;
        self.manager.release(self.slot_id)
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        match self.manager.release(self.slot_id) {
            Ok(()) => {
                tracing::debug!(slot = %self.slot_id, "Slot permit dropped, slot released");
            }
            Err(SlotError::Disposed) => {
                tracing::debug!(slot = %self.slot_id, "Slot pool disposed before permit drop");
            }
            Err(e) => {
                tracing::error!(slot = %self.slot_id, error = %e, "Failed to release slot on drop");
            }
        }
    }
}
