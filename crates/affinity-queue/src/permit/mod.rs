//! Slot pool for exclusive job affinity.
//!
//! - [`AffinityManager`] owns the N slots and implements the bounded scan.
//! - [`SlotPermit`] is the scoped hold on a granted slot (released on drop).
//! - [`SlotInfo`] is the read-only per-slot view used by status reporting.

mod lease;
mod pool;
mod slot;

pub use lease::SlotPermit;
pub use pool::{
    Acquisition, AffinityManager, DEFAULT_ACQUISITION_TIMEOUT, DEFAULT_SCAN_INTERVAL,
    DenialReason, SlotError,
};
pub use slot::{SlotId, SlotInfo};

pub(crate) use pool::utilization;
