//! CPU placement for the computation thread.
//!
//! Emulation is one hot loop; pinning it keeps its caches warm and keeps the
//! scheduler from migrating it next to the controller's render thread. Core
//! IDs come from `core_affinity`. Pinning is best-effort: an unknown core or
//! a refusal from the OS leaves the thread unpinned.

use core_affinity::CoreId;

use crate::trace::{debug, warn};

/// Core IDs the current process may run on.
#[must_use]
pub fn available_cores() -> Vec<usize> {
    core_affinity::get_core_ids()
        .map(|ids| ids.into_iter().map(|id| id.id).collect())
        .unwrap_or_default()
}

/// Pins the calling thread to `core_id`.
///
/// Returns `true` if pinning succeeded.
pub fn pin_to_core(core_id: usize) -> bool {
    if !available_cores().contains(&core_id) {
        warn!(core_id, "core not available, leaving thread unpinned");
        return false;
    }
    let pinned = core_affinity::set_for_current(CoreId { id: core_id });
    if pinned {
        debug!(core_id, "computation thread pinned");
    } else {
        warn!(core_id, "failed to pin computation thread");
    }
    pinned
}
