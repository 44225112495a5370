//! `SetReconciler` (spec.md §4.2): a pure function diffing a desired relay
//! list against the current one, producing a `kept` list (existing
//! records preserved where possible) and a `to_free` list (records to tear
//! down).

use std::sync::Arc;

use crate::record::{relay_has_changed, DesiredRelay, RelayRecord};

pub struct ReconcileOutcome {
    pub kept: Vec<Arc<RelayRecord>>,
    pub to_free: Vec<Arc<RelayRecord>>,
}

/// For each entry in `desired`, look for a `current` record with the same
/// `local_mount`. If found and unchanged (`relay_has_changed` is false),
/// the existing record is kept — its worker handle and source slot survive
/// untouched, and `on_demand` is assimilated in place even if it differs.
/// Otherwise a fresh record is built from `desired`. Whatever is left over
/// in `current` after this pass becomes `to_free`.
///
/// Ordering is unspecified (spec.md §4.2 "not externally observable");
/// this implementation preserves `desired`'s order in `kept`.
pub fn reconcile(current: Vec<Arc<RelayRecord>>, desired: &[DesiredRelay]) -> ReconcileOutcome {
    let mut remaining = current;
    let mut kept = Vec::with_capacity(desired.len());
    let mut to_free = Vec::new();

    for d in desired {
        if let Some(pos) = remaining.iter().position(|r| r.local_mount == d.local_mount) {
            let existing = remaining.remove(pos);
            if relay_has_changed(d, &existing) {
                to_free.push(existing);
                kept.push(Arc::new(RelayRecord::from_desired(d)));
            } else {
                existing.set_on_demand(d.on_demand);
                existing.set_enabled(d.enabled);
                kept.push(existing);
            }
        } else {
            kept.push(Arc::new(RelayRecord::from_desired(d)));
        }
    }

    to_free.extend(remaining);
    ReconcileOutcome { kept, to_free }
}
