//! Reconciliation engine. A pure diff of a scan report against known devices.
//!
//! # Invariants
//!
//! - Every MAC lands in at most one of `new`, `changed`, `offline`.
//! - Identical inputs yield an identical `ChangeSet`; every list is sorted
//!   by MAC and nothing depends on hash-map iteration order.
//! - No I/O, no clock reads.

use std::collections::BTreeMap;

use super::model::{ChangeSet, DeviceSnapshot, MacAddress};

/// Compute the change-set between the previously known devices of a scope and
/// a freshly completed report.
///
/// When a report mentions the same MAC more than once, the last entry wins.
pub fn diff(previous: &BTreeMap<MacAddress, DeviceSnapshot>, report: &[DeviceSnapshot]) -> ChangeSet {
    let observed: BTreeMap<&MacAddress, &DeviceSnapshot> =
        report.iter().map(|d| (&d.mac, d)).collect();

    let mut changes = ChangeSet::default();

    for (mac, seen) in &observed {
        match previous.get(*mac) {
            None => changes.new.push((*seen).clone()),
            Some(known) if known.differs_from(seen) => changes.changed.push((*seen).clone()),
            Some(_) => {}
        }
    }

    for (mac, known) in previous {
        if !observed.contains_key(mac) {
            changes.offline.push(known.clone());
        }
    }

    changes
}

/// Index a snapshot list by MAC (last entry wins).
pub fn index_by_mac(snapshots: impl IntoIterator<Item = DeviceSnapshot>) -> BTreeMap<MacAddress, DeviceSnapshot> {
    snapshots.into_iter().map(|d| (d.mac.clone(), d)).collect()
}
