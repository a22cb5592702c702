//! Data structures used throughout the controller.
//!
//! A [`PodRecord`] is what the inventory tells us about one pod at one
//! observation.  A [`MembershipSnapshot`] is the full set of pods
//! considered live at a point in time, keyed by pod name.  The
//! reconciliation loop only ever compares whole snapshots, so duplicated
//! or reordered watch notifications never reach the sinks.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::net::IpAddr;

use log::warn;
use serde::{Deserialize, Serialize};

/// One pod as captured by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    pub name: String,
    pub namespace: String,
    pub address: IpAddr,
    pub ready: bool,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PodRecord {
    /// Inventory-wide identity; pod names are only unique per namespace.
    pub fn key(&self) -> PodKey {
        PodKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodKey {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for PodKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A change notification coming out of a pod inventory.
///
/// `Removed` is also sent when a pod still exists but can no longer be
/// published (lost its address, entered a terminal phase).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodEvent {
    Upsert(PodRecord),
    Removed(PodKey),
}

/// All pods considered live at one instant, keyed by lowercased name.
/// DNS names are case-insensitive, so `Web` and `web` are the same member.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pods: BTreeMap<String, PodRecord>,
}

impl MembershipSnapshot {
    /// Builds a snapshot, dropping name collisions.  When two namespaces
    /// carry the same pod name the one sorting first by `(namespace, name)`
    /// is kept.
    pub fn from_records(records: impl IntoIterator<Item = PodRecord>) -> Self {
        let mut sorted: Vec<PodRecord> = records.into_iter().collect();
        sorted.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut pods = BTreeMap::new();
        for record in sorted {
            match pods.entry(record.name.to_ascii_lowercase()) {
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
                Entry::Occupied(existing) => {
                    let kept: &PodRecord = existing.get();
                    warn!(
                        "Pod name collision for {}: keeping {}, ignoring {}",
                        record.name,
                        kept.key(),
                        record.key()
                    );
                }
            }
        }
        Self { pods }
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&PodRecord> {
        self.pods.get(&name.to_ascii_lowercase())
    }

    /// Records ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = &PodRecord> {
        self.pods.values()
    }

    /// Address-level difference from `previous` to `self`.
    ///
    /// A pod whose address changed shows up in both lists so the old
    /// record is withdrawn before the new one is published.  Label and
    /// readiness changes alone do not produce a diff: they are invisible
    /// in DNS.
    pub fn diff(&self, previous: &MembershipSnapshot) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();

        for (name, old) in &previous.pods {
            match self.pods.get(name) {
                Some(new) if new.address == old.address => {}
                _ => diff.to_remove.push(old.clone()),
            }
        }
        for (name, new) in &self.pods {
            match previous.pods.get(name) {
                Some(old) if old.address == new.address => {}
                _ => diff.to_add.push(new.clone()),
            }
        }
        diff
    }
}

/// Result of [`MembershipSnapshot::diff`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub to_add: Vec<PodRecord>,
    pub to_remove: Vec<PodRecord>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// A snapshot stamped by the observer.  Versions only ever increase, so a
/// retry scheduled for an older version is known to be obsolete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedSnapshot {
    pub version: u64,
    pub snapshot: MembershipSnapshot,
}
