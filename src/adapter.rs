//! Record store adapter.
//!
//! Maps pods to DNS names (`<prefix><pod>.<zone>`) and membership deltas
//! to store mutations.  A transactional store receives the whole delta as
//! one commit; otherwise removals are verified and applied one by one
//! before the additions.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use hickory_server::proto::rr::Name;
use log::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{DnsRecord, RecordChange, RecordStore};
use crate::types::{MembershipSnapshot, PodRecord};

pub struct RecordStoreAdapter {
    store: Arc<dyn RecordStore>,
    zone: String,
    prefix: String,
    ttl: u32,
}

impl RecordStoreAdapter {
    pub fn new(store: Arc<dyn RecordStore>, zone: &str, prefix: &str, ttl: u32) -> Self {
        Self {
            store,
            zone: format!("{}.", zone.trim_end_matches('.').to_ascii_lowercase()),
            prefix: prefix.to_ascii_lowercase(),
            ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// DNS name for a pod, or `None` if it would not be a valid name.
    pub fn fqdn_for(&self, pod_name: &str) -> Option<String> {
        let label = format!("{}{}", self.prefix, pod_name.to_ascii_lowercase());
        let fqdn = format!("{}.{}", label.trim_matches('.'), self.zone);
        match Name::from_ascii(&fqdn) {
            Ok(name) if name.is_fqdn() && name.num_labels() > 0 => Some(fqdn),
            _ => {
                warn!("Pod {} does not map to a valid DNS name ({})", pod_name, fqdn);
                None
            }
        }
    }

    /// Inverse of [`fqdn_for`](Self::fqdn_for); `None` for names outside
    /// the zone or prefix.
    pub fn pod_name_for(&self, fqdn: &str) -> Option<String> {
        let fqdn = fqdn.to_ascii_lowercase();
        let label = fqdn.strip_suffix(&self.zone)?.strip_suffix('.')?;
        let pod = label.strip_prefix(self.prefix.trim_start_matches('.'))?;
        if pod.is_empty() {
            None
        } else {
            Some(pod.to_string())
        }
    }

    pub fn record_for(&self, pod: &PodRecord) -> Option<DnsRecord> {
        Some(DnsRecord {
            name: self.fqdn_for(&pod.name)?,
            address: pod.address,
            ttl: self.ttl,
        })
    }

    /// What the store currently publishes, as a membership snapshot.  Used
    /// as the diff baseline after a restart and on every periodic resync.
    ///
    /// An owned name carrying more than one address of a family was not
    /// written by us.  It is reported with the unspecified address so the
    /// diff always replaces (or deletes) the whole rrset.
    pub async fn baseline(&self) -> Result<MembershipSnapshot, StoreError> {
        let mut rrsets: BTreeMap<(String, bool), Vec<IpAddr>> = BTreeMap::new();
        for record in self.store.records().await? {
            match self.pod_name_for(&record.name) {
                Some(name) => rrsets
                    .entry((name, record.address.is_ipv4()))
                    .or_default()
                    .push(record.address),
                None => debug!("Ignoring foreign record {}", record.name),
            }
        }

        let pods = rrsets.into_iter().map(|((name, ipv4), addresses)| {
            let address = match addresses.as_slice() {
                [single] => *single,
                _ => {
                    warn!("{} holds {} addresses, rewriting it", name, addresses.len());
                    if ipv4 {
                        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                    } else {
                        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                    }
                }
            };
            PodRecord {
                name,
                namespace: String::new(),
                address,
                ready: true,
                labels: Default::default(),
            }
        });
        Ok(MembershipSnapshot::from_records(pods))
    }

    /// Withdraws `to_remove` and publishes `to_add`.
    pub async fn apply(&self, to_add: &[PodRecord], to_remove: &[PodRecord]) -> Result<(), StoreError> {
        let removals: Vec<DnsRecord> = to_remove.iter().filter_map(|p| self.record_for(p)).collect();
        let additions: Vec<DnsRecord> = to_add.iter().filter_map(|p| self.record_for(p)).collect();
        if removals.is_empty() && additions.is_empty() {
            return Ok(());
        }

        for old in &removals {
            info!("DNS remove {} {} {}", old.name, old.kind(), old.address);
        }
        for new in &additions {
            info!("DNS add {} {} {}", new.name, new.kind(), new.address);
        }

        if self.store.supports_transactions() {
            let changes: Vec<RecordChange> = removals
                .into_iter()
                .map(RecordChange::Remove)
                .chain(additions.into_iter().map(RecordChange::Upsert))
                .collect();
            return self.store.commit(&changes).await;
        }

        for old in removals {
            match self.store.lookup(&old).await? {
                Some(current) if current.address == old.address => {
                    self.store.commit(&[RecordChange::Remove(old)]).await?;
                }
                Some(current) => {
                    warn!(
                        "Leaving {} alone: expected {}, found {}",
                        old.name, old.address, current.address
                    );
                }
                None => debug!("{} already absent", old.name),
            }
        }
        for new in additions {
            self.store.commit(&[RecordChange::Upsert(new)]).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, MemoryStore};

    fn adapter(store: Arc<MemoryStore>, prefix: &str) -> RecordStoreAdapter {
        RecordStoreAdapter::new(store, "Example.com", prefix, 30)
    }

    fn record(name: &str, ip: &str) -> DnsRecord {
        DnsRecord {
            name: name.into(),
            address: ip.parse().unwrap(),
            ttl: 30,
        }
    }

    #[test]
    fn names_round_trip_through_prefix_and_zone() {
        let a = adapter(Arc::new(MemoryStore::new(true)), "pods.");
        assert_eq!(a.fqdn_for("peer-0").as_deref(), Some("pods.peer-0.example.com."));
        assert_eq!(a.pod_name_for("pods.peer-0.example.com.").as_deref(), Some("peer-0"));
        assert_eq!(a.pod_name_for("other.example.com."), None);
        assert_eq!(a.pod_name_for("pods.peer-0.example.org."), None);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let a = adapter(Arc::new(MemoryStore::new(true)), "");
        let too_long = "x".repeat(70);
        assert_eq!(a.fqdn_for(&too_long), None);
    }

    #[tokio::test]
    async fn transactional_store_gets_one_commit_removals_first() {
        let store = Arc::new(MemoryStore::new(true));
        let a = adapter(store.clone(), "");
        a.apply(&[pod("b", "10.0.0.3")], &[pod("b", "10.0.0.2")]).await.unwrap();

        let commits = store.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(
            commits[0],
            vec![
                RecordChange::Remove(record("b.example.com.", "10.0.0.2")),
                RecordChange::Upsert(record("b.example.com.", "10.0.0.3")),
            ]
        );
        assert_eq!(store.addresses()["b.example.com."].to_string(), "10.0.0.3");
    }

    #[tokio::test]
    async fn non_transactional_store_skips_repaired_records() {
        let store = Arc::new(MemoryStore::new(false));
        store.insert(record("a.example.com.", "10.0.0.1"));
        // Someone re-pointed b by hand since we last wrote it.
        store.insert(record("b.example.com.", "10.9.9.9"));
        let a = adapter(store.clone(), "");

        a.apply(&[], &[pod("a", "10.0.0.1"), pod("b", "10.0.0.2")]).await.unwrap();

        let left = store.addresses();
        assert!(!left.contains_key("a.example.com."));
        assert_eq!(left["b.example.com."].to_string(), "10.9.9.9");
    }

    #[tokio::test]
    async fn empty_delta_touches_nothing() {
        let store = Arc::new(MemoryStore::new(true));
        adapter(store.clone(), "").apply(&[], &[]).await.unwrap();
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn baseline_rebuilds_membership_from_store() {
        let store = Arc::new(MemoryStore::new(true));
        store.insert(record("a.example.com.", "10.0.0.1"));
        store.insert(record("b.example.com.", "fd00::2"));
        store.insert(record("www.example.org.", "192.0.2.1"));

        let base = adapter(store, "").baseline().await.unwrap();
        let pairs: Vec<_> = base.iter().map(|p| (p.name.clone(), p.address.to_string())).collect();
        assert_eq!(
            pairs,
            [("a".to_string(), "10.0.0.1".to_string()), ("b".to_string(), "fd00::2".to_string())]
        );
    }

    /// Reads back a fixed record list, as a store holding rrsets with
    /// several addresses would.
    struct FixedRecords(Vec<DnsRecord>);

    #[async_trait::async_trait]
    impl RecordStore for FixedRecords {
        fn supports_transactions(&self) -> bool {
            true
        }

        async fn check_ready(&self) -> Result<(), StoreError> {
            Ok(())
        }

        async fn records(&self) -> Result<Vec<DnsRecord>, StoreError> {
            Ok(self.0.clone())
        }

        async fn commit(&self, _changes: &[RecordChange]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn multi_address_rrset_is_always_drift() {
        let store = Arc::new(FixedRecords(vec![
            record("a.example.com.", "10.0.0.1"),
            record("a.example.com.", "10.0.0.9"),
            record("b.example.com.", "10.0.0.2"),
        ]));
        let base = RecordStoreAdapter::new(store, "example.com", "", 30).baseline().await.unwrap();

        assert_eq!(base.get("a").unwrap().address.to_string(), "0.0.0.0");
        assert_eq!(base.get("b").unwrap().address.to_string(), "10.0.0.2");

        // Desired state matching one of the stray addresses still rewrites a.
        let desired = MembershipSnapshot::from_records(vec![pod("a", "10.0.0.1"), pod("b", "10.0.0.2")]);
        let diff = desired.diff(&base);
        assert_eq!(diff.to_add, vec![pod("a", "10.0.0.1")]);
        assert_eq!(diff.to_remove.len(), 1);
        assert_eq!(diff.to_remove[0].name, "a");
    }

    #[tokio::test]
    async fn commit_errors_propagate() {
        let store = Arc::new(MemoryStore::new(true));
        store.fail_commits([StoreError::Transient("503".into())]);
        let err = adapter(store, "").apply(&[pod("a", "10.0.0.1")], &[]).await.unwrap_err();
        assert!(err.is_transient());
    }
}
