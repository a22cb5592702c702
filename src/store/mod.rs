//! Persistent record store seam.
//!
//! The reconciler never talks to the DNS backend directly: it goes through
//! [`crate::adapter::RecordStoreAdapter`], which in turn drives a
//! [`RecordStore`].  The only production store is the PowerDNS HTTP API.

use std::net::IpAddr;

use async_trait::async_trait;
use hickory_server::proto::rr::RecordType;
use serde::Serialize;

use crate::error::StoreError;

pub mod powerdns;
pub use powerdns::PowerDnsStore;

/// A single address record owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsRecord {
    /// Fully qualified, with the trailing dot.
    pub name: String,
    pub address: IpAddr,
    pub ttl: u32,
}

impl DnsRecord {
    pub fn kind(&self) -> RecordType {
        match self.address {
            IpAddr::V4(_) => RecordType::A,
            IpAddr::V6(_) => RecordType::AAAA,
        }
    }

    /// Same name and record type.
    pub fn same_rrset(&self, other: &DnsRecord) -> bool {
        self.name == other.name && self.kind() == other.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    Remove(DnsRecord),
    Upsert(DnsRecord),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Whether [`RecordStore::commit`] applies a batch all-or-nothing.
    fn supports_transactions(&self) -> bool;

    /// Cheap readiness check: reachable and schema (zone) present.
    async fn check_ready(&self) -> Result<(), StoreError>;

    /// Every record owned by the controller.
    async fn records(&self) -> Result<Vec<DnsRecord>, StoreError>;

    /// The stored record sharing `record`'s name and type, if any.
    async fn lookup(&self, record: &DnsRecord) -> Result<Option<DnsRecord>, StoreError> {
        Ok(self
            .records()
            .await?
            .into_iter()
            .find(|stored| stored.same_rrset(record)))
    }

    /// Applies `changes` in order.  Transactional stores apply all of them
    /// or none.
    async fn commit(&self, changes: &[RecordChange]) -> Result<(), StoreError>;
}
