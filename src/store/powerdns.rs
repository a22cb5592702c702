//! PowerDNS authoritative server, driven through its HTTP API.
//!
//! A zone `PATCH` carrying several rrsets is applied by PowerDNS in one
//! database transaction, so the whole reconciliation diff is committed
//! atomically.  Records written here carry an rrset comment whose account
//! is [`OWNER_ACCOUNT`]; rrsets without it belong to someone else and are
//! never read back as baseline nor deleted.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{DnsRecord, RecordChange, RecordStore};
use crate::config::StoreConfig;
use crate::error::StoreError;

pub const OWNER_ACCOUNT: &str = "podpeer";
const OWNER_COMMENT: &str = "managed by podpeer";

pub struct PowerDnsStore {
    client: Client,
    server_url: String,
    zone: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ZonePatch {
    rrsets: Vec<RrSetChange>,
}

#[derive(Debug, Serialize)]
struct RrSetChange {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    changetype: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    records: Vec<RecordContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    comments: Vec<Comment>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordContent {
    content: String,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Comment {
    content: String,
    #[serde(default)]
    account: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    #[serde(default)]
    rrsets: Vec<RrSet>,
}

#[derive(Debug, Deserialize)]
struct RrSet {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    ttl: u32,
    #[serde(default)]
    records: Vec<RecordContent>,
    #[serde(default)]
    comments: Vec<Comment>,
}

impl PowerDnsStore {
    pub fn new(cfg: &StoreConfig, call_timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder()
            .timeout(call_timeout)
            .danger_accept_invalid_certs(!cfg.verify_tls)
            .build()
            .map_err(|e| StoreError::PermanentRejection(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            server_url: format!(
                "{}/api/v1/servers/{}",
                cfg.api_url.trim_end_matches('/'),
                cfg.server_id
            ),
            zone: canonical_zone(&cfg.zone),
            api_key: cfg.api_key.clone(),
        })
    }

    fn zone_url(&self) -> String {
        format!("{}/zones/{}", self.server_url, self.zone)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, StoreError> {
        let resp = self
            .client
            .get(url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

#[async_trait]
impl RecordStore for PowerDnsStore {
    fn supports_transactions(&self) -> bool {
        true
    }

    async fn check_ready(&self) -> Result<(), StoreError> {
        self.get(&self.server_url).await?;
        match self.get(&self.zone_url()).await {
            Ok(_) => Ok(()),
            Err(StoreError::SchemaInvalid(detail)) => Err(StoreError::SchemaInvalid(format!(
                "zone {} not found: {}",
                self.zone, detail
            ))),
            Err(e) => Err(e),
        }
    }

    async fn records(&self) -> Result<Vec<DnsRecord>, StoreError> {
        let zone: Zone = self.get(&self.zone_url()).await?.json().await?;
        Ok(owned_records(zone))
    }

    async fn commit(&self, changes: &[RecordChange]) -> Result<(), StoreError> {
        let patch = build_patch(changes);
        if patch.rrsets.is_empty() {
            return Ok(());
        }
        debug!("PATCH {} with {} rrsets", self.zone_url(), patch.rrsets.len());

        let resp = self
            .client
            .patch(self.zone_url())
            .header("X-API-Key", &self.api_key)
            .json(&patch)
            .send()
            .await?;
        if resp.status().is_success() {
            return Ok(());
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        // Deleting something that is already gone is the desired outcome.
        let only_deletes = changes.iter().all(|c| matches!(c, RecordChange::Remove(_)));
        if status.is_client_error() && only_deletes && body.to_lowercase().contains("not found") {
            return Ok(());
        }
        Err(classify(status, &body))
    }
}

fn canonical_zone(zone: &str) -> String {
    format!("{}.", zone.trim_end_matches('.'))
}

fn classify(status: StatusCode, body: &str) -> StoreError {
    let detail = format!("{}: {}", status, body.trim());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        StoreError::Transient(detail)
    } else if status == StatusCode::NOT_FOUND || status == StatusCode::UNPROCESSABLE_ENTITY {
        StoreError::SchemaInvalid(detail)
    } else {
        StoreError::PermanentRejection(detail)
    }
}

/// Removals first, then additions.  PowerDNS rejects a patch naming the
/// same rrset twice, so a removal whose rrset is re-added is dropped: the
/// `REPLACE` already swaps it atomically.
fn build_patch(changes: &[RecordChange]) -> ZonePatch {
    let upserts: Vec<&DnsRecord> = changes
        .iter()
        .filter_map(|c| match c {
            RecordChange::Upsert(r) => Some(r),
            RecordChange::Remove(_) => None,
        })
        .collect();

    let mut rrsets: Vec<RrSetChange> = Vec::new();
    for change in changes {
        if let RecordChange::Remove(old) = change {
            let replaced = upserts.iter().any(|new| new.same_rrset(old));
            let duplicate = rrsets
                .iter()
                .any(|c| c.name == old.name && c.kind == old.kind().to_string());
            if !replaced && !duplicate {
                rrsets.push(RrSetChange {
                    name: old.name.clone(),
                    kind: old.kind().to_string(),
                    changetype: "DELETE",
                    ttl: None,
                    records: Vec::new(),
                    comments: Vec::new(),
                });
            }
        }
    }
    for new in upserts {
        rrsets.push(RrSetChange {
            name: new.name.clone(),
            kind: new.kind().to_string(),
            changetype: "REPLACE",
            ttl: Some(new.ttl),
            records: vec![RecordContent {
                content: new.address.to_string(),
                disabled: false,
            }],
            comments: vec![Comment {
                content: OWNER_COMMENT.to_string(),
                account: OWNER_ACCOUNT.to_string(),
            }],
        });
    }
    ZonePatch { rrsets }
}

fn owned_records(zone: Zone) -> Vec<DnsRecord> {
    let mut records = Vec::new();
    for rrset in zone.rrsets {
        if rrset.kind != "A" && rrset.kind != "AAAA" {
            continue;
        }
        if !rrset.comments.iter().any(|c| c.account == OWNER_ACCOUNT) {
            continue;
        }
        for content in rrset.records.iter().filter(|r| !r.disabled) {
            if let Ok(address) = content.content.parse::<IpAddr>() {
                records.push(DnsRecord {
                    name: rrset.name.clone(),
                    address,
                    ttl: rrset.ttl,
                });
            }
        }
    }
    records
}
