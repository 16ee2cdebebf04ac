//! Discovery ledger.
//!
//! Latest discovery record per address, snapshotted to disk after every
//! scan pass. Addresses missing from a later pass keep their last record;
//! `observed_at` shows how old it is.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::storage::{read_json, write_json_atomic, DiscoveryRecord, StoreError};

#[derive(Debug)]
pub struct DiscoveryLedger {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<IpAddr, DiscoveryRecord>>,
}

impl DiscoveryLedger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the ledger at `path`; a missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records: BTreeMap<IpAddr, DiscoveryRecord> = read_json(&path)?.unwrap_or_default();
        log::info!("LEDGER_OPENED path={} records={}", path.display(), records.len());
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Merge one scan pass, keeping the newer record per address.
    pub fn record_pass(&self, pass: &[DiscoveryRecord]) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let mut next = records.clone();
        for record in pass {
            let newer = next
                .get(&record.ip)
                .map_or(true, |existing| existing.observed_at <= record.observed_at);
            if newer {
                next.insert(record.ip, record.clone());
            }
        }

        if let Some(path) = &self.path {
            write_json_atomic(path, &next)?;
        }
        *records = next;
        log::debug!("LEDGER_UPDATED pass={} total={}", pass.len(), records.len());
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<IpAddr, DiscoveryRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
