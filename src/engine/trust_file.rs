//! Trust-state file.
//!
//! Single writer for the published trust view. The snapshot is taken and
//! written under one lock, so files land in snapshot order and a slow
//! writer can never overwrite a newer view with an older one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::reconcile::TrustRecord;
use crate::storage::{read_json, write_json_atomic, StoreError};

pub type TrustState = BTreeMap<String, TrustRecord>;

#[derive(Debug)]
pub struct TrustStateFile {
    path: Option<PathBuf>,
    writer: Mutex<u64>,
}

impl TrustStateFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            writer: Mutex::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Compute the view with `snapshot` and write it, both under the writer lock.
    pub fn publish<F>(&self, snapshot: F) -> Result<TrustState, StoreError>
    where
        F: FnOnce() -> TrustState,
    {
        let mut generation = self.writer.lock();
        let state = snapshot();
        if let Some(path) = &self.path {
            write_json_atomic(path, &state)?;
        }
        *generation += 1;
        log::debug!("TRUST_STATE_PUBLISHED generation={} devices={}", *generation, state.len());
        Ok(state)
    }

    /// Last published view, empty before the first publish.
    pub fn load(&self) -> Result<TrustState, StoreError> {
        match &self.path {
            Some(path) => Ok(read_json(path)?.unwrap_or_default()),
            None => Ok(TrustState::new()),
        }
    }

    /// Number of views published by this process.
    pub fn generation(&self) -> u64 {
        *self.writer.lock()
    }
}
