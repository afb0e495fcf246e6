//! Resumable download support.
//!
//! When a transfer dies mid-stream and the server advertised byte
//! ranges plus a validator, the bytes received so far are parked in a
//! process-wide store. The next attempt for the same URL sends
//! `Range`/`If-Range`; a `206 Partial Content` answer confirms the
//! parked prefix is still valid, a `200 OK` means the resource changed
//! and the prefix must be discarded.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::loader::DataResponse;

/// Bytes of an interrupted transfer plus the validator that guards
/// their reuse.
#[derive(Debug, Clone)]
pub struct ResumableData {
    /// `ETag` or `Last-Modified` value of the interrupted response
    pub validator: String,
    /// The bytes received before the interruption
    pub data: Bytes,
}

impl ResumableData {
    /// Capture resumable state from an interrupted transfer, when the
    /// protocol allows it: a byte-ranged server, a validator, and at
    /// least one received byte.
    pub fn new(response: &DataResponse, data: Bytes) -> Option<Self> {
        if data.is_empty() {
            return None;
        }
        let accepts_ranges = response
            .header("Accept-Ranges")
            .is_some_and(|value| value.eq_ignore_ascii_case("bytes"));
        if !accepts_ranges {
            return None;
        }
        let validator = response
            .header("ETag")
            .or_else(|| response.header("Last-Modified"))?;
        Some(Self {
            validator: validator.to_string(),
            data,
        })
    }

    /// Header fields to request continuation of this transfer.
    pub fn resume_headers(&self) -> Vec<(String, String)> {
        vec![
            ("Range".to_string(), format!("bytes={}-", self.data.len())),
            ("If-Range".to_string(), self.validator.clone()),
        ]
    }

    /// Whether the server honored the range request: only a `206`
    /// means the parked prefix may be kept.
    pub fn is_resumed(response: &DataResponse) -> bool {
        response.status_code == 206
    }
}

const STORE_CAPACITY: usize = 32;

/// Process-wide registry of interrupted transfers, bounded to the most
/// recent [`STORE_CAPACITY`] URLs.
pub struct ResumableDataStore {
    state: Mutex<StoreState>,
}

struct StoreState {
    entries: HashMap<String, (u64, ResumableData)>,
    next_stamp: u64,
}

impl ResumableDataStore {
    fn new() -> Self {
        Self {
            state: Mutex::new(StoreState {
                entries: HashMap::new(),
                next_stamp: 0,
            }),
        }
    }

    /// The process-wide store.
    pub fn shared() -> &'static ResumableDataStore {
        static SHARED: Lazy<ResumableDataStore> = Lazy::new(ResumableDataStore::new);
        &SHARED
    }

    /// Park resumable data for `url`, evicting the oldest entry when
    /// full.
    pub fn store(&self, url: &str, data: ResumableData) {
        let mut state = self.state.lock().unwrap();
        let stamp = state.next_stamp;
        state.next_stamp += 1;
        log::debug!(
            "resumable store: parking {} bytes for {}",
            data.data.len(),
            url
        );
        state.entries.insert(url.to_string(), (stamp, data));
        if state.entries.len() > STORE_CAPACITY {
            if let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, (stamp, _))| *stamp)
                .map(|(key, _)| key.clone())
            {
                state.entries.remove(&oldest);
            }
        }
    }

    /// Claim the parked data for `url`, removing it from the store.
    pub fn take(&self, url: &str) -> Option<ResumableData> {
        let mut state = self.state.lock().unwrap();
        state.entries.remove(url).map(|(_, data)| data)
    }

    /// Drop every entry (used by tests).
    pub fn remove_all(&self) {
        self.state.lock().unwrap().entries.clear();
    }

    /// Number of parked transfers.
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }
}
