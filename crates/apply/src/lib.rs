//! kvsync apply: the two passes that move the store toward a flattened document.
//!
//! `sync` writes only what is absent or drifted and never deletes.
//! `finalize` deletes every key of a document, used once the resource is going away.
//! Both are best-effort per key: a failing key is reported and the pass moves
//! on, except when the store is unreachable, which ends the pass early.

#![forbid(unsafe_code)]

use kvsync_core::FlatKeySet;
use kvsync_store::{StoreClient, StoreError};
use metrics::counter;
use tracing::{debug, info, trace, warn};

/// A key that hit a store error during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFailure {
    pub key: String,
    pub error: StoreError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Desired keys confirmed equal in the store after this pass, in order.
    pub synced: Vec<String>,
    /// Number of successful puts.
    pub writes: usize,
    pub failures: Vec<KeyFailure>,
    /// Keys never attempted because the store became unreachable.
    pub skipped: Vec<String>,
}

impl SyncReport {
    pub fn aborted(&self) -> bool { !self.skipped.is_empty() || self.failures.iter().any(|f| f.error.is_connection()) }
    pub fn is_clean(&self) -> bool { self.failures.is_empty() && self.skipped.is_empty() }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeReport {
    pub deleted: Vec<String>,
    pub failures: Vec<KeyFailure>,
    pub skipped: Vec<String>,
}

impl FinalizeReport {
    /// Every key was deleted (or already absent).
    pub fn is_complete(&self) -> bool { self.failures.is_empty() && self.skipped.is_empty() }
}

fn record_failure(failures: &mut Vec<KeyFailure>, key: &str, error: StoreError) {
    counter!("kvsync_key_errors_total", 1u64);
    failures.push(KeyFailure { key: key.to_string(), error });
}

/// Converge the store toward `desired`, one key at a time in flatten order.
///
/// A read error counts as "absent" so the key is still written; the error is
/// reported either way. Keys the store holds but `desired` lacks are left alone.
pub async fn sync(desired: &FlatKeySet, store: &dyn StoreClient) -> SyncReport {
    let mut report = SyncReport::default();
    let mut entries = desired.iter();
    while let Some(entry) = entries.next() {
        let key = entry.path.as_str();
        let current = match store.get(key).await {
            Ok(v) => v,
            Err(e) if e.is_connection() => {
                warn!(key, error = %e, "store unreachable; abandoning sync pass");
                record_failure(&mut report.failures, key, e);
                report.skipped = entries.map(|e| e.path.clone()).collect();
                break;
            }
            Err(e) => {
                warn!(key, error = %e, "read failed; writing desired value");
                record_failure(&mut report.failures, key, e);
                None
            }
        };

        match current {
            Some(cur) if cur == entry.value => {
                trace!(key, "in sync");
                report.synced.push(key.to_string());
                continue;
            }
            Some(cur) => {
                info!(key, "drift detected; repairing");
                debug!(key, store = %cur, desired = %entry.value, "drifted values");
            }
            None => debug!(key, "key absent; writing"),
        }

        match store.put(key, &entry.value).await {
            Ok(()) => {
                counter!("kvsync_store_puts_total", 1u64);
                report.writes += 1;
                report.synced.push(key.to_string());
            }
            Err(e) => {
                let unreachable = e.is_connection();
                warn!(key, error = %e, "write failed");
                record_failure(&mut report.failures, key, e);
                if unreachable {
                    report.skipped = entries.map(|e| e.path.clone()).collect();
                    break;
                }
            }
        }
    }
    report
}

/// Delete every key of `keys` from the store.
pub async fn finalize(keys: &FlatKeySet, store: &dyn StoreClient) -> FinalizeReport {
    let mut report = FinalizeReport::default();
    let mut paths = keys.paths();
    while let Some(key) = paths.next() {
        debug!(key, "deleting key");
        match store.delete(key).await {
            Ok(()) => {
                counter!("kvsync_store_deletes_total", 1u64);
                report.deleted.push(key.to_string());
            }
            Err(e) => {
                let unreachable = e.is_connection();
                warn!(key, error = %e, "delete failed");
                record_failure(&mut report.failures, key, e);
                if unreachable {
                    report.skipped = paths.map(str::to_string).collect();
                    break;
                }
            }
        }
    }
    report
}
