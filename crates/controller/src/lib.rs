//! kvsync controller: one reconciliation of a `ConsulKV` resource, plus the
//! kube-runtime wiring that invokes it.
//!
//! A cycle loads the resource and branches on deletion intent:
//!
//! - gone: nothing to do.
//! - deleting with our finalizer: delete its keys from the store, then drop the finalizer.
//!   An unparseable `spec.keys` falls back to the keys recorded in `status.keys`.
//! - otherwise: make sure the finalizer is persisted, sync the keys, write
//!   status and the `lastData` annotation, and ask to be requeued.
//!
//! The dispatcher guarantees at most one cycle per resource at a time, so the
//! controller holds no locks of its own.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher, Controller},
    Client, ResourceExt,
};
use kvsync_apply::{FinalizeReport, SyncReport};
use kvsync_core::{flatten, parse_document, FlatKeySet, ParseError, ParseLimits};
use kvsync_kubehub::{
    has_finalizer, is_deleting, ConsulKV, ConsulKVStatus, ObjectKey, ResourceApi, ResourceError, FINALIZER,
    LAST_DATA_ANNOTATION,
};
use kvsync_store::StoreClient;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Delay before the next cycle after a successful sync.
    pub requeue_after: Duration,
    /// Delay before retrying a cycle that returned an error.
    pub error_requeue_after: Duration,
    pub limits: ParseLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            requeue_after: Duration::from_secs(60),
            error_requeue_after: Duration::from_secs(5),
            limits: ParseLimits::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("loading {key}: {source}")]
    Load { key: ObjectKey, source: ResourceError },
    #[error("persisting {what} of {key}: {source}")]
    Persist { key: ObjectKey, what: &'static str, source: ResourceError },
    #[error("parsing spec.keys of {key}: {source}")]
    Parse { key: ObjectKey, source: ParseError },
    #[error("finalizing {key}: {} key(s) failed, {} skipped", .report.failures.len(), .report.skipped.len())]
    Finalize { key: ObjectKey, report: FinalizeReport },
}

/// Where a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The resource no longer exists.
    Missing,
    /// Deletion is pending but our finalizer is already gone.
    Released,
    Finalized(FinalizeReport),
    Synced(SyncReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub step: Step,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn done(step: Step) -> Self { Self { step, requeue_after: None } }
}

/// `lastSynced` text, e.g. `Friday, 16-Oct-26 09:30:00 UTC`.
pub fn format_last_synced(at: DateTime<Utc>) -> String {
    at.format("%A, %d-%b-%y %H:%M:%S UTC").to_string()
}

pub struct ReconcileController {
    resources: Arc<dyn ResourceApi>,
    store: Arc<dyn StoreClient>,
    config: ControllerConfig,
}

impl ReconcileController {
    pub fn new(resources: Arc<dyn ResourceApi>, store: Arc<dyn StoreClient>, config: ControllerConfig) -> Self {
        Self { resources, store, config }
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Run one cycle for `key`.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        let started = Instant::now();
        counter!("kvsync_reconcile_total", 1u64);
        let res = self.cycle(key).await;
        histogram!("kvsync_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("kvsync_reconcile_errors_total", 1u64);
        }
        res
    }

    async fn cycle(&self, key: &ObjectKey) -> Result<ReconcileOutcome, ReconcileError> {
        info!(resource = %key, "reconciling");
        let loaded = self
            .resources
            .get(key)
            .await
            .map_err(|source| ReconcileError::Load { key: key.clone(), source })?;
        let Some(obj) = loaded else {
            info!(resource = %key, "resource not found; assuming it was deleted");
            return Ok(ReconcileOutcome::done(Step::Missing));
        };

        if is_deleting(&obj) {
            if !has_finalizer(&obj) {
                debug!(resource = %key, "deletion pending without our finalizer");
                return Ok(ReconcileOutcome::done(Step::Released));
            }
            return self.finalize(key, &obj).await;
        }

        // Persist the finalizer before touching the store, so a crash after
        // this point still leaves cleanup pending.
        if !has_finalizer(&obj) {
            let mut finalizers = obj.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.resources
                .set_finalizers(&obj, finalizers)
                .await
                .map_err(|source| ReconcileError::Persist { key: key.clone(), what: "finalizer", source })?;
            info!(resource = %key, "finalizer added");
        }

        let desired = self.desired(key, &obj)?;
        let report = kvsync_apply::sync(&desired, self.store.as_ref()).await;
        if report.is_clean() {
            info!(resource = %key, keys = desired.len(), writes = report.writes, "all keys reconciled");
        } else {
            warn!(
                resource = %key,
                failed = report.failures.len(),
                skipped = report.skipped.len(),
                "sync finished with errors; next cycle retries"
            );
        }

        let status = ConsulKVStatus {
            consul_server: self.store.identity(),
            keys: report.synced.clone(),
            last_synced: format_last_synced(Utc::now()),
        };
        self.resources
            .patch_status(&obj, &status)
            .await
            .map_err(|source| ReconcileError::Persist { key: key.clone(), what: "status", source })?;

        if obj.annotations().get(LAST_DATA_ANNOTATION) != Some(&obj.spec.keys) {
            self.resources
                .annotate(&obj, LAST_DATA_ANNOTATION, &obj.spec.keys)
                .await
                .map_err(|source| ReconcileError::Persist { key: key.clone(), what: "annotation", source })?;
        }

        Ok(ReconcileOutcome { step: Step::Synced(report), requeue_after: Some(self.config.requeue_after) })
    }

    /// Delete the resource's keys, then release the finalizer. When `spec.keys`
    /// no longer parses, the keys last recorded in `status.keys` are deleted
    /// instead; those are the only keys this controller confirmed writing.
    async fn finalize(&self, key: &ObjectKey, obj: &ConsulKV) -> Result<ReconcileOutcome, ReconcileError> {
        info!(resource = %key, "delete requested; removing keys from store");
        let keys = match self.desired(key, obj) {
            Ok(keys) => keys,
            Err(ReconcileError::Parse { .. }) => {
                let recorded = obj.status.as_ref().map(|s| s.keys.clone()).unwrap_or_default();
                warn!(resource = %key, keys = recorded.len(), "spec.keys unparseable; deleting the keys recorded in status");
                recorded.into_iter().map(|path| (path, String::new())).collect()
            }
            Err(e) => return Err(e),
        };
        let report = kvsync_apply::finalize(&keys, self.store.as_ref()).await;
        if !report.is_complete() {
            warn!(resource = %key, failed = report.failures.len(), skipped = report.skipped.len(), "finalization incomplete; keeping finalizer");
            return Err(ReconcileError::Finalize { key: key.clone(), report });
        }

        let remaining: Vec<String> = obj.finalizers().iter().filter(|f| *f != FINALIZER).cloned().collect();
        self.resources
            .set_finalizers(obj, remaining)
            .await
            .map_err(|source| ReconcileError::Persist { key: key.clone(), what: "finalizer removal", source })?;
        info!(resource = %key, deleted = report.deleted.len(), "finalized");
        Ok(ReconcileOutcome::done(Step::Finalized(report)))
    }

    fn desired(&self, key: &ObjectKey, obj: &ConsulKV) -> Result<FlatKeySet, ReconcileError> {
        match parse_document(&obj.spec.keys, &self.config.limits) {
            Ok(doc) => Ok(flatten(&doc)),
            Err(source) => {
                error!(resource = %key, error = %source, "spec.keys is not a valid document");
                Err(ReconcileError::Parse { key: key.clone(), source })
            }
        }
    }
}

// ---- kube-runtime wiring ----

async fn reconcile(obj: Arc<ConsulKV>, ctl: Arc<ReconcileController>) -> Result<Action, ReconcileError> {
    let outcome = ctl.reconcile(&ObjectKey::of(&obj)).await?;
    Ok(match outcome.requeue_after {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(obj: Arc<ConsulKV>, err: &ReconcileError, ctl: Arc<ReconcileController>) -> Action {
    error!(resource = %ObjectKey::of(&obj), error = %err, "reconcile failed; retrying");
    Action::requeue(ctl.config().error_requeue_after)
}

/// Watch `ConsulKV` objects (all namespaces unless `namespace` is set) and
/// drive `controller` until a shutdown signal arrives.
pub async fn run(client: Client, controller: Arc<ReconcileController>, namespace: Option<String>) {
    let api: Api<ConsulKV> = match namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    info!(ns = ?namespace, "controller started");
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, controller)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(resource = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "reconcile dispatch failed"),
            }
        })
        .await;
    info!("controller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn last_synced_uses_rfc850_layout() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 9, 30, 0).unwrap();
        assert_eq!(format_last_synced(at), "Friday, 16-Oct-26 09:30:00 UTC");
    }

    #[test]
    fn default_config_requeues_every_minute() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.requeue_after, Duration::from_secs(60));
        assert!(cfg.error_requeue_after < cfg.requeue_after);
    }
}
