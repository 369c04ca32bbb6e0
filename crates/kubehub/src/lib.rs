//! kvsync kubehub: the `ConsulKV` custom resource and the narrow set of
//! reads/writes the controller performs on it.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Marker that holds deletion until store keys are cleaned up.
pub const FINALIZER: &str = "consul.panw.com/finalizer";
/// Annotation carrying the last applied `spec.keys` blob.
pub const LAST_DATA_ANNOTATION: &str = "lastData";

/// Desired store content for one resource.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "consul.panw.com",
    version = "v1alpha1",
    kind = "ConsulKV",
    plural = "consulkvs",
    shortname = "ckv",
    namespaced,
    status = "ConsulKVStatus"
)]
pub struct ConsulKVSpec {
    /// Nested YAML document; every leaf becomes one store key.
    #[serde(default)]
    pub keys: String,
}

/// Observed state written by the controller after each sync.
///
/// Fields are always serialized so a merge patch clears stale values.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsulKVStatus {
    #[serde(default)]
    pub consul_server: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub last_synced: String,
}

pub fn has_finalizer(obj: &ConsulKV) -> bool { obj.finalizers().iter().any(|f| f == FINALIZER) }

pub fn is_deleting(obj: &ConsulKV) -> bool { obj.metadata.deletion_timestamp.is_some() }

/// Namespace + name of one resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn of(obj: &ConsulKV) -> Self {
        Self { namespace: obj.namespace(), name: obj.name_any() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("kube api: {0}")]
    Kube(#[from] kube::Error),
    #[error("{key} not found")]
    NotFound { key: String },
    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },
    #[error("write rejected for {key}")]
    Rejected { key: String },
}

/// Resource reads and writes used by one reconciliation.
#[async_trait::async_trait]
pub trait ResourceApi: Send + Sync {
    /// Fetch the current object, `None` when it no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<ConsulKV>, ResourceError>;

    /// Replace the finalizer list, guarded by the object's resourceVersion.
    async fn set_finalizers(&self, obj: &ConsulKV, finalizers: Vec<String>) -> Result<(), ResourceError>;

    async fn patch_status(&self, obj: &ConsulKV, status: &ConsulKVStatus) -> Result<(), ResourceError>;

    async fn annotate(&self, obj: &ConsulKV, name: &str, value: &str) -> Result<(), ResourceError>;
}

// ---- kube ----

/// `ResourceApi` backed by the Kubernetes API server (merge patches).
pub struct KubeResources {
    client: Client,
}

impl KubeResources {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> Result<Self, ResourceError> {
        Ok(Self::new(Client::try_default().await?))
    }

    fn api(&self, namespace: Option<&str>) -> Api<ConsulKV> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::default_namespaced(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl ResourceApi for KubeResources {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ConsulKV>, ResourceError> {
        Ok(self.api(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn set_finalizers(&self, obj: &ConsulKV, finalizers: Vec<String>) -> Result<(), ResourceError> {
        let mut meta = serde_json::Map::new();
        meta.insert("finalizers".into(), json!(finalizers));
        if let Some(rv) = obj.resource_version() {
            meta.insert("resourceVersion".into(), json!(rv));
        }
        let patch = json!({ "metadata": meta });
        let api = self.api(obj.namespace().as_deref());
        api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        debug!(resource = %ObjectKey::of(obj), ?finalizers, "finalizers updated");
        Ok(())
    }

    async fn patch_status(&self, obj: &ConsulKV, status: &ConsulKVStatus) -> Result<(), ResourceError> {
        let patch = json!({ "status": status });
        let api = self.api(obj.namespace().as_deref());
        api.patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn annotate(&self, obj: &ConsulKV, name: &str, value: &str) -> Result<(), ResourceError> {
        let patch = json!({ "metadata": { "annotations": { name: value } } });
        let api = self.api(obj.namespace().as_deref());
        api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }
}

// ---- in-memory ----

#[derive(Default)]
struct MemoryInner {
    objects: BTreeMap<ObjectKey, ConsulKV>,
    next_rv: u64,
    writes: usize,
    reject_writes: bool,
}

impl MemoryInner {
    fn bump(&mut self, obj: &mut ConsulKV) {
        self.next_rv += 1;
        obj.metadata.resource_version = Some(self.next_rv.to_string());
    }

    fn writable(&mut self, obj: &ConsulKV) -> Result<(ObjectKey, &mut ConsulKV), ResourceError> {
        let key = ObjectKey::of(obj);
        if self.reject_writes {
            return Err(ResourceError::Rejected { key: key.to_string() });
        }
        self.writes += 1;
        match self.objects.get_mut(&key) {
            Some(stored) => Ok((key, stored)),
            None => Err(ResourceError::NotFound { key: key.to_string() }),
        }
    }
}

/// In-process `ResourceApi` that mimics the API server's handling of
/// finalizers: an object marked for deletion disappears once its finalizer
/// list is empty.
#[derive(Default)]
pub struct MemoryResources {
    inner: Mutex<MemoryInner>,
}

impl MemoryResources {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create or replace an object as a user would.
    pub fn insert(&self, mut obj: ConsulKV) -> ObjectKey {
        let key = ObjectKey::of(&obj);
        let mut inner = self.lock();
        inner.bump(&mut obj);
        inner.objects.insert(key.clone(), obj);
        key
    }

    pub fn object(&self, key: &ObjectKey) -> Option<ConsulKV> { self.lock().objects.get(key).cloned() }

    /// Replace `spec.keys` of an existing object.
    pub fn edit_keys(&self, key: &ObjectKey, keys: &str) -> bool {
        let mut inner = self.lock();
        let Some(mut obj) = inner.objects.remove(key) else { return false };
        obj.spec.keys = keys.to_string();
        inner.bump(&mut obj);
        inner.objects.insert(key.clone(), obj);
        true
    }

    /// Request deletion. Returns true when the object is gone right away
    /// (no finalizers).
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let mut inner = self.lock();
        let Some(mut obj) = inner.objects.remove(key) else { return true };
        if obj.finalizers().is_empty() {
            return true;
        }
        if obj.metadata.deletion_timestamp.is_none() {
            obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        inner.bump(&mut obj);
        inner.objects.insert(key.clone(), obj);
        false
    }

    /// Number of write calls received, rejected ones included.
    pub fn writes(&self) -> usize { self.lock().writes }

    pub fn reject_writes(&self, on: bool) { self.lock().reject_writes = on; }
}

#[async_trait::async_trait]
impl ResourceApi for MemoryResources {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ConsulKV>, ResourceError> {
        Ok(self.lock().objects.get(key).cloned())
    }

    async fn set_finalizers(&self, obj: &ConsulKV, finalizers: Vec<String>) -> Result<(), ResourceError> {
        let mut inner = self.lock();
        let (key, stored) = inner.writable(obj)?;
        if stored.resource_version() != obj.resource_version() {
            return Err(ResourceError::Conflict {
                key: key.to_string(),
                reason: "resourceVersion changed".to_string(),
            });
        }
        stored.metadata.finalizers = if finalizers.is_empty() { None } else { Some(finalizers) };
        let released = is_deleting(stored) && stored.finalizers().is_empty();
        if released {
            inner.objects.remove(&key);
            return Ok(());
        }
        let mut updated = stored.clone();
        inner.bump(&mut updated);
        inner.objects.insert(key, updated);
        Ok(())
    }

    async fn patch_status(&self, obj: &ConsulKV, status: &ConsulKVStatus) -> Result<(), ResourceError> {
        let mut inner = self.lock();
        let (key, stored) = inner.writable(obj)?;
        let mut updated = stored.clone();
        updated.status = Some(status.clone());
        inner.bump(&mut updated);
        inner.objects.insert(key, updated);
        Ok(())
    }

    async fn annotate(&self, obj: &ConsulKV, name: &str, value: &str) -> Result<(), ResourceError> {
        let mut inner = self.lock();
        let (key, stored) = inner.writable(obj)?;
        let mut updated = stored.clone();
        updated.annotations_mut().insert(name.to_string(), value.to_string());
        inner.bump(&mut updated);
        inner.objects.insert(key, updated);
        Ok(())
    }
}
