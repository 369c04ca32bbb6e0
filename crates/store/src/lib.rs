//! kvsync store: the key/value store interface the sync loop talks to.
//!
//! `ConsulStore` speaks the Consul HTTP KV API. `MemoryStore` is an in-process
//! double with call counters and fault injection, used by tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use base64::Engine as _;
use metrics::histogram;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Store operation, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreOp {
    Get,
    Put,
    Delete,
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached at all; later calls are unlikely to fare better.
    #[error("store unreachable: {reason}")]
    Connection { reason: String },
    #[error("read {key}: {reason}")]
    Read { key: String, reason: String },
    #[error("write {key}: {reason}")]
    Write { key: String, reason: String },
    #[error("delete {key}: {reason}")]
    Delete { key: String, reason: String },
}

impl StoreError {
    pub fn is_connection(&self) -> bool { matches!(self, StoreError::Connection { .. }) }

    fn for_op(op: StoreOp, key: &str, reason: impl Into<String>) -> Self {
        let key = key.to_string();
        let reason = reason.into();
        match op {
            StoreOp::Get | StoreOp::List => StoreError::Read { key, reason },
            StoreOp::Put => StoreError::Write { key, reason },
            StoreOp::Delete => StoreError::Delete { key, reason },
        }
    }
}

/// Key/value store consumed by the sync loop. Every call is one round-trip
/// and may fail on its own.
#[async_trait::async_trait]
pub trait StoreClient: Send + Sync {
    /// Human-readable identity of the backing store (e.g. `host:port`).
    fn identity(&self) -> String;

    /// Current value for `key`, `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

// ---- configuration ----

/// Where and how to reach the store. Resolved once by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// ACL token sent as `X-Consul-Token`.
    pub token: Option<String>,
    pub datacenter: Option<String>,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8500,
            token: None,
            datacenter: None,
            timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }
}

// ---- Consul ----

fn is_addressable(key: &str) -> bool {
    !key.split('/').any(|seg| seg == "." || seg == "..")
}

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

/// Consul KV over HTTP (`/v1/kv/<key>`).
pub struct ConsulStore {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    datacenter: Option<String>,
    identity: String,
}

impl ConsulStore {
    pub fn new(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let base = Url::parse(&format!("{}://{}/v1/kv/", cfg.scheme, cfg.address()))
            .map_err(|e| StoreError::Connection { reason: format!("invalid store address {}: {}", cfg.address(), e) })?;
        let client = reqwest::Client::builder()
            .user_agent(concat!("kvsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1)))
            .build()
            .map_err(|e| StoreError::Connection { reason: format!("building http client: {}", e) })?;
        Ok(Self {
            client,
            base,
            token: cfg.token.clone(),
            datacenter: cfg.datacenter.clone(),
            identity: cfg.address(),
        })
    }

    /// Request URL for `key`. A `.` or `..` segment would be folded away by
    /// URL normalisation and address a different key, so it is refused.
    fn url(&self, op: StoreOp, key: &str, flag: Option<&str>) -> Result<Url, StoreError> {
        if !is_addressable(key) {
            return Err(StoreError::for_op(op, key, "key has a '.' or '..' segment, which HTTP cannot address"));
        }
        let mut url = self.base.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().extend(key.split('/'));
        }
        // Only touch the query when there is one; otherwise a bare `?` is left behind
        if flag.is_some() || self.datacenter.is_some() {
            let mut q = url.query_pairs_mut();
            if let Some(flag) = flag { q.append_pair(flag, "true"); }
            if let Some(dc) = &self.datacenter { q.append_pair("dc", dc); }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let rb = self.client.request(method, url);
        match &self.token {
            Some(t) => rb.header("X-Consul-Token", t),
            None => rb,
        }
    }

    async fn send(&self, op: StoreOp, key: &str, rb: RequestBuilder) -> Result<reqwest::Response, StoreError> {
        let started = Instant::now();
        let res = rb.send().await;
        histogram!("kvsync_store_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        res.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                StoreError::Connection { reason: e.to_string() }
            } else {
                StoreError::for_op(op, key, e.to_string())
            }
        })
    }
}

#[async_trait::async_trait]
impl StoreClient for ConsulStore {
    fn identity(&self) -> String { self.identity.clone() }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let rb = self.request(Method::GET, self.url(StoreOp::Get, key, Some("raw"))?);
        let resp = self.send(StoreOp::Get, key, rb).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp.bytes().await.map_err(|e| StoreError::for_op(StoreOp::Get, key, e.to_string()))?;
                Ok(Some(String::from_utf8_lossy(&body).into_owned()))
            }
            s => Err(StoreError::for_op(StoreOp::Get, key, format!("unexpected status {}", s))),
        }
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let rb = self.request(Method::PUT, self.url(StoreOp::Put, key, None)?).body(value.to_string());
        let resp = self.send(StoreOp::Put, key, rb).await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::for_op(StoreOp::Put, key, format!("unexpected status {}", status)));
        }
        // Consul answers `true` or `false`
        let body = resp.text().await.map_err(|e| StoreError::for_op(StoreOp::Put, key, e.to_string()))?;
        if body.trim() != "true" {
            return Err(StoreError::for_op(StoreOp::Put, key, "store rejected the write"));
        }
        trace!(key, "put ok");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if !is_addressable(key) {
            // Nothing can have been written under it over HTTP, so it is already absent
            warn!(key, "skipping delete of a key HTTP cannot address");
            return Ok(());
        }
        let rb = self.request(Method::DELETE, self.url(StoreOp::Delete, key, None)?);
        let resp = self.send(StoreOp::Delete, key, rb).await?;
        match resp.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => Err(StoreError::for_op(StoreOp::Delete, key, format!("unexpected status {}", s))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rb = self.request(Method::GET, self.url(StoreOp::List, prefix, Some("recurse"))?);
        let resp = self.send(StoreOp::List, prefix, rb).await?;
        match resp.status() {
            StatusCode::NOT_FOUND => return Ok(Vec::new()),
            s if s.is_success() => {}
            s => return Err(StoreError::for_op(StoreOp::List, prefix, format!("unexpected status {}", s))),
        }
        let pairs: Vec<KvPair> = resp.json().await.map_err(|e| StoreError::for_op(StoreOp::List, prefix, e.to_string()))?;
        let mut out = Vec::with_capacity(pairs.len());
        for p in pairs {
            let value = match p.value {
                Some(b64) => {
                    let raw = base64::engine::general_purpose::STANDARD
                        .decode(b64.as_bytes())
                        .map_err(|e| StoreError::for_op(StoreOp::List, &p.key, format!("decoding value: {}", e)))?;
                    String::from_utf8_lossy(&raw).into_owned()
                }
                None => String::new(),
            };
            out.push((p.key, value));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        debug!(prefix, count = out.len(), "listed keys");
        Ok(out)
    }
}

// ---- in-memory ----

/// Number of calls a `MemoryStore` has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub gets: usize,
    pub puts: usize,
    pub deletes: usize,
}

#[derive(Default)]
struct MemoryInner {
    data: BTreeMap<String, String>,
    counts: OpCounts,
    failures: Vec<(StoreOp, String)>,
    unreachable: bool,
}

impl MemoryInner {
    fn check(&self, op: StoreOp, key: &str) -> Result<(), StoreError> {
        if self.unreachable {
            return Err(StoreError::Connection { reason: "memory store marked unreachable".to_string() });
        }
        if self.failures.iter().any(|(o, k)| *o == op && k == key) {
            return Err(StoreError::for_op(op, key, "injected failure"));
        }
        Ok(())
    }
}

/// In-memory store. Calls through `StoreClient` are counted; the inherent
/// helpers (`insert`, `value`, `snapshot`) are not.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let me = Self::new();
        for (k, v) in entries { me.insert(k, v); }
        me
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write behind the controller's back (simulates out-of-band drift).
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().data.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<String> { self.lock().data.remove(key) }

    pub fn value(&self, key: &str) -> Option<String> { self.lock().data.get(key).cloned() }

    pub fn snapshot(&self) -> BTreeMap<String, String> { self.lock().data.clone() }

    pub fn counts(&self) -> OpCounts { self.lock().counts }

    pub fn reset_counts(&self) { self.lock().counts = OpCounts::default(); }

    /// Make every future `op` on `key` fail with the per-operation error.
    pub fn fail(&self, op: StoreOp, key: impl Into<String>) {
        self.lock().failures.push((op, key.into()));
    }

    pub fn clear_failures(&self) { self.lock().failures.clear(); }

    /// Make every call fail with `StoreError::Connection`.
    pub fn set_unreachable(&self, on: bool) { self.lock().unreachable = on; }
}

#[async_trait::async_trait]
impl StoreClient for MemoryStore {
    fn identity(&self) -> String { "memory".to_string() }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.lock();
        inner.counts.gets += 1;
        inner.check(StoreOp::Get, key)?;
        Ok(inner.data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.counts.puts += 1;
        inner.check(StoreOp::Put, key)?;
        inner.data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.counts.deletes += 1;
        inner.check(StoreOp::Delete, key)?;
        inner.data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.lock();
        inner.check(StoreOp::List, prefix)?;
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consul(cfg: StoreConfig) -> ConsulStore { ConsulStore::new(&cfg).unwrap() }

    #[test]
    fn consul_urls_encode_each_segment() {
        let store = consul(StoreConfig { host: "consul.local".into(), ..Default::default() });
        assert_eq!(store.identity(), "consul.local:8500");
        let url = |key: &str, flag: Option<&str>| store.url(StoreOp::Get, key, flag).unwrap().to_string();
        assert_eq!(url("db/host", None), "http://consul.local:8500/v1/kv/db/host");
        assert_eq!(url("a b/c?d", Some("raw")), "http://consul.local:8500/v1/kv/a%20b/c%3Fd?raw=true");
        assert_eq!(url("app/", Some("recurse")), "http://consul.local:8500/v1/kv/app/?recurse=true");
        assert_eq!(url("a/...b/.x", None), "http://consul.local:8500/v1/kv/a/...b/.x");
    }

    #[test]
    fn dot_segments_are_refused_not_normalised() {
        let store = consul(StoreConfig::default());
        for key in ["app/../secret", "a/./b", "..", "a/..", "."] {
            assert_eq!(
                store.url(StoreOp::Put, key, None).unwrap_err(),
                StoreError::Write {
                    key: key.to_string(),
                    reason: "key has a '.' or '..' segment, which HTTP cannot address".into()
                }
            );
            assert!(matches!(store.url(StoreOp::Get, key, Some("raw")), Err(StoreError::Read { .. })));
        }
    }

    #[test]
    fn consul_urls_carry_datacenter() {
        let store = consul(StoreConfig { datacenter: Some("dc2".into()), ..Default::default() });
        assert_eq!(store.url(StoreOp::Get, "k", None).unwrap().as_str(), "http://127.0.0.1:8500/v1/kv/k?dc=dc2");
    }

    #[test]
    fn bad_address_is_a_connection_error() {
        let cfg = StoreConfig { host: "bad host".into(), ..Default::default() };
        let err = ConsulStore::new(&cfg).err().unwrap();
        assert!(err.is_connection(), "{err}");
    }

    #[tokio::test]
    async fn memory_store_counts_and_fails_on_demand() {
        let store = MemoryStore::with_entries([("a", "1")]);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").await.unwrap(), None);
        store.put("b", "2").await.unwrap();
        store.delete("missing").await.unwrap();
        assert_eq!(store.counts(), OpCounts { gets: 2, puts: 1, deletes: 1 });

        store.fail(StoreOp::Put, "c");
        let err = store.put("c", "3").await.unwrap_err();
        assert_eq!(err, StoreError::Write { key: "c".into(), reason: "injected failure".into() });
        assert_eq!(store.value("c"), None);

        store.set_unreachable(true);
        assert!(store.get("a").await.unwrap_err().is_connection());
    }

    #[tokio::test]
    async fn memory_list_is_prefix_scoped() {
        let store = MemoryStore::with_entries([("app/a", "1"), ("app/b/c", "2"), ("apq", "x"), ("z", "y")]);
        let listed = store.list("app/").await.unwrap();
        assert_eq!(listed, vec![("app/a".to_string(), "1".to_string()), ("app/b/c".to_string(), "2".to_string())]);
        assert_eq!(store.list("").await.unwrap().len(), 4);
    }
}
