//! Cache (C6): a content-addressed intermediate-result store keyed by
//! fingerprint, with at-most-one concurrent builder per fingerprint and LRU
//! eviction under a configurable max size (§4.6).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock};

use crate::error::FlowError;
use crate::fingerprint::Fingerprint;
use crate::types::{Schema, Timestamp, Value};

/// `(fingerprint, schema, row_count, payload_location, created_at,
/// size_bytes)` (§3). `payload_location` is opaque — typically a file path
/// in a shared staging directory (§6).
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub schema: Schema,
    pub row_count: u64,
    pub payload_location: String,
    pub created_at: Timestamp,
    pub size_bytes: u64,
}

enum Slot {
    Building(Arc<Notify>),
    Ready(CacheEntry),
}

struct Inner {
    entries: HashMap<String, Slot>,
    /// The materialized rows behind each `Ready` entry's `payload_location`.
    /// A real deployment would resolve `payload_location` against shared
    /// staging storage; this in-process runtime just keeps it alongside the
    /// metadata so `ScanFromCache` can read back real data (§4.5, §8
    /// property 4). Always inserted/evicted in lockstep with `entries`.
    payloads: HashMap<String, Vec<Vec<Value>>>,
    lru: Vec<String>,
    pinned: HashMap<String, u32>,
    total_bytes: u64,
    max_bytes: u64,
}

/// Content-addressed store. Internally synchronized (unlike [`crate::graph::Graph`])
/// because concurrent scheduler dispatches race to insert the same
/// fingerprint and must observe the same result — the striped-lock-by-
/// fingerprint idiom of §5, collapsed here to a single `RwLock<Inner>` for
/// the in-process runtime (the teacher's store backends use the same
/// `RwLock<Inner>` shape for its process/fiber state).
pub struct Cache {
    inner: RwLock<Inner>,
}

impl Cache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                payloads: HashMap::new(),
                lru: Vec::new(),
                pinned: HashMap::new(),
                total_bytes: 0,
                max_bytes,
            }),
        }
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let inner = self.inner.try_read().ok()?;
        match inner.entries.get(&fingerprint.0) {
            Some(Slot::Ready(entry)) => Some(entry.clone()),
            _ => None,
        }
    }

    /// The rows materialized under `fingerprint`, if a `Ready` entry exists
    /// for it. Always present whenever `lookup` returns `Some` — inserted
    /// and evicted together with the metadata entry.
    pub fn payload(&self, fingerprint: &Fingerprint) -> Option<Vec<Vec<Value>>> {
        let inner = self.inner.try_read().ok()?;
        inner.payloads.get(&fingerprint.0).cloned()
    }

    /// Pins an entry for the duration of a run so eviction skips it while
    /// it's in use (§4.6, §9 open-question strengthening).
    pub async fn pin(&self, fingerprint: &Fingerprint) {
        let mut inner = self.inner.write().await;
        *inner.pinned.entry(fingerprint.0.clone()).or_insert(0) += 1;
    }

    pub async fn unpin(&self, fingerprint: &Fingerprint) {
        let mut inner = self.inner.write().await;
        if let Some(count) = inner.pinned.get_mut(&fingerprint.0) {
            *count -= 1;
            if *count == 0 {
                inner.pinned.remove(&fingerprint.0);
            }
        }
    }

    /// Inserts a freshly built entry, or returns the entry a concurrent
    /// caller already built for the same fingerprint (§4.6, §8 property 5:
    /// at-most-one-builder). `producer` is only ever invoked by the caller
    /// that wins the race to register the `Building` slot.
    pub async fn insert<F, Fut>(&self, fingerprint: &Fingerprint, producer: F) -> Result<CacheEntry, FlowError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(Schema, u64, String, u64, Vec<Vec<Value>>), FlowError>>,
    {
        let notify = {
            let mut inner = self.inner.write().await;
            match inner.entries.get(&fingerprint.0) {
                Some(Slot::Ready(entry)) => return Ok(entry.clone()),
                Some(Slot::Building(notify)) => Some(notify.clone()),
                None => {
                    inner.entries.insert(fingerprint.0.clone(), Slot::Building(Arc::new(Notify::new())));
                    None
                }
            }
        };

        if let Some(notify) = notify {
            notify.notified().await;
            let inner = self.inner.read().await;
            return match inner.entries.get(&fingerprint.0) {
                Some(Slot::Ready(entry)) => Ok(entry.clone()),
                _ => Err(FlowError::Internal("cache producer finished without installing an entry".into())),
            };
        }

        let result = producer().await;

        let mut inner = self.inner.write().await;
        let notify = match inner.entries.remove(&fingerprint.0) {
            Some(Slot::Building(n)) => n,
            _ => Arc::new(Notify::new()),
        };

        let (entry, rows) = match result {
            Ok((schema, row_count, payload_location, size_bytes, rows)) => (
                CacheEntry {
                    fingerprint: fingerprint.clone(),
                    schema,
                    row_count,
                    payload_location,
                    created_at: crate::types::now_ms(),
                    size_bytes,
                },
                rows,
            ),
            Err(e) => {
                notify.notify_waiters();
                return Err(e);
            }
        };

        inner.total_bytes += entry.size_bytes;
        inner.entries.insert(fingerprint.0.clone(), Slot::Ready(entry.clone()));
        inner.payloads.insert(fingerprint.0.clone(), rows);
        inner.lru.retain(|k| k != &fingerprint.0);
        inner.lru.push(fingerprint.0.clone());
        notify.notify_waiters();

        evict_if_needed(&mut inner);
        Ok(entry)
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        let mut inner = self.inner.write().await;
        if let Some(Slot::Ready(entry)) = inner.entries.remove(&fingerprint.0) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
        }
        inner.payloads.remove(&fingerprint.0);
        inner.lru.retain(|k| k != &fingerprint.0);
    }
}

fn evict_if_needed(inner: &mut Inner) {
    let mut i = 0;
    while inner.total_bytes > inner.max_bytes && i < inner.lru.len() {
        let key = inner.lru[i].clone();
        if inner.pinned.contains_key(&key) {
            i += 1;
            continue;
        }
        if let Some(Slot::Ready(entry)) = inner.entries.remove(&key) {
            inner.total_bytes = inner.total_bytes.saturating_sub(entry.size_bytes);
        }
        inner.payloads.remove(&key);
        inner.lru.remove(i);
    }
}

/// Guards a pinned entry so callers can't forget to unpin on early return —
/// grounded on the same RAII pattern the scheduler uses for run-level
/// cancellation flags.
pub struct Pin<'a> {
    cache: &'a Cache,
    fingerprint: Fingerprint,
}

impl<'a> Pin<'a> {
    pub async fn acquire(cache: &'a Cache, fingerprint: Fingerprint) -> Self {
        cache.pin(&fingerprint).await;
        Self { cache, fingerprint }
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        let cache = self.cache;
        let fp = self.fingerprint.clone();
        tokio::spawn(async move {
            cache.unpin(&fp).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(s: &str) -> Fingerprint {
        Fingerprint(s.to_string())
    }

    #[tokio::test]
    async fn insert_then_lookup_round_trips() {
        let cache = Cache::new(1_000_000);
        let entry = cache
            .insert(&fp("a"), || async { Ok((Schema::empty(), 3, "loc://a".into(), 100, vec![vec![Value::I64(1)]])) })
            .await
            .unwrap();
        assert_eq!(entry.row_count, 3);
        assert_eq!(cache.lookup(&fp("a")).unwrap().payload_location, "loc://a");
        assert_eq!(cache.payload(&fp("a")), Some(vec![vec![Value::I64(1)]]));
    }

    #[tokio::test]
    async fn concurrent_inserts_for_same_fingerprint_see_one_build() {
        let cache = Arc::new(Cache::new(1_000_000));
        let build_count = Arc::new(Mutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .insert(&fp("shared"), || {
                        let build_count = build_count.clone();
                        async move {
                            *build_count.lock() += 1;
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok((Schema::empty(), 1, "loc://shared".into(), 10, Vec::new()))
                        }
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*build_count.lock(), 1);
    }

    #[tokio::test]
    async fn lru_evicts_unpinned_entries_over_budget() {
        let cache = Cache::new(150);
        cache.insert(&fp("a"), || async { Ok((Schema::empty(), 1, "a".into(), 100, Vec::new())) }).await.unwrap();
        cache.insert(&fp("b"), || async { Ok((Schema::empty(), 1, "b".into(), 100, Vec::new())) }).await.unwrap();
        assert!(cache.lookup(&fp("a")).is_none());
        assert!(cache.payload(&fp("a")).is_none());
        assert!(cache.lookup(&fp("b")).is_some());
    }

    #[tokio::test]
    async fn pinned_entries_survive_eviction_pressure() {
        let cache = Cache::new(150);
        cache.insert(&fp("a"), || async { Ok((Schema::empty(), 1, "a".into(), 100, Vec::new())) }).await.unwrap();
        cache.pin(&fp("a")).await;
        cache.insert(&fp("b"), || async { Ok((Schema::empty(), 1, "b".into(), 100, Vec::new())) }).await.unwrap();
        assert!(cache.lookup(&fp("a")).is_some());
    }
}
