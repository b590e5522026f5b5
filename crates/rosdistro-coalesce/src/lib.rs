// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Single-flight request coalescing.
//!
//! The first caller to present a key runs its future to completion;
//! concurrent callers presenting the same key observe the in-flight
//! future and share its result rather than duplicating the work. The key
//! is removed the instant the work completes, so the next caller either
//! hits a fast path installed by the completed work or starts fresh.
//!
//! Built on [`futures::future::Shared`] over a boxed future; errors are
//! wrapped in `Arc` so every waiter can receive an owned clone.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type SharedResult<V, E> = Result<V, Arc<E>>;

struct Entry<V, E> {
    id: u64,
    fut: Shared<BoxFuture<'static, SharedResult<V, E>>>,
}

impl<V, E> Clone for Entry<V, E> {
    fn clone(&self) -> Self {
        Entry { id: self.id, fut: self.fut.clone() }
    }
}

/// Coalesces concurrent callers keyed by `K` into a single execution of
/// `V`-producing, `E`-failing work.
pub struct Coalescer<K, V, E> {
    inflight: Mutex<HashMap<K, Entry<V, E>>>,
    next_id: AtomicU64,
}

impl<K, V, E> Default for Coalescer<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> Coalescer<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Construct an empty coalescer.
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `produce` under single-flight semantics for `key`. If another
    /// caller is already running work for the same key, await its result
    /// instead of polling `produce`.
    pub async fn run<F>(&self, key: K, produce: F) -> SharedResult<V, E>
    where
        F: Future<Output = Result<V, E>> + Send + 'static,
    {
        let entry = {
            let mut guard = self.inflight.lock().expect("coalescer mutex poisoned");
            if let Some(existing) = guard.get(&key) {
                existing.clone()
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let boxed: BoxFuture<'static, SharedResult<V, E>> = produce.map(|r| r.map_err(Arc::new)).boxed();
                let entry = Entry { id, fut: boxed.shared() };
                guard.insert(key.clone(), entry.clone());
                entry
            }
        };

        let result = entry.fut.await;

        let mut guard = self.inflight.lock().expect("coalescer mutex poisoned");
        if let Some(current) = guard.get(&key) {
            if current.id == entry.id {
                guard.remove(&key);
            }
        }
        result
    }

    /// Number of keys currently in flight. Exposed for tests and metrics.
    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().expect("coalescer mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let coalescer: Arc<Coalescer<&'static str, u32, String>> = Arc::new(Coalescer::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = coalescer.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                coalescer
                    .run("k", async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<u32, String>(42)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_failure() {
        let coalescer: Arc<Coalescer<&'static str, u32, String>> = Arc::new(Coalescer::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let coalescer = coalescer.clone();
            handles.push(tokio::spawn(async move { coalescer.run("k", async move { Err::<u32, String>("boom".to_string()) }).await }));
        }
        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert_eq!(err.as_str(), "boom");
        }
    }

    #[tokio::test]
    async fn key_is_removed_after_completion() {
        let coalescer: Coalescer<&'static str, u32, String> = Coalescer::new();
        coalescer.run("k", async { Ok::<u32, String>(1) }).await.unwrap();
        assert_eq!(coalescer.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn sequential_calls_after_completion_rerun_work() {
        let coalescer: Coalescer<&'static str, u32, String> = Coalescer::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let executions = executions.clone();
            coalescer
                .run("k", async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, String>(1)
                })
                .await
                .unwrap();
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let coalescer: Arc<Coalescer<&'static str, u32, String>> = Arc::new(Coalescer::new());
        let a = coalescer.clone();
        let b = coalescer.clone();
        let (ra, rb) = tokio::join!(a.run("a", async { Ok::<u32, String>(1) }), b.run("b", async { Ok::<u32, String>(2) }));
        assert_eq!(*ra.unwrap(), 1);
        assert_eq!(*rb.unwrap(), 2);
    }
}
