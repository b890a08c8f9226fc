//! Single-flight lookups: at most one in-flight provider call per key.
//!
//! The first caller for a key spawns the lookup as a detached task and
//! registers a watch channel; later callers subscribe to it. The entry is
//! removed before the result is published, so a key never has two in-flight
//! lookups. Dropping a waiter never cancels the lookup itself.

use super::types::{GeocodeError, NormalizedKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome<V> = Option<Result<V, GeocodeError>>;
type InFlight<V> = Arc<Mutex<HashMap<NormalizedKey, Arc<watch::Sender<Outcome<V>>>>>>;

/// Removes the in-flight entry when the lookup task finishes or unwinds.
struct InFlightGuard<V> {
    in_flight: InFlight<V>,
    key: NormalizedKey,
}

impl<V> Drop for InFlightGuard<V> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.key);
    }
}

/// Deduplicates concurrent lookups of the same key.
pub struct RequestCoalescer<V> {
    in_flight: InFlight<V>,
}

impl<V> Default for RequestCoalescer<V> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to the in-flight lookup for `key`, or start one with `do_lookup`.
    ///
    /// `do_lookup` is only invoked when this caller becomes the leader.
    pub async fn resolve_once<F, Fut>(&self, key: &NormalizedKey, do_lookup: F) -> Result<V, GeocodeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, GeocodeError>> + Send + 'static,
    {
        let mut rx = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(key) {
                Some(tx) => {
                    tracing::debug!(%key, waiters = tx.receiver_count(), "attached to in-flight lookup");
                    tx.subscribe()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    let tx = Arc::new(tx);
                    in_flight.insert(key.clone(), Arc::clone(&tx));

                    let guard = InFlightGuard {
                        in_flight: Arc::clone(&self.in_flight),
                        key: key.clone(),
                    };
                    let lookup = do_lookup();
                    tokio::spawn(async move {
                        let result = lookup.await;
                        drop(guard);
                        tx.send_replace(Some(result));
                    });
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(GeocodeError::LookupAborted))
    }

    /// Callers currently attached to the lookup for `key`.
    pub fn waiters(&self, key: &NormalizedKey) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of keys with a lookup in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn key(text: &str) -> NormalizedKey {
        NormalizedKey::from_parts(text.into(), None, None)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_lookup() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                coalescer
                    .resolve_once(&key("k"), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(42)
                    })
                    .await
            }));
        }

        while coalescer.waiters(&key("k")) < 8 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_fans_out_and_clears() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let gate = Arc::new(Notify::new());

        let first = {
            let coalescer = Arc::clone(&coalescer);
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                coalescer
                    .resolve_once(&key("k"), move || async move {
                        gate.notified().await;
                        Err(GeocodeError::NotFound("k".into()))
                    })
                    .await
            })
        };
        while coalescer.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let second = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                coalescer
                    .resolve_once(&key("k"), || async { Ok(7) })
                    .await
            })
        };
        while coalescer.waiters(&key("k")) < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let not_found = Err(GeocodeError::NotFound("k".into()));
        assert_eq!(first.await.unwrap(), not_found);
        assert_eq!(second.await.unwrap(), not_found);

        // Entry torn down: the next caller leads a fresh lookup
        assert_eq!(coalescer.resolve_once(&key("k"), || async { Ok(7) }).await, Ok(7));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let coalescer = RequestCoalescer::<&'static str>::new();
        let calls = Arc::new(AtomicU32::new(0));
        let (key_a, key_b) = (key("a"), key("b"));
        let (a, b) = tokio::join!(
            coalescer.resolve_once(&key_a, {
                let calls = Arc::clone(&calls);
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("a")
                }
            }),
            coalescer.resolve_once(&key_b, {
                let calls = Arc::clone(&calls);
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("b")
                }
            }),
        );
        assert_eq!((a, b), (Ok("a"), Ok("b")));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_abort_lookup() {
        let coalescer = Arc::new(RequestCoalescer::<u32>::new());
        let gate = Arc::new(Notify::new());
        let finished = Arc::new(AtomicU32::new(0));

        let leader = {
            let coalescer = Arc::clone(&coalescer);
            let gate = Arc::clone(&gate);
            let finished = Arc::clone(&finished);
            tokio::spawn(async move {
                coalescer
                    .resolve_once(&key("k"), move || async move {
                        gate.notified().await;
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(1)
                    })
                    .await
            })
        };
        while coalescer.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        let follower = {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move { coalescer.resolve_once(&key("k"), || async { Ok(2) }).await })
        };
        while coalescer.waiters(&key("k")) < 2 {
            tokio::task::yield_now().await;
        }

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());
        gate.notify_one();

        assert_eq!(follower.await.unwrap(), Ok(1));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_lookup_reports_aborted() {
        let coalescer = RequestCoalescer::<u32>::new();
        let result = coalescer
            .resolve_once(&key("k"), || async {
                tokio::time::sleep(Duration::from_millis(1)).await;
                panic!("provider adapter bug")
            })
            .await;
        assert_eq!(result, Err(GeocodeError::LookupAborted));
        assert_eq!(coalescer.in_flight(), 0);
    }
}
