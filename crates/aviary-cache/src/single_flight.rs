//! Per-key request collapsing
//!
//! The first caller for a key registers a shared future; callers arriving
//! while it runs await that same future instead of starting their own. The
//! registration is removed as soon as the work finishes, before any caller
//! observes the result, so the next request for the key starts fresh.
//!
//! The registry only holds a weak handle. When every caller of a run has
//! been dropped the work is dropped with them and its key is released.
//!
//! The registry is owned by whoever constructs it (the cache service) and is
//! scoped to the process; nothing here coordinates across processes.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared, WeakShared};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Flight<T> {
    id: u64,
    // `None` only for a future that had already completed when registered
    future: Option<WeakShared<BoxFuture<'static, T>>>,
}

type SharedRun<T> = Shared<BoxFuture<'static, T>>;

/// Removes a flight's registration when its work completes or is dropped
struct Registration<T> {
    flights: Arc<DashMap<String, Flight<T>>>,
    key: String,
    id: u64,
}

impl<T> Drop for Registration<T> {
    fn drop(&mut self) {
        self.flights.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

/// Keyed registry of in-flight operations
pub struct SingleFlight<T> {
    flights: Arc<DashMap<String, Flight<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` for `key`, or join the run already in progress
    ///
    /// `work` is only invoked when no run for `key` is registered. Every
    /// caller for the same run receives a clone of its output.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let future = match self.flights.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let running = entry.get().future.as_ref().and_then(WeakShared::upgrade);
                if let Some(future) = running {
                    tracing::debug!("Joining in-flight operation for {}", key);
                    future
                } else {
                    let (flight, future) = self.launch(key, work);
                    entry.insert(flight);
                    future
                }
            }
            Entry::Vacant(entry) => {
                let (flight, future) = self.launch(key, work);
                entry.insert(flight);
                future
            }
        };

        future.await
    }

    fn launch<F, Fut>(&self, key: &str, work: F) -> (Flight<T>, SharedRun<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registration = Registration {
            flights: Arc::clone(&self.flights),
            key: key.to_string(),
            id,
        };
        let work = work();
        let future = async move {
            let output = work.await;
            drop(registration);
            output
        }
        .boxed()
        .shared();

        let flight = Flight {
            id,
            future: future.downgrade(),
        };
        (flight, future)
    }

    /// Whether `key` has a run in progress
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.flights.contains_key(key)
    }

    /// Number of runs in progress
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_run() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let flights = Arc::clone(&flights);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                flights
                    .run("audio/abc", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        42
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.expect("Operation should succeed"), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_registration_removed_after_completion() {
        let flights = SingleFlight::<Option<u32>>::new();
        let first = flights.run("k", || async { None }).await;
        assert_eq!(first, None);
        assert!(!flights.is_in_flight("k"));

        // A later call starts a fresh run rather than reusing the old outcome
        let second = flights.run("k", || async { Some(7) }).await;
        assert_eq!(second, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_run_independently() {
        let flights = Arc::new(SingleFlight::<&'static str>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let a = {
            let (flights, runs) = (Arc::clone(&flights), Arc::clone(&runs));
            tokio::spawn(async move {
                flights
                    .run("a", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        "a"
                    })
                    .await
            })
        };
        let b = {
            let (flights, runs) = (Arc::clone(&flights), Arc::clone(&runs));
            tokio::spawn(async move {
                flights
                    .run("b", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        "b"
                    })
                    .await
            })
        };

        assert_eq!(a.await.expect("Operation should succeed"), "a");
        assert_eq!(b.await.expect("Operation should succeed"), "b");
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_leader_does_not_strand_key() {
        let flights = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(flights.is_in_flight("k"));

        leader.abort();
        let _ = leader.await;
        assert!(!flights.is_in_flight("k"));

        assert_eq!(flights.run("k", || async { 2 }).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_caller_keeps_run_alive_after_leader_drops() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let spawn = |value: u32| {
            let (flights, runs) = (Arc::clone(&flights), Arc::clone(&runs));
            tokio::spawn(async move {
                flights
                    .run("k", move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        value
                    })
                    .await
            })
        };

        let leader = spawn(1);
        tokio::time::sleep(Duration::from_millis(1)).await;
        let follower = spawn(2);
        tokio::time::sleep(Duration::from_millis(1)).await;

        leader.abort();
        let _ = leader.await;
        assert!(flights.is_in_flight("k"));

        assert_eq!(follower.await.expect("Operation should succeed"), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flights.is_in_flight("k"));
    }
}
