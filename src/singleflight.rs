use std::future::Future;

use dashmap::DashMap;
use hickory_proto::op::Message;
use rustc_hash::FxBuildHasher;
use tokio::sync::oneshot;

type Waiters = Vec<oneshot::Sender<Option<Message>>>;

/// Coalesces concurrent fetches for the same fingerprint: the first caller
/// runs the fetch, everyone else waits for its result.
pub struct SingleFlight {
    flights: DashMap<String, Waiters, FxBuildHasher>,
}

/// Clears the slot if the executing caller is dropped mid-flight; the
/// orphaned waiters see a closed channel and retry as fresh originals.
struct FlightGuard<'a> {
    flights: &'a DashMap<String, Waiters, FxBuildHasher>,
    key: &'a str,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.flights.remove(self.key);
        }
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            flights: DashMap::with_hasher(FxBuildHasher::default()),
        }
    }

    /// Run `fetch` once per key at a time. Concurrent callers with the same
    /// key share the executing caller's result; the returned bool is true
    /// exactly for the caller that ran the fetch, and only that caller may
    /// write the cache. Once the flight completes the key is gone, so a
    /// later call starts over.
    ///
    /// The fetch future must not fail; errors are folded into `None`.
    pub async fn call<F>(&self, key: String, fetch: F) -> (Option<Message>, bool)
    where
        F: Future<Output = Option<Message>>,
    {
        let mut fetch = Some(fetch);
        loop {
            let rx = {
                use dashmap::mapref::entry::Entry;
                match self.flights.entry(key.clone()) {
                    Entry::Occupied(mut entry) => {
                        let (tx, rx) = oneshot::channel();
                        entry.get_mut().push(tx);
                        Some(rx)
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(Vec::new());
                        None
                    }
                }
            };

            match rx {
                Some(rx) => match rx.await {
                    Ok(result) => return (result, false),
                    // the executing caller vanished without reporting
                    Err(_) => continue,
                },
                None => {
                    let mut guard = FlightGuard {
                        flights: &self.flights,
                        key: &key,
                        armed: true,
                    };
                    let result = fetch
                        .take()
                        .expect("flight re-entered after executing")
                        .await;
                    guard.armed = false;
                    let waiters = self
                        .flights
                        .remove(&key)
                        .map(|(_, waiters)| waiters)
                        .unwrap_or_default();
                    for tx in waiters {
                        let _ = tx.send(result.clone());
                    }
                    return (result, true);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn marker_message(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let gate = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let gate = gate.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                gate.call("example.com.11".to_string(), async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Some(marker_message(7))
                })
                .await
            }));
        }

        let mut originals = 0;
        for handle in handles {
            let (result, original) = handle.await.expect("task");
            assert_eq!(result.expect("shared result").id(), 7);
            if original {
                originals += 1;
            }
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(originals, 1);
    }

    #[tokio::test]
    async fn completed_flight_leaves_no_state_behind() {
        let gate = SingleFlight::new();
        let (first, original) = gate
            .call("key".to_string(), async { Some(marker_message(1)) })
            .await;
        assert!(original);
        assert_eq!(first.expect("result").id(), 1);

        // the key is gone, so this is a fresh fetch, not a replay
        let (second, original) = gate
            .call("key".to_string(), async { Some(marker_message(2)) })
            .await;
        assert!(original);
        assert_eq!(second.expect("result").id(), 2);
        assert!(gate.flights.is_empty());
    }

    #[tokio::test]
    async fn distinct_keys_run_independently() {
        let gate = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let a = {
            let gate = gate.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                gate.call("a".to_string(), async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    None
                })
                .await
            })
        };
        let b = {
            let gate = gate.clone();
            let executions = executions.clone();
            tokio::spawn(async move {
                gate.call("b".to_string(), async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    None
                })
                .await
            })
        };
        let (ra, rb) = (a.await.expect("task"), b.await.expect("task"));
        assert!(ra.1 && rb.1);
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
