use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::errors::LookupError;

type Flight<T> = Shared<BoxFuture<'static, Result<T, LookupError>>>;

/// Coalesces concurrent calls for the same key onto one in-flight future.
///
/// The first caller for a key installs the work as a shared future; everyone
/// arriving before completion awaits the same future and observes the
/// identical result, including errors. Because the future is shared, a
/// caller that goes away does not abort the flight as long as any waiter
/// remains. The entry is removed once the flight it belongs to completes, so
/// later callers start fresh.
pub(crate) struct FlightGroup<T: Clone> {
    inflight: Mutex<HashMap<String, (u64, Flight<T>)>>,
    seq: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub async fn run<F>(&self, key: &str, make: F) -> Result<T, LookupError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, LookupError>>,
    {
        let (id, flight) = {
            let mut inflight = self.inflight.lock().expect("singleflight mutex poisoned");
            match inflight.get(key) {
                Some((id, flight)) => (*id, flight.clone()),
                None => {
                    let id = self.seq.fetch_add(1, Ordering::Relaxed);
                    let flight = make().shared();
                    inflight.insert(key.to_string(), (id, flight.clone()));
                    (id, flight)
                }
            }
        };

        let result = flight.await;

        let mut inflight = self.inflight.lock().expect("singleflight mutex poisoned");
        if inflight.get(key).is_some_and(|(current, _)| *current == id) {
            inflight.remove(key);
        }
        result
    }
}
