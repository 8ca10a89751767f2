//! Coalescing of concurrent identical fetches.
//!
//! The first requester for a key becomes the leader and performs the real
//! work; everyone who arrives while it is in flight becomes a follower and
//! receives the leader's outcome, success or failure alike. A leader that
//! drops without completing releases its followers with `Cancelled` so they
//! never hang.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::DepotError;

type FlightResult<T> = Result<T, DepotError>;
type Waiters<T> = Vec<oneshot::Sender<FlightResult<T>>>;

struct Inner<T> {
    inflight: Mutex<HashMap<String, Waiters<T>>>,
}

/// Shared group of in-flight keys.
pub struct FlightGroup<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for FlightGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for FlightGroup<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Role assigned to a joining requester.
pub enum Flight<T> {
    Leader(FlightGuard<T>),
    Follower(oneshot::Receiver<FlightResult<T>>),
}

impl<T: Clone> FlightGroup<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn join(&self, key: &str) -> Flight<T> {
        let mut inflight = self.inner.inflight.lock();
        match inflight.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Flight::Follower(rx)
            }
            None => {
                inflight.insert(key.to_string(), Vec::new());
                Flight::Leader(FlightGuard {
                    inner: self.inner.clone(),
                    key: key.to_string(),
                    completed: false,
                })
            }
        }
    }

    /// Keys currently in flight, for introspection.
    pub fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().len()
    }
}

/// Leader handle; completing it releases every follower.
pub struct FlightGuard<T> {
    inner: Arc<Inner<T>>,
    key: String,
    completed: bool,
}

impl<T: Clone> FlightGuard<T> {
    pub fn complete(mut self, result: FlightResult<T>) {
        self.broadcast(result);
        self.completed = true;
    }

    fn broadcast(&mut self, result: FlightResult<T>) {
        let waiters = self.inner.inflight.lock().remove(&self.key);
        if let Some(waiters) = waiters {
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        }
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        if !self.completed {
            let waiters = self.inner.inflight.lock().remove(&self.key);
            if let Some(waiters) = waiters {
                for waiter in waiters {
                    let _ = waiter.send(Err(DepotError::Cancelled));
                }
            }
        }
    }
}
