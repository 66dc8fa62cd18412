//! Per-request cache workers.
//!
//! A [`Worker`] owns the single underlying fetch for one distinct request,
//! and remembers its outcome for the request's cache time. A [`WorkerPool`]
//! hands out workers, reusing a live one for an equal request and replacing
//! expired ones.

use std::{
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    mem,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::task::{Spawn, SpawnExt};
use log::{debug, warn};

use crate::{
    callback::{Callback, CallbackSet, Token},
    error::{Error, Result},
    request::{Call, Outcome, Request, SourceId},
};

/// Expired workers are swept from a pool at most this often.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The fetch is still running. New waiters are queued.
    Fetching,

    /// The fetch succeeded and its outcome is still fresh. New waiters get
    /// the cached outcome immediately.
    Cached,

    /// The fetch failed, the cached outcome went stale, or the worker was
    /// destroyed. The worker can't accept waiters and must be replaced.
    Expired,
}

struct WorkerState<V, E> {
    outcome: Option<Arc<Outcome<V, E>>>,

    // Set when the fetch settles. None means "not yet stale".
    expires_at: Option<Instant>,
    destroyed: bool,
    waiters: CallbackSet<V, E>,
}

impl<V, E> WorkerState<V, E> {
    // The phase is derived entirely from what has been recorded; nothing
    // stores it directly.
    fn phase_at(&self, now: Instant) -> Phase {
        match (self.destroyed, self.expires_at, self.outcome.is_some()) {
            (true, _, _) => Phase::Expired,
            (false, Some(expires_at), _) if now >= expires_at => Phase::Expired,
            (false, Some(..), true) => Phase::Cached,
            _ => Phase::Fetching,
        }
    }
}

enum Attach<V, E> {
    Waiting,
    Ready(Arc<Outcome<V, E>>),
}

/// Owner of one underlying fetch. The fetch starts as soon as the worker is
/// created, and happens exactly once no matter how many waiters attach.
pub struct Worker<V, E> {
    request: Request,
    state: Arc<Mutex<WorkerState<V, E>>>,
}

impl<V, E> Worker<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create a worker and start its fetch on `spawner`.
    pub fn start(call: Call<V, E>, spawner: &(impl Spawn + ?Sized)) -> Result<Self> {
        let worker = Self::pending(call.request().clone(), CallbackSet::new());
        worker.run(&call, spawner)?;
        Ok(worker)
    }

    // A worker in the Fetching phase whose fetch hasn't been started yet.
    // Waiters are registered before the fetch runs, so that they can't miss
    // an outcome that settles immediately.
    fn pending(request: Request, waiters: CallbackSet<V, E>) -> Self {
        Self {
            request,
            state: Arc::new(Mutex::new(WorkerState {
                outcome: None,
                expires_at: None,
                destroyed: false,
                waiters,
            })),
        }
    }

    // Invoke the fetch function and spawn the fetch. Must not be called with
    // a pool lock held: the fetch function may use the pool. If the fetch
    // can't be spawned, the worker is destroyed so that it gets replaced.
    fn run(&self, call: &Call<V, E>, spawner: &(impl Spawn + ?Sized)) -> Result<()> {
        let shared = Arc::clone(&self.state);
        let cache_time = call.cache_time();
        let fetch = call.invoke();

        let spawned = spawner.spawn(async move {
            let outcome: Arc<Outcome<V, E>> = Arc::new(fetch.await.into());
            let ttl = if outcome.is_success() {
                cache_time
            } else {
                Duration::from_secs(0)
            };

            let waiters = {
                let mut guard = shared.lock().unwrap();
                guard.outcome = Some(Arc::clone(&outcome));
                guard.expires_at = Some(Instant::now() + ttl);
                mem::take(&mut guard.waiters)
            };

            waiters.deliver_all(&outcome);
        });

        spawned.map_err(|err| {
            self.destroy();
            err.into()
        })
    }
}

impl<V, E> Worker<V, E> {
    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn phase(&self) -> Phase {
        self.phase_at(Instant::now())
    }

    pub fn phase_at(&self, now: Instant) -> Phase {
        self.state.lock().unwrap().phase_at(now)
    }

    fn attach(&self, callback: Callback<V, E>) -> Result<Attach<V, E>> {
        let mut guard = self.state.lock().unwrap();

        match guard.phase_at(Instant::now()) {
            Phase::Expired => {
                warn!("attempted to attach a waiter to an expired worker for {}", self.request);
                Err(Error::ExpiredWorker {
                    request: self.request.to_string(),
                })
            }
            Phase::Cached => match guard.outcome.as_ref() {
                Some(outcome) => Ok(Attach::Ready(Arc::clone(outcome))),
                None => unreachable!("Cached worker has no outcome"),
            },
            Phase::Fetching => {
                guard.waiters.insert(callback);
                Ok(Attach::Waiting)
            }
        }
    }

    /// Wait for this worker's outcome. While fetching, the callback is
    /// queued; once cached, it is called immediately with the cached
    /// outcome. Adding to an expired worker fails with
    /// [`Error::ExpiredWorker`].
    pub fn add(&self, callback: Callback<V, E>) -> Result<()> {
        if let Attach::Ready(outcome) = self.attach(callback.clone())? {
            callback.deliver(&outcome);
        }
        Ok(())
    }

    /// Stop waiting. Returns true if the callback was still queued.
    pub fn remove(&self, token: Token) -> bool {
        self.state.lock().unwrap().waiters.remove(token)
    }

    /// Expire this worker immediately and drop every queued waiter.
    pub fn destroy(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.destroyed = true;
        guard.waiters = CallbackSet::new();
    }
}

impl<V, E> Clone for Worker<V, E> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<V, E> Debug for Worker<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("request", &self.request)
            .field("phase", &self.phase())
            .finish()
    }
}

struct PoolEntry<V, E> {
    worker: Worker<V, E>,
    fetches: usize,
}

struct PoolState<V, E> {
    // Workers are looked up by source first, then by request equality.
    entries: HashMap<SourceId, Vec<PoolEntry<V, E>>>,
    last_cleanup: Instant,
}

impl<V, E> PoolState<V, E> {
    fn find(&mut self, request: &Request) -> Option<&mut PoolEntry<V, E>> {
        self.entries
            .get_mut(&request.source())?
            .iter_mut()
            .find(|entry| entry.worker.request().is_same(request))
    }

    fn delete_expired(&mut self, now: Instant) {
        self.entries.values_mut().for_each(|entries| {
            entries.retain(|entry| entry.worker.phase_at(now) != Phase::Expired)
        });
        self.entries.retain(|_, entries| !entries.is_empty());
        self.last_cleanup = now;
    }
}

/// Hands out one live [`Worker`] per distinct request.
pub struct WorkerPool<V, E> {
    spawner: Arc<dyn Spawn + Send + Sync>,
    state: Mutex<PoolState<V, E>>,
}

impl<V, E> WorkerPool<V, E>
where
    V: Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    pub fn new(spawner: impl Spawn + Send + Sync + 'static) -> Self {
        Self {
            spawner: Arc::new(spawner),
            state: Mutex::new(PoolState {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Wait for the outcome of `call`. A live worker for an equal request is
    /// reused; otherwise (no worker, or an expired one) a new worker is
    /// created and its fetch started.
    ///
    /// The fetch function is invoked without the pool locked, so it may use
    /// the pool itself.
    pub fn add(&self, call: &Call<V, E>, callback: Callback<V, E>) -> Result<()> {
        let now = Instant::now();

        let (ready, created) = {
            let mut guard = self.state.lock().unwrap();

            if now >= guard.last_cleanup + CLEANUP_INTERVAL {
                guard.delete_expired(now);
            }

            let reused = match guard.find(call.request()) {
                Some(entry) => match entry.worker.attach(callback.clone()) {
                    Ok(attached) => Some(attached),
                    Err(Error::ExpiredWorker { .. }) => None,
                    Err(err) => return Err(err),
                },
                None => None,
            };

            match reused {
                Some(attached) => (attached, None),
                None => {
                    // Registered while still locked, so that concurrent adds
                    // for the same request join this worker.
                    let mut waiters = CallbackSet::new();
                    waiters.insert(callback.clone());
                    let worker = Worker::pending(call.request().clone(), waiters);

                    match guard.find(call.request()) {
                        Some(entry) => {
                            entry.worker = worker.clone();
                            entry.fetches += 1;
                        }
                        None => guard
                            .entries
                            .entry(call.request().source())
                            .or_default()
                            .push(PoolEntry {
                                worker: worker.clone(),
                                fetches: 1,
                            }),
                    }

                    (Attach::Waiting, Some(worker))
                }
            }
        };

        if let Some(worker) = created {
            debug!("starting worker for {}", call.request());
            worker.run(call, &*self.spawner)?;
        }

        // Deliver cached outcomes outside of the pool lock, so that the
        // callback is free to use the pool again.
        if let Attach::Ready(outcome) = ready {
            callback.deliver(&outcome);
        }

        Ok(())
    }
}

impl<V, E> WorkerPool<V, E> {
    /// How many workers (and therefore underlying fetches) have been created
    /// for requests equal to `request`, since its entry was last swept.
    pub fn fetch_count(&self, request: &Request) -> usize {
        self.state
            .lock()
            .unwrap()
            .find(request)
            .map_or(0, |entry| entry.fetches)
    }

    /// Number of distinct requests with a worker, live or expired.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn delete_expired(&self) {
        self.state.lock().unwrap().delete_expired(Instant::now());
    }

    /// Expire every worker and forget them.
    pub fn destroy(&self) {
        let mut guard = self.state.lock().unwrap();
        guard
            .entries
            .values()
            .flatten()
            .for_each(|entry| entry.worker.destroy());
        guard.entries.clear();
    }
}

impl<V, E> Debug for WorkerPool<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.len())
            .finish()
    }
}
