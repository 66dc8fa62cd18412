use std::{
    fmt::{self, Debug, Formatter},
    mem,
    sync::{Arc, Mutex},
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures::task::{Spawn, SpawnExt};
use futures_timer::Delay;
use log::{debug, error};

use crate::{
    callback::Callback,
    error::{Error, Result},
    execute::execute,
    group::{group, merge_external, PendingRequest},
    request::Call,
};

/// A source of requests that are still wanted by live consumers. Consulted
/// once per flush, so that late interest can join work that is already
/// part of the batch.
pub trait InterestSource<V, E>: Send + Sync {
    fn still_interested(&self) -> Vec<PendingRequest<V, E>>;
}

/// Configuration for a [`DispatchQueue`].
#[derive(Debug, Clone)]
pub struct DispatchRules {
    /// How long the queue collects requests after the first one arrives.
    pub window: Duration,

    /// Record [`FlushStats`] for every flush, readable with
    /// [`DispatchQueue::last_flush`].
    pub debug: bool,
}

impl Default for DispatchRules {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(1),
            debug: false,
        }
    }
}

/// Request counts from a single flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushStats {
    /// Requests that were buffered when the window closed.
    pub requests: usize,

    /// Distinct groups they were collapsed into.
    pub groups: usize,
}

struct QueueState<V, E> {
    pending: Vec<PendingRequest<V, E>>,
    armed: bool,

    // Incremented on every flush. A window timer only flushes if no other
    // flush happened since it was armed.
    window: u64,
}

/// Collects requests over a short window, then collapses equal requests and
/// runs each distinct one exactly once.
///
/// The first request to arrive in an idle queue arms a timer; when it fires,
/// everything that arrived in the meantime is flushed together. Requests
/// that arrive while a flush is executing start a fresh window.
///
/// All asynchronous work (the window timer, and every fetch) is run on the
/// spawner given to [`DispatchQueue::new`]. The queue never waits for
/// fetches to finish.
pub struct DispatchQueue<V, E> {
    rules: DispatchRules,
    spawner: Arc<dyn Spawn + Send + Sync>,
    interest: Option<Arc<dyn InterestSource<V, E>>>,
    state: Mutex<QueueState<V, E>>,
    last_flush: ArcSwapOption<FlushStats>,
}

impl<V, E> DispatchQueue<V, E>
where
    V: Send + 'static,
    E: Send + 'static,
{
    pub fn new(rules: DispatchRules, spawner: impl Spawn + Send + Sync + 'static) -> Arc<Self> {
        Self::build(rules, Arc::new(spawner), None)
    }

    /// Create a queue that merges the requests of `interest` into every
    /// flush.
    pub fn with_interest(
        rules: DispatchRules,
        spawner: impl Spawn + Send + Sync + 'static,
        interest: Arc<dyn InterestSource<V, E>>,
    ) -> Arc<Self> {
        Self::build(rules, Arc::new(spawner), Some(interest))
    }

    fn build(
        rules: DispatchRules,
        spawner: Arc<dyn Spawn + Send + Sync>,
        interest: Option<Arc<dyn InterestSource<V, E>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rules,
            spawner,
            interest,
            state: Mutex::new(QueueState {
                pending: Vec::new(),
                armed: false,
                window: 0,
            }),
            last_flush: ArcSwapOption::empty(),
        })
    }

    #[inline]
    pub fn rules(&self) -> &DispatchRules {
        &self.rules
    }

    /// Number of requests currently buffered.
    pub fn queue_size(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Counts from the most recent flush. Only recorded when
    /// [`DispatchRules::debug`] is set.
    pub fn last_flush(&self) -> Option<FlushStats> {
        self.last_flush.load_full().map(|stats| *stats)
    }

    /// Convenience for `enqueue(PendingRequest::new(call, callback))`.
    pub fn load(self: &Arc<Self>, call: Call<V, E>, callback: Callback<V, E>) -> Result<()> {
        self.enqueue(PendingRequest::new(call, callback))
    }

    /// Buffer a request. If the queue is idle, this opens a new window.
    ///
    /// Fails only if the window timer can't be spawned, in which case the
    /// request is not kept.
    pub fn enqueue(self: &Arc<Self>, request: PendingRequest<V, E>) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        guard.pending.push(request);

        if guard.armed {
            return Ok(());
        }

        let window = guard.window;
        let queue = Arc::clone(self);
        let delay = Delay::new(self.rules.window);

        let spawned = self.spawner.spawn(async move {
            delay.await;
            queue.close_window(window);
        });

        match spawned {
            Ok(()) => {
                debug!("opened dispatch window {}", window);
                guard.armed = true;
                Ok(())
            }
            Err(err) => {
                guard.pending.pop();
                Err(err.into())
            }
        }
    }

    fn close_window(&self, window: u64) {
        let pending = {
            let mut guard = self.state.lock().unwrap();

            // Someone flushed this window by hand; the requests are gone.
            if !guard.armed || guard.window != window {
                return;
            }

            Self::drain(&mut guard)
        };

        match self.dispatch(pending) {
            Ok(..) => {}
            Err(Error::EmptyQueue) => {
                panic!("Unknown logic error: dispatch window closed with no pending requests")
            }
            Err(err) => error!("failed to dispatch window {}: {}", window, err),
        }
    }

    // Disarm before doing any work, so that requests arriving from here on
    // open a new window rather than joining groups that are already closed.
    fn drain(state: &mut QueueState<V, E>) -> Vec<PendingRequest<V, E>> {
        state.armed = false;
        state.window += 1;
        mem::take(&mut state.pending)
    }

    /// Close the current window: group everything pending, merge in any
    /// still-interested requests, and start one fetch per group.
    ///
    /// Flushing an empty queue is a logic error and returns
    /// [`Error::EmptyQueue`]. If the spawner refuses a group's fetch, that
    /// group's callbacks are dropped without an outcome and
    /// [`Error::Spawn`] is returned after the other groups are spawned.
    pub fn flush(&self) -> Result<FlushStats> {
        let pending = {
            let mut guard = self.state.lock().unwrap();
            if guard.pending.is_empty() {
                return Err(Error::EmptyQueue);
            }

            Self::drain(&mut guard)
        };

        self.dispatch(pending)
    }

    fn dispatch(&self, pending: Vec<PendingRequest<V, E>>) -> Result<FlushStats> {
        let requests = pending.len();
        let mut groups = group(pending)?;

        if let Some(interest) = self.interest.as_ref() {
            merge_external(&mut groups, interest.still_interested());
        }

        let stats = FlushStats {
            requests,
            groups: groups.len(),
        };

        debug!(
            "flushing {} request(s) as {} group(s)",
            stats.requests, stats.groups
        );

        if self.rules.debug {
            self.last_flush.store(Some(Arc::new(stats)));
        }

        let mut failure = None;
        for group in groups {
            let request = group.request().to_string();
            let callbacks = group.callbacks().len();

            if let Err(err) = self.spawner.spawn(execute(group)) {
                error!(
                    "failed to spawn fetch for {}, {} callback(s) dropped: {}",
                    request, callbacks, err
                );
                failure = Some(err);
            }
        }

        match failure {
            None => Ok(stats),
            Some(err) => Err(err.into()),
        }
    }
}

impl<V, E> Debug for DispatchQueue<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock().unwrap();
        f.debug_struct("DispatchQueue")
            .field("rules", &self.rules)
            .field("pending", &guard.pending)
            .field("armed", &guard.armed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args::Arg, request::Query};
    use futures::{executor::ThreadPool, future};
    use std::sync::mpsc;

    fn pool() -> ThreadPool {
        ThreadPool::builder().pool_size(1).create().unwrap()
    }

    fn noop_query() -> Query<(), ()> {
        Query::new(|_: &[Arg]| future::ready(Ok(())))
    }

    #[test]
    fn flushing_empty_queue_is_an_error() {
        let queue: Arc<DispatchQueue<(), ()>> = DispatchQueue::new(DispatchRules::default(), pool());
        assert!(matches!(queue.flush(), Err(Error::EmptyQueue)));
    }

    #[test]
    fn manual_flush_disarms_the_window() {
        let rules = DispatchRules {
            window: Duration::from_secs(60),
            debug: true,
        };
        let queue = DispatchQueue::new(rules, pool());
        let query = noop_query();

        queue.load(query.call(vec![Arg::from(1)]), Callback::new(|_| {})).unwrap();
        queue.load(query.call(vec![Arg::from(1)]), Callback::new(|_| {})).unwrap();
        assert_eq!(queue.queue_size(), 2);

        let stats = queue.flush().unwrap();
        assert_eq!(stats, FlushStats { requests: 2, groups: 1 });
        assert_eq!(queue.last_flush(), Some(stats));
        assert_eq!(queue.queue_size(), 0);

        // The stale window timer must not try to flush again
        queue.close_window(0);
        assert!(matches!(queue.flush(), Err(Error::EmptyQueue)));
    }

    #[test]
    fn enqueue_during_delivery_opens_a_new_window() {
        let rules = DispatchRules {
            window: Duration::from_millis(1),
            debug: true,
        };
        let queue: Arc<DispatchQueue<(), ()>> = DispatchQueue::new(rules, pool());
        let query = noop_query();
        let (send, recv) = mpsc::channel();

        let first = {
            let queue = queue.clone();
            let query = query.clone();
            let send = Mutex::new(send);

            Callback::new(move |_| {
                let send = send.lock().unwrap().clone();
                send.send(queue.last_flush()).unwrap();

                let inner = queue.clone();
                let send = Mutex::new(send);
                queue
                    .load(
                        query.call(vec![Arg::from(2)]),
                        Callback::new(move |_| {
                            let _ = send.lock().unwrap().send(inner.last_flush());
                        }),
                    )
                    .unwrap();
            })
        };

        queue.load(query.call(vec![Arg::from(1)]), first).unwrap();

        let stats = FlushStats {
            requests: 1,
            groups: 1,
        };
        let timeout = Duration::from_secs(1);
        assert_eq!(recv.recv_timeout(timeout).unwrap(), Some(stats));
        assert_eq!(recv.recv_timeout(timeout).unwrap(), Some(stats));
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn stats_are_only_recorded_in_debug() {
        let queue = DispatchQueue::new(DispatchRules::default(), pool());
        let query = noop_query();

        queue.load(query.call(vec![]), Callback::new(|_| {})).unwrap();
        queue.flush().unwrap();

        assert_eq!(queue.last_flush(), None);
    }
}
