//! Long-lived consumers of the dispatch queue.
//!
//! A [`Subscription`] turns parameters into a set of named calls, sends them
//! through a [`DispatchQueue`], and routes the outcomes into a
//! [`ResultRouter`] whose observers see one combined result per fetch cycle.
//! The last calls a subscription issued are its "still interested"
//! requests; a [`SubscriptionRegistry`] gathers those from every live
//! subscription so that the queue can merge them into each flush.
//!
//! [`fetch_all`] is the one-shot counterpart: it fetches a set of named
//! calls once and resolves to their combined outcomes.

use std::{
    fmt::{self, Debug, Formatter},
    sync::{Arc, Mutex, Weak},
};

use futures::channel::oneshot;
use indexmap::IndexMap;
use log::{debug, warn};

use crate::{
    callback::Callback,
    error::{Error, Result},
    group::PendingRequest,
    queue::{DispatchQueue, InterestSource},
    request::{Call, Outcome, SourceId},
    router::{Combined, ObserverId, ResultRouter},
};

/// Builds the named calls of one fetch cycle from a subscription's
/// parameters. Every name must be one of the subscription's slots.
pub type Compose<P, V, E> = dyn Fn(&P) -> Vec<(String, Call<V, E>)> + Send + Sync;

struct SubscriptionState<P, V, E> {
    last_params: Option<P>,
    last_requests: Vec<PendingRequest<V, E>>,
    destroyed: bool,
}

struct Inner<P, V, E> {
    queue: Arc<DispatchQueue<V, E>>,
    router: Arc<ResultRouter<V, E>>,
    compose: Box<Compose<P, V, E>>,
    state: Mutex<SubscriptionState<P, V, E>>,
}

impl<P, V, E> Inner<P, V, E> {
    fn check_alive(&self, state: &SubscriptionState<P, V, E>) -> Result<()> {
        if state.destroyed {
            warn!("subscription used after destroy()");
            Err(Error::Destroyed)
        } else {
            Ok(())
        }
    }
}

// What a registry needs from a subscription, independent of its parameter
// type.
trait LiveSubscription<V, E>: InterestSource<V, E> {
    fn invalidate(&self, sources: &[SourceId]) -> Result<usize>;
}

impl<P, V, E> InterestSource<V, E> for Inner<P, V, E>
where
    P: Send,
    V: Send,
    E: Send,
{
    fn still_interested(&self) -> Vec<PendingRequest<V, E>> {
        let guard = self.state.lock().unwrap();
        if guard.destroyed {
            Vec::new()
        } else {
            guard.last_requests.clone()
        }
    }
}

impl<P, V, E> LiveSubscription<V, E> for Inner<P, V, E>
where
    P: Send,
    V: Send + 'static,
    E: Send + 'static,
{
    fn invalidate(&self, sources: &[SourceId]) -> Result<usize> {
        let stale: Vec<PendingRequest<V, E>> = self
            .still_interested()
            .into_iter()
            .filter(|pending| sources.contains(&pending.request().source()))
            .collect();

        let count = stale.len();
        for pending in stale {
            self.queue.enqueue(pending)?;
        }

        Ok(count)
    }
}

/// A declarative consumer of a set of named queries.
///
/// Each call to [`fetch`](Subscription::fetch) starts a new cycle: the
/// compose function is run on the parameters, every resulting call is
/// enqueued, and once all of them have settled the observers receive the
/// combined outcomes. Outcomes of an older cycle that arrive after a newer
/// cycle has delivered are dropped; see [`ResultRouter`] for the exact
/// rules.
///
/// Dropping a subscription destroys it.
pub struct Subscription<P, V, E> {
    inner: Arc<Inner<P, V, E>>,
}

impl<P, V, E> Subscription<P, V, E>
where
    P: Clone + Send + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create a standalone subscription. Its requests are not merged into
    /// other flushes; use [`SubscriptionRegistry::register`] for that.
    pub fn new<S: Into<String>>(
        queue: &Arc<DispatchQueue<V, E>>,
        slots: impl IntoIterator<Item = S>,
        compose: impl Fn(&P) -> Vec<(String, Call<V, E>)> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Arc::clone(queue),
                router: ResultRouter::new(slots),
                compose: Box::new(compose),
                state: Mutex::new(SubscriptionState {
                    last_params: None,
                    last_requests: Vec::new(),
                    destroyed: false,
                }),
            }),
        }
    }

    /// Start a new fetch cycle. With `None`, the parameters of the previous
    /// cycle are reused; if there were none, nothing happens.
    ///
    /// The compose function runs without any of the subscription's locks
    /// held, so it may consult the subscription or its registry.
    pub fn fetch(&self, params: Option<P>) -> Result<()> {
        let params = {
            let guard = self.inner.state.lock().unwrap();
            self.inner.check_alive(&guard)?;

            match params.or_else(|| guard.last_params.clone()) {
                Some(params) => params,
                None => return Ok(()),
            }
        };

        let calls = (self.inner.compose)(&params);

        // Reject bad names before a cycle is opened for them
        let slots = self.inner.router.slots();
        if let Some((slot, _)) = calls.iter().find(|(slot, _)| !slots.contains(slot)) {
            return Err(Error::UnknownSlot { slot: slot.clone() });
        }

        let sequence = self.inner.router.begin();
        let requests = calls
            .into_iter()
            .map(|(slot, call)| -> Result<PendingRequest<V, E>> {
                let callback = self.inner.router.callback(&slot, sequence)?;
                Ok(PendingRequest::new(call, callback))
            })
            .collect::<Result<Vec<_>>>()?;

        {
            let mut guard = self.inner.state.lock().unwrap();
            // Destroyed while composing
            self.inner.check_alive(&guard)?;

            debug!("subscription fetching {} request(s)", requests.len());
            guard.last_params = Some(params);
            guard.last_requests = requests.clone();
        }

        // Enqueue outside of our own lock; the queue may consult
        // `still_interested` while flushing.
        for pending in requests {
            self.inner.queue.enqueue(pending)?;
        }

        Ok(())
    }

    pub fn subscribe(
        &self,
        observer: impl Fn(&Combined<V, E>) + Send + Sync + 'static,
    ) -> Result<ObserverId> {
        self.inner.check_alive(&self.inner.state.lock().unwrap())?;
        Ok(self.inner.router.subscribe(observer))
    }

    pub fn unsubscribe(&self, id: ObserverId) -> Result<bool> {
        self.inner.check_alive(&self.inner.state.lock().unwrap())?;
        Ok(self.inner.router.unsubscribe(id))
    }

    /// The requests issued by the most recent fetch cycle.
    pub fn still_interested(&self) -> Result<Vec<PendingRequest<V, E>>> {
        self.inner.check_alive(&self.inner.state.lock().unwrap())?;
        Ok(self.inner.still_interested())
    }

    /// Emit `combined` to the observers directly. Every in-flight cycle is
    /// forgotten, so its outcomes will not be emitted.
    pub fn intercept(&self, combined: &Combined<V, E>) -> Result<()> {
        self.inner.check_alive(&self.inner.state.lock().unwrap())?;
        self.inner.router.clear();
        self.inner.router.emit(combined);
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().unwrap().destroyed
    }
}

impl<P, V, E> Subscription<P, V, E> {
    /// Stop this subscription: observers are dropped, in-flight outcomes are
    /// ignored, and it no longer reports any interest. Every later call
    /// fails with [`Error::Destroyed`].
    pub fn destroy(&self) -> Result<()> {
        {
            let mut guard = self.inner.state.lock().unwrap();
            self.inner.check_alive(&guard)?;
            guard.destroyed = true;
            guard.last_requests.clear();
        }

        self.inner.router.close();
        Ok(())
    }
}

impl<P, V, E> Drop for Subscription<P, V, E> {
    fn drop(&mut self) {
        let mut guard = self.inner.state.lock().unwrap();
        if !guard.destroyed {
            guard.destroyed = true;
            guard.last_requests.clear();
            drop(guard);
            self.inner.router.close();
        }
    }
}

impl<P, V, E> Debug for Subscription<P, V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.inner.state.lock().unwrap();
        f.debug_struct("Subscription")
            .field("router", &self.inner.router)
            .field("last_requests", &guard.last_requests)
            .field("destroyed", &guard.destroyed)
            .finish()
    }
}

/// The set of live subscriptions whose interest is merged into flushes.
///
/// Pass the registry to [`DispatchQueue::with_interest`], then create
/// subscriptions with [`register`](SubscriptionRegistry::register). The
/// registry only holds weak references; a dropped subscription disappears
/// from it on its own.
pub struct SubscriptionRegistry<V, E> {
    live: Mutex<Vec<Weak<dyn LiveSubscription<V, E>>>>,
}

impl<V, E> Default for SubscriptionRegistry<V, E> {
    fn default() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
        }
    }
}

impl<V, E> SubscriptionRegistry<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a subscription on `queue` and track its interest.
    pub fn register<P, S>(
        &self,
        queue: &Arc<DispatchQueue<V, E>>,
        slots: impl IntoIterator<Item = S>,
        compose: impl Fn(&P) -> Vec<(String, Call<V, E>)> + Send + Sync + 'static,
    ) -> Subscription<P, V, E>
    where
        P: Clone + Send + 'static,
        S: Into<String>,
    {
        let subscription = Subscription::new(queue, slots, compose);
        let live: Arc<dyn LiveSubscription<V, E>> = subscription.inner.clone();

        let mut guard = self.live.lock().unwrap();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.push(Arc::downgrade(&live));

        subscription
    }

    /// Re-enqueue every live request whose source is in `sources`. Returns
    /// how many requests were enqueued.
    pub fn invalidate(&self, sources: &[SourceId]) -> Result<usize> {
        let mut total = 0;
        for live in self.upgrade() {
            total += live.invalidate(sources)?;
        }

        Ok(total)
    }
}

impl<V, E> SubscriptionRegistry<V, E> {
    fn upgrade(&self) -> Vec<Arc<dyn LiveSubscription<V, E>>> {
        let mut guard = self.live.lock().unwrap();
        guard.retain(|weak| weak.strong_count() > 0);
        guard.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of subscriptions that are still alive.
    pub fn len(&self) -> usize {
        self.upgrade().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V, E> InterestSource<V, E> for SubscriptionRegistry<V, E>
where
    V: Send,
    E: Send,
{
    fn still_interested(&self) -> Vec<PendingRequest<V, E>> {
        // Collected without holding the registry lock while subscriptions
        // lock their own state.
        self.upgrade()
            .iter()
            .flat_map(|live| live.still_interested())
            .collect()
    }
}

impl<V, E> Debug for SubscriptionRegistry<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("live", &self.upgrade().len())
            .finish()
    }
}

/// Fetch a set of named calls once, through `queue`, and resolve to their
/// outcomes in the order given.
///
/// Nothing is enqueued until the returned future is first polled. If the
/// queue loses a call without delivering anything (for instance because the
/// executor shut down), this fails with [`Error::Abandoned`].
pub async fn fetch_all<V, E, S>(
    queue: &Arc<DispatchQueue<V, E>>,
    calls: impl IntoIterator<Item = (S, Call<V, E>)>,
) -> Result<Combined<V, E>>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    S: Into<String>,
{
    let mut receivers = Vec::new();

    for (slot, call) in calls {
        let (send, recv) = oneshot::channel();
        let send = Mutex::new(Some(send));

        queue.load(
            call,
            Callback::new(move |outcome: &Outcome<V, E>| {
                if let Some(send) = send.lock().unwrap().take() {
                    // The receiver is gone only if the caller stopped waiting
                    let _ = send.send(outcome.clone());
                }
            }),
        )?;

        receivers.push((slot.into(), recv));
    }

    let mut combined = IndexMap::with_capacity(receivers.len());
    for (slot, recv) in receivers {
        match recv.await {
            Ok(outcome) => {
                combined.insert(slot, outcome);
            }
            Err(oneshot::Canceled) => return Err(Error::Abandoned { slot }),
        }
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{args::Arg, queue::DispatchRules, request::Query};
    use futures::{executor, future};

    fn pool() -> executor::ThreadPool {
        executor::ThreadPool::builder().pool_size(1).create().unwrap()
    }

    fn echo() -> Query<i32, ()> {
        Query::new(|args: &[Arg]| {
            future::ready(Ok(args.first().and_then(Arg::as_f64).unwrap_or(0.0) as i32))
        })
    }

    #[test]
    fn fetch_without_params_is_a_no_op() {
        let queue = DispatchQueue::new(DispatchRules::default(), pool());
        let query = echo();
        let subscription: Subscription<i32, i32, ()> =
            Subscription::new(&queue, ["x"], move |p: &i32| {
                vec![("x".to_owned(), query.call(vec![Arg::from(*p)]))]
            });

        subscription.fetch(None).unwrap();
        assert_eq!(queue.queue_size(), 0);
        assert!(subscription.still_interested().unwrap().is_empty());
    }

    #[test]
    fn unknown_slot_fails_the_fetch() {
        let queue = DispatchQueue::new(DispatchRules::default(), pool());
        let query = echo();
        let subscription: Subscription<i32, i32, ()> =
            Subscription::new(&queue, ["x"], move |p: &i32| {
                vec![("y".to_owned(), query.call(vec![Arg::from(*p)]))]
            });

        assert!(matches!(
            subscription.fetch(Some(1)),
            Err(Error::UnknownSlot { slot }) if slot == "y"
        ));
        assert_eq!(queue.queue_size(), 0);
    }

    #[test]
    fn destroyed_subscription_rejects_everything() {
        let queue = DispatchQueue::new(DispatchRules::default(), pool());
        let subscription: Subscription<i32, i32, ()> =
            Subscription::new(&queue, ["x"], |_: &i32| Vec::new());

        subscription.destroy().unwrap();
        assert!(subscription.is_destroyed());

        assert!(matches!(subscription.fetch(Some(1)), Err(Error::Destroyed)));
        assert!(matches!(subscription.subscribe(|_| {}), Err(Error::Destroyed)));
        assert!(matches!(subscription.still_interested(), Err(Error::Destroyed)));
        assert!(matches!(
            subscription.intercept(&Combined::new()),
            Err(Error::Destroyed)
        ));
        assert!(matches!(subscription.destroy(), Err(Error::Destroyed)));
    }

    #[test]
    fn registry_forgets_dropped_subscriptions() {
        let registry: Arc<SubscriptionRegistry<i32, ()>> = SubscriptionRegistry::new();
        let queue = DispatchQueue::with_interest(DispatchRules::default(), pool(), registry.clone());
        let query = echo();

        let subscription: Subscription<i32, i32, ()> =
            registry.register(&queue, ["x"], move |p: &i32| {
                vec![("x".to_owned(), query.call(vec![Arg::from(*p)]))]
            });
        assert_eq!(registry.len(), 1);

        subscription.fetch(Some(4)).unwrap();
        assert_eq!(registry.still_interested().len(), 1);

        drop(subscription);
        assert!(registry.is_empty());
        assert!(registry.still_interested().is_empty());
    }

    #[test]
    fn compose_may_consult_the_registry() {
        let registry: Arc<SubscriptionRegistry<i32, ()>> = SubscriptionRegistry::new();
        let queue = DispatchQueue::with_interest(DispatchRules::default(), pool(), registry.clone());
        let query = echo();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription: Subscription<i32, i32, ()> = {
            let interest = registry.clone();
            let seen = seen.clone();
            registry.register(&queue, ["x"], move |p: &i32| {
                seen.lock().unwrap().push(interest.still_interested().len());
                vec![("x".to_owned(), query.call(vec![Arg::from(*p)]))]
            })
        };

        subscription.fetch(Some(1)).unwrap();
        subscription.fetch(Some(2)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn fetch_all_combines_in_order() {
        let queue = DispatchQueue::new(DispatchRules::default(), pool());
        let query = echo();

        let combined = executor::block_on(fetch_all(
            &queue,
            vec![
                ("b", query.call(vec![Arg::from(2)])),
                ("a", query.call(vec![Arg::from(1)])),
            ],
        ))
        .unwrap();

        let names: Vec<_> = combined.keys().cloned().collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(combined["a"], Outcome::Success(1));
        assert_eq!(combined["b"], Outcome::Success(2));
    }
}
