//! Querybatch is a windowed, de-duplicating fetch scheduler. Many independent
//! consumers ask for data through small, declarative requests ("call this
//! query with these arguments"); querybatch collects the requests that arrive
//! within a short window, collapses equal requests into one, runs each
//! distinct fetch exactly once, and hands the same outcome to every consumer
//! that asked for it.
//!
//! ## Overview
//!
//! A [`Query`] is a fetch function with an identity. Calling it with
//! arguments produces a [`Call`]: a [`Request`] descriptor bound to the
//! function that fetches it. Two requests are the same if they come from the
//! same query and their arguments compare equal (see the [`args`] module for
//! the exact rules).
//!
//! ```
//! use futures::future;
//! use querybatch::{Arg, Query};
//!
//! let add: Query<f64, String> = Query::new(|args: &[Arg]| {
//!     let sum = args.iter().filter_map(Arg::as_f64).sum();
//!     future::ready(Ok(sum))
//! });
//!
//! let first = add.call(vec![Arg::from(1), Arg::from(2)]);
//! let second = add.call(vec![Arg::from(1), Arg::from(2), Arg::Undefined]);
//!
//! // Trailing undefined arguments don't count
//! assert!(first.request().is_same(second.request()));
//! ```
//!
//! Calls are sent through a [`DispatchQueue`]. The first call to arrive at an
//! idle queue opens a window (1ms by default; see [`DispatchRules`]). When it
//! closes, the buffered calls are grouped, and one fetch is spawned per
//! group. Every [`Callback`] registered for the group receives the same
//! [`Outcome`], whether the fetch succeeded or failed.
//!
//! querybatch doesn't pick an async runtime. The window timer and every
//! fetch are spawned onto whatever [`Spawn`] implementation the queue is
//! created with; timing uses [`futures_timer`].
//!
//! ```
//! use futures::{executor::{self, ThreadPool}, future};
//! use querybatch::{fetch_all, Arg, DispatchQueue, DispatchRules, Outcome, Query};
//!
//! let double: Query<i64, String> = Query::new(|args: &[Arg]| {
//!     let value = args.first().and_then(Arg::as_f64).unwrap_or(0.0);
//!     future::ready(Ok(value as i64 * 2))
//! });
//!
//! let queue = DispatchQueue::new(DispatchRules::default(), ThreadPool::new().unwrap());
//!
//! let combined = executor::block_on(fetch_all(&queue, vec![
//!     ("a", double.call(vec![Arg::from(21)])),
//!     ("b", double.call(vec![Arg::from(21)])),
//! ])).unwrap();
//!
//! assert_eq!(combined["a"], Outcome::Success(42));
//! assert_eq!(combined["b"], Outcome::Success(42));
//! ```
//!
//! For long-lived consumers, a [`Subscription`] maps parameters to a set of
//! named calls, and emits one [`Combined`] result to its observers for each
//! fetch cycle, dropping results that were overtaken by a newer cycle.
//! Subscriptions created through a [`SubscriptionRegistry`] also report
//! their latest requests back to the queue, so that a consumer which is
//! already interested in a request joins any batch that fetches it again.
//!
//! ## Design notes
//!
//! ### Callbacks are identified by token
//!
//! A [`Callback`] gets a fresh [`Token`] when it is created, and clones share
//! it. Callback sets are de-duplicated by token, so registering the same
//! callback twice for one request results in a single delivery, while two
//! callbacks created separately are always delivered to separately.
//!
//! ### Failures are data
//!
//! A failed fetch is delivered as [`Outcome::Failure`] to every interested
//! callback, exactly like a success. The crate's own [`Error`] type only
//! describes misuse of the scheduler: flushing an empty queue, naming an
//! unknown slot, using a destroyed subscription, or a spawner that refuses
//! work.
//!
//! ### Caching
//!
//! The dispatch queue itself never caches. A [`WorkerPool`] can be used by
//! fetch functions that want to share one in-flight or recently completed
//! fetch per distinct request; see the [`cache`] module.
//!
//! [`Spawn`]: futures::task::Spawn

pub mod args;
pub mod cache;
mod callback;
mod error;
mod execute;
mod group;
mod queue;
mod request;
mod router;
mod subscription;

pub use args::{equal, normalize, Arg, Handle, Signature};
pub use cache::{Phase, Worker, WorkerPool, CLEANUP_INTERVAL};
pub use callback::{Callback, CallbackSet, Token};
pub use error::{Error, Result};
pub use execute::execute;
pub use group::{group, merge_external, PendingRequest, RequestGroup};
pub use queue::{DispatchQueue, DispatchRules, FlushStats, InterestSource};
pub use request::{
    Call, FetchFn, FetchFuture, Outcome, Query, Request, SourceId, DEFAULT_CACHE_TIME,
};
pub use router::{Combined, ObserverId, ResultRouter, SequenceToken};
pub use subscription::{fetch_all, Compose, Subscription, SubscriptionRegistry};
