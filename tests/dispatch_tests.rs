//! These tests are intended to ensure that each distinct request is fetched
//! the correct number of times, and that every consumer sees its outcome.

use crossbeam;
use futures::{
    executor, future,
    task::{self, FutureObj, Spawn, SpawnError},
    FutureExt,
};
use querybatch::{
    fetch_all, Arg, Callback, DispatchQueue, DispatchRules, Error, FlushStats, Outcome, Query,
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    task::{Context, Poll},
    thread,
    time::Duration,
};

fn pool() -> executor::ThreadPool {
    executor::ThreadPool::builder().pool_size(2).create().unwrap()
}

fn counted<F>(counter: &Arc<AtomicUsize>, function: F) -> Query<Value, String>
where
    F: Fn(&[Arg]) -> Value + Send + Sync + 'static,
{
    let counter = counter.clone();
    Query::new(move |args: &[Arg]| {
        counter.fetch_add(1, Ordering::SeqCst);
        future::ready(Ok(function(args)))
    })
}

fn number(args: &[Arg], index: usize) -> f64 {
    args.get(index).and_then(Arg::as_f64).unwrap_or(0.0)
}

#[test]
fn duplicates_are_fetched_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let add = counted(&counter, |args| json!(number(args, 0) + number(args, 1)));
    let queue = DispatchQueue::new(DispatchRules::default(), pool());

    let combined = executor::block_on(fetch_all(
        &queue,
        (0..7).map(|i| (format!("sum{}", i), add.call(vec![Arg::from(1), Arg::from(2)]))),
    ))
    .unwrap();

    assert_eq!(combined.len(), 7);
    assert!(combined.values().all(|outcome| *outcome == Outcome::Success(json!(3.0))));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_fetches_share_groups() {
    let x_count = Arc::new(AtomicUsize::new(0));
    let y_count = Arc::new(AtomicUsize::new(0));
    let z_count = Arc::new(AtomicUsize::new(0));

    let x = counted(&x_count, |args| json!(number(args, 0) + number(args, 1)));
    let y = counted(&y_count, |args| json!(number(args, 0) * number(args, 1)));
    let z = counted(&z_count, |_| json!("hello"));

    let rules = DispatchRules {
        window: Duration::from_millis(20),
        debug: true,
    };
    let queue = DispatchQueue::new(rules, pool());

    let calls = || {
        vec![
            ("x", x.call(vec![Arg::from(1), Arg::from(2)])),
            ("y", y.call(vec![Arg::from(1), Arg::from(3)])),
            ("z", z.call(vec![])),
        ]
    };

    let (first, second) =
        executor::block_on(future::join(fetch_all(&queue, calls()), fetch_all(&queue, calls())));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first, second);
    assert_eq!(first["x"], Outcome::Success(json!(3.0)));
    assert_eq!(first["y"], Outcome::Success(json!(3.0)));
    assert_eq!(first["z"], Outcome::Success(json!("hello")));

    assert_eq!(x_count.load(Ordering::SeqCst), 1);
    assert_eq!(y_count.load(Ordering::SeqCst), 1);
    assert_eq!(z_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        queue.last_flush(),
        Some(FlushStats {
            requests: 6,
            groups: 3
        })
    );
}

#[test]
fn failures_reach_every_consumer() {
    let query: Query<i32, String> = Query::new(|_: &[Arg]| future::ready(Err(String::from("down"))));
    let queue = DispatchQueue::new(DispatchRules::default(), pool());

    let combined = executor::block_on(fetch_all(
        &queue,
        vec![("a", query.call(vec![])), ("b", query.call(vec![Arg::Undefined]))],
    ))
    .unwrap();

    assert_eq!(combined["a"], Outcome::Failure(String::from("down")));
    assert_eq!(combined["b"], Outcome::Failure(String::from("down")));
}

#[test]
fn same_callback_is_delivered_once() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |_| json!(null));
    let rules = DispatchRules {
        window: Duration::from_secs(60),
        debug: true,
    };
    let queue = DispatchQueue::new(rules, pool());

    let (send, recv) = mpsc::channel();
    let send = std::sync::Mutex::new(send);
    let callback = Callback::new(move |outcome: &Outcome<Value, String>| {
        send.lock().unwrap().send(outcome.clone()).unwrap()
    });

    queue.load(query.call(vec![Arg::from("a")]), callback.clone()).unwrap();
    queue.load(query.call(vec![Arg::from("a")]), callback).unwrap();

    assert_eq!(queue.flush().unwrap(), FlushStats { requests: 2, groups: 1 });
    assert_eq!(
        recv.recv_timeout(Duration::from_secs(1)).unwrap(),
        Outcome::Success(json!(null))
    );
    assert!(recv.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn flushing_an_idle_queue_is_an_error() {
    let queue: Arc<DispatchQueue<Value, String>> =
        DispatchQueue::new(DispatchRules::default(), pool());

    assert!(matches!(queue.flush(), Err(Error::EmptyQueue)));
}

/// Enqueue the same request from several threads, and confirm that a single
/// fetch was made fulfilling all of them
#[test]
fn test_threaded() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |args| json!(number(args, 0)));

    let rules = DispatchRules {
        window: Duration::from_millis(50),
        debug: false,
    };
    let queue = DispatchQueue::new(rules, pool());
    let queue_ref = &queue;
    let query_ref = &query;

    let result: Vec<Outcome<Value, String>> = crossbeam::scope(move |s| {
        let threads: Vec<_> = (0..4)
            .map(move |i| {
                s.spawn(move |_s| {
                    thread::sleep(Duration::from_millis(i + 2));
                    let fut = fetch_all(queue_ref, vec![("n", query_ref.call(vec![Arg::from(5)]))]);
                    let mut combined = executor::block_on(fut).unwrap();
                    combined.swap_remove("n").unwrap()
                })
            })
            .collect();

        threads.into_iter().map(|t| t.join().unwrap()).collect()
    })
    .unwrap();

    assert_eq!(result, vec![Outcome::Success(json!(5.0)); 4]);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[test]
fn nothing_is_enqueued_until_polled() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |_| json!(true));

    let rules = DispatchRules {
        window: Duration::from_secs(60),
        debug: true,
    };
    let queue = DispatchQueue::new(rules, pool());

    // A waker that does nothing; we're manually calling poll
    let mut ctx = Context::from_waker(task::noop_waker_ref());

    let mut fut = fetch_all(
        &queue,
        vec![("a", query.call(vec![])), ("b", query.call(vec![]))],
    )
    .boxed();
    assert_eq!(queue.queue_size(), 0);

    assert!(fut.poll_unpin(&mut ctx).is_pending());
    assert_eq!(queue.queue_size(), 2);

    // The window is far away; close it by hand
    assert_eq!(queue.flush().unwrap(), FlushStats { requests: 2, groups: 1 });

    let combined = loop {
        match fut.poll_unpin(&mut ctx) {
            Poll::Ready(combined) => break combined.unwrap(),
            Poll::Pending => thread::sleep(Duration::from_millis(5)),
        }
    };

    assert_eq!(combined["a"], Outcome::Success(json!(true)));
    assert_eq!(combined["b"], Outcome::Success(json!(true)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

/// Spawns the first `remaining` tasks onto a thread pool, then behaves as if
/// the executor had shut down.
struct Limited {
    pool: executor::ThreadPool,
    remaining: AtomicUsize,
}

impl Limited {
    fn new(remaining: usize) -> Self {
        Limited {
            pool: pool(),
            remaining: AtomicUsize::new(remaining),
        }
    }
}

impl Spawn for Limited {
    fn spawn_obj(&self, future: FutureObj<'static, ()>) -> Result<(), SpawnError> {
        match self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(..) => self.pool.spawn_obj(future),
            Err(..) => Err(SpawnError::shutdown()),
        }
    }
}

#[test]
fn refused_window_keeps_nothing() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |_| json!(1));
    let queue = DispatchQueue::new(DispatchRules::default(), Limited::new(0));

    let result = queue.load(query.call(vec![]), Callback::new(|_| {}));
    assert!(matches!(result, Err(Error::Spawn(..))));
    assert_eq!(queue.queue_size(), 0);
}

#[test]
fn refused_fetch_fails_the_flush() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |_| json!(1));
    let rules = DispatchRules {
        window: Duration::from_secs(60),
        debug: true,
    };

    // Only the window timer gets spawned
    let queue = DispatchQueue::new(rules, Limited::new(1));
    queue.load(query.call(vec![]), Callback::new(|_| {})).unwrap();

    assert!(matches!(queue.flush(), Err(Error::Spawn(..))));
    assert_eq!(
        queue.last_flush(),
        Some(FlushStats {
            requests: 1,
            groups: 1
        })
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn lost_fetch_is_reported_as_abandoned() {
    let counter = Arc::new(AtomicUsize::new(0));
    let query = counted(&counter, |_| json!(1));
    let queue = DispatchQueue::new(DispatchRules::default(), Limited::new(1));

    let result = executor::block_on(fetch_all(&queue, vec![("lost", query.call(vec![]))]));

    assert!(matches!(result, Err(Error::Abandoned { slot }) if slot == "lost"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}
