//! Request descriptors, query definitions, and fetch outcomes.

use std::{
    fmt::{self, Debug, Display, Formatter},
    future::Future,
    num::NonZeroUsize,
    sync::{atomic::AtomicUsize, Arc},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt};

use crate::{
    args::{self, Arg, Signature},
    callback::next_id,
};

static NEXT_SOURCE: AtomicUsize = AtomicUsize::new(0);

/// The default time a successful result stays cached by a [`Worker`].
///
/// [`Worker`]: crate::Worker
pub const DEFAULT_CACHE_TIME: Duration = Duration::from_millis(1000);

/// Opaque identity of a query definition. Unique per [`Query`], and stable
/// for as long as that query (or any of its clones) lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(NonZeroUsize);

impl SourceId {
    pub fn new() -> Self {
        SourceId(next_id(&NEXT_SOURCE))
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Immutable description of a request: which source, with which arguments.
///
/// The [`Signature`] is computed once, here, and is what decides whether two
/// requests are the same; see the [`args`](crate::args) module.
#[derive(Clone)]
pub struct Request {
    source: SourceId,
    args: Arc<[Arg]>,
    signature: Signature,
}

impl Request {
    pub fn new(source: SourceId, args: impl IntoIterator<Item = Arg>) -> Self {
        let args: Arc<[Arg]> = args.into_iter().collect();
        let signature = args::normalize(&args);

        Self {
            source,
            args,
            signature,
        }
    }

    #[inline]
    pub fn source(&self) -> SourceId {
        self.source
    }

    #[inline]
    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Two requests are the same if they have the same source and equal
    /// signatures.
    pub fn is_same(&self, other: &Request) -> bool {
        self.source == other.source && args::equal(&self.signature, &other.signature)
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.is_same(other)
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("source", &self.source)
            .field("args", &self.args)
            .finish()
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Request({}, {} args)", self.source, self.args.len())
    }
}

/// The settled result of a fetch. Every callback interested in a request
/// observes the same `Outcome`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<V, E> {
    Success(V),
    Failure(E),
}

impl<V, E> Outcome<V, E> {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(..))
    }

    pub fn value(&self) -> Option<&V> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(..) => None,
        }
    }

    pub fn error(&self) -> Option<&E> {
        match self {
            Outcome::Success(..) => None,
            Outcome::Failure(error) => Some(error),
        }
    }

    pub fn into_result(self) -> Result<V, E> {
        self.into()
    }
}

impl<V, E> From<Result<V, E>> for Outcome<V, E> {
    fn from(result: Result<V, E>) -> Self {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(error) => Outcome::Failure(error),
        }
    }
}

impl<V, E> From<Outcome<V, E>> for Result<V, E> {
    fn from(outcome: Outcome<V, E>) -> Self {
        match outcome {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(error) => Err(error),
        }
    }
}

pub type FetchFuture<V, E> = BoxFuture<'static, Result<V, E>>;

/// The underlying fetch function of a query. It is handed the original
/// (un-normalized) arguments of the request.
pub type FetchFn<V, E> = Arc<dyn Fn(&[Arg]) -> FetchFuture<V, E> + Send + Sync>;

/// A query definition: a source identity bound to a fetch function.
/// Calling it with arguments (see [`Query::call`]) produces a [`Call`].
pub struct Query<V, E> {
    source: SourceId,
    fetch: FetchFn<V, E>,
    cache_time: Duration,
}

impl<V, E> Query<V, E> {
    pub fn new<F, Fut>(fetch: F) -> Self
    where
        F: Fn(&[Arg]) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        Self {
            source: SourceId::new(),
            fetch: Arc::new(move |args: &[Arg]| fetch(args).boxed()),
            cache_time: DEFAULT_CACHE_TIME,
        }
    }

    /// Set how long a successful result stays cached by a [`WorkerPool`].
    ///
    /// [`WorkerPool`]: crate::WorkerPool
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    #[inline]
    pub fn source(&self) -> SourceId {
        self.source
    }

    #[inline]
    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    pub fn call(&self, args: impl IntoIterator<Item = Arg>) -> Call<V, E> {
        Call {
            request: Request::new(self.source, args),
            fetch: self.fetch.clone(),
            cache_time: self.cache_time,
        }
    }
}

impl<V, E> Clone for Query<V, E> {
    fn clone(&self) -> Self {
        Self {
            source: self.source,
            fetch: self.fetch.clone(),
            cache_time: self.cache_time,
        }
    }
}

impl<V, E> Debug for Query<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("source", &self.source)
            .field("fetch", &"<closure>")
            .field("cache_time", &self.cache_time)
            .finish()
    }
}

/// A request together with the function that fetches it.
pub struct Call<V, E> {
    request: Request,
    fetch: FetchFn<V, E>,
    cache_time: Duration,
}

impl<V, E> Call<V, E> {
    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn cache_time(&self) -> Duration {
        self.cache_time
    }

    /// Start the underlying fetch with the request's original arguments.
    pub fn invoke(&self) -> FetchFuture<V, E> {
        (self.fetch)(self.request.args())
    }
}

impl<V, E> Clone for Call<V, E> {
    fn clone(&self) -> Self {
        Self {
            request: self.request.clone(),
            fetch: self.fetch.clone(),
            cache_time: self.cache_time,
        }
    }
}

impl<V, E> Debug for Call<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("request", &self.request)
            .field("fetch", &"<closure>")
            .finish()
    }
}
