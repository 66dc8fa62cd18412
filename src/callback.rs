use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::request::Outcome;

/// Allocate the next identifier from a process-wide counter. Identifiers
/// start at 1 and are never reused; we assume the process won't live long
/// enough to run out of them.
pub(crate) fn next_id(counter: &AtomicUsize) -> NonZeroUsize {
    let id = counter.fetch_add(1, Ordering::Relaxed) + 1;
    NonZeroUsize::new(id).expect("Overflow when creating token")
}

static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(0);

/// Identity of a [`Callback`]. Every call to [`Callback::new`] gets a fresh
/// token; clones of a callback share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(NonZeroUsize);

/// A registered receiver for the outcome of a request.
///
/// Membership in a [`CallbackSet`] is decided by the callback's [`Token`],
/// not by the identity of the closure inside it. Enqueueing the same
/// `Callback` (or a clone of it) several times therefore results in a single
/// delivery, while two separately created callbacks wrapping the same
/// closure are delivered to separately.
pub struct Callback<V, E> {
    token: Token,
    deliver: Arc<dyn Fn(&Outcome<V, E>) + Send + Sync>,
}

impl<V, E> Callback<V, E> {
    pub fn new(deliver: impl Fn(&Outcome<V, E>) + Send + Sync + 'static) -> Self {
        Self {
            token: Token(next_id(&NEXT_TOKEN)),
            deliver: Arc::new(deliver),
        }
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn deliver(&self, outcome: &Outcome<V, E>) {
        (self.deliver)(outcome)
    }
}

impl<V, E> Clone for Callback<V, E> {
    fn clone(&self) -> Self {
        Self {
            token: self.token,
            deliver: self.deliver.clone(),
        }
    }
}

impl<V, E> Debug for Callback<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("token", &self.token)
            .field("deliver", &"<closure>")
            .finish()
    }
}

/// An insertion-ordered set of callbacks, all interested in the same
/// outcome. Outcomes are delivered in insertion order.
///
/// Sets are small in practice (one entry per distinct consumer of a single
/// request), so membership is a linear scan.
pub struct CallbackSet<V, E> {
    callbacks: Vec<Callback<V, E>>,
}

impl<V, E> Default for CallbackSet<V, E> {
    fn default() -> Self {
        Self {
            callbacks: Vec::with_capacity(1),
        }
    }
}

impl<V, E> CallbackSet<V, E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback to the set. Returns false, and leaves the set
    /// unchanged, if a callback with the same token is already present.
    pub fn insert(&mut self, callback: Callback<V, E>) -> bool {
        if self.contains(callback.token) {
            false
        } else {
            self.callbacks.push(callback);
            true
        }
    }

    pub fn contains(&self, token: Token) -> bool {
        self.callbacks.iter().any(|callback| callback.token == token)
    }

    /// Remove the callback with this token. Returns true if it was present.
    pub fn remove(&mut self, token: Token) -> bool {
        match self.callbacks.iter().position(|callback| callback.token == token) {
            Some(index) => {
                self.callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.callbacks.iter().map(|callback| callback.token)
    }

    /// Deliver the same outcome to every callback, in insertion order.
    pub fn deliver_all(&self, outcome: &Outcome<V, E>) {
        self.callbacks
            .iter()
            .for_each(|callback| callback.deliver(outcome));
    }
}

impl<V, E> Debug for CallbackSet<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.tokens()).finish()
    }
}
