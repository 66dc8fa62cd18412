//! Grouping of buffered requests into one unit of work per distinct request.

use std::fmt::{self, Debug, Formatter};

use crate::{
    callback::{Callback, CallbackSet},
    error::{Error, Result},
    request::{Call, Request},
};

/// A single queued request and the callback that wants its outcome.
pub struct PendingRequest<V, E> {
    pub call: Call<V, E>,
    pub callback: Callback<V, E>,
}

impl<V, E> PendingRequest<V, E> {
    pub fn new(call: Call<V, E>, callback: Callback<V, E>) -> Self {
        Self { call, callback }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        self.call.request()
    }
}

impl<V, E> Clone for PendingRequest<V, E> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
            callback: self.callback.clone(),
        }
    }
}

impl<V, E> Debug for PendingRequest<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("request", self.request())
            .field("callback", &self.callback.token())
            .finish()
    }
}

/// Every callback interested in one distinct request, within one batch.
/// Created by [`group`], consumed exactly once by [`execute`].
///
/// [`execute`]: crate::execute
pub struct RequestGroup<V, E> {
    call: Call<V, E>,
    callbacks: CallbackSet<V, E>,
}

impl<V, E> RequestGroup<V, E> {
    fn seed(pending: PendingRequest<V, E>) -> Self {
        let PendingRequest { call, callback } = pending;
        let mut callbacks = CallbackSet::new();
        callbacks.insert(callback);

        Self { call, callbacks }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        self.call.request()
    }

    #[inline]
    pub fn call(&self) -> &Call<V, E> {
        &self.call
    }

    #[inline]
    pub fn callbacks(&self) -> &CallbackSet<V, E> {
        &self.callbacks
    }

    pub(crate) fn into_parts(self) -> (Call<V, E>, CallbackSet<V, E>) {
        (self.call, self.callbacks)
    }
}

impl<V, E> Debug for RequestGroup<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGroup")
            .field("request", self.request())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Partition pending requests into groups of equal requests, in first-seen
/// order. The callbacks of every equal request are merged into one group.
///
/// Each request is compared against every group created so far, so this is
/// O(n·g) for n requests and g distinct groups. Workloads are expected to be
/// duplicate-heavy, keeping g small.
///
/// Grouping an empty list is a logic error and returns
/// [`Error::EmptyQueue`].
pub fn group<V, E>(
    requests: impl IntoIterator<Item = PendingRequest<V, E>>,
) -> Result<Vec<RequestGroup<V, E>>> {
    let mut requests = requests.into_iter();
    let first = requests.next().ok_or(Error::EmptyQueue)?;

    let mut groups = vec![RequestGroup::seed(first)];

    for pending in requests {
        match groups
            .iter_mut()
            .find(|group| group.request().is_same(pending.request()))
        {
            Some(group) => {
                group.callbacks.insert(pending.callback);
            }
            None => groups.push(RequestGroup::seed(pending)),
        }
    }

    Ok(groups)
}

/// Attach the callbacks of `extra` requests to the existing groups they
/// match. Requests without a matching group are ignored: late interest only
/// ever joins work that is already part of this batch.
pub fn merge_external<V, E>(
    groups: &mut [RequestGroup<V, E>],
    extra: impl IntoIterator<Item = PendingRequest<V, E>>,
) {
    for pending in extra {
        if let Some(group) = groups
            .iter_mut()
            .find(|group| group.request().is_same(pending.request()))
        {
            group.callbacks.insert(pending.callback);
        }
    }
}
