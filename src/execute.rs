use log::trace;

use crate::{group::RequestGroup, request::Outcome};

/// Run the fetch for a group exactly once, then deliver the outcome to every
/// callback in the group, in insertion order.
///
/// A failed fetch is not an error here: it becomes an [`Outcome::Failure`]
/// and is delivered like any other outcome. This future never fails.
pub async fn execute<V, E>(group: RequestGroup<V, E>) {
    let (call, callbacks) = group.into_parts();
    trace!(
        "executing {} for {} callback(s)",
        call.request(),
        callbacks.len()
    );

    let outcome: Outcome<V, E> = call.invoke().await.into();
    callbacks.deliver_all(&outcome);
}
