//! Combining several named results into one emission.
//!
//! A [`ResultRouter`] has a fixed set of named slots. Each fetch cycle
//! starts with [`ResultRouter::begin`], which hands out a fresh
//! [`SequenceToken`] and registers it with every slot; callbacks created for
//! that token (see [`ResultRouter::callback`]) record their outcome into
//! their slot. Once every slot holds an outcome from the newest cycle that
//! has delivered anything, the combined result is emitted to observers.
//!
//! Repeated cycles can settle out of order. The rules are:
//!
//! - An outcome is only recorded if its token is still tracked by its slot.
//! - Recording an outcome for token `t` retires every older token of that
//!   slot. An older cycle whose result arrives after a newer one has landed
//!   is therefore dropped.
//! - An older cycle whose result arrives *before* the newer one lands is not
//!   retroactively discarded: it is recorded and may emit, and the newer
//!   one emits again when it arrives.

use std::{
    collections::BTreeSet,
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
    sync::{atomic::AtomicUsize, Arc, Mutex},
};

use indexmap::IndexMap;
use log::trace;

use crate::{
    callback::{next_id, Callback},
    error::{Error, Result},
    request::Outcome,
};

static NEXT_OBSERVER: AtomicUsize = AtomicUsize::new(0);

/// Marks one fetch cycle of a router. Later cycles have larger tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceToken(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(NonZeroUsize);

/// One outcome per slot name, in slot order.
pub type Combined<V, E> = IndexMap<String, Outcome<V, E>>;

type Observer<V, E> = Arc<dyn Fn(&Combined<V, E>) + Send + Sync>;

struct Slot<V, E> {
    name: String,
    sequences: BTreeSet<SequenceToken>,
    value: Option<(SequenceToken, Outcome<V, E>)>,
}

struct RouterState<V, E> {
    slots: Vec<Slot<V, E>>,
    next_sequence: u64,

    // The newest token that has recorded an outcome in any slot
    newest: Option<SequenceToken>,
}

impl<V: Clone, E: Clone> RouterState<V, E> {
    fn record(
        &mut self,
        index: usize,
        sequence: SequenceToken,
        outcome: &Outcome<V, E>,
    ) -> Option<Combined<V, E>> {
        let slot = &mut self.slots[index];

        if !slot.sequences.contains(&sequence) {
            trace!("dropping superseded result for slot {:?}", slot.name);
            return None;
        }

        slot.value = Some((sequence, outcome.clone()));
        slot.sequences = slot.sequences.split_off(&sequence);

        let newest = match self.newest {
            Some(newest) if newest > sequence => newest,
            _ => sequence,
        };
        self.newest = Some(newest);

        self.slots
            .iter()
            .map(|slot| match slot.value {
                Some((token, ref outcome)) if token == newest => {
                    Some((slot.name.clone(), outcome.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

pub struct ResultRouter<V, E> {
    state: Mutex<RouterState<V, E>>,
    observers: Mutex<Vec<(ObserverId, Observer<V, E>)>>,
}

impl<V, E> ResultRouter<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new<S: Into<String>>(slots: impl IntoIterator<Item = S>) -> Arc<Self> {
        let slots = slots
            .into_iter()
            .map(|name| Slot {
                name: name.into(),
                sequences: BTreeSet::new(),
                value: None,
            })
            .collect();

        Arc::new(Self {
            state: Mutex::new(RouterState {
                slots,
                next_sequence: 0,
                newest: None,
            }),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Start a new fetch cycle. The returned token is tracked by every slot
    /// until a newer token's result lands in that slot.
    pub fn begin(&self) -> SequenceToken {
        let mut guard = self.state.lock().unwrap();
        guard.next_sequence += 1;
        let sequence = SequenceToken(guard.next_sequence);

        for slot in guard.slots.iter_mut() {
            slot.sequences.insert(sequence);
        }

        sequence
    }

    /// Create the callback that delivers results for `slot` in the cycle
    /// identified by `sequence`.
    pub fn callback(self: &Arc<Self>, slot: &str, sequence: SequenceToken) -> Result<Callback<V, E>> {
        let index = self
            .state
            .lock()
            .unwrap()
            .slots
            .iter()
            .position(|candidate| candidate.name == slot)
            .ok_or_else(|| Error::UnknownSlot {
                slot: slot.to_owned(),
            })?;

        let router = Arc::clone(self);
        Ok(Callback::new(move |outcome: &Outcome<V, E>| {
            router.deliver(index, sequence, outcome)
        }))
    }

    fn deliver(&self, index: usize, sequence: SequenceToken, outcome: &Outcome<V, E>) {
        let combined = self.state.lock().unwrap().record(index, sequence, outcome);

        if let Some(combined) = combined {
            self.emit(&combined);
        }
    }

    /// Send a combined result to every observer, bypassing the slots.
    pub fn emit(&self, combined: &Combined<V, E>) {
        // Observers are called without holding any lock, so they may freely
        // subscribe, unsubscribe, or start another cycle.
        let observers: Vec<Observer<V, E>> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        observers.iter().for_each(|observer| observer(combined));
    }

    pub fn subscribe(&self, observer: impl Fn(&Combined<V, E>) + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(next_id(&NEXT_OBSERVER));
        self.observers.lock().unwrap().push((id, Arc::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut guard = self.observers.lock().unwrap();
        let before = guard.len();
        guard.retain(|(candidate, _)| *candidate != id);
        guard.len() != before
    }
}

impl<V, E> ResultRouter<V, E> {
    /// Forget every tracked cycle and recorded outcome. Results still in
    /// flight will be dropped when they arrive.
    pub fn clear(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.newest = None;
        guard.slots.iter_mut().for_each(|slot| {
            slot.sequences.clear();
            slot.value = None;
        });
    }

    /// Drop every observer and all tracking. Nothing is emitted afterwards
    /// unless new observers subscribe.
    pub fn close(&self) {
        self.observers.lock().unwrap().clear();
        self.clear();
    }

    pub fn slots(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .slots
            .iter()
            .map(|slot| slot.name.clone())
            .collect()
    }
}

impl<V, E> Debug for ResultRouter<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock().unwrap();
        f.debug_struct("ResultRouter")
            .field(
                "slots",
                &guard.slots.iter().map(|slot| &slot.name).collect::<Vec<_>>(),
            )
            .field("newest", &guard.newest)
            .finish()
    }
}
