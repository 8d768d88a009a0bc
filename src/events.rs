//! Per-instance listener registry.
//!
//! Every [`Request`](crate::Request), [`Response`](crate::Response) and
//! [`Server`](crate::Server) owns one [`Listeners`] list. There is no global
//! bus: a listener only ever sees events of the instance it subscribed to.
//!
//! The list lives inside its owner's mutex. Emitting is split in two steps so
//! no listener ever runs while that mutex is held:
//!
//! ```text
//! lock owner ── listeners.take_for(kind) ── unlock ── call each listener
//! ```

use std::sync::Arc;

/// A registered callback.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync + 'static>;

/// An event that can be routed to listeners by kind.
pub trait Event {
    type Kind: Copy + Eq;

    fn kind(&self) -> Self::Kind;
}

/// Handle returned by every `on`/`once` call. Pass it back to `off` to
/// unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Subscription(u64);

struct Entry<E: Event> {
    id: u64,
    kind: E::Kind,
    once: bool,
    listener: Listener<E>,
}

pub(crate) struct Listeners<E: Event> {
    next_id: u64,
    entries: Vec<Entry<E>>,
}

impl<E: Event> Listeners<E> {
    pub(crate) fn new() -> Self {
        Self { next_id: 0, entries: Vec::new() }
    }

    pub(crate) fn subscribe(&mut self, kind: E::Kind, once: bool, listener: Listener<E>) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(Entry { id, kind, once, listener });
        Subscription(id)
    }

    pub(crate) fn unsubscribe(&mut self, sub: Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != sub.0);
        self.entries.len() != before
    }

    /// Snapshot of the listeners for `kind`, in subscription order. `once`
    /// entries are removed as part of the snapshot.
    pub(crate) fn take_for(&mut self, kind: E::Kind) -> Vec<Listener<E>> {
        let out = self.entries.iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.listener))
            .collect();
        self.entries.retain(|e| !(e.once && e.kind == kind));
        out
    }

    /// Claims a single subscription for a one-off delivery. Returns `None`
    /// if it was unsubscribed in the meantime.
    pub(crate) fn take_one(&mut self, sub: Subscription) -> Option<Listener<E>> {
        let pos = self.entries.iter().position(|e| e.id == sub.0)?;
        if self.entries[pos].once {
            Some(self.entries.remove(pos).listener)
        } else {
            Some(Arc::clone(&self.entries[pos].listener))
        }
    }
}

pub(crate) fn dispatch<E>(listeners: Vec<Listener<E>>, event: &E) {
    for listener in listeners {
        listener(event);
    }
}
