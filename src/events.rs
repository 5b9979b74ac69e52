//! Deferred client-visible actions, drained by the playing worker at frame
//! boundaries or by the loader once the media finishes loading.

use std::collections::VecDeque;

use parking_lot::{Mutex, MutexGuard};

/// A client call issued before the media finished loading, replayed once
/// it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingOp {
    Play,
    Pause,
    Seek(i64),
}

/// An action whose client-visible signal is deferred until the pipeline
/// actually delivers frames from the new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    Played,
    Paused,
    Stopped,
    Seeked,
    Retry(PendingOp),
}

/// Strictly FIFO list of deferred actions. An action the dispatcher cannot
/// consume yet halts the drain and keeps itself and its successors queued.
#[derive(Default)]
pub(crate) struct EventList {
    queue: Mutex<VecDeque<Deferred>>,
    drain: Mutex<()>,
}

impl EventList {
    pub(crate) fn push(&self, event: Deferred) {
        self.queue.lock().push_back(event);
    }

    /// Pushes `event` unless an identical one is already queued. Used for
    /// seeks so that rapidly coalesced requests settle into one signal.
    pub(crate) fn push_unique(&self, event: Deferred) {
        let mut queue = self.queue.lock();
        if !queue.contains(&event) {
            queue.push_back(event);
        }
    }

    /// Serializes drains from concurrent workers; hold the guard across a
    /// full drain.
    pub(crate) fn drain_guard(&self) -> MutexGuard<'_, ()> {
        self.drain.lock()
    }

    pub(crate) fn front(&self) -> Option<Deferred> {
        self.queue.lock().front().copied()
    }

    pub(crate) fn pop_front(&self) {
        self.queue.lock().pop_front();
    }

    pub(crate) fn clear(&self) {
        self.queue.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order() {
        let events = EventList::default();
        events.push(Deferred::Played);
        events.push(Deferred::Seeked);
        events.push(Deferred::Stopped);

        let mut seen = Vec::new();
        while let Some(event) = events.front() {
            seen.push(event);
            events.pop_front();
        }
        assert_eq!(
            seen,
            vec![Deferred::Played, Deferred::Seeked, Deferred::Stopped]
        );
    }

    #[test]
    fn unconsumable_event_keeps_successors() {
        let events = EventList::default();
        events.push(Deferred::Seeked);
        events.push(Deferred::Paused);

        // A dispatcher that cannot consume the front leaves everything.
        let front = events.front().unwrap();
        assert_eq!(front, Deferred::Seeked);
        assert_eq!(events.front(), Some(Deferred::Seeked));
    }

    #[test]
    fn push_unique_coalesces_duplicates() {
        let events = EventList::default();
        events.push_unique(Deferred::Seeked);
        events.push_unique(Deferred::Seeked);

        assert_eq!(events.front(), Some(Deferred::Seeked));
        events.pop_front();
        assert_eq!(events.front(), None);
    }

    #[test]
    fn retries_keep_their_payload() {
        let events = EventList::default();
        events.push(Deferred::Retry(PendingOp::Seek(5000)));
        assert_eq!(events.front(), Some(Deferred::Retry(PendingOp::Seek(5000))));
    }
}
