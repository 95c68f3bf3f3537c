//! Debug event notifications.
//!
//! Subscribers register per event kind and are called synchronously from the
//! operation that publishes the event.

use crate::core::{ResetType, RunKind};

use std::collections::HashMap;

/// A debug lifecycle event.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum DebugEvent {
    /// The core is about to be halted.
    PreHalt,
    /// The core was halted.
    PostHalt,
    /// The core is about to run, either resuming or stepping.
    PreRun(RunKind),
    /// The core started running.
    PostRun(RunKind),
    /// The core is about to be reset.
    PreReset(ResetType),
    /// The core was reset.
    PostReset(ResetType),
    /// The session is about to disconnect from the target.
    PreDisconnect,
}

/// The key a subscription is registered under.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DebugEventKind {
    /// Matches [`DebugEvent::PreHalt`].
    PreHalt,
    /// Matches [`DebugEvent::PostHalt`].
    PostHalt,
    /// Matches [`DebugEvent::PreRun`].
    PreRun,
    /// Matches [`DebugEvent::PostRun`].
    PostRun,
    /// Matches [`DebugEvent::PreReset`].
    PreReset,
    /// Matches [`DebugEvent::PostReset`].
    PostReset,
    /// Matches [`DebugEvent::PreDisconnect`].
    PreDisconnect,
}

impl DebugEvent {
    /// The kind this event is delivered under.
    pub fn kind(&self) -> DebugEventKind {
        match self {
            DebugEvent::PreHalt => DebugEventKind::PreHalt,
            DebugEvent::PostHalt => DebugEventKind::PostHalt,
            DebugEvent::PreRun(_) => DebugEventKind::PreRun,
            DebugEvent::PostRun(_) => DebugEventKind::PostRun,
            DebugEvent::PreReset(_) => DebugEventKind::PreReset,
            DebugEvent::PostReset(_) => DebugEventKind::PostReset,
            DebugEvent::PreDisconnect => DebugEventKind::PreDisconnect,
        }
    }
}

/// A subscriber callback.
pub type EventHandler = Box<dyn FnMut(&DebugEvent) + Send>;

/// The pub/sub hub for debug events.
#[derive(Default)]
pub struct EventHub {
    subscribers: HashMap<DebugEventKind, Vec<EventHandler>>,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("kinds", &self.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EventHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&mut self, kind: DebugEventKind, handler: EventHandler) {
        self.subscribers.entry(kind).or_default().push(handler);
    }

    /// Deliver `event` to all subscribers of its kind.
    pub fn notify(&mut self, event: &DebugEvent) {
        if let Some(handlers) = self.subscribers.get_mut(&event.kind()) {
            for handler in handlers {
                handler(event);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscribers_only_see_their_kind() {
        let mut hub = EventHub::new();
        let halts = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&halts);
        hub.subscribe(
            DebugEventKind::PostHalt,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        hub.notify(&DebugEvent::PostHalt);
        hub.notify(&DebugEvent::PreRun(RunKind::Resume));
        hub.notify(&DebugEvent::PostHalt);

        assert_eq!(halts.load(Ordering::SeqCst), 2);
    }
}
