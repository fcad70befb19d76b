//! Routing table from event kind to ingest handler.

use std::collections::HashMap;

use tracing::debug;

use crate::event::Event;

/// Handler for one event kind.
pub type KindHandler = Box<dyn FnMut(Event) + Send>;

/// Classifies inbound events by kind and routes each to its registered
/// reconciler. Dispatch is synchronous and total: every event is routed
/// exactly once, and unknown kinds are dropped without error so newer
/// event types never break older clients.
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<u32, KindHandler>,
}

impl Dispatcher {
    /// Empty routing table.
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Register the handler for a kind, replacing any previous one.
    pub fn register(&mut self, kind: u32, handler: KindHandler) {
        self.routes.insert(kind, handler);
    }

    /// Route one event.
    pub fn dispatch(&mut self, event: Event) {
        match self.routes.get_mut(&event.kind) {
            Some(handler) => handler(event),
            None => debug!(kind = event.kind, id = %event.id, "unknown kind dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KIND_DM, KIND_POST, KIND_PROFILE};
    use std::sync::{Arc, Mutex};

    fn event_of_kind(kind: u32) -> Event {
        Event {
            id: format!("id-{kind}"),
            pubkey: String::new(),
            kind,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn routes_by_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::new();
        for kind in [KIND_PROFILE, KIND_POST, KIND_DM] {
            let sink = Arc::clone(&log);
            d.register(kind, Box::new(move |ev| sink.lock().unwrap().push(ev.kind)));
        }
        d.dispatch(event_of_kind(KIND_DM));
        d.dispatch(event_of_kind(KIND_POST));
        d.dispatch(event_of_kind(KIND_PROFILE));
        assert_eq!(*log.lock().unwrap(), vec![4, 1, 0]);
    }

    #[test]
    fn unknown_kinds_are_dropped_silently() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::new();
        let sink = Arc::clone(&log);
        d.register(1, Box::new(move |ev| sink.lock().unwrap().push(ev.id)));
        d.dispatch(event_of_kind(30023));
        d.dispatch(event_of_kind(7));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn reregistering_replaces_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::new();
        let sink = Arc::clone(&log);
        d.register(1, Box::new(move |_| sink.lock().unwrap().push("old")));
        let sink = Arc::clone(&log);
        d.register(1, Box::new(move |_| sink.lock().unwrap().push("new")));
        d.dispatch(event_of_kind(1));
        assert_eq!(*log.lock().unwrap(), vec!["new"]);
    }
}
