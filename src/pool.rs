//! Relay pool: fans subscriptions and publications out across every
//! connected relay and merges their inbound streams into one deduplicated,
//! serialized event stream.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::event::Event;
use crate::relay::{Connection, Filter, Inbound, Outbound, RelayDescriptor};
use crate::store::{self, Store};

/// Handler for deduplicated inbound events; second argument is the relay URL
/// the event arrived from.
pub type EventHandler = Box<dyn FnMut(Event, &str) + Send>;
/// Handler for relay notices: `(relay url, notice text)`.
pub type NoticeHandler = Box<dyn FnMut(&str, &str) + Send>;

#[derive(Default)]
struct Handlers {
    event: Mutex<Option<EventHandler>>,
    notice: Mutex<Option<NoticeHandler>>,
}

/// Owns N concurrent relay connections behind one publish/subscribe surface.
///
/// All inbound traffic funnels through a single consumer task, so downstream
/// ingestion never races; dedup by event id happens there, against the
/// persistence port's `seen.<id>` index, before anything reaches the
/// registered handler.
pub struct RelayPool {
    relays: Mutex<HashMap<String, Connection>>,
    subs: Mutex<HashMap<String, Filter>>,
    inbound_tx: mpsc::Sender<Inbound>,
    handlers: Arc<Handlers>,
    tor_socks: Option<String>,
    consumer: tokio::task::JoinHandle<()>,
}

impl RelayPool {
    /// Create a pool with no relays. Must be called within a tokio runtime.
    pub fn new(store: Arc<dyn Store>, tor_socks: Option<String>) -> RelayPool {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let handlers = Arc::new(Handlers::default());
        let consumer = tokio::spawn(consume(inbound_rx, Arc::clone(&handlers), store));
        RelayPool {
            relays: Mutex::new(HashMap::new()),
            subs: Mutex::new(HashMap::new()),
            inbound_tx,
            handlers,
            tor_socks,
            consumer,
        }
    }

    /// Register the event handler. At most one is active; registering again
    /// replaces the previous one.
    pub fn on_event(&self, handler: EventHandler) {
        *self.handlers.event.lock().unwrap() = Some(handler);
    }

    /// Register the notice handler, replacing any previous one.
    pub fn on_notice(&self, handler: NoticeHandler) {
        *self.handlers.notice.lock().unwrap() = Some(handler);
    }

    /// Open a connection to a relay. Idempotent per URL: a second add of the
    /// same URL is a no-op and returns false. Connect failures are retried by
    /// the connection's own task and never block other relays.
    pub fn add_relay(&self, descriptor: RelayDescriptor) -> bool {
        let mut relays = self.relays.lock().unwrap();
        if relays.contains_key(&descriptor.url) {
            return false;
        }
        let subs = if descriptor.read {
            self.subs
                .lock()
                .unwrap()
                .iter()
                .map(|(id, f)| (id.clone(), f.clone()))
                .collect()
        } else {
            vec![]
        };
        let url = descriptor.url.clone();
        let conn = Connection::spawn(
            descriptor,
            self.tor_socks.clone(),
            self.inbound_tx.clone(),
            subs,
        );
        relays.insert(url, conn);
        true
    }

    /// Close and discard a relay connection. In-flight subscriptions on it
    /// are abandoned, not migrated. Returns false if the URL is unknown.
    pub fn remove_relay(&self, url: &str) -> bool {
        match self.relays.lock().unwrap().remove(url) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Issue a subscription to every relay with `read = true`. Filters are
    /// per-relay and independent; the stable id means a later subscribe under
    /// the same id replaces the filter everywhere.
    pub fn subscribe(&self, id: impl Into<String>, filter: Filter) {
        let id = id.into();
        self.subs.lock().unwrap().insert(id.clone(), filter.clone());
        for conn in self.relays.lock().unwrap().values() {
            if conn.descriptor.read {
                conn.send(Outbound::Subscribe(id.clone(), filter.clone()));
            }
        }
    }

    /// Close a subscription on every read relay.
    pub fn unsubscribe(&self, id: &str) {
        self.subs.lock().unwrap().remove(id);
        for conn in self.relays.lock().unwrap().values() {
            if conn.descriptor.read {
                conn.send(Outbound::Unsubscribe(id.to_string()));
            }
        }
    }

    /// Send an event to every relay with `write = true`, fire-and-forget.
    /// Returns how many relays it was handed to; confirmation only ever
    /// arrives indirectly, as the event echoes back on a subscription.
    pub fn publish(&self, event: &Event) -> usize {
        let mut sent = 0;
        for conn in self.relays.lock().unwrap().values() {
            if conn.descriptor.write {
                conn.send(Outbound::Publish(event.clone()));
                sent += 1;
            }
        }
        sent
    }

    /// Descriptors of the current relay set.
    pub fn relays(&self) -> Vec<RelayDescriptor> {
        self.relays
            .lock()
            .unwrap()
            .values()
            .map(|c| c.descriptor.clone())
            .collect()
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        for conn in self.relays.lock().unwrap().values() {
            conn.close();
        }
        self.consumer.abort();
    }
}

/// Single serialized dispatch point: dedup against the id-seen index, then
/// hand each surviving event to the registered handler exactly once.
async fn consume(
    mut rx: mpsc::Receiver<Inbound>,
    handlers: Arc<Handlers>,
    store: Arc<dyn Store>,
) {
    while let Some(inbound) = rx.recv().await {
        match inbound {
            Inbound::Event { relay, event } => {
                // Verification must precede the seen-index write: a corrupted
                // copy of an event would otherwise mark its id seen and
                // suppress every later genuine copy.
                if let Err(e) = event.verify() {
                    warn!(relay = %relay, id = %event.id, error = %e, "invalid event dropped");
                    continue;
                }
                let seen_key = format!("seen.{}", event.id);
                match store.contains(&seen_key) {
                    Ok(true) => {
                        debug!(id = %event.id, relay = %relay, "duplicate event dropped");
                        continue;
                    }
                    Ok(false) => {
                        if let Err(e) = store::set(store.as_ref(), &seen_key, &true) {
                            warn!(id = %event.id, error = %e, "failed to mark event seen");
                        }
                    }
                    Err(e) => {
                        // Dedup is best-effort; downstream ingest is
                        // idempotent anyway.
                        warn!(id = %event.id, error = %e, "seen index lookup failed");
                    }
                }
                if let Some(handler) = handlers.event.lock().unwrap().as_mut() {
                    handler(event, &relay);
                }
            }
            Inbound::Notice { relay, text } => {
                if let Some(handler) = handlers.notice.lock().unwrap().as_mut() {
                    handler(&relay, &text);
                }
            }
        }
    }
}
