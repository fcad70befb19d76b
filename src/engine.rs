//! The coordinator: owns the relay pool, the per-kind reconcilers, and the
//! write-through persistence that lets a restart resume mid-conversation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::chat::{Conversations, Message};
use crate::config::Settings;
use crate::crypto;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::event::{unix_now, Event, Keys, Tag, KIND_DM, KIND_POST, KIND_PROFILE};
use crate::follows::{normalize_pubkey, valid_pubkey, FollowSet};
use crate::pool::RelayPool;
use crate::profile::{ProfileMeta, ProfileStore};
use crate::relay::{Filter, RelayDescriptor};
use crate::store::{self, Store};
use crate::timeline::{Timeline, TimelineEntry, PENDING_TIMEOUT_SECS};

/// Everything the reconcilers mutate, behind one lock so dispatch, sweeps,
/// and user actions always see a consistent whole.
struct State {
    timeline: Timeline,
    conversations: Conversations,
    profiles: ProfileStore,
    follows: FollowSet,
}

/// Client-side synchronization engine: submits signed events optimistically,
/// reconciles them against the relay echo, and keeps every materialized view
/// persisted as it changes.
pub struct Engine {
    keys: Keys,
    store: Arc<dyn Store>,
    pool: RelayPool,
    state: Arc<Mutex<State>>,
    feed_limit: u64,
    sweeper: tokio::task::JoinHandle<()>,
}

impl Engine {
    /// Bring the engine up: rehydrate state from the store, connect the
    /// persisted relay set (falling back to the configured seeds), register
    /// the per-kind reconcilers, and start the pending-entry sweeper.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(keys: Keys, store: Arc<dyn Store>, settings: &Settings) -> Result<Engine> {
        let state = Arc::new(Mutex::new(load_state(store.as_ref())?));

        let pool = RelayPool::new(Arc::clone(&store), settings.tor_socks.clone());
        let mut dispatcher = build_dispatcher(&keys, &state, &store);
        pool.on_event(Box::new(move |ev, _relay| dispatcher.dispatch(ev)));
        pool.on_notice(Box::new(|relay, text| {
            info!(relay = %relay, notice = %text, "relay notice");
        }));

        let relays: Vec<RelayDescriptor> = match store::get(store.as_ref(), "relays")? {
            Some(relays) => relays,
            None => settings.relays.clone(),
        };
        for descriptor in &relays {
            pool.add_relay(descriptor.clone());
        }
        store::set(store.as_ref(), "relays", &relays)?;

        let engine = Engine {
            keys,
            store: Arc::clone(&store),
            pool,
            state: Arc::clone(&state),
            feed_limit: settings.feed_limit,
            sweeper: spawn_sweeper(state, store),
        };
        engine.refresh_feed();
        engine
            .pool
            .subscribe("inbox", Filter::tagged(vec![engine.keys.pubkey.clone()]).kinds(vec![KIND_DM]));
        Ok(engine)
    }

    /// My public key, 64 hex characters.
    pub fn my_pubkey(&self) -> &str {
        &self.keys.pubkey
    }

    /// Submit a post: it appears at the head of the timeline immediately,
    /// flagged `loading` until its echo returns. Returns the event id, which
    /// is final before any relay has seen the event.
    pub fn submit_post(&self, text: &str) -> Result<String> {
        if text.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let ev = Event::build(&self.keys, KIND_POST, vec![], text, unix_now())?;
        let id = ev.id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.timeline.insert_pending(&ev);
            persist_timeline(self.store.as_ref(), &state.timeline);
        }
        self.pool.publish(&ev);
        Ok(id)
    }

    /// Resend a retry-flagged post. The event is rebuilt from the stored
    /// entry; deterministic signing means the resend is byte-identical, so
    /// the id is stable and relays that did receive it dedup it themselves.
    pub fn republish_post(&self, id: &str) -> Result<()> {
        let entry = {
            let mut state = self.state.lock().unwrap();
            let entry = state
                .timeline
                .mark_republish(id)
                .ok_or_else(|| Error::UnknownId(id.to_string()))?;
            persist_timeline(self.store.as_ref(), &state.timeline);
            entry
        };
        let ev = rebuild_post(&self.keys, &entry)?;
        self.pool.publish(&ev);
        Ok(())
    }

    /// Remove a post from the local timeline only.
    pub fn delete_post(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.timeline.remove(id) {
            return Err(Error::UnknownId(id.to_string()));
        }
        persist_timeline(self.store.as_ref(), &state.timeline);
        Ok(())
    }

    /// Entries of the timeline, newest first.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.state.lock().unwrap().timeline.entries().to_vec()
    }

    /// Encrypt and send a direct message, chaining it onto the previous
    /// message in the thread. Returns the event id. The message is flagged
    /// `failed` as well as pending when no writable relay exists to carry it.
    pub fn send_message(&self, peer: &str, text: &str) -> Result<String> {
        if !valid_pubkey(peer) {
            return Err(Error::InvalidKey);
        }
        // tags, thread keys, and storage keys all carry the lowercase form
        let peer = &normalize_pubkey(peer);
        if text.is_empty() {
            return Err(Error::EmptyMessage);
        }
        let secret = crypto::shared_secret(&self.keys, peer)?;
        let content = crypto::seal(&secret, text);

        let mut state = self.state.lock().unwrap();
        let mut tags = vec![Tag::pubkey(peer)];
        if let Some(prev) = state.conversations.last_id(peer) {
            tags.push(Tag::event(prev));
        }
        let ev = Event::build(&self.keys, KIND_DM, tags, content, unix_now())?;
        let id = ev.id.clone();
        state.conversations.append_pending(
            peer,
            Message {
                text: text.to_string(),
                from: self.keys.pubkey.clone(),
                id: id.clone(),
                created_at: ev.created_at,
                tags: ev.tags.clone(),
                loading: true,
                retry: false,
                failed: false,
            },
        );
        if self.pool.publish(&ev) == 0 {
            state.conversations.mark_failed(peer, &id);
        }
        persist_thread(self.store.as_ref(), &state.conversations, peer);
        Ok(id)
    }

    /// Remove a message from the local thread only.
    pub fn delete_message(&self, peer: &str, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.conversations.delete(peer, id) {
            return Err(Error::UnknownId(id.to_string()));
        }
        persist_thread(self.store.as_ref(), &state.conversations, peer);
        Ok(())
    }

    /// Messages exchanged with one peer, chain order.
    pub fn messages(&self, peer: &str) -> Vec<Message> {
        self.state.lock().unwrap().conversations.messages(peer).to_vec()
    }

    /// Peers with an open conversation.
    pub fn peers(&self) -> Vec<String> {
        self.state.lock().unwrap().conversations.peers()
    }

    /// Follow a key and start pulling its events.
    pub fn follow(&self, key: &str) -> Result<()> {
        let key = normalize_pubkey(key);
        {
            let mut state = self.state.lock().unwrap();
            state.follows.follow(&key)?;
            persist_follows(self.store.as_ref(), &state.follows);
        }
        self.pool.subscribe(format!("key:{key}"), self.author_filter(&key));
        Ok(())
    }

    /// Unfollow a key and stop pulling its events. Already-ingested events
    /// stay in the timeline.
    pub fn unfollow(&self, key: &str) -> Result<()> {
        let key = normalize_pubkey(key);
        {
            let mut state = self.state.lock().unwrap();
            state.follows.unfollow(&key)?;
            persist_follows(self.store.as_ref(), &state.follows);
        }
        self.pool.unsubscribe(&format!("key:{key}"));
        Ok(())
    }

    /// Followed keys, ordered.
    pub fn follows(&self) -> Vec<String> {
        self.state.lock().unwrap().follows.to_vec()
    }

    /// Re-issue the per-author subscriptions for myself and every follow.
    /// Subscription ids are stable, so this replaces rather than stacks.
    pub fn refresh_feed(&self) {
        let keys: Vec<String> = {
            let state = self.state.lock().unwrap();
            let mut keys = state.follows.to_vec();
            keys.push(self.keys.pubkey.clone());
            keys
        };
        for key in keys {
            self.pool.subscribe(format!("key:{key}"), self.author_filter(&key));
        }
    }

    /// Publish my profile metadata and update the local view without waiting
    /// for the echo.
    pub fn save_profile(&self, meta: &ProfileMeta) -> Result<String> {
        let ev = Event::build(&self.keys, KIND_PROFILE, vec![], meta.to_content()?, unix_now())?;
        let id = ev.id.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.profiles.upsert(&ev);
            persist_profiles(self.store.as_ref(), &state.profiles);
        }
        store::set(self.store.as_ref(), "profile", meta)?;
        self.pool.publish(&ev);
        Ok(id)
    }

    /// Latest known profile metadata for a key.
    pub fn profile(&self, pubkey: &str) -> Option<ProfileMeta> {
        self.state.lock().unwrap().profiles.get(pubkey).cloned()
    }

    /// Add a relay to the active set and persist the membership.
    pub fn add_relay(&self, descriptor: RelayDescriptor) -> bool {
        let added = self.pool.add_relay(descriptor);
        if added {
            persist_relays(self.store.as_ref(), &self.pool);
        }
        added
    }

    /// Drop a relay from the active set and persist the membership.
    pub fn remove_relay(&self, url: &str) -> bool {
        let removed = self.pool.remove_relay(url);
        if removed {
            persist_relays(self.store.as_ref(), &self.pool);
        }
        removed
    }

    /// Descriptors of the current relay set.
    pub fn relays(&self) -> Vec<RelayDescriptor> {
        self.pool.relays()
    }

    fn author_filter(&self, key: &str) -> Filter {
        Filter::authors(vec![key.to_string()])
            .kinds(vec![KIND_PROFILE, KIND_POST, KIND_DM])
            .limit(self.feed_limit as usize)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Rehydrate all materialized views from the persistence port.
fn load_state(store: &dyn Store) -> Result<State> {
    let timeline = Timeline::from_entries(store::get(store, "timeline")?.unwrap_or_default());
    let mut conversations = Conversations::new();
    let peers: Vec<String> = store::get(store, "conversations")?.unwrap_or_default();
    for peer in peers {
        let messages: Vec<Message> =
            store::get(store, &format!("messages.{peer}"))?.unwrap_or_default();
        conversations.insert_thread(peer, messages);
    }
    let profiles: HashMap<String, ProfileMeta> =
        store::get(store, "profiles")?.unwrap_or_default();
    let follows = FollowSet::from_keys(store::get(store, "follows")?.unwrap_or_default());
    Ok(State {
        timeline,
        conversations,
        profiles: ProfileStore::from_map(profiles),
        follows,
    })
}

/// Wire each event kind to its reconciler. Every route persists what it
/// changed before returning, so a crash never loses a confirmed event.
fn build_dispatcher(
    keys: &Keys,
    state: &Arc<Mutex<State>>,
    store: &Arc<dyn Store>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    let (st, db) = (Arc::clone(state), Arc::clone(store));
    dispatcher.register(
        KIND_POST,
        Box::new(move |ev| {
            let mut state = st.lock().unwrap();
            if state.timeline.ingest(&ev) {
                persist_timeline(db.as_ref(), &state.timeline);
            }
        }),
    );

    let (st, db, keys_dm) = (Arc::clone(state), Arc::clone(store), keys.clone());
    dispatcher.register(
        KIND_DM,
        Box::new(move |ev| {
            let mut state = st.lock().unwrap();
            if let Some(peer) = state.conversations.ingest(&keys_dm, &ev) {
                persist_thread(db.as_ref(), &state.conversations, &peer);
            }
        }),
    );

    let (st, db) = (Arc::clone(state), Arc::clone(store));
    dispatcher.register(
        KIND_PROFILE,
        Box::new(move |ev| {
            let mut state = st.lock().unwrap();
            if state.profiles.upsert(&ev) {
                persist_profiles(db.as_ref(), &state.profiles);
            }
        }),
    );

    dispatcher
}

/// Once a second, flag pending entries whose echo is overdue.
fn spawn_sweeper(state: Arc<Mutex<State>>, store: Arc<dyn Store>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let now = unix_now();
            let mut state = state.lock().unwrap();
            if state.timeline.sweep(now, PENDING_TIMEOUT_SECS) {
                persist_timeline(store.as_ref(), &state.timeline);
            }
            for peer in state.conversations.sweep(now, PENDING_TIMEOUT_SECS) {
                persist_thread(store.as_ref(), &state.conversations, &peer);
            }
        }
    })
}

/// Rebuild the exact event a timeline entry came from.
fn rebuild_post(keys: &Keys, entry: &TimelineEntry) -> Result<Event> {
    Event::build(
        keys,
        KIND_POST,
        entry.tags.clone(),
        entry.message.clone(),
        entry.created_at,
    )
}

fn persist_timeline(store: &dyn Store, timeline: &Timeline) {
    if let Err(e) = store::set(store, "timeline", &timeline.entries()) {
        warn!(error = %e, "failed to persist timeline");
    }
}

fn persist_thread(store: &dyn Store, conversations: &Conversations, peer: &str) {
    if let Err(e) = store::set(store, &format!("messages.{peer}"), &conversations.messages(peer)) {
        warn!(peer = %peer, error = %e, "failed to persist thread");
    }
    if let Err(e) = store::set(store, "conversations", &conversations.peers()) {
        warn!(error = %e, "failed to persist conversation index");
    }
}

fn persist_follows(store: &dyn Store, follows: &FollowSet) {
    if let Err(e) = store::set(store, "follows", &follows.to_vec()) {
        warn!(error = %e, "failed to persist follows");
    }
}

fn persist_profiles(store: &dyn Store, profiles: &ProfileStore) {
    if let Err(e) = store::set(store, "profiles", profiles.as_map()) {
        warn!(error = %e, "failed to persist profiles");
    }
}

fn persist_relays(store: &dyn Store, pool: &RelayPool) {
    if let Err(e) = store::set(store, "relays", &pool.relays()) {
        warn!(error = %e, "failed to persist relay set");
    }
}
