//! Direct-message engine: one ordered, append-only encrypted thread per
//! peer, with hash-chained ordering via `e` tag references.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto;
use crate::event::{Event, Keys, Tag};

/// Materialized view of one direct message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Decrypted text.
    pub text: String,
    /// Author public key.
    pub from: String,
    /// Event id.
    pub id: String,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Tags, including the recipient `p` tag and the chain `e` reference to
    /// the previous message in this thread, when one existed at send time.
    pub tags: Vec<Tag>,
    /// Awaiting the relay echo.
    pub loading: bool,
    /// Echo never came; flagged by the sweep.
    pub retry: bool,
    /// The send reached zero writable relays.
    pub failed: bool,
}

/// Per-peer conversation threads. Each thread is an independent dedup scope:
/// the same id may exist in two different conversations, never twice in one.
#[derive(Debug, Default)]
pub struct Conversations {
    threads: HashMap<String, Vec<Message>>,
}

impl Conversations {
    /// No conversations.
    pub fn new() -> Conversations {
        Conversations::default()
    }

    /// Rehydrate one peer's thread from persisted messages.
    pub fn insert_thread(&mut self, peer: impl Into<String>, messages: Vec<Message>) {
        self.threads.insert(peer.into(), messages);
    }

    /// Peers with an open conversation.
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.threads.keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Messages in one thread, chain order.
    pub fn messages(&self, peer: &str) -> &[Message] {
        self.threads.get(peer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Id of the newest message in a thread, for chaining the next send.
    pub fn last_id(&self, peer: &str) -> Option<String> {
        self.threads
            .get(peer)?
            .last()
            .map(|message| message.id.clone())
    }

    /// Append a locally sent message awaiting its echo.
    pub fn append_pending(&mut self, peer: &str, message: Message) {
        self.threads.entry(peer.to_string()).or_default().push(message);
    }

    /// Ingest a kind-4 event. Returns the peer whose thread changed, or None
    /// when the event was a duplicate, undecryptable, or not ours at all.
    ///
    /// Direction is decided the way the original traffic is shaped: an event
    /// carrying a `p` tag with my key is addressed to me and lands in the
    /// sender's thread; an event authored by me is the echo of my own send
    /// and reconciles the pending message in the recipient's thread.
    pub fn ingest(&mut self, keys: &Keys, event: &Event) -> Option<String> {
        let addressed_to_me = event
            .tags
            .iter()
            .any(|Tag(fields)| fields.len() >= 2 && fields[0] == "p" && fields[1] == keys.pubkey);

        if addressed_to_me {
            self.ingest_inbound(keys, event)
        } else if event.pubkey == keys.pubkey {
            self.ingest_echo(event)
        } else {
            None
        }
    }

    fn ingest_inbound(&mut self, keys: &Keys, event: &Event) -> Option<String> {
        let peer = event.pubkey.clone();

        // Dedup within this thread only. A pending entry with the same id is
        // a self-addressed echo and just gets confirmed.
        if let Some(existing) = self
            .threads
            .get_mut(&peer)
            .and_then(|thread| thread.iter_mut().find(|m| m.id == event.id))
        {
            if existing.loading || existing.retry {
                existing.loading = false;
                existing.retry = false;
                return Some(peer);
            }
            return None;
        }

        let secret = match crypto::shared_secret(keys, &peer) {
            Ok(secret) => secret,
            Err(e) => {
                debug!(peer = %peer, error = %e, "secret derivation failed, dropping");
                return None;
            }
        };
        let text = match crypto::open(&secret, &event.content) {
            Ok(text) => text,
            Err(_) => {
                // Indistinguishable from "not addressed to me"; never
                // surfaced as a per-message error.
                debug!(id = %event.id, "undecryptable message dropped");
                return None;
            }
        };

        // The thread is only created once the payload decrypts; a garbled
        // message must not leave an empty conversation behind.
        let thread = self.threads.entry(peer.clone()).or_default();

        if let Some(prev) = event.tag_value("e") {
            if !thread.iter().any(|m| m.id == prev) {
                // Advisory only; local history may simply be incomplete.
                debug!(id = %event.id, prev = %prev, "chain reference unknown");
            }
        }

        let message = Message {
            text,
            from: event.pubkey.clone(),
            id: event.id.clone(),
            created_at: event.created_at,
            tags: event.tags.clone(),
            loading: false,
            retry: false,
            failed: false,
        };
        // Keep the chain monotonic in created_at regardless of relay
        // delivery order.
        let at = thread
            .iter()
            .rposition(|m| m.created_at <= event.created_at)
            .map(|i| i + 1)
            .unwrap_or(0);
        thread.insert(at, message);
        Some(peer)
    }

    fn ingest_echo(&mut self, event: &Event) -> Option<String> {
        let peer = event.tag_value("p")?.to_string();
        let thread = self.threads.get_mut(&peer)?;
        let message = thread
            .iter_mut()
            .find(|m| m.id == event.id && (m.loading || m.retry))?;
        message.loading = false;
        message.retry = false;
        message.failed = false;
        Some(peer)
    }

    /// Flag messages stuck in `loading` past the timeout. Returns the peers
    /// whose threads changed.
    pub fn sweep(&mut self, now: u64, timeout: u64) -> Vec<String> {
        let mut changed = Vec::new();
        for (peer, thread) in &mut self.threads {
            for message in thread.iter_mut() {
                if message.loading && now.saturating_sub(message.created_at) > timeout {
                    message.loading = false;
                    message.retry = true;
                    if !changed.contains(peer) {
                        changed.push(peer.clone());
                    }
                }
            }
        }
        changed
    }

    /// Mark a message as having reached no relay at all.
    pub fn mark_failed(&mut self, peer: &str, id: &str) {
        if let Some(thread) = self.threads.get_mut(peer) {
            if let Some(message) = thread.iter_mut().find(|m| m.id == id) {
                message.failed = true;
            }
        }
    }

    /// Local-only removal from one thread; nothing is retracted from relays.
    pub fn delete(&mut self, peer: &str, id: &str) -> bool {
        match self.threads.get_mut(peer) {
            Some(thread) => {
                let before = thread.len();
                thread.retain(|m| m.id != id);
                thread.len() != before
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{unix_now, KIND_DM};

    fn alice() -> Keys {
        Keys::from_hex(&"11".repeat(32)).unwrap()
    }

    fn bob() -> Keys {
        Keys::from_hex(&"22".repeat(32)).unwrap()
    }

    /// Encrypted DM from `from` to `to`, chained onto `prev` when given.
    fn dm(from: &Keys, to: &Keys, text: &str, created_at: u64, prev: Option<&str>) -> Event {
        let secret = crypto::shared_secret(from, &to.pubkey).unwrap();
        let mut tags = vec![Tag::pubkey(to.pubkey.clone())];
        if let Some(prev) = prev {
            tags.push(Tag::event(prev));
        }
        Event::build(from, KIND_DM, tags, crypto::seal(&secret, text), created_at).unwrap()
    }

    #[test]
    fn inbound_message_is_decrypted_into_senders_thread() {
        let (a, b) = (alice(), bob());
        let ev = dm(&b, &a, "hey alice", 100, None);
        let mut conv = Conversations::new();
        assert_eq!(conv.ingest(&a, &ev), Some(b.pubkey.clone()));
        let thread = conv.messages(&b.pubkey);
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].text, "hey alice");
        assert_eq!(thread[0].from, b.pubkey);
        assert!(!thread[0].loading);
    }

    #[test]
    fn duplicate_id_within_thread_is_dropped() {
        let (a, b) = (alice(), bob());
        let ev = dm(&b, &a, "once", 100, None);
        let mut conv = Conversations::new();
        assert!(conv.ingest(&a, &ev).is_some());
        assert!(conv.ingest(&a, &ev).is_none());
        assert_eq!(conv.messages(&b.pubkey).len(), 1);
    }

    #[test]
    fn undecryptable_message_is_silently_dropped() {
        let (a, b) = (alice(), bob());
        let eve = Keys::from_hex(&"33".repeat(32)).unwrap();
        // encrypted for eve but tagged to alice
        let secret = crypto::shared_secret(&b, &eve.pubkey).unwrap();
        let ev = Event::build(
            &b,
            KIND_DM,
            vec![Tag::pubkey(a.pubkey.clone())],
            crypto::seal(&secret, "not for alice"),
            100,
        )
        .unwrap();
        let mut conv = Conversations::new();
        assert!(conv.ingest(&a, &ev).is_none());
        assert!(conv.messages(&b.pubkey).is_empty());
        // no empty thread left behind either
        assert!(conv.peers().is_empty());
    }

    #[test]
    fn own_echo_reconciles_pending_message() {
        let (a, b) = (alice(), bob());
        let ev = dm(&a, &b, "hi bob", 100, None);
        let mut conv = Conversations::new();
        conv.append_pending(
            &b.pubkey,
            Message {
                text: "hi bob".into(),
                from: a.pubkey.clone(),
                id: ev.id.clone(),
                created_at: ev.created_at,
                tags: ev.tags.clone(),
                loading: true,
                retry: false,
                failed: false,
            },
        );
        assert_eq!(conv.ingest(&a, &ev), Some(b.pubkey.clone()));
        let thread = conv.messages(&b.pubkey);
        assert!(!thread[0].loading);
        assert!(!thread[0].retry);
        // a second echo from another relay changes nothing
        assert!(conv.ingest(&a, &ev).is_none());
    }

    #[test]
    fn chain_references_previous_message_and_broken_chain_is_tolerated() {
        let (a, b) = (alice(), bob());
        let first = dm(&b, &a, "one", 100, None);
        let second = dm(&b, &a, "two", 101, Some(&first.id));
        let mut conv = Conversations::new();
        conv.ingest(&a, &first).unwrap();
        conv.ingest(&a, &second).unwrap();
        let thread = conv.messages(&b.pubkey);
        assert_eq!(thread[1].tags.iter().any(|Tag(f)| f[0] == "e"), true);

        // a chain reference to an id we never saw is appended anyway
        let orphan = dm(&b, &a, "three", 102, Some(&"ff".repeat(32)));
        assert!(conv.ingest(&a, &orphan).is_some());
        assert_eq!(conv.messages(&b.pubkey).len(), 3);
    }

    #[test]
    fn out_of_order_delivery_keeps_chain_monotonic() {
        let (a, b) = (alice(), bob());
        let late = dm(&b, &a, "late", 200, None);
        let early = dm(&b, &a, "early", 100, None);
        let mut conv = Conversations::new();
        conv.ingest(&a, &late);
        conv.ingest(&a, &early);
        let times: Vec<u64> = conv.messages(&b.pubkey).iter().map(|m| m.created_at).collect();
        assert_eq!(times, vec![100, 200]);
    }

    #[test]
    fn conversations_are_independent_dedup_scopes() {
        let (a, b) = (alice(), bob());
        let c = Keys::from_hex(&"44".repeat(32)).unwrap();
        let mut conv = Conversations::new();
        conv.ingest(&a, &dm(&b, &a, "from b", 100, None));
        conv.ingest(&a, &dm(&c, &a, "from c", 100, None));
        assert_eq!(conv.peers().len(), 2);
        assert_eq!(conv.messages(&b.pubkey).len(), 1);
        assert_eq!(conv.messages(&c.pubkey).len(), 1);
    }

    #[test]
    fn sweep_flags_stale_sends_and_mark_failed_sticks() {
        let (a, b) = (alice(), bob());
        let now = unix_now();
        let mut conv = Conversations::new();
        conv.append_pending(
            &b.pubkey,
            Message {
                text: "stuck".into(),
                from: a.pubkey.clone(),
                id: "aa".repeat(32),
                created_at: now - 10,
                tags: vec![],
                loading: true,
                retry: false,
                failed: false,
            },
        );
        let changed = conv.sweep(now, 3);
        assert_eq!(changed, vec![b.pubkey.clone()]);
        assert!(conv.messages(&b.pubkey)[0].retry);
        assert!(conv.sweep(now, 3).is_empty());

        conv.mark_failed(&b.pubkey, &"aa".repeat(32));
        assert!(conv.messages(&b.pubkey)[0].failed);
    }

    #[test]
    fn delete_is_local_and_scoped_to_one_thread() {
        let (a, b) = (alice(), bob());
        let ev = dm(&b, &a, "bye", 100, None);
        let mut conv = Conversations::new();
        conv.ingest(&a, &ev);
        assert!(conv.delete(&b.pubkey, &ev.id));
        assert!(!conv.delete(&b.pubkey, &ev.id));
        assert!(conv.messages(&b.pubkey).is_empty());
    }

    #[test]
    fn foreign_conversation_is_ignored() {
        let (a, b) = (alice(), bob());
        let c = Keys::from_hex(&"44".repeat(32)).unwrap();
        // b messaging c is none of alice's business
        let ev = dm(&b, &c, "private", 100, None);
        let mut conv = Conversations::new();
        assert!(conv.ingest(&a, &ev).is_none());
        assert!(conv.peers().is_empty());
    }
}
