//! Nostr event model, canonical hashing, and signing keys.

use rand::thread_rng;
use secp256k1::{schnorr::Signature, Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Kind number for profile metadata events.
pub const KIND_PROFILE: u32 = 0;
/// Kind number for short text posts.
pub const KIND_POST: u32 = 1;
/// Kind number for encrypted direct messages.
pub const KIND_DM: u32 = 4;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// The first element denotes the type, the rest hold data:
///
/// - `p` – references another author's public key
/// - `e` – links to another event ID
///
/// Tags are stored verbatim so uncommon or custom tags survive a round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag referencing a public key.
    pub fn pubkey(key: impl Into<String>) -> Tag {
        Tag(vec!["p".into(), key.into()])
    }

    /// Tag referencing another event id.
    pub fn event(id: impl Into<String>) -> Tag {
        Tag(vec!["e".into(), id.into()])
    }
}

/// Core Nostr event exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11...",
///   "pubkey": "b5f3...",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["p", "c0ff..."]],
///   "content": "hello",
///   "sig": "deadbeef..."
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 over the canonical serialization).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Kind number: 0 = profile, 1 = post, 4 = encrypted DM.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Ordered tag arrays.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// Build, hash, and sign an event with the given keys.
    pub fn build(
        keys: &Keys,
        kind: u32,
        tags: Vec<Tag>,
        content: impl Into<String>,
        created_at: u64,
    ) -> Result<Event> {
        let mut ev = Event {
            id: String::new(),
            pubkey: keys.pubkey.clone(),
            kind,
            created_at,
            tags,
            content: content.into(),
            sig: String::new(),
        };
        let hash = event_hash(&ev)?;
        ev.id = hex::encode(hash);
        ev.sig = keys.sign(&hash)?;
        Ok(ev)
    }

    /// Verify the event's id and Schnorr signature.
    pub fn verify(&self) -> Result<()> {
        let hash = event_hash(self)?;
        if hex::encode(hash) != self.id {
            return Err(Error::Crypto("id mismatch".into()));
        }
        let sig = Signature::from_slice(
            &hex::decode(&self.sig).map_err(|e| Error::Crypto(e.to_string()))?,
        )?;
        let pk = XOnlyPublicKey::from_slice(
            &hex::decode(&self.pubkey).map_err(|e| Error::Crypto(e.to_string()))?,
        )?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }

    /// First value of the first tag of the given type, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|Tag(fields)| fields.first().map(|f| f == name).unwrap_or(false))
            .and_then(|Tag(fields)| fields.get(1))
            .map(|s| s.as_str())
    }
}

/// Compute the canonical Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Signing identity: a secp256k1 keypair with its x-only public key in hex.
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    /// Author public key (x-only, hex) used in every event this identity signs.
    pub pubkey: String,
}

impl Keys {
    /// Generate a fresh random keypair.
    pub fn generate() -> Keys {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(&mut thread_rng());
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Keys { keypair, pubkey }
    }

    /// Load keys from a 64-character hex private key.
    pub fn from_hex(privkey: &str) -> Result<Keys> {
        let secp = Secp256k1::new();
        let bytes = hex::decode(privkey).map_err(|e| Error::Crypto(e.to_string()))?;
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)?;
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Ok(Keys { keypair, pubkey })
    }

    /// Private key as hex, for persisting to configuration.
    pub fn privkey_hex(&self) -> String {
        hex::encode(self.keypair.secret_key().secret_bytes())
    }

    /// Secret key for ECDH derivation.
    pub(crate) fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    /// Sign a 32-byte digest, returning the hex Schnorr signature.
    ///
    /// Deterministic (no auxiliary randomness) so a republished event stays
    /// byte-identical to the original transmission.
    fn sign(&self, hash: &[u8; 32]) -> Result<String> {
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(hash)?;
        let sig = secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(hex::encode(sig.as_ref()))
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").field("pubkey", &self.pubkey).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_hash_matches_reference() {
        let ev = Event {
            id: String::new(),
            pubkey: "00".repeat(32),
            kind: 1,
            created_at: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let expected = {
            let obj =
                serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&obj).unwrap());
            let bytes = hasher.finalize();
            let mut arr = [0u8; 32];
            arr.copy_from_slice(&bytes);
            arr
        };
        assert_eq!(event_hash(&ev).unwrap(), expected);
    }

    #[test]
    fn build_produces_verifiable_event() {
        let keys = Keys::from_hex(&"01".repeat(32)).unwrap();
        let ev = Event::build(&keys, KIND_POST, vec![], "hello", 1).unwrap();
        assert_eq!(ev.pubkey, keys.pubkey);
        assert_eq!(ev.id.len(), 64);
        ev.verify().unwrap();
    }

    #[test]
    fn verify_rejects_tampered_content() {
        let keys = Keys::from_hex(&"01".repeat(32)).unwrap();
        let mut ev = Event::build(&keys, KIND_POST, vec![], "hello", 1).unwrap();
        ev.content = "bye".into();
        assert!(ev.verify().is_err());
    }

    #[test]
    fn verify_rejects_bad_sig() {
        let keys = Keys::from_hex(&"01".repeat(32)).unwrap();
        let mut ev = Event::build(&keys, KIND_POST, vec![], "hello", 1).unwrap();
        ev.sig.replace_range(0..2, "00");
        assert!(ev.verify().is_err());
    }

    #[test]
    fn rebuilding_yields_identical_event() {
        let keys = Keys::from_hex(&"02".repeat(32)).unwrap();
        let a = Event::build(&keys, KIND_POST, vec![Tag::pubkey("ab")], "x", 7).unwrap();
        let b = Event::build(&keys, KIND_POST, vec![Tag::pubkey("ab")], "x", 7).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tag_value_finds_first_match() {
        let ev = Event {
            id: String::new(),
            pubkey: String::new(),
            kind: 4,
            created_at: 1,
            tags: vec![Tag::pubkey("k1"), Tag::event("e1"), Tag::pubkey("k2")],
            content: String::new(),
            sig: String::new(),
        };
        assert_eq!(ev.tag_value("p"), Some("k1"));
        assert_eq!(ev.tag_value("e"), Some("e1"));
        assert_eq!(ev.tag_value("d"), None);
    }

    #[test]
    fn keys_round_trip_hex() {
        let keys = Keys::generate();
        let again = Keys::from_hex(&keys.privkey_hex()).unwrap();
        assert_eq!(keys.pubkey, again.pubkey);
    }
}
