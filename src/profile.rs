//! Profile store: latest kind-0 metadata per public key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::event::Event;

/// Profile metadata carried in a kind-0 event's content as a JSON object.
/// Unknown fields in the wire form are dropped on parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileMeta {
    /// Display name.
    #[serde(rename = "name", default)]
    pub handle: String,
    /// Free-form bio.
    #[serde(default)]
    pub about: String,
    /// Avatar URL.
    #[serde(rename = "picture", default)]
    pub avatar: String,
}

impl ProfileMeta {
    /// Parse the content field of a kind-0 event.
    pub fn from_content(content: &str) -> Result<ProfileMeta> {
        Ok(serde_json::from_str(content)?)
    }

    /// Serialize into the content field of a kind-0 event.
    pub fn to_content(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Last-writer-wins map of pubkey to profile metadata.
#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: HashMap<String, ProfileMeta>,
}

impl ProfileStore {
    pub fn new() -> ProfileStore {
        ProfileStore::default()
    }

    pub fn from_map(profiles: HashMap<String, ProfileMeta>) -> ProfileStore {
        ProfileStore { profiles }
    }

    /// Ingest a kind-0 event, unconditionally replacing the stored metadata
    /// for its author. Returns true if the store changed; unparseable
    /// content is dropped.
    pub fn upsert(&mut self, event: &Event) -> bool {
        let meta = match ProfileMeta::from_content(&event.content) {
            Ok(meta) => meta,
            Err(e) => {
                debug!(id = %event.id, error = %e, "malformed profile dropped");
                return false;
            }
        };
        if self.profiles.get(&event.pubkey) == Some(&meta) {
            return false;
        }
        self.profiles.insert(event.pubkey.clone(), meta);
        true
    }

    pub fn get(&self, pubkey: &str) -> Option<&ProfileMeta> {
        self.profiles.get(pubkey)
    }

    pub fn as_map(&self) -> &HashMap<String, ProfileMeta> {
        &self.profiles
    }
}
