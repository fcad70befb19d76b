//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{Context, Result};

use crate::relay::RelayDescriptor;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// Signing key as 64 hex characters. Absent for read-only use.
    pub privkey: Option<String>,
    /// Seed relays, used until the persisted relay list takes over.
    pub relays: Vec<RelayDescriptor>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Feed backfill depth per subscription.
    pub feed_limit: u64,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT")?);
        let privkey = env::var("PRIVKEY").ok().filter(|s| !s.is_empty());
        let relays = csv_relays(env::var("RELAYS").unwrap_or_default());
        let tor_socks = env::var("TOR_SOCKS").ok().filter(|s| !s.is_empty());
        let feed_limit = env::var("FEED_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(20);
        Ok(Self {
            store_root,
            privkey,
            relays,
            tor_socks,
            feed_limit,
        })
    }
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    let s = input.as_ref();
    s.split(',')
        .filter_map(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .collect()
}

/// Parse a comma-separated relay list. Each entry is a URL, optionally
/// suffixed with `|r` (read-only) or `|w` (write-only); bare entries are
/// read-write.
pub fn csv_relays(input: impl AsRef<str>) -> Vec<RelayDescriptor> {
    csv_strings(input)
        .into_iter()
        .map(|entry| match entry.rsplit_once('|') {
            Some((url, "r")) => RelayDescriptor {
                url: url.to_string(),
                read: true,
                write: false,
            },
            Some((url, "w")) => RelayDescriptor {
                url: url.to_string(),
                read: false,
                write: true,
            },
            _ => RelayDescriptor::read_write(entry.as_str()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs, sync::Mutex};
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for v in ["STORE_ROOT", "PRIVKEY", "RELAYS", "TOR_SOCKS", "FEED_LIMIT"] {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp\n",
                "PRIVKEY=0101010101010101010101010101010101010101010101010101010101010101\n",
                "RELAYS=wss://r1,wss://r2|r,wss://r3|w\n",
                "TOR_SOCKS=\n",
                "FEED_LIMIT=50\n",
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp"));
        assert!(cfg.privkey.is_some());
        assert_eq!(cfg.relays.len(), 3);
        assert!(cfg.relays[0].read && cfg.relays[0].write);
        assert!(cfg.relays[1].read && !cfg.relays[1].write);
        assert!(!cfg.relays[2].read && cfg.relays[2].write);
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.feed_limit, 50);
    }

    #[test]
    fn defaults_when_optional_absent() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_ROOT=/tmp\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert!(cfg.privkey.is_none());
        assert!(cfg.relays.is_empty());
        assert!(cfg.tor_socks.is_none());
        assert_eq!(cfg.feed_limit, 20);
    }

    #[test]
    fn missing_store_root_errors() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "RELAYS=wss://r1\n").unwrap();
        assert!(Settings::from_env(env_path.to_str().unwrap()).is_err());
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
        let relays = csv_relays("wss://a|r, wss://b");
        assert_eq!(relays[0].url, "wss://a");
        assert!(!relays[0].write);
        assert_eq!(relays[1].url, "wss://b");
        assert!(relays[1].read && relays[1].write);
    }
}
