//! Command line interface for the sync engine. Supports initialization,
//! posting, direct messages, follow management, relay management, and
//! profile publication.

mod chat;
mod config;
mod crypto;
mod dispatch;
mod engine;
mod error;
mod event;
mod follows;
mod pool;
mod profile;
mod relay;
mod store;
mod timeline;

use std::{
    fs,
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use config::Settings;
use engine::Engine;
use event::Keys;
use profile::ProfileMeta;
use store::FileStore;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "skein",
    author,
    version,
    about = "Relay-synchronized Nostr client engine"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the `.env` file, a fresh keypair, and the store directory.
    Init,
    /// Print the public key in use.
    Whoami,
    /// Publish a post.
    Post { text: String },
    /// Print the timeline, newest first.
    Feed,
    /// Resend a post whose echo never arrived.
    Repost { id: String },
    /// Send an encrypted direct message.
    Dm { peer: String, text: String },
    /// Print the conversation with a peer.
    Chat { peer: String },
    /// Follow a public key.
    Follow { key: String },
    /// Unfollow a public key.
    Unfollow { key: String },
    /// Print followed keys.
    Follows,
    /// Manage the relay set.
    Relay {
        #[command(subcommand)]
        action: RelayAction,
    },
    /// Manage profile metadata.
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
    /// Stay connected and print events as they arrive.
    Listen,
}

/// Operations available under `skein relay`.
#[derive(Subcommand)]
enum RelayAction {
    /// Add a relay; `--read-only` or `--write-only` restrict its role.
    Add {
        url: String,
        #[arg(long, conflicts_with = "write_only")]
        read_only: bool,
        #[arg(long)]
        write_only: bool,
    },
    /// Remove a relay.
    Remove { url: String },
    /// Print the relay set.
    List,
}

/// Operations available under `skein profile`.
#[derive(Subcommand)]
enum ProfileAction {
    /// Publish profile metadata.
    Set {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "")]
        about: String,
        #[arg(long, default_value = "")]
        picture: String,
    },
    /// Print the latest known profile for a key (defaults to mine).
    Show { key: Option<String> },
}

/// Seconds to stay connected after a one-shot command, long enough for the
/// outbound frame to flush and the echo to come back.
const SETTLE: Duration = Duration::from_millis(1500);

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    if let Commands::Init = cli.command {
        FileStore::open(&cfg.store_root)?;
        return Ok(());
    }

    let engine = bring_up(&cfg)?;
    match cli.command {
        Commands::Init => unreachable!(),
        Commands::Whoami => println!("{}", engine.my_pubkey()),
        Commands::Post { text } => {
            let id = engine.submit_post(&text)?;
            tokio::time::sleep(SETTLE).await;
            println!("{id}");
        }
        Commands::Feed => {
            tokio::time::sleep(SETTLE).await;
            for entry in engine.timeline() {
                let flag = if entry.loading {
                    " [sending]"
                } else if entry.retry {
                    " [retry]"
                } else {
                    ""
                };
                println!("{} {} {}{flag}", entry.created_at, entry.author, entry.message);
            }
        }
        Commands::Repost { id } => {
            engine.republish_post(&id)?;
            tokio::time::sleep(SETTLE).await;
        }
        Commands::Dm { peer, text } => {
            let id = engine.send_message(&peer, &text)?;
            tokio::time::sleep(SETTLE).await;
            println!("{id}");
        }
        Commands::Chat { peer } => {
            tokio::time::sleep(SETTLE).await;
            for message in engine.messages(&peer) {
                let flag = if message.failed {
                    " [failed]"
                } else if message.loading {
                    " [sending]"
                } else if message.retry {
                    " [retry]"
                } else {
                    ""
                };
                println!("{} {} {}{flag}", message.created_at, message.from, message.text);
            }
        }
        Commands::Follow { key } => notice_or_fail(engine.follow(&key))?,
        Commands::Unfollow { key } => notice_or_fail(engine.unfollow(&key))?,
        Commands::Follows => {
            for key in engine.follows() {
                println!("{key}");
            }
        }
        Commands::Relay { action } => match action {
            RelayAction::Add {
                url,
                read_only,
                write_only,
            } => {
                let descriptor = relay::RelayDescriptor {
                    url: url.clone(),
                    read: !write_only,
                    write: !read_only,
                };
                if !engine.add_relay(descriptor) {
                    bail!("relay already configured: {url}");
                }
            }
            RelayAction::Remove { url } => {
                if !engine.remove_relay(&url) {
                    bail!("relay not configured: {url}");
                }
            }
            RelayAction::List => {
                for descriptor in engine.relays() {
                    let role = match (descriptor.read, descriptor.write) {
                        (true, true) => "rw",
                        (true, false) => "r",
                        (false, true) => "w",
                        (false, false) => "-",
                    };
                    println!("{} {role}", descriptor.url);
                }
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::Set {
                name,
                about,
                picture,
            } => {
                let meta = ProfileMeta {
                    handle: name,
                    about,
                    avatar: picture,
                };
                engine.save_profile(&meta)?;
                tokio::time::sleep(SETTLE).await;
            }
            ProfileAction::Show { key } => {
                let key = key.unwrap_or_else(|| engine.my_pubkey().to_string());
                tokio::time::sleep(SETTLE).await;
                match engine.profile(&key) {
                    Some(meta) => {
                        println!("name: {}", meta.handle);
                        println!("about: {}", meta.about);
                        println!("picture: {}", meta.avatar);
                    }
                    None => bail!("no profile known for {key}"),
                }
            }
        },
        Commands::Listen => {
            tokio::signal::ctrl_c().await?;
        }
    }
    Ok(())
}

/// Print notice-grade errors to stderr without failing; duplicate follow
/// actions inform rather than abort.
fn notice_or_fail(result: error::Result<()>) -> anyhow::Result<()> {
    match result {
        Err(e) if e.is_notice() => {
            eprintln!("{e}");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Open the store, load the signing key, and start the engine.
fn bring_up(cfg: &Settings) -> anyhow::Result<Engine> {
    let privkey = cfg
        .privkey
        .as_deref()
        .ok_or(error::Error::MissingKey)
        .context("PRIVKEY not set; run `skein init` first")?;
    let keys = Keys::from_hex(privkey)?;
    let store = Arc::new(FileStore::open(&cfg.store_root)?);
    Ok(Engine::new(keys, store, cfg)?)
}

/// Create a default `.env` file with a fresh keypair if one is not already
/// present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("skein-data");
    let keys = Keys::generate();
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str(&format!("PRIVKEY={}\n", keys.privkey_hex()));
    content.push_str("RELAYS=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("FEED_LIMIT=20\n");
    fs::write(env_path, content)?;
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_vars() {
        for v in ["STORE_ROOT", "PRIVKEY", "RELAYS", "TOR_SOCKS", "FEED_LIMIT"] {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, privkey: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nPRIVKEY={}\nRELAYS=\n",
            dir.path().join("data").to_str().unwrap(),
            privkey,
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    #[tokio::test]
    async fn init_creates_env_with_key_and_store() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        assert!(data.contains("PRIVKEY="));
        assert!(data.contains(&format!(
            "STORE_ROOT={}",
            dir.path().join("skein-data").to_string_lossy()
        )));
        assert!(dir.path().join("skein-data").exists());

        // a second init must not regenerate the key
        let before = data;
        run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Init,
        })
        .await
        .unwrap();
        assert_eq!(fs::read_to_string(&env_path).unwrap(), before);
    }

    #[tokio::test]
    async fn post_works_without_relays() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, &"03".repeat(32));
        run(Cli {
            env: env_file,
            command: Commands::Post {
                text: "offline first".into(),
            },
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn follow_rejects_malformed_key() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, &"03".repeat(32));
        let result = run(Cli {
            env: env_file,
            command: Commands::Follow {
                key: "not-a-key".into(),
            },
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn missing_privkey_is_a_clear_error() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            format!("STORE_ROOT={}\n", dir.path().join("data").to_str().unwrap()),
        )
        .unwrap();
        let result = run(Cli {
            env: env_path.to_string_lossy().into_owned(),
            command: Commands::Whoami,
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("PRIVKEY"));
        assert!(matches!(
            err.downcast_ref::<error::Error>(),
            Some(error::Error::MissingKey)
        ));
    }

    #[tokio::test]
    async fn relay_add_and_remove_round_trip() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, &"03".repeat(32));
        run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Add {
                    url: "ws://127.0.0.1:1".into(),
                    read_only: false,
                    write_only: false,
                },
            },
        })
        .await
        .unwrap();
        // duplicate add fails
        let dup = run(Cli {
            env: env_file.clone(),
            command: Commands::Relay {
                action: RelayAction::Add {
                    url: "ws://127.0.0.1:1".into(),
                    read_only: false,
                    write_only: false,
                },
            },
        })
        .await;
        assert!(dup.is_err());
        run(Cli {
            env: env_file,
            command: Commands::Relay {
                action: RelayAction::Remove {
                    url: "ws://127.0.0.1:1".into(),
                },
            },
        })
        .await
        .unwrap();
    }
}
