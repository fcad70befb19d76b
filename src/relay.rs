//! One logical connection to one relay: lifecycle, reconnects, and the
//! minimal NIP-01 wire subset the engine speaks.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{client_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::event::Event;

/// Delay between reconnection attempts to an unreachable relay.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Membership record for one relay in the active set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayDescriptor {
    /// WebSocket URL, e.g. `wss://relay.example.com`.
    pub url: String,
    /// Subscriptions are issued to this relay.
    pub read: bool,
    /// Events are published to this relay.
    pub write: bool,
}

impl RelayDescriptor {
    /// Descriptor with both capabilities enabled.
    pub fn read_write(url: impl Into<String>) -> RelayDescriptor {
        RelayDescriptor {
            url: url.into(),
            read: true,
            write: true,
        }
    }
}

/// Subscription filter in the NIP-01 shape. Absent fields are omitted from
/// the wire object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Match events authored by any of these keys.
    pub authors: Option<Vec<String>>,
    /// Match events of any of these kinds.
    pub kinds: Option<Vec<u32>>,
    /// Match events carrying a `p` tag referencing any of these keys.
    pub pubkeys: Option<Vec<String>>,
    /// Only events at or after this timestamp.
    pub since: Option<u64>,
    /// Cap on stored events returned.
    pub limit: Option<usize>,
}

impl Filter {
    /// Filter on authors.
    pub fn authors(keys: Vec<String>) -> Filter {
        Filter {
            authors: Some(keys),
            ..Filter::default()
        }
    }

    /// Restrict to the given kinds.
    pub fn kinds(mut self, kinds: Vec<u32>) -> Filter {
        self.kinds = Some(kinds);
        self
    }

    /// Restrict to events tagged with the given `p` keys.
    pub fn tagged(keys: Vec<String>) -> Filter {
        Filter {
            pubkeys: Some(keys),
            ..Filter::default()
        }
    }

    /// Cap the number of stored events returned.
    pub fn limit(mut self, limit: usize) -> Filter {
        self.limit = Some(limit);
        self
    }

    /// Serialize into the NIP-01 filter object.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        if let Some(a) = self.authors.clone() {
            map.insert(
                "authors".into(),
                Value::Array(a.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(k) = self.kinds.clone() {
            map.insert(
                "kinds".into(),
                Value::Array(k.into_iter().map(|v| Value::Number(v.into())).collect()),
            );
        }
        if let Some(p) = self.pubkeys.clone() {
            map.insert(
                "#p".into(),
                Value::Array(p.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(s) = self.since {
            map.insert("since".into(), Value::Number(s.into()));
        }
        if let Some(l) = self.limit {
            map.insert("limit".into(), Value::Number(l.into()));
        }
        Value::Object(map)
    }
}

/// Commands the pool sends down to one connection task.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    /// Open (or replace) a subscription under a stable id.
    Subscribe(String, Filter),
    /// Close a subscription.
    Unsubscribe(String),
    /// Send an event.
    Publish(Event),
}

/// Everything a connection forwards up to the pool's merged stream.
#[derive(Debug, Clone)]
pub(crate) enum Inbound {
    Event { relay: String, event: Event },
    Notice { relay: String, text: String },
}

/// Handle to a spawned connection task.
pub(crate) struct Connection {
    pub descriptor: RelayDescriptor,
    tx: mpsc::UnboundedSender<Outbound>,
    handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Spawn the connection task. `subs` seeds the subscriptions replayed on
    /// every (re)connect; later `Subscribe`/`Unsubscribe` commands keep that
    /// replay set current.
    pub fn spawn(
        descriptor: RelayDescriptor,
        tor_socks: Option<String>,
        inbound: mpsc::Sender<Inbound>,
        subs: Vec<(String, Filter)>,
    ) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let desc = descriptor.clone();
        let handle = tokio::spawn(async move {
            run_connection(desc, tor_socks, inbound, rx, subs.into_iter().collect()).await;
        });
        Connection {
            descriptor,
            tx,
            handle,
        }
    }

    /// Queue a command for the connection task. Dropped silently if the task
    /// has already exited.
    pub fn send(&self, cmd: Outbound) {
        let _ = self.tx.send(cmd);
    }

    /// Tear the connection down, abandoning in-flight subscriptions.
    pub fn close(&self) {
        self.handle.abort();
    }
}

/// Connect, replay subscriptions, and shuttle messages until the pool drops
/// the command channel. Connection failures back off and retry without
/// affecting any other relay.
async fn run_connection(
    desc: RelayDescriptor,
    tor_socks: Option<String>,
    inbound: mpsc::Sender<Inbound>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut subs: HashMap<String, Filter>,
) {
    loop {
        let mut ws = match connect_ws(&desc.url, tor_socks.as_deref()).await {
            Ok(ws) => {
                debug!(relay = %desc.url, "connected");
                ws
            }
            Err(e) => {
                warn!(relay = %desc.url, error = %e, "connect failed");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        if desc.read {
            for (id, filter) in &subs {
                let req = json!(["REQ", id, filter.to_json()]);
                if ws.send(Message::Text(req.to_string())).await.is_err() {
                    break;
                }
            }
        }

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { return };
                    let msg = match cmd {
                        Outbound::Subscribe(id, filter) => {
                            let req = json!(["REQ", id, filter.to_json()]);
                            subs.insert(id, filter);
                            req
                        }
                        Outbound::Unsubscribe(id) => {
                            subs.remove(&id);
                            json!(["CLOSE", id])
                        }
                        Outbound::Publish(event) => json!(["EVENT", event]),
                    };
                    if ws.send(Message::Text(msg.to_string())).await.is_err() {
                        break;
                    }
                }
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(txt))) => {
                            if forward(&desc.url, &txt, &inbound).await.is_err() {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(relay = %desc.url, error = %e, "read failed");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        sleep(RECONNECT_DELAY).await;
    }
}

/// Parse one relay frame and forward events/notices to the merged stream.
/// Unrecognized frames (EOSE, OK, malformed JSON) are ignored.
async fn forward(
    relay: &str,
    txt: &str,
    inbound: &mpsc::Sender<Inbound>,
) -> std::result::Result<(), ()> {
    let Ok(val) = serde_json::from_str::<Value>(txt) else {
        return Ok(());
    };
    let Some(arr) = val.as_array() else {
        return Ok(());
    };
    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") if arr.len() >= 3 => {
            if let Ok(event) = serde_json::from_value::<Event>(arr[2].clone()) {
                inbound
                    .send(Inbound::Event {
                        relay: relay.to_string(),
                        event,
                    })
                    .await
                    .map_err(|_| ())?;
            }
        }
        Some("NOTICE") if arr.len() >= 2 => {
            if let Some(text) = arr[1].as_str() {
                inbound
                    .send(Inbound::Notice {
                        relay: relay.to_string(),
                        text: text.to_string(),
                    })
                    .await
                    .map_err(|_| ())?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Establish a WebSocket connection, optionally via a SOCKS5 proxy.
async fn connect_ws(
    relay: &str,
    tor_socks: Option<&str>,
) -> Result<WebSocketStream<Box<dyn AsyncReadWrite + Unpin + Send>>> {
    let url = Url::parse(relay).map_err(|e| Error::Network(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Network("missing host".into()))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Network("missing port".into()))?;
    let req = relay
        .into_client_request()
        .map_err(|e| Error::Network(e.to_string()))?;
    let stream: Box<dyn AsyncReadWrite + Unpin + Send> = if let Some(proxy) = tor_socks {
        Box::new(
            Socks5Stream::connect(proxy, (host, port))
                .await
                .map_err(|e| Error::Network(e.to_string()))?,
        )
    } else {
        Box::new(TcpStream::connect((host, port)).await?)
    };
    let (ws, _) = client_async(req, stream)
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    Ok(ws)
}

/// Blanket trait for boxed async read/write streams.
trait AsyncReadWrite: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
