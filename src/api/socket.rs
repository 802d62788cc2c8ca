use crate::api::events::{self, Frame};
use crate::error::ChatError;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Named-event handler registry. Holds at most one handler per event name;
/// installing a handler replaces the previous one.
#[derive(Clone, Default)]
pub struct Realtime {
    handlers: Arc<Mutex<HashMap<String, Handler>>>,
}

impl Realtime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Handler>> {
        self.handlers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.lock().insert(event.to_string(), Arc::new(handler));
    }

    /// Removes the handler for `event`, returning whether one was installed.
    pub fn off(&self, event: &str) -> bool {
        self.lock().remove(event).is_some()
    }

    pub fn is_subscribed(&self, event: &str) -> bool {
        self.lock().contains_key(event)
    }

    /// Hands `payload` to the handler for `event`, if any.
    pub fn deliver(&self, event: &str, payload: Value) -> bool {
        // The handler runs outside the lock so it may call back into the registry.
        let handler = self.lock().get(event).cloned();
        match handler {
            Some(h) => {
                h(payload);
                true
            }
            None => false,
        }
    }
}

/// Builds the Socket.IO WebSocket endpoint for a server base URL.
pub fn socket_url(base_url: &str, user_id: Option<&str>) -> Result<Url, ChatError> {
    let mut url = Url::parse(base_url).map_err(|e| ChatError::Config(format!("invalid socket url {base_url:?}: {e}")))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot use {scheme} for {base_url:?}")))?;
    url.set_path("/socket.io/");
    url.set_query(None);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("EIO", "4").append_pair("transport", "websocket");
        if let Some(id) = user_id {
            query.append_pair("userId", id);
        }
    }
    Ok(url)
}

/// Owns the background connection task; the connection closes when this is dropped.
pub struct SocketHandle {
    task: JoinHandle<()>,
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn connect(url: Url, realtime: Realtime) -> Result<SocketHandle, ChatError> {
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    log::info!("WebSocket connected to {}", url.host_str().unwrap_or_default());
    let (mut write, mut read) = ws_stream.split();

    let task = tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("socket read failed: {e}");
                    break;
                }
            };
            let reply = match events::decode(&text) {
                Ok(Frame::Open(_)) => Some(events::connect()),
                Ok(Frame::Ping) => Some(events::pong()),
                Ok(Frame::Event(ev)) => {
                    if !realtime.deliver(&ev.event_type, ev.data) {
                        log::trace!("no handler for {}", ev.event_type);
                    }
                    None
                }
                Ok(Frame::ConnectError(reason)) => {
                    log::warn!("socket namespace rejected: {reason}");
                    break;
                }
                Ok(Frame::Close | Frame::Disconnect) => break,
                Ok(_) => None,
                Err(e) => {
                    log::warn!("skipping socket frame: {e}");
                    None
                }
            };
            if let Some(reply) = reply {
                if let Err(e) = write.send(WsMessage::Text(reply)).await {
                    log::warn!("socket write failed: {e}");
                    break;
                }
            }
        }
        log::info!("WebSocket closed");
    });

    Ok(SocketHandle { task })
}
