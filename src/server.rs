use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::channel::{Channel, ChannelError, DestructSignal};
use crate::messages::{ClientMessage, Envelope, JoinReply, JoinRequest, Reply, CC_REQUEST};
use crate::presence::Member;
use crate::store::DocumentStore;

type ChannelMap = HashMap<String, Arc<Channel>>;

struct Membership {
    channel: Arc<Channel>,
    member: Member,
}

/// One client connection and the channels it has joined.
pub struct Session {
    id: String,
    outbound: mpsc::UnboundedSender<String>,
    memberships: Vec<Membership>,
}

impl Session {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Session {
            id: Uuid::new_v4().to_string(),
            outbound,
            memberships: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn reply(&self, request: &Envelope, payload: Value) {
        self.send(&Reply::to(request, payload));
    }

    fn send(&self, reply: &Reply) {
        match serde_json::to_string(reply) {
            Ok(text) => {
                if self.outbound.send(text).is_err() {
                    debug!("Connection {} closed before reply", self.id);
                }
            }
            Err(e) => error!("Failed to encode reply for {}: {}", self.id, e),
        }
    }

    fn membership(&self, namespace: Option<&str>) -> Option<&Membership> {
        let namespace = namespace?;
        self.memberships.iter().find(|m| m.channel.namespace() == namespace)
    }
}

/// Process-wide context: the store and every live channel, keyed by name.
pub struct Server {
    store: Arc<dyn DocumentStore>,
    channels: RwLock<ChannelMap>,
    idle_delay: Duration,
    destruct_tx: mpsc::UnboundedSender<DestructSignal>,
}

impl Server {
    pub fn new(store: Arc<dyn DocumentStore>, idle_delay: Duration) -> Arc<Self> {
        let (destruct_tx, mut destruct_rx) = mpsc::unbounded_channel::<DestructSignal>();
        let server = Arc::new(Server {
            store,
            channels: RwLock::new(HashMap::new()),
            idle_delay,
            destruct_tx,
        });

        let weak: Weak<Server> = Arc::downgrade(&server);
        tokio::spawn(async move {
            while let Some(signal) = destruct_rx.recv().await {
                let Some(server) = weak.upgrade() else { break };
                server.handle_destruct(signal).await;
            }
        });

        server
    }

    pub async fn resolve_or_create(
        &self,
        channel_name: &str,
    ) -> Result<Arc<Channel>, ChannelError> {
        let mut channels = self.channels.write().await;
        self.resolve_locked(&mut channels, channel_name).await
    }

    /// Resolves the requested channel and seats the member without letting
    /// go of the registry, so a pending destruct either finishes first or
    /// finds the channel occupied.
    pub async fn seat(
        &self,
        request: &JoinRequest,
    ) -> Result<(Arc<Channel>, Member), ChannelError> {
        let mut channels = self.channels.write().await;
        let channel = self.resolve_locked(&mut channels, &request.channel).await?;
        let member = channel.seat_member(request).await;
        Ok((channel, member))
    }

    async fn resolve_locked(
        &self,
        channels: &mut ChannelMap,
        channel_name: &str,
    ) -> Result<Arc<Channel>, ChannelError> {
        if let Some(channel) = channels.get(channel_name) {
            return Ok(channel.clone());
        }
        let channel = Channel::open(
            channel_name,
            self.store.clone(),
            self.idle_delay,
            self.destruct_tx.clone(),
        )
        .await?;
        channels.insert(channel_name.to_string(), channel.clone());
        Ok(channel)
    }

    /// True when no channel is registered under that name. A registered
    /// channel without members still counts as taken.
    pub async fn is_empty(&self, channel_name: &str) -> bool {
        !self.channels.read().await.contains_key(channel_name)
    }

    pub async fn destroy(&self, channel_name: &str) {
        let removed = self.channels.write().await.remove(channel_name);
        if let Some(channel) = removed {
            channel.destroy().await;
        }
    }

    async fn handle_destruct(&self, signal: DestructSignal) {
        let mut channels = self.channels.write().await;
        let channel = match channels.get(&signal.channel_name) {
            Some(channel) if channel.id() == signal.channel_id => channel.clone(),
            _ => {
                debug!("Ignoring stale destruct signal for {}", signal.channel_name);
                return;
            }
        };
        if !channel.is_empty().await {
            debug!("Channel {} is occupied again, not destroying", signal.channel_name);
            return;
        }
        channels.remove(&signal.channel_name);
        drop(channels);
        channel.destroy().await;
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut session = Session::new(tx);
        info!("Connection {} opened", session.id);

        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        self.handle_text(text, &mut session).await;
                    } else if msg.is_close() {
                        break;
                    }
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        self.handle_disconnect(session).await;
    }

    /// Handles one inbound text frame. Nothing here fails the connection:
    /// bad frames and store errors are logged and the request goes unanswered.
    pub async fn handle_text(&self, text: &str, session: &mut Session) {
        let envelope: Envelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Malformed frame from {}: {}", session.id, e);
                return;
            }
        };
        if envelope.cc != CC_REQUEST {
            debug!("Ignoring document store frame from {}", session.id);
            return;
        }
        let message = match ClientMessage::from_envelope(&envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!("Bad {} request from {}: {}", envelope.kind, session.id, e);
                return;
            }
        };

        match message {
            ClientMessage::RequestJoinRoom(request) => {
                self.join_room(&request, &envelope, session).await;
            }
            ClientMessage::ChannelAvailable { channel } => {
                let available = self.is_empty(&channel).await;
                session.reply(&envelope, Value::Bool(available));
            }
            ClientMessage::EditorEvent => {
                if let Some(m) = session.membership(envelope.ns.as_deref()) {
                    m.channel.editor_event(&m.member.id);
                }
            }
            ClientMessage::GetEditorsValues { version } => {
                let Some(m) = session.membership(envelope.ns.as_deref()) else {
                    debug!("{} asked for editors of a channel it has not joined", session.id);
                    return;
                };
                match m.channel.editor_values(version).await {
                    Ok(values) => session.reply(&envelope, Value::Array(values)),
                    Err(e) => error!("Failed to rebuild editors of {}: {}", m.channel.name(), e),
                }
            }
            ClientMessage::Unknown(kind) => {
                debug!("Unknown request type {kind} from {}", session.id);
            }
        }
    }

    async fn join_room(&self, request: &JoinRequest, envelope: &Envelope, session: &mut Session) {
        let (channel, member) = match self.seat(request).await {
            Ok(seated) => seated,
            Err(e) => {
                error!("Failed to open channel {}: {}", request.channel, e);
                return;
            }
        };
        let announced = channel.announce_member(&member).await;
        session.memberships.push(Membership { channel: channel.clone(), member });

        match announced {
            Ok(()) => {
                let reply = JoinReply {
                    id: channel.id().to_string(),
                    ns: channel.namespace().to_string(),
                };
                match serde_json::to_value(reply) {
                    Ok(payload) => {
                        session.send(&Reply::to(envelope, payload).in_channel(&request.channel));
                    }
                    Err(e) => error!("Failed to encode join reply: {}", e),
                }
            }
            Err(e) => error!("Failed to announce {} in {}: {}", request.id, request.channel, e),
        }
    }

    pub async fn handle_disconnect(&self, session: Session) {
        for membership in &session.memberships {
            membership.channel.remove_member(&membership.member).await;
        }
        info!("Connection {} closed", session.id);
    }
}
