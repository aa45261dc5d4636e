use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{error, info};
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::aggregator::{self, ChatAppends, ChatObserver, EditorsObserver, SessionInput};
use crate::document::{self, DocKind, DocumentHandle};
use crate::messages::{ChatEntry, JoinRequest};
use crate::ot::{self, OpComponent};
use crate::presence::{Member, Roster};
use crate::store::{DocumentStore, OpKind, OpSource, StoreError, SubscriptionId};

pub const SELF_DESTRUCT_DELAY: Duration = Duration::from_secs(5 * 60 * 60);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Failed to encode document value: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Operation log replay failed at version {version}: {source}")]
    Replay { version: u64, source: ot::OtError },
}

/// Sent to the registry when an empty channel has been idle long enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestructSignal {
    pub channel_name: String,
    pub channel_id: String,
}

fn generate_channel_id() -> String {
    let mut rng = rand::thread_rng();
    (0..5).map(|_| format!("{:04x}", rng.gen::<u16>())).collect()
}

fn timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Coordinator for one collaborative channel: membership, history entries
/// and idle teardown.
pub struct Channel {
    name: String,
    id: String,
    namespace: String,
    chat: DocumentHandle,
    editors: DocumentHandle,
    cursors: DocumentHandle,
    roster: Mutex<Roster>,
    self_destruct: Mutex<Option<JoinHandle<()>>>,
    idle_delay: Duration,
    destruct_tx: mpsc::UnboundedSender<DestructSignal>,
    activity: mpsc::UnboundedSender<SessionInput>,
    chat_appends: Arc<ChatAppends>,
    aggregator: JoinHandle<()>,
    subscriptions: Vec<(DocKind, SubscriptionId)>,
}

impl Channel {
    /// Creates the channel's documents if needed, hooks the edit aggregator
    /// onto them and starts it.
    pub async fn open(
        name: &str,
        store: Arc<dyn DocumentStore>,
        idle_delay: Duration,
        destruct_tx: mpsc::UnboundedSender<DestructSignal>,
    ) -> Result<Arc<Self>, ChannelError> {
        let id = generate_channel_id();
        let namespace = format!("{name}{id}");
        let chat = DocumentHandle::new(store.clone(), namespace.clone(), DocKind::Chat);
        let editors = DocumentHandle::new(store.clone(), namespace.clone(), DocKind::Editors);
        let cursors = DocumentHandle::new(store, namespace.clone(), DocKind::Cursors);

        let (activity, rx) = mpsc::unbounded_channel();
        let chat_appends = Arc::new(ChatAppends::new());
        let chat_observer = ChatObserver::new(activity.clone(), chat_appends.clone());
        let (transcript, chat_sub) = chat.subscribe(Arc::new(chat_observer)).await?;
        let editors_observer = EditorsObserver::new(activity.clone(), chat_appends.clone());
        let editors_sub = match editors.subscribe(Arc::new(editors_observer)).await {
            Ok((_, sub)) => sub,
            Err(e) => {
                chat.unsubscribe(chat_sub).await;
                return Err(e.into());
            }
        };
        cursors.fetch().await?;

        let aggregator = tokio::spawn(aggregator::run(
            namespace.clone(),
            chat.clone(),
            editors.clone(),
            document::message_count(&transcript.data),
            rx,
        ));

        info!("Channel {name} ({id}) created");
        Ok(Arc::new(Channel {
            name: name.to_string(),
            id,
            namespace,
            chat,
            editors,
            cursors,
            roster: Mutex::new(Roster::new()),
            self_destruct: Mutex::new(None),
            idle_delay,
            destruct_tx,
            activity,
            chat_appends,
            aggregator,
            subscriptions: vec![(DocKind::Chat, chat_sub), (DocKind::Editors, editors_sub)],
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace all three documents live under in the store.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn is_empty(&self) -> bool {
        self.roster.lock().await.is_empty()
    }

    pub async fn member_ids(&self) -> Vec<String> {
        self.roster.lock().await.member_ids()
    }

    pub fn chat(&self) -> &DocumentHandle {
        &self.chat
    }

    pub fn editors(&self) -> &DocumentHandle {
        &self.editors
    }

    pub fn cursors(&self) -> &DocumentHandle {
        &self.cursors
    }

    /// Seats the member and records the join in the chat document.
    pub async fn add_member(&self, request: &JoinRequest) -> Result<Member, ChannelError> {
        let member = self.seat_member(request).await;
        self.announce_member(&member).await?;
        Ok(member)
    }

    /// Roster half of a join. The member counts as connected from here on,
    /// whether or not the announcement succeeds.
    pub async fn seat_member(&self, request: &JoinRequest) -> Member {
        let mut roster = self.roster.lock().await;
        let member = roster.admit(request.id.clone(), request.username.clone(), timestamp());
        self.stop_self_destruct_timer().await;
        info!("Client ({}:{} in {}) joined", member.id, member.info.name, self.name);
        member
    }

    /// Writes `activeUsers`, `allUsers` and the `join` entry, in that order.
    pub async fn announce_member(&self, member: &Member) -> Result<(), ChannelError> {
        let value = serde_json::to_value(member)?;
        for list in ["activeUsers", "allUsers"] {
            let path = vec![list.into(), member.id.clone().into()];
            let op = OpComponent::object_insert(path, value.clone());
            self.chat.submit(vec![op], OpSource::Coordinator).await?;
        }
        let join = ChatEntry::Join { uid: member.id.clone(), timestamp: timestamp() };
        self.chat.push_message(serde_json::to_value(&join)?, OpSource::Coordinator).await?;
        Ok(())
    }

    /// Attributes editing activity (focus, typing) to a member.
    pub fn editor_event(&self, member_id: &str) {
        let _ = self.activity.send(SessionInput::EditorActivity {
            member_id: member_id.to_string(),
            chat_appends: self.chat_appends.count(),
        });
    }

    /// Rebuilds the editors document as it was at `version` by replaying its
    /// operation log, one record per editor id.
    pub async fn editor_values(&self, version: u64) -> Result<Vec<Value>, ChannelError> {
        let records = self.editors.ops(0, version).await?;
        let mut content = DocKind::Editors.seed();
        for record in records {
            match record.kind {
                OpKind::Create { data } => content = data,
                OpKind::Op(op) => {
                    ot::apply(&mut content, &op)
                        .map_err(|source| ChannelError::Replay { version: record.v, source })?;
                }
            }
        }

        let mut values: Vec<(String, Value)> = Vec::new();
        for editor in content.as_array().into_iter().flatten() {
            let id = editor["id"].as_str().unwrap_or_default().to_string();
            match values.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, value)) => value.clone_from(editor),
                None => values.push((id, editor.clone())),
            }
        }
        Ok(values.into_iter().map(|(_, value)| value).collect())
    }

    /// Connection-close cleanup. Steps run in order and the first failure
    /// stops the chain; the member then stays seated.
    pub async fn remove_member(&self, member: &Member) {
        info!("Client ({} in {}) disconnected", member.id, self.name);
        if let Err(e) = self.release_member(member, timestamp()).await {
            error!("Cleanup for {} in {} aborted: {e}", member.id, self.name);
        }
    }

    async fn release_member(&self, member: &Member, left_at: i64) -> Result<(), ChannelError> {
        let left = ChatEntry::Left { uid: member.id.clone(), timestamp: left_at };
        self.chat.push_message(serde_json::to_value(&left)?, OpSource::Coordinator).await?;

        let chat = self.chat.fetch().await?;
        if let Some(active) = chat.data["activeUsers"].get(&member.id) {
            let path = vec!["activeUsers".into(), member.id.clone().into()];
            let op = OpComponent::object_delete(path, active.clone());
            self.chat.submit(vec![op], OpSource::Coordinator).await?;
        }
        if let Some(previous) = chat.data["allUsers"][member.id.as_str()].get("left") {
            let path = vec!["allUsers".into(), member.id.clone().into(), "left".into()];
            let stamp = OpComponent::object_replace(path, previous.clone(), left_at.into());
            self.chat.submit(vec![stamp], OpSource::Coordinator).await?;
        }

        let cursors = self.cursors.fetch().await?;
        if let Some(editors) = cursors.data.as_object() {
            for (index, editor) in editors {
                for field in ["userCursors", "userSelections"] {
                    if let Some(old) = editor[field].get(&member.id) {
                        let path =
                            vec![index.clone().into(), field.into(), member.id.clone().into()];
                        let op = OpComponent::object_delete(path, old.clone());
                        self.cursors.submit(vec![op], OpSource::Coordinator).await?;
                    }
                }
            }
        }

        let mut roster = self.roster.lock().await;
        roster.remove(member.seat());
        if roster.is_empty() {
            self.start_self_destruct_timer().await;
        }
        Ok(())
    }

    async fn start_self_destruct_timer(&self) {
        let mut pending = self.self_destruct.lock().await;
        if pending.is_some() {
            return;
        }
        let delay = self.idle_delay;
        let tx = self.destruct_tx.clone();
        let signal = DestructSignal {
            channel_name: self.name.clone(),
            channel_id: self.id.clone(),
        };
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(signal);
        }));
    }

    async fn stop_self_destruct_timer(&self) {
        if let Some(timer) = self.self_destruct.lock().await.take() {
            timer.abort();
        }
    }

    /// Stops everything the channel runs in the background.
    pub async fn destroy(&self) {
        self.stop_self_destruct_timer().await;
        for (kind, subscription) in &self.subscriptions {
            match kind {
                DocKind::Chat => self.chat.unsubscribe(*subscription).await,
                DocKind::Editors => self.editors.unsubscribe(*subscription).await,
                DocKind::Cursors => self.cursors.unsubscribe(*subscription).await,
            }
        }
        self.aggregator.abort();
        info!("Channel {} ({}) was destroyed", self.name, self.id);
    }
}
