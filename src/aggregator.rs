//! Folds editing activity into `edit` history entries.
//!
//! [`EditSession`] is the pure state machine. [`run`] drives it from a queue
//! fed by the chat/editors observers and by members' `editor-event`s, and
//! writes the resulting groups into the chat document.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::document::DocumentHandle;
use crate::messages::{ChatEntry, EditGroup, FileContents};
use crate::ot::OpComponent;
use crate::store::{Change, DocumentObserver, OpSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LastEvent {
    None,
    Chat,
    Edit,
}

/// Contents of one editor as captured from a change notification.
#[derive(Clone, Debug, PartialEq)]
pub struct EditorTouch {
    pub editor_id: String,
    pub contents: String,
}

/// `chat_appends` is [`ChatAppends::count`] at the moment the activity was
/// observed.
#[derive(Debug)]
pub enum SessionInput {
    ChatAppended,
    EditorActivity {
        member_id: String,
        chat_appends: usize,
    },
    BeforeEdit {
        version: u64,
        touched: Vec<EditorTouch>,
        chat_appends: usize,
    },
    AfterEdit {
        version: u64,
        touched: Vec<EditorTouch>,
    },
}

impl SessionInput {
    fn chat_appends(&self) -> usize {
        match self {
            SessionInput::EditorActivity { chat_appends, .. }
            | SessionInput::BeforeEdit { chat_appends, .. } => *chat_appends,
            SessionInput::ChatAppended | SessionInput::AfterEdit { .. } => 0,
        }
    }
}

/// What the driver has to write into the chat document.
#[derive(Clone, Debug, PartialEq)]
pub enum HistoryWrite {
    Append(EditGroup),
    Replace(EditGroup),
}

pub struct EditSession {
    last_event: LastEvent,
    group: Option<EditGroup>,
    files: HashSet<String>,
    users: HashSet<String>,
}

impl Default for EditSession {
    fn default() -> Self {
        Self::new()
    }
}

impl EditSession {
    pub fn new() -> Self {
        Self {
            last_event: LastEvent::None,
            group: None,
            files: HashSet::new(),
            users: HashSet::new(),
        }
    }

    pub fn last_event(&self) -> LastEvent {
        self.last_event
    }

    pub fn group(&self) -> Option<&EditGroup> {
        self.group.as_ref()
    }

    /// Someone else wrote to the transcript; the open group is finished.
    pub fn chat_observed(&mut self) {
        self.last_event = LastEvent::Chat;
        self.group = None;
    }

    /// The open group could not be written; the next activity starts over.
    pub fn abandon_group(&mut self) {
        self.last_event = LastEvent::None;
        self.group = None;
    }

    fn open_if_idle(&mut self, version: u64, now: i64) -> bool {
        if self.last_event == LastEvent::Edit && self.group.is_some() {
            return false;
        }
        self.files.clear();
        self.users.clear();
        self.group = Some(EditGroup {
            from_version: version,
            to_version: version,
            files: Vec::new(),
            users: Vec::new(),
            file_contents: BTreeMap::new(),
            start_timestamp: now,
            end_timestamp: now,
        });
        self.last_event = LastEvent::Edit;
        true
    }

    fn opened(&self, opened: bool) -> Option<HistoryWrite> {
        if opened {
            self.group.clone().map(HistoryWrite::Append)
        } else {
            None
        }
    }

    pub fn editor_activity(
        &mut self,
        member_id: &str,
        version: u64,
        now: i64,
    ) -> Option<HistoryWrite> {
        let opened = self.open_if_idle(version, now);
        if let Some(group) = self.group.as_mut() {
            if self.users.insert(member_id.to_string()) {
                group.users.push(member_id.to_string());
            }
        }
        self.opened(opened)
    }

    /// `touched` holds each editor's contents before the operation lands.
    pub fn before_edit(
        &mut self,
        touched: &[EditorTouch],
        version: u64,
        now: i64,
    ) -> Option<HistoryWrite> {
        if touched.is_empty() {
            return None;
        }
        let opened = self.open_if_idle(version, now);
        if let Some(group) = self.group.as_mut() {
            for touch in touched {
                if self.files.insert(touch.editor_id.clone()) {
                    group.files.push(touch.editor_id.clone());
                    group.file_contents.insert(
                        touch.editor_id.clone(),
                        FileContents {
                            value_before: touch.contents.clone(),
                            value_after: touch.contents.clone(),
                        },
                    );
                }
            }
        }
        self.opened(opened)
    }

    /// `touched` holds each editor's contents after the operation landed.
    pub fn after_edit(
        &mut self,
        touched: &[EditorTouch],
        version: u64,
        now: i64,
    ) -> Option<HistoryWrite> {
        let group = self.group.as_mut()?;
        let mut changed = false;
        for touch in touched {
            if let Some(contents) = group.file_contents.get_mut(&touch.editor_id) {
                contents.value_after.clone_from(&touch.contents);
                changed = true;
            }
        }
        if !changed || self.last_event != LastEvent::Edit {
            return None;
        }
        group.to_version = version;
        group.end_timestamp = now;
        Some(HistoryWrite::Replace(group.clone()))
    }
}

/// Entries inserted into the `messages` list by this change.
fn inserted_messages<'a>(change: &Change<'a>) -> impl Iterator<Item = &'a Value> {
    let op: &'a [OpComponent] = change.op;
    op.iter()
        .filter(|c| c.p.len() == 2 && c.p[0].is_key("messages") && c.ld.is_none())
        .filter_map(|c| c.li.as_ref())
}

fn is_external_chat_append(change: &Change<'_>) -> bool {
    change.source != OpSource::Aggregator
        && inserted_messages(change).any(|entry| entry["type"] != "edit")
}

/// Editors whose `contents` string is edited by this change, read from the
/// snapshot carried by the notification.
fn touched_editors(change: &Change<'_>) -> Vec<EditorTouch> {
    let mut touched: Vec<EditorTouch> = Vec::new();
    for component in change.op {
        if component.p.len() != 3 || !component.p[1].is_key("contents") {
            continue;
        }
        let Some(editor) = component.p[0].as_index().and_then(|i| change.snapshot.get(i)) else {
            continue;
        };
        let (Some(id), Some(contents)) = (editor["id"].as_str(), editor["contents"].as_str())
        else {
            continue;
        };
        if let Some(existing) = touched.iter_mut().find(|t| t.editor_id == id) {
            existing.contents = contents.to_string();
        } else {
            touched.push(EditorTouch {
                editor_id: id.to_string(),
                contents: contents.to_string(),
            });
        }
    }
    touched
}

/// Transcript entries written by anyone but the aggregator since it
/// subscribed. Store notifications are serialized, so a count taken while
/// observing editing activity fixes where that activity's group belongs.
#[derive(Debug, Default)]
pub struct ChatAppends(AtomicUsize);

impl ChatAppends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn record(&self, entries: usize) {
        self.0.fetch_add(entries, Ordering::SeqCst);
    }
}

pub struct ChatObserver {
    tx: mpsc::UnboundedSender<SessionInput>,
    appends: Arc<ChatAppends>,
}

impl ChatObserver {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>, appends: Arc<ChatAppends>) -> Self {
        Self { tx, appends }
    }
}

impl DocumentObserver for ChatObserver {
    fn before_apply(&self, change: &Change<'_>) {
        if change.source == OpSource::Aggregator {
            return;
        }
        let entries = inserted_messages(change).count();
        if entries > 0 {
            self.appends.record(entries);
        }
        if is_external_chat_append(change) {
            let _ = self.tx.send(SessionInput::ChatAppended);
        }
    }

    fn after_apply(&self, _change: &Change<'_>) {}
}

pub struct EditorsObserver {
    tx: mpsc::UnboundedSender<SessionInput>,
    appends: Arc<ChatAppends>,
}

impl EditorsObserver {
    pub fn new(tx: mpsc::UnboundedSender<SessionInput>, appends: Arc<ChatAppends>) -> Self {
        Self { tx, appends }
    }
}

impl DocumentObserver for EditorsObserver {
    fn before_apply(&self, change: &Change<'_>) {
        let touched = touched_editors(change);
        if !touched.is_empty() {
            let _ = self.tx.send(SessionInput::BeforeEdit {
                version: change.version,
                touched,
                chat_appends: self.appends.count(),
            });
        }
    }

    fn after_apply(&self, change: &Change<'_>) {
        let touched = touched_editors(change);
        if !touched.is_empty() {
            let _ = self.tx.send(SessionInput::AfterEdit { version: change.version, touched });
        }
    }
}

fn timestamp() -> i64 {
    Utc::now().timestamp_millis()
}

/// Drives an [`EditSession`] until every sender of `rx` is gone.
///
/// `start` is the transcript length when the observers were subscribed. A
/// new group is inserted after every entry that preceded the activity
/// opening it, however far behind the queue is, and is amended at that
/// position afterwards.
pub async fn run(
    namespace: String,
    chat: DocumentHandle,
    editors: DocumentHandle,
    start: usize,
    mut rx: mpsc::UnboundedReceiver<SessionInput>,
) {
    let mut session = EditSession::new();
    let mut groups_written = 0;
    // Position of the open group and the value last written there.
    let mut slot: Option<(usize, Value)> = None;

    while let Some(input) = rx.recv().await {
        let chat_appends = input.chat_appends();
        let write = match input {
            SessionInput::ChatAppended => {
                session.chat_observed();
                None
            }
            SessionInput::EditorActivity { member_id, .. } => match editors.fetch().await {
                Ok(snapshot) => session.editor_activity(&member_id, snapshot.version, timestamp()),
                Err(e) => {
                    error!("Failed to read editors for {namespace}: {e}");
                    None
                }
            },
            SessionInput::BeforeEdit { version, touched, .. } => {
                session.before_edit(&touched, version, timestamp())
            }
            SessionInput::AfterEdit { version, touched } => {
                session.after_edit(&touched, version, timestamp())
            }
        };

        let Some(write) = write else { continue };
        let (index, expected, group) = match write {
            HistoryWrite::Append(group) => (start + chat_appends + groups_written, None, group),
            HistoryWrite::Replace(group) => match &slot {
                Some((index, written)) => (*index, Some(written.clone()), group),
                None => {
                    debug!("No edit group written yet for {namespace}");
                    continue;
                }
            },
        };
        let value = match serde_json::to_value(ChatEntry::Edit(group)) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode edit group for {namespace}: {e}");
                continue;
            }
        };

        let appending = expected.is_none();
        let result = match expected {
            None => chat.insert_message(index, value.clone(), OpSource::Aggregator).await,
            Some(expected) => {
                chat.replace_message(index, expected, value.clone(), OpSource::Aggregator).await
            }
        };
        match result {
            Ok(_) => {
                if appending {
                    groups_written += 1;
                }
                slot = Some((index, value));
            }
            Err(e) => {
                error!("Failed to record edit group in {namespace}: {e}");
                session.abandon_group();
                slot = None;
            }
        }
    }
    debug!("Edit aggregator for {namespace} stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::document::DocKind;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn touch(id: &str, contents: &str) -> EditorTouch {
        EditorTouch { editor_id: id.to_string(), contents: contents.to_string() }
    }

    #[test]
    fn burst_over_two_files_and_two_users_is_one_group() {
        let mut s = EditSession::new();

        let opened = s.editor_activity("u1", 5, 100);
        assert!(matches!(
            opened,
            Some(HistoryWrite::Append(ref g)) if g.from_version == 5 && g.users == ["u1"]
        ));

        assert_eq!(s.before_edit(&[touch("A", "a0")], 5, 101), None);
        s.after_edit(&[touch("A", "a1")], 6, 102);
        assert_eq!(s.editor_activity("u2", 6, 103), None);
        assert_eq!(s.before_edit(&[touch("B", "b0")], 6, 104), None);
        s.after_edit(&[touch("B", "b1")], 7, 105);
        assert_eq!(s.before_edit(&[touch("A", "a1")], 7, 106), None);
        let last = s.after_edit(&[touch("A", "a2")], 8, 107);

        let Some(HistoryWrite::Replace(group)) = last else {
            panic!("expected the group to be amended")
        };
        assert_eq!(group.files, ["A", "B"]);
        assert_eq!(group.users, ["u1", "u2"]);
        assert_eq!((group.from_version, group.to_version), (5, 8));
        assert_eq!((group.start_timestamp, group.end_timestamp), (100, 107));
        let file = |before: &str, after: &str| FileContents {
            value_before: before.into(),
            value_after: after.into(),
        };
        assert_eq!(group.file_contents["A"], file("a0", "a2"));
        assert_eq!(group.file_contents["B"], file("b0", "b1"));
    }

    #[test]
    fn chat_closes_the_open_group() {
        let mut s = EditSession::new();
        assert!(matches!(s.before_edit(&[touch("A", "")], 1, 1), Some(HistoryWrite::Append(_))));
        s.after_edit(&[touch("A", "x")], 2, 2);
        s.chat_observed();
        assert_eq!(s.last_event(), LastEvent::Chat);
        assert!(s.group().is_none());
        assert_eq!(s.after_edit(&[touch("A", "xy")], 3, 3), None);

        let reopened = s.before_edit(&[touch("A", "x")], 3, 4);
        let Some(HistoryWrite::Append(group)) = reopened else { panic!("expected a new group") };
        assert_eq!(group.from_version, 3);
        assert_eq!(group.file_contents["A"].value_before, "x");
    }

    #[test]
    fn edits_without_contents_changes_are_ignored() {
        let mut s = EditSession::new();
        assert_eq!(s.before_edit(&[], 1, 1), None);
        assert_eq!(s.last_event(), LastEvent::None);
    }

    struct Fixture {
        chat: DocumentHandle,
        editors: DocumentHandle,
        appends: Arc<ChatAppends>,
        tx: mpsc::UnboundedSender<SessionInput>,
    }

    impl Fixture {
        fn activity(&self, member_id: &str) {
            let input = SessionInput::EditorActivity {
                member_id: member_id.into(),
                chat_appends: self.appends.count(),
            };
            self.tx.send(input).unwrap();
        }
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let chat = DocumentHandle::new(store.clone(), "ns".into(), DocKind::Chat);
        let editors = DocumentHandle::new(store.clone(), "ns".into(), DocKind::Editors);
        let appends = Arc::new(ChatAppends::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let chat_observer = ChatObserver::new(tx.clone(), appends.clone());
        let editors_observer = EditorsObserver::new(tx.clone(), appends.clone());
        chat.subscribe(Arc::new(chat_observer)).await.unwrap();
        editors.subscribe(Arc::new(editors_observer)).await.unwrap();
        editors
            .submit(
                vec![
                    OpComponent::list_insert(vec![0.into()], json!({"id": "A", "contents": "a"})),
                    OpComponent::list_insert(vec![1.into()], json!({"id": "B", "contents": "b"})),
                ],
                OpSource::Client,
            )
            .await
            .unwrap();
        tokio::spawn(run("ns".into(), chat.clone(), editors.clone(), 0, rx));
        Fixture { chat, editors, appends, tx }
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn type_now(editors: &DocumentHandle, index: usize, offset: usize, text: &str) {
        let path = vec![index.into(), "contents".into(), offset.into()];
        let op = vec![OpComponent::string_insert(path, text)];
        editors.submit(op, OpSource::Client).await.unwrap();
    }

    async fn type_into(editors: &DocumentHandle, index: usize, offset: usize, text: &str) {
        type_now(editors, index, offset, text).await;
        settle().await;
    }

    async fn say(chat: &DocumentHandle, text: &str) {
        let entry = json!({"type": "message", "uid": "u1", "message": text});
        chat.push_message(entry, OpSource::Client).await.unwrap();
    }

    async fn messages(chat: &DocumentHandle) -> Vec<Value> {
        chat.fetch().await.unwrap().data["messages"].as_array().cloned().unwrap()
    }

    fn contents(before: &str, after: &str) -> Value {
        json!({"valueBefore": before, "valueAfter": after})
    }

    fn kinds(messages: &[Value]) -> Vec<&str> {
        messages.iter().map(|m| m["type"].as_str().unwrap()).collect()
    }

    #[tokio::test]
    async fn burst_is_amended_in_place() {
        let f = fixture().await;
        f.activity("u1");
        settle().await;
        type_into(&f.editors, 0, 1, "1").await;
        f.activity("u2");
        settle().await;
        type_into(&f.editors, 1, 1, "2").await;
        type_into(&f.editors, 0, 2, "3").await;

        let messages = messages(&f.chat).await;
        assert_eq!(messages.len(), 1);
        let group = &messages[0];
        assert_eq!(group["type"], "edit");
        assert_eq!(group["files"], json!(["A", "B"]));
        assert_eq!(group["users"], json!(["u1", "u2"]));
        assert_eq!(group["fromVersion"], 2);
        assert_eq!(group["toVersion"], 5);
        assert_eq!(group["fileContents"]["A"], contents("a", "a13"));
        assert_eq!(group["fileContents"]["B"], contents("b", "b2"));
    }

    #[tokio::test]
    async fn chat_in_the_middle_splits_the_burst() {
        let f = fixture().await;
        type_into(&f.editors, 0, 1, "x").await;
        say(&f.chat, "hi").await;
        settle().await;
        type_into(&f.editors, 0, 2, "y").await;

        let messages = messages(&f.chat).await;
        assert_eq!(kinds(&messages), ["edit", "message", "edit"]);
        assert_eq!(messages[0]["fileContents"]["A"]["valueAfter"], "ax");
        assert_eq!(messages[2]["fileContents"]["A"], contents("ax", "axy"));
    }

    #[tokio::test]
    async fn groups_keep_their_place_when_the_queue_lags() {
        let f = fixture().await;
        type_now(&f.editors, 0, 1, "x").await;
        say(&f.chat, "hi").await;
        f.activity("u2");
        type_now(&f.editors, 0, 2, "y").await;
        settle().await;

        let messages = messages(&f.chat).await;
        assert_eq!(kinds(&messages), ["edit", "message", "edit"]);
        assert_eq!(messages[0]["fileContents"]["A"], contents("a", "ax"));
        assert_eq!(messages[0]["toVersion"], 3);
        assert_eq!(messages[1]["message"], "hi");
        assert_eq!(messages[2]["fileContents"]["A"], contents("ax", "axy"));
        assert_eq!(messages[2]["users"], json!(["u2"]));

        say(&f.chat, "bye").await;
        type_into(&f.editors, 1, 1, "z").await;
        let messages = self::messages(&f.chat).await;
        assert_eq!(kinds(&messages), ["edit", "message", "edit", "message", "edit"]);
        assert_eq!(messages[4]["files"], json!(["B"]));
    }

    #[tokio::test]
    async fn rejected_amendment_starts_a_fresh_group() {
        let f = fixture().await;
        type_into(&f.editors, 0, 1, "x").await;
        let group = messages(&f.chat).await.remove(0);
        assert_eq!(group["type"], "edit");

        let note = json!({"type": "message", "uid": "u1", "message": "overwritten"});
        f.chat
            .submit(
                vec![OpComponent::list_replace(
                    vec!["messages".into(), 0.into()],
                    group,
                    note.clone(),
                )],
                OpSource::Client,
            )
            .await
            .unwrap();
        type_into(&f.editors, 0, 2, "y").await;
        assert_eq!(messages(&f.chat).await, vec![note.clone()]);

        type_into(&f.editors, 0, 3, "z").await;
        let messages = messages(&f.chat).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], note);
        assert_eq!(messages[1]["type"], "edit");
        assert_eq!(messages[1]["fromVersion"], 4);
        assert_eq!(messages[1]["fileContents"]["A"], contents("axy", "axyz"));
    }
}
