//! Document store interface and the in-memory backend.
//!
//! The store is the operational-transform substrate the channels sit on. It
//! owns document state, versioning and the operation log; channels only ever
//! talk to it through [`DocumentStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::ot::{self, OpComponent, OtError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Document {namespace}/{doc} does not exist")]
    NotFound { namespace: String, doc: String },
    #[error("Document {namespace}/{doc} already exists")]
    AlreadyExists { namespace: String, doc: String },
    #[error("Operation rejected: {0}")]
    Rejected(#[from] OtError),
}

/// Who submitted an operation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    Client,
    Coordinator,
    Aggregator,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub version: u64,
    pub data: Value,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create { data: Value },
    Op(Vec<OpComponent>),
}

/// One entry of a document's operation log. `v` is the version the document
/// had before the record was applied.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct OpRecord {
    pub v: u64,
    #[serde(flatten)]
    pub kind: OpKind,
    pub source: OpSource,
}

/// A change as seen by observers. For `before_apply` the snapshot and
/// version are the pre-operation state, for `after_apply` the post-operation
/// state.
pub struct Change<'a> {
    pub namespace: &'a str,
    pub doc: &'a str,
    pub version: u64,
    pub snapshot: &'a Value,
    pub op: &'a [OpComponent],
    pub source: OpSource,
}

/// Two-phase change hook. Both callbacks run synchronously inside the
/// submission and must not block.
pub trait DocumentObserver: Send + Sync {
    fn before_apply(&self, change: &Change<'_>);
    fn after_apply(&self, change: &Change<'_>);
}

pub type SubscriptionId = u64;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-in-time read. `None` when the document was never created.
    async fn fetch(&self, namespace: &str, doc: &str) -> Result<Option<Snapshot>, StoreError>;

    async fn create(&self, namespace: &str, doc: &str, data: Value) -> Result<Snapshot, StoreError>;

    /// Applies `op` atomically and returns the post-operation snapshot.
    async fn submit(
        &self,
        namespace: &str,
        doc: &str,
        op: Vec<OpComponent>,
        source: OpSource,
    ) -> Result<Snapshot, StoreError>;

    async fn subscribe(
        &self,
        namespace: &str,
        doc: &str,
        observer: Arc<dyn DocumentObserver>,
    ) -> Result<(Snapshot, SubscriptionId), StoreError>;

    async fn unsubscribe(&self, namespace: &str, doc: &str, subscription: SubscriptionId);

    /// Log records with `from <= v < to`, clamped to what has been recorded.
    async fn get_ops(
        &self,
        namespace: &str,
        doc: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<OpRecord>, StoreError>;
}

struct StoredDoc {
    data: Value,
    log: Vec<OpRecord>,
    observers: Vec<(SubscriptionId, Arc<dyn DocumentObserver>)>,
}

impl StoredDoc {
    fn version(&self) -> u64 {
        self.log.len() as u64
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot { version: self.version(), data: self.data.clone() }
    }
}

type DocKey = (String, String);

/// Non-persistent store. Everything is lost when the process exits.
#[derive(Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocKey, StoredDoc>>,
    next_subscription: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, doc: &str) -> DocKey {
        (namespace.to_string(), doc.to_string())
    }

    fn not_found(namespace: &str, doc: &str) -> StoreError {
        StoreError::NotFound { namespace: namespace.to_string(), doc: doc.to_string() }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn fetch(&self, namespace: &str, doc: &str) -> Result<Option<Snapshot>, StoreError> {
        let docs = self.docs.read().await;
        Ok(docs.get(&Self::key(namespace, doc)).map(StoredDoc::snapshot))
    }

    async fn create(
        &self,
        namespace: &str,
        doc: &str,
        data: Value,
    ) -> Result<Snapshot, StoreError> {
        let mut docs = self.docs.write().await;
        let key = Self::key(namespace, doc);
        if docs.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                namespace: namespace.to_string(),
                doc: doc.to_string(),
            });
        }
        let stored = StoredDoc {
            data: data.clone(),
            log: vec![OpRecord {
                v: 0,
                kind: OpKind::Create { data },
                source: OpSource::Coordinator,
            }],
            observers: Vec::new(),
        };
        let snapshot = stored.snapshot();
        docs.insert(key, stored);
        debug!("Created doc {doc} in {namespace}");
        Ok(snapshot)
    }

    async fn submit(
        &self,
        namespace: &str,
        doc: &str,
        op: Vec<OpComponent>,
        source: OpSource,
    ) -> Result<Snapshot, StoreError> {
        let mut docs = self.docs.write().await;
        let stored = docs
            .get_mut(&Self::key(namespace, doc))
            .ok_or_else(|| Self::not_found(namespace, doc))?;

        let mut next = stored.data.clone();
        ot::apply(&mut next, &op)?;

        let before = Change {
            namespace,
            doc,
            version: stored.version(),
            snapshot: &stored.data,
            op: &op,
            source,
        };
        for (_, observer) in &stored.observers {
            observer.before_apply(&before);
        }

        let v = stored.version();
        stored.data = next;
        stored.log.push(OpRecord { v, kind: OpKind::Op(op.clone()), source });

        let after = Change {
            namespace,
            doc,
            version: stored.version(),
            snapshot: &stored.data,
            op: &op,
            source,
        };
        for (_, observer) in &stored.observers {
            observer.after_apply(&after);
        }

        Ok(stored.snapshot())
    }

    async fn subscribe(
        &self,
        namespace: &str,
        doc: &str,
        observer: Arc<dyn DocumentObserver>,
    ) -> Result<(Snapshot, SubscriptionId), StoreError> {
        let mut docs = self.docs.write().await;
        let stored = docs
            .get_mut(&Self::key(namespace, doc))
            .ok_or_else(|| Self::not_found(namespace, doc))?;
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        stored.observers.push((id, observer));
        Ok((stored.snapshot(), id))
    }

    async fn unsubscribe(&self, namespace: &str, doc: &str, subscription: SubscriptionId) {
        let mut docs = self.docs.write().await;
        if let Some(stored) = docs.get_mut(&Self::key(namespace, doc)) {
            stored.observers.retain(|(id, _)| *id != subscription);
        }
    }

    async fn get_ops(
        &self,
        namespace: &str,
        doc: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<OpRecord>, StoreError> {
        let docs = self.docs.read().await;
        let stored = docs
            .get(&Self::key(namespace, doc))
            .ok_or_else(|| Self::not_found(namespace, doc))?;
        Ok(stored
            .log
            .iter()
            .filter(|record| record.v >= from && record.v < to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(&'static str, u64, Value)>>,
    }

    impl DocumentObserver for Recorder {
        fn before_apply(&self, change: &Change<'_>) {
            self.seen.lock().unwrap().push(("before", change.version, change.snapshot.clone()));
        }

        fn after_apply(&self, change: &Change<'_>) {
            self.seen.lock().unwrap().push(("after", change.version, change.snapshot.clone()));
        }
    }

    #[tokio::test]
    async fn create_then_fetch() {
        let store = MemoryStore::new();
        assert!(store.fetch("ns", "chat").await.unwrap().is_none());

        let created = store.create("ns", "chat", json!([])).await.unwrap();
        assert_eq!(created.version, 1);
        assert!(matches!(
            store.create("ns", "chat", json!([])).await,
            Err(StoreError::AlreadyExists { .. })
        ));
        assert_eq!(store.fetch("ns", "chat").await.unwrap(), Some(created));
    }

    #[tokio::test]
    async fn observers_see_pre_and_post_state() {
        let store = MemoryStore::new();
        store.create("ns", "editors", json!([{"id": "a", "contents": ""}])).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        store.subscribe("ns", "editors", recorder.clone()).await.unwrap();

        let path = vec![0.into(), "contents".into(), 0.into()];
        let op = vec![OpComponent::string_insert(path, "hi")];
        let snapshot = store.submit("ns", "editors", op, OpSource::Client).await.unwrap();
        assert_eq!(snapshot.version, 2);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0], ("before", 1, json!([{"id": "a", "contents": ""}])));
        assert_eq!(seen[1], ("after", 2, json!([{"id": "a", "contents": "hi"}])));
    }

    #[tokio::test]
    async fn rejected_ops_do_not_notify_or_log() {
        let store = MemoryStore::new();
        store.create("ns", "chat", json!({"messages": []})).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let (_, id) = store.subscribe("ns", "chat", recorder.clone()).await.unwrap();

        let bad = vec![OpComponent::list_insert(vec!["messages".into(), 3.into()], json!(1))];
        assert!(matches!(
            store.submit("ns", "chat", bad, OpSource::Client).await,
            Err(StoreError::Rejected(_))
        ));
        assert!(recorder.seen.lock().unwrap().is_empty());
        assert_eq!(store.get_ops("ns", "chat", 0, 10).await.unwrap().len(), 1);

        store.unsubscribe("ns", "chat", id).await;
        let good = vec![OpComponent::list_insert(vec!["messages".into(), 0.into()], json!(1))];
        store.submit("ns", "chat", good, OpSource::Client).await.unwrap();
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_ops_returns_the_requested_window() {
        let store = MemoryStore::new();
        store.create("ns", "editors", json!([])).await.unwrap();
        for i in 0..3usize {
            let op = vec![OpComponent::list_insert(vec![i.into()], json!({"id": i}))];
            store.submit("ns", "editors", op, OpSource::Client).await.unwrap();
        }

        let ops = store.get_ops("ns", "editors", 1, 3).await.unwrap();
        assert_eq!(ops.iter().map(|r| r.v).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(ops[0].kind, OpKind::Op(_)));

        let all = store.get_ops("ns", "editors", 0, 100).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].kind, OpKind::Create { data: json!([]) });
    }

    #[tokio::test]
    async fn submit_to_missing_doc_fails() {
        let store = MemoryStore::new();
        let op = vec![OpComponent::object_insert(vec!["k".into()], json!(1))];
        assert!(matches!(
            store.submit("ns", "cursors", op, OpSource::Client).await,
            Err(StoreError::NotFound { .. })
        ));
    }
}
