use std::sync::Arc;

use log::debug;
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::ot::OpComponent;
use crate::store::{
    DocumentObserver, DocumentStore, OpRecord, OpSource, Snapshot, StoreError, SubscriptionId,
};

/// The three documents every channel owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocKind {
    Chat,
    Editors,
    Cursors,
}

impl DocKind {
    pub fn name(self) -> &'static str {
        match self {
            DocKind::Chat => "chat",
            DocKind::Editors => "editors",
            DocKind::Cursors => "cursors",
        }
    }

    /// Contents a document starts with when the store has never seen it.
    pub fn seed(self) -> Value {
        match self {
            DocKind::Chat => json!({ "activeUsers": {}, "allUsers": {}, "messages": [] }),
            DocKind::Editors => json!([]),
            DocKind::Cursors => json!({}),
        }
    }
}

/// Accessor for one channel document. The document is created with its seed
/// on first use if the store does not have it yet.
#[derive(Clone)]
pub struct DocumentHandle {
    store: Arc<dyn DocumentStore>,
    namespace: String,
    kind: DocKind,
    ready: Arc<OnceCell<()>>,
}

impl DocumentHandle {
    pub fn new(store: Arc<dyn DocumentStore>, namespace: String, kind: DocKind) -> Self {
        Self {
            store,
            namespace,
            kind,
            ready: Arc::new(OnceCell::new()),
        }
    }

    pub fn kind(&self) -> DocKind {
        self.kind
    }

    async fn ensure(&self) -> Result<(), StoreError> {
        self.ready.get_or_try_init(|| self.create_if_missing()).await?;
        Ok(())
    }

    async fn create_if_missing(&self) -> Result<(), StoreError> {
        let name = self.kind.name();
        if self.store.fetch(&self.namespace, name).await?.is_some() {
            return Ok(());
        }
        match self.store.create(&self.namespace, name, self.kind.seed()).await {
            Ok(_) => {
                debug!("Created doc {name} for {}", self.namespace);
                Ok(())
            }
            Err(StoreError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn subscribe(
        &self,
        observer: Arc<dyn DocumentObserver>,
    ) -> Result<(Snapshot, SubscriptionId), StoreError> {
        self.ensure().await?;
        self.store.subscribe(&self.namespace, self.kind.name(), observer).await
    }

    pub async fn unsubscribe(&self, subscription: SubscriptionId) {
        self.store.unsubscribe(&self.namespace, self.kind.name(), subscription).await;
    }

    pub async fn fetch(&self) -> Result<Snapshot, StoreError> {
        self.ensure().await?;
        self.store
            .fetch(&self.namespace, self.kind.name())
            .await?
            .ok_or_else(|| StoreError::NotFound {
                namespace: self.namespace.clone(),
                doc: self.kind.name().to_string(),
            })
    }

    pub async fn submit(
        &self,
        op: Vec<OpComponent>,
        source: OpSource,
    ) -> Result<Snapshot, StoreError> {
        self.ensure().await?;
        self.store.submit(&self.namespace, self.kind.name(), op, source).await
    }

    pub async fn ops(&self, from: u64, to: u64) -> Result<Vec<OpRecord>, StoreError> {
        self.ensure().await?;
        self.store.get_ops(&self.namespace, self.kind.name(), from, to).await
    }

    /// Appends an entry to the chat transcript.
    pub async fn push_message(
        &self,
        message: Value,
        source: OpSource,
    ) -> Result<Snapshot, StoreError> {
        let snapshot = self.fetch().await?;
        let len = message_count(&snapshot.data);
        self.insert_message(len, message, source).await
    }

    /// Inserts an entry at `index`, shifting later entries back.
    pub async fn insert_message(
        &self,
        index: usize,
        message: Value,
        source: OpSource,
    ) -> Result<Snapshot, StoreError> {
        let op = OpComponent::list_insert(vec!["messages".into(), index.into()], message);
        self.submit(vec![op], source).await
    }

    /// Swaps the entry at `index` for `message`, but only if it still equals
    /// `expected`. Otherwise the store rejects the operation.
    pub async fn replace_message(
        &self,
        index: usize,
        expected: Value,
        message: Value,
        source: OpSource,
    ) -> Result<Snapshot, StoreError> {
        let path = vec!["messages".into(), index.into()];
        let op = OpComponent::list_replace(path, expected, message);
        self.submit(vec![op], source).await
    }
}

/// Number of entries in a chat document's transcript.
pub fn message_count(chat: &Value) -> usize {
    chat["messages"].as_array().map_or(0, Vec::len)
}
