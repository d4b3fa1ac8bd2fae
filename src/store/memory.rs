use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Disposer, Filter, RemoteStore, SnapshotResult, StoreError, Subscription, WriteMode};
use crate::model::{Document, Fields};

/// In-process document store. Every write pushes a fresh filtered snapshot to
/// each listener on the written collection.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, Fields>>,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    writes: u64,
    fail_writes: Option<String>,
}

struct Listener {
    path: String,
    filter: Option<Filter>,
    tx: mpsc::UnboundedSender<SnapshotResult>,
}

impl MemoryState {
    fn snapshot(&self, path: &str, filter: Option<&Filter>) -> Vec<Document> {
        let Some(collection) = self.collections.get(path) else {
            return Vec::new();
        };
        collection
            .iter()
            .filter(|(_, fields)| filter.map(|f| f.matches(fields)).unwrap_or(true))
            .map(|(id, fields)| Document::new(id.clone(), fields.clone()))
            .collect()
    }

    fn notify(&mut self, path: &str) {
        let mut closed = Vec::new();
        for (id, listener) in &self.listeners {
            if listener.path != path {
                continue;
            }
            let docs = self.snapshot(path, listener.filter.as_ref());
            if listener.tx.send(Ok(docs)).is_err() {
                closed.push(*id);
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        match &self.fail_writes {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Writes a document without counting it as a client write.
    pub fn seed(&self, path: &str, id: &str, fields: Fields) {
        let mut state = self.state();
        state
            .collections
            .entry(path.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        state.notify(path);
    }

    pub fn document(&self, path: &str, id: &str) -> Option<Fields> {
        self.state()
            .collections
            .get(path)
            .and_then(|collection| collection.get(id))
            .cloned()
    }

    pub fn documents(&self, path: &str) -> Vec<Document> {
        self.state().snapshot(path, None)
    }

    pub fn write_count(&self) -> u64 {
        self.state().writes
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state()
            .listeners
            .values()
            .filter(|listener| !listener.tx.is_closed())
            .count()
    }

    pub fn set_fail_writes(&self, reason: Option<&str>) {
        self.state().fail_writes = reason.map(str::to_string);
    }

    /// Delivers an error to every listener on `path`, as a backend would on a revoked query.
    pub fn push_error(&self, path: &str, err: StoreError) {
        let state = self.state();
        for listener in state.listeners.values() {
            if listener.path == path {
                // A closed receiver is pruned on the next write.
                let _ = listener.tx.send(Err(err.clone()));
            }
        }
    }
}

fn merge_into(target: &mut Fields, patch: Fields) {
    for (key, value) in patch {
        match (target.get_mut(&key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

impl RemoteStore for MemoryStore {
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();
        let initial = state.snapshot(path, filter.as_ref());
        // `rx` is still in hand, so this cannot fail.
        let _ = tx.send(Ok(initial));

        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(
            id,
            Listener {
                path: path.to_string(),
                filter,
                tx,
            },
        );
        drop(state);

        let inner = Arc::clone(&self.inner);
        let disposer = Disposer::new(move || {
            let mut state = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            state.listeners.remove(&id);
        });
        tracing::debug!(path, listener = id, "memory store listener registered");
        Ok(Subscription {
            snapshots: rx,
            disposer,
        })
    }

    async fn upsert_document(
        &self,
        path: &str,
        id: &str,
        fields: Fields,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_writable()?;
        let collection = state.collections.entry(path.to_string()).or_default();
        match (mode, collection.get_mut(id)) {
            (WriteMode::Merge, Some(existing)) => merge_into(existing, fields),
            _ => {
                collection.insert(id.to_string(), fields);
            }
        }
        state.writes += 1;
        state.notify(path);
        Ok(())
    }

    async fn add_document(&self, path: &str, fields: Fields) -> Result<String, StoreError> {
        let mut state = self.state();
        state.check_writable()?;
        let id = Uuid::new_v4().simple().to_string();
        state
            .collections
            .entry(path.to_string())
            .or_default()
            .insert(id.clone(), fields);
        state.writes += 1;
        state.notify(path);
        Ok(id)
    }

    async fn update_document(&self, path: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        let mut state = self.state();
        state.check_writable()?;
        let Some(existing) = state
            .collections
            .get_mut(path)
            .and_then(|collection| collection.get_mut(id))
        else {
            return Err(StoreError::NotFound {
                path: path.to_string(),
                id: id.to_string(),
            });
        };
        merge_into(existing, fields);
        state.writes += 1;
        state.notify(path);
        Ok(())
    }

    async fn read_document(&self, path: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self
            .document(path, id)
            .map(|fields| Document::new(id, fields)))
    }
}
