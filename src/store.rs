//! Remote store seam: a document backend with realtime collection subscriptions.

mod memory;

pub use memory::MemoryStore;

use serde_json::Value as JsonValue;
use std::fmt;
use std::future::Future;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Document, Fields};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document {path}/{id} not found")]
    NotFound { path: String, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Only the supplied fields are written; everything else on the document survives.
    Merge,
    Replace,
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: JsonValue,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        fields.get(&self.field) == Some(&self.value)
    }
}

pub type SnapshotResult = Result<Vec<Document>, StoreError>;

/// Unsubscribe callback. Runs at most once: on `dispose` or when dropped.
pub struct Disposer {
    inner: Option<Box<dyn FnOnce() + Send>>,
}

impl Disposer {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn dispose(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(f) = self.inner.take() {
            f();
        }
    }
}

impl Drop for Disposer {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("armed", &self.inner.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct Subscription {
    pub snapshots: mpsc::UnboundedReceiver<SnapshotResult>,
    pub disposer: Disposer,
}

pub trait RemoteStore: Send + Sync + 'static {
    /// Registers a listener; the first snapshot is delivered asynchronously on the channel.
    fn subscribe(&self, path: &str, filter: Option<Filter>) -> Result<Subscription, StoreError>;

    fn upsert_document(
        &self,
        path: &str,
        id: &str,
        fields: Fields,
        mode: WriteMode,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn add_document(
        &self,
        path: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<String, StoreError>> + Send;

    fn update_document(
        &self,
        path: &str,
        id: &str,
        fields: Fields,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn read_document(
        &self,
        path: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<Document>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn disposer_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let disposer = Disposer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        disposer.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        drop(Disposer::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn filter_matches_exact_value_only() {
        let filter = Filter::eq("resolved", false);
        let mut fields = Fields::new();
        assert!(!filter.matches(&fields));
        fields.insert("resolved".to_string(), json!(false));
        assert!(filter.matches(&fields));
        fields.insert("resolved".to_string(), json!("false"));
        assert!(!filter.matches(&fields));
    }
}
