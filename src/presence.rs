use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::{require_capabilities, Principal, CAP_LOCATION_REPORT, CAP_ROSTER_VIEW};
use crate::config::Config;
use crate::error::{TrackerError, TrackerResult};
use crate::markers::{MarkerKey, MarkerScope};
use crate::model::{format_timestamp, Document, GeoPoint, LocationRecord, UserPresence};
use crate::state::Published;
use crate::store::{RemoteStore, WriteMode};
use crate::stream::StreamHandle;
use crate::surface::{IconVariant, Popup, SurfaceLifecycle};

/// Strict: a record exactly `window` old is already offline.
pub fn is_online(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let Some(updated_at) = updated_at else {
        return false;
    };
    let age_ms = now.signed_duration_since(updated_at).num_milliseconds();
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    age_ms < window_ms
}

pub struct PresenceSynchronizer {
    principal: Principal,
    super_admin_id: Option<String>,
    online_window: Duration,
    scope: MarkerScope,
    published: Published,
    rendered: HashSet<String>,
}

impl PresenceSynchronizer {
    pub fn new(principal: Principal, config: &Config, scope: MarkerScope, published: Published) -> Self {
        Self {
            principal,
            super_admin_id: config.super_admin_id.clone(),
            online_window: config.online_window,
            scope,
            published,
            rendered: HashSet::new(),
        }
    }

    /// Reconciles presence markers with one snapshot. Returns the number of
    /// users with a live or pending marker afterwards.
    pub fn apply_snapshot(&mut self, docs: &[Document], now: DateTime<Utc>) -> usize {
        if !self.scope.is_live() {
            tracing::debug!("dropping presence snapshot for an ended session");
            return 0;
        }

        let mut roster = Vec::with_capacity(docs.len());
        let mut seen = HashSet::with_capacity(docs.len());
        for doc in docs {
            let record = match LocationRecord::from_document(doc) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unusable location record");
                    continue;
                }
            };
            let is_self = doc.id == self.principal.id;
            let is_admin = record.is_admin
                || self.super_admin_id.as_deref() == Some(doc.id.as_str());
            let online = is_online(record.updated_at, now, self.online_window);

            roster.push(UserPresence {
                user_id: doc.id.clone(),
                user_name: record.user_name.clone(),
                online,
                is_admin,
                last_seen: record.updated_at,
            });

            if !is_self && !self.principal.is_admin {
                continue;
            }

            let popup = presence_popup(&record, is_self, online);
            let icon = IconVariant::for_presence(is_self, is_admin);
            match self
                .scope
                .upsert(MarkerKey::presence(doc.id.clone()), record.position, icon, popup)
            {
                Ok(_) => {
                    seen.insert(doc.id.clone());
                }
                Err(err) => {
                    tracing::warn!(user_id = %doc.id, error = %err, "failed to render presence marker");
                }
            }
        }

        for stale in self.rendered.difference(&seen) {
            self.scope.remove(&MarkerKey::presence(stale.clone()));
        }
        self.rendered = seen;

        if self.principal.has_capability(CAP_ROSTER_VIEW) {
            sort_roster(&mut roster);
            let published = &self.published;
            if !self.scope.publish_if_live(|| published.publish_roster(roster)) {
                tracing::debug!("session ended mid-snapshot; roster not published");
            }
        }
        self.rendered.len()
    }

    pub fn start<S: RemoteStore>(
        self,
        store: &S,
        collection: &str,
        cancel: CancellationToken,
    ) -> TrackerResult<StreamHandle> {
        let subscription = store
            .subscribe(collection, None)
            .map_err(|source| TrackerError::Subscription {
                stream: "presence",
                source,
            })?;
        tracing::info!(collection, user_id = %self.principal.id, "presence stream started");
        let mut snapshots = subscription.snapshots;
        let token = cancel.clone();
        let mut sync = self;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = snapshots.recv() => match next {
                        Some(Ok(docs)) => {
                            let rendered = sync.apply_snapshot(&docs, Utc::now());
                            tracing::trace!(docs = docs.len(), rendered, "presence snapshot applied");
                        }
                        Some(Err(source)) => {
                            let err = TrackerError::Subscription { stream: "presence", source };
                            tracing::error!(error = %err, "presence stream stopped");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(StreamHandle::new(
            "presence",
            cancel,
            subscription.disposer,
            task,
        ))
    }
}

fn presence_popup(record: &LocationRecord, is_self: bool, online: bool) -> Popup {
    let title = if is_self {
        format!("{} (you)", record.user_name)
    } else {
        record.user_name.clone()
    };
    Popup {
        title,
        lines: vec![
            if online { "Online" } else { "Offline" }.to_string(),
            format!("Last seen: {}", format_timestamp(record.updated_at)),
        ],
        action: None,
    }
}

fn sort_roster(roster: &mut [UserPresence]) {
    roster.sort_by(|a, b| {
        b.online
            .cmp(&a.online)
            .then_with(|| a.user_name.to_lowercase().cmp(&b.user_name.to_lowercase()))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
}

/// Writes the caller's own location record. One per session: the initial
/// recenter happens on the first successful write only.
pub struct LocationReporter<S> {
    store: Arc<S>,
    collection: String,
    principal: Principal,
    surface: Arc<SurfaceLifecycle>,
    published: Published,
    session: CancellationToken,
    centered: AtomicBool,
}

impl<S: RemoteStore> LocationReporter<S> {
    pub fn new(
        store: Arc<S>,
        collection: impl Into<String>,
        principal: Principal,
        surface: Arc<SurfaceLifecycle>,
        published: Published,
        session: CancellationToken,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            principal,
            surface,
            published,
            session,
            centered: AtomicBool::new(false),
        }
    }

    pub async fn report(&self, position: GeoPoint) -> TrackerResult<()> {
        require_capabilities(&self.principal, &[CAP_LOCATION_REPORT])?;
        if self.session.is_cancelled() {
            return Err(TrackerError::NoSession);
        }
        self.published.set_last_position(Some(position));

        let mut fields = LocationRecord::owned_fields(
            &self.principal.id,
            &self.principal.display_name,
            position,
            Utc::now(),
        );
        fields.insert("isAdmin".to_string(), json!(self.principal.is_admin));

        if let Err(source) = self
            .store
            .upsert_document(&self.collection, &self.principal.id, fields, WriteMode::Merge)
            .await
        {
            let err = TrackerError::write(format!("{}/{}", self.collection, self.principal.id), source);
            tracing::warn!(user_id = %self.principal.id, error = %err, "location update failed");
            if !self.session.is_cancelled() {
                self.published
                    .notify_failure("Could not update your location", &err);
            }
            return Err(err);
        }

        if self.session.is_cancelled() {
            return Ok(());
        }
        if !self.centered.swap(true, Ordering::SeqCst) {
            tracing::info!(
                latitude = position.latitude,
                longitude = position.longitude,
                "centering map on own position"
            );
            self.surface.recenter(position);
        }
        Ok(())
    }

    pub fn has_centered(&self) -> bool {
        self.centered.load(Ordering::SeqCst)
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }
}
