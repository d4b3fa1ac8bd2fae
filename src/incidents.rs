use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::auth::{
    require_capabilities, Principal, ResolveCapability, CAP_INCIDENTS_REPORT, CAP_INCIDENTS_RESOLVE,
};
use crate::error::{TrackerError, TrackerResult};
use crate::markers::{MarkerKey, MarkerLayer, MarkerScope};
use crate::model::{format_timestamp, Document, GeoPoint, Incident, Notice};
use crate::state::Published;
use crate::store::{Filter, RemoteStore};
use crate::stream::StreamHandle;
use crate::surface::{IconVariant, Popup};

fn incident_popup(incident: &Incident, resolve: Option<&ResolveCapability>) -> Popup {
    Popup {
        title: format!("Incident reported by {}", incident.user_name),
        lines: vec![
            incident.display_message().to_string(),
            format_timestamp(incident.created_at),
        ],
        action: resolve.map(|capability| capability.action_for(&incident.id)),
    }
}

fn render_incident(
    scope: &MarkerScope,
    incident: &Incident,
    location: GeoPoint,
    resolve: Option<&ResolveCapability>,
) -> TrackerResult<()> {
    scope.upsert(
        MarkerKey::incident(incident.id.clone()),
        location,
        IconVariant::Incident,
        incident_popup(incident, resolve),
    )?;
    Ok(())
}

pub struct IncidentSynchronizer {
    principal: Principal,
    scope: MarkerScope,
    published: Published,
}

impl IncidentSynchronizer {
    pub fn new(principal: Principal, scope: MarkerScope, published: Published) -> Self {
        Self {
            principal,
            scope,
            published,
        }
    }

    /// Full replace: the incident layer and the published list are rebuilt
    /// from this snapshot alone. Returns the number of markers drawn or pending.
    pub fn apply_snapshot(&mut self, docs: &[Document]) -> usize {
        if !self.scope.is_live() {
            tracing::debug!("dropping incident snapshot for an ended session");
            return 0;
        }
        self.scope.clear_layer(MarkerLayer::Incident);

        let resolve = self.principal.resolve_capability();
        let mut active = Vec::with_capacity(docs.len());
        let mut rendered = 0;
        for doc in docs {
            let incident = match Incident::from_document(doc) {
                Ok(incident) => incident,
                Err(err) => {
                    tracing::warn!(error = %err, "skipping unreadable incident");
                    continue;
                }
            };
            if incident.resolved {
                continue;
            }
            match incident.location {
                Some(location) => {
                    match render_incident(&self.scope, &incident, location, resolve.as_ref()) {
                        Ok(()) => rendered += 1,
                        Err(err) => {
                            tracing::warn!(incident_id = %incident.id, error = %err, "failed to render incident marker");
                        }
                    }
                }
                None => {
                    tracing::debug!(incident_id = %incident.id, "incident has no location; listed without marker");
                }
            }
            active.push(incident);
        }

        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        let published = &self.published;
        if !self.scope.publish_if_live(|| published.publish_incidents(active)) {
            tracing::debug!("session ended mid-snapshot; incident list not published");
        }
        rendered
    }

    pub fn start<S: RemoteStore>(
        self,
        store: &S,
        collection: &str,
        cancel: CancellationToken,
    ) -> TrackerResult<StreamHandle> {
        let subscription = store
            .subscribe(collection, Some(Filter::eq("resolved", false)))
            .map_err(|source| TrackerError::Subscription {
                stream: "incidents",
                source,
            })?;
        tracing::info!(collection, admin = self.principal.is_admin, "incident stream started");
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
                            let rendered = sync.apply_snapshot(&docs);
                            tracing::trace!(docs = docs.len(), rendered, "incident snapshot applied");
                        }
                        Some(Err(source)) => {
                            let err = TrackerError::Subscription { stream: "incidents", source };
                            tracing::error!(error = %err, "incident stream stopped");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(StreamHandle::new(
            "incidents",
            cancel,
            subscription.disposer,
            task,
        ))
    }
}

/// Report and resolve operations for the signed-in principal.
pub struct IncidentDesk<S> {
    store: Arc<S>,
    collection: String,
    principal: Principal,
    scope: MarkerScope,
    published: Published,
    fallback_position: GeoPoint,
}

impl<S: RemoteStore> IncidentDesk<S> {
    pub fn new(
        store: Arc<S>,
        collection: impl Into<String>,
        principal: Principal,
        scope: MarkerScope,
        published: Published,
        fallback_position: GeoPoint,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            principal,
            scope,
            published,
            fallback_position,
        }
    }

    /// Files a new incident at the last known own position.
    pub async fn report_incident(&self, message: &str) -> TrackerResult<String> {
        require_capabilities(&self.principal, &[CAP_INCIDENTS_REPORT])?;
        let position = self
            .published
            .last_position()
            .unwrap_or(self.fallback_position);
        let fields = Incident::new_report_fields(
            &self.principal.id,
            &self.principal.display_name,
            message,
            position,
            Utc::now(),
        );
        match self.store.add_document(&self.collection, fields).await {
            Ok(id) => {
                tracing::info!(incident_id = %id, user_id = %self.principal.id, "incident reported");
                let published = &self.published;
                self.scope.publish_if_live(|| {
                    published.notify(Notice::info("Incident reported. Help is on the way."))
                });
                Ok(id)
            }
            Err(source) => {
                let err = TrackerError::write(self.collection.clone(), source);
                tracing::warn!(user_id = %self.principal.id, error = %err, "incident report failed");
                let published = &self.published;
                self.scope
                    .publish_if_live(|| published.notify_failure("Could not report incident", &err));
                Err(err)
            }
        }
    }

    /// Marks an incident resolved. The marker and list entry disappear
    /// immediately and come back if the write fails.
    pub async fn resolve_incident(&self, incident_id: &str) -> TrackerResult<()> {
        if let Err(err) = require_capabilities(&self.principal, &[CAP_INCIDENTS_RESOLVE]) {
            tracing::warn!(user_id = %self.principal.id, incident_id, "resolve refused: not an admin");
            return Err(err);
        }

        let taken = self.published.take_incident(incident_id);
        self.scope.remove(&MarkerKey::incident(incident_id));

        let fields = Incident::resolution_fields(&self.principal.id, Utc::now());
        match self
            .store
            .update_document(&self.collection, incident_id, fields)
            .await
        {
            Ok(()) => {
                tracing::info!(incident_id, resolved_by = %self.principal.id, "incident resolved");
                let published = &self.published;
                self.scope
                    .publish_if_live(|| published.notify(Notice::info("Incident resolved.")));
                Ok(())
            }
            Err(source) => {
                let err = TrackerError::write(format!("{}/{}", self.collection, incident_id), source);
                if !self.scope.is_live() {
                    tracing::info!(incident_id, error = %err, "resolve failed after the session ended; not restoring");
                    return Err(err);
                }
                tracing::warn!(incident_id, error = %err, "resolve failed; restoring incident");
                if let Some((_, incident)) = &taken {
                    if let Some(location) = incident.location {
                        let resolve = self.principal.resolve_capability();
                        if let Err(render_err) =
                            render_incident(&self.scope, incident, location, resolve.as_ref())
                        {
                            tracing::warn!(incident_id, error = %render_err, "failed to restore incident marker");
                        }
                    }
                }
                // Marker writes take the registry lock, so only published state goes in here.
                let published = &self.published;
                self.scope.publish_if_live(|| {
                    if let Some((index, incident)) = taken {
                        published.restore_incident(index, incident);
                    }
                    published.notify_failure("Could not resolve incident", &err);
                });
                Err(err)
            }
        }
    }
}
