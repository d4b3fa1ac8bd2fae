//! Reactive state published to the UI layer.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::auth::Principal;
use crate::error::TrackerError;
use crate::model::{GeoPoint, Incident, Notice, UserPresence};

const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    Initializing,
    Active,
}

#[derive(Clone)]
pub struct Published {
    inner: Arc<PublishedInner>,
}

struct PublishedInner {
    session: watch::Sender<SessionState>,
    principal: watch::Sender<Option<Principal>>,
    roster: watch::Sender<Vec<UserPresence>>,
    incidents: watch::Sender<Vec<Incident>>,
    last_position: watch::Sender<Option<GeoPoint>>,
    notices: broadcast::Sender<Notice>,
}

impl Default for Published {
    fn default() -> Self {
        Self::new()
    }
}

impl Published {
    pub fn new() -> Self {
        let (notices, _rx) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            inner: Arc::new(PublishedInner {
                session: watch::channel(SessionState::LoggedOut).0,
                principal: watch::channel(None).0,
                roster: watch::channel(Vec::new()).0,
                incidents: watch::channel(Vec::new()).0,
                last_position: watch::channel(None).0,
                notices,
            }),
        }
    }

    pub fn set_session(&self, state: SessionState) {
        let previous = self.inner.session.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "session state changed");
        }
    }

    pub fn session(&self) -> SessionState {
        *self.inner.session.borrow()
    }

    pub fn set_principal(&self, principal: Option<Principal>) {
        self.inner.principal.send_replace(principal);
    }

    pub fn principal(&self) -> Option<Principal> {
        self.inner.principal.borrow().clone()
    }

    pub fn publish_roster(&self, roster: Vec<UserPresence>) {
        self.inner.roster.send_replace(roster);
    }

    pub fn roster(&self) -> Vec<UserPresence> {
        self.inner.roster.borrow().clone()
    }

    /// Full replace; never merged with the previous list.
    pub fn publish_incidents(&self, incidents: Vec<Incident>) {
        self.inner.incidents.send_replace(incidents);
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.inner.incidents.borrow().clone()
    }

    /// Removes an incident from the published list, returning it with its index.
    pub fn take_incident(&self, id: &str) -> Option<(usize, Incident)> {
        let mut taken = None;
        self.inner.incidents.send_if_modified(|incidents| {
            match incidents.iter().position(|incident| incident.id == id) {
                Some(index) => {
                    taken = Some((index, incidents.remove(index)));
                    true
                }
                None => false,
            }
        });
        taken
    }

    /// Puts back an incident taken optimistically, unless a newer snapshot already has it.
    pub fn restore_incident(&self, index: usize, incident: Incident) {
        self.inner.incidents.send_if_modified(|incidents| {
            if incidents.iter().any(|existing| existing.id == incident.id) {
                return false;
            }
            let index = index.min(incidents.len());
            incidents.insert(index, incident);
            true
        });
    }

    pub fn set_last_position(&self, position: Option<GeoPoint>) {
        self.inner.last_position.send_replace(position);
    }

    pub fn last_position(&self) -> Option<GeoPoint> {
        *self.inner.last_position.borrow()
    }

    pub fn notify(&self, notice: Notice) {
        tracing::debug!(level = ?notice.level, message = %notice.message, "notice");
        // No subscribers is fine; notices are fire-and-forget.
        let _ = self.inner.notices.send(notice);
    }

    /// Transient failures are only logged; the rest become an error notice.
    pub fn notify_failure(&self, context: &str, err: &TrackerError) {
        if err.is_transient() {
            tracing::debug!(error = %err, context, "transient failure; no notice");
            return;
        }
        self.notify(Notice::error(format!("{context}: {err}")));
    }

    /// Clears everything scoped to a session.
    pub fn reset(&self) {
        self.inner.principal.send_replace(None);
        self.inner.roster.send_replace(Vec::new());
        self.inner.incidents.send_replace(Vec::new());
        self.inner.last_position.send_replace(None);
    }

    pub fn view(&self, markers_ready: watch::Receiver<bool>) -> TrackerView {
        TrackerView {
            session_state: self.inner.session.subscribe(),
            principal: self.inner.principal.subscribe(),
            markers_ready,
            roster: self.inner.roster.subscribe(),
            active_incidents: self.inner.incidents.subscribe(),
            last_position: self.inner.last_position.subscribe(),
            notices: self.inner.notices.subscribe(),
        }
    }
}

/// Receivers handed to the UI layer.
pub struct TrackerView {
    pub session_state: watch::Receiver<SessionState>,
    pub principal: watch::Receiver<Option<Principal>>,
    pub markers_ready: watch::Receiver<bool>,
    /// Only ever non-empty for admin viewers.
    pub roster: watch::Receiver<Vec<UserPresence>>,
    pub active_incidents: watch::Receiver<Vec<Incident>>,
    pub last_position: watch::Receiver<Option<GeoPoint>>,
    pub notices: broadcast::Receiver<Notice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incident(id: &str) -> Incident {
        Incident {
            id: id.to_string(),
            user_name: "Ana".to_string(),
            message: String::new(),
            location: None,
            reported_by: "u1".to_string(),
            resolved: false,
            created_at: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    #[test]
    fn take_and_restore_keep_the_original_order() {
        let published = Published::new();
        published.publish_incidents(vec![incident("a"), incident("b"), incident("c")]);

        let (index, taken) = published.take_incident("b").unwrap();
        assert_eq!(index, 1);
        assert!(published.take_incident("b").is_none());

        published.restore_incident(index, taken);
        let ids: Vec<String> = published.incidents().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        published.restore_incident(0, incident("a"));
        assert_eq!(published.incidents().len(), 3);
    }

    #[test]
    fn only_lasting_failures_become_notices() {
        let published = Published::new();
        let (_tx, ready) = watch::channel(false);
        let mut view = published.view(ready);

        published.notify_failure("Could not draw marker", &TrackerError::SurfaceNotReady);
        assert!(view.notices.try_recv().is_err());

        let err = TrackerError::write(
            "incidents/a",
            crate::store::StoreError::Unavailable("offline".to_string()),
        );
        published.notify_failure("Could not resolve incident", &err);
        let notice = view.notices.try_recv().unwrap();
        assert_eq!(notice.level, crate::model::NoticeLevel::Error);
        assert!(notice.message.starts_with("Could not resolve incident: "));
    }

    #[test]
    fn reset_clears_session_scoped_state() {
        let published = Published::new();
        let (_tx, ready) = watch::channel(false);
        let mut view = published.view(ready);
        published.set_principal(Some(Principal::new("u1", "Ana", None, true, false)));
        published.publish_incidents(vec![incident("a")]);
        published.set_last_position(Some(GeoPoint::new(1.0, 2.0)));
        published.notify(Notice::error("boom"));

        published.reset();
        assert!(published.principal().is_none());
        assert!(published.incidents().is_empty());
        assert!(published.last_position().is_none());
        assert!(view.active_incidents.borrow_and_update().is_empty());
        assert_eq!(view.notices.try_recv().unwrap(), Notice::error("boom"));
    }
}
