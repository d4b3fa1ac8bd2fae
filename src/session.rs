//! Session controller: `LoggedOut -> Initializing -> Active -> LoggedOut`.
//!
//! Owns every per-session resource (stream handles, the surface request task,
//! the location reporter) and tears them down in a fixed order so a late
//! callback can never recreate a marker after logout.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{resolve_principal, Principal};
use crate::config::Config;
use crate::error::{TrackerError, TrackerResult};
use crate::geolocation::{start_position_driver, GeolocationSource, WatchOptions};
use crate::identity::{Account, IdentityProvider};
use crate::incidents::{IncidentDesk, IncidentSynchronizer};
use crate::markers::MarkerRegistry;
use crate::model::{timestamp_value, Fields};
use crate::presence::{LocationReporter, PresenceSynchronizer};
use crate::state::{Published, SessionState, TrackerView};
use crate::store::{RemoteStore, WriteMode};
use crate::stream::StreamHandle;
use crate::surface::{IconSet, SurfaceContainer, SurfaceLifecycle};

struct SessionSlots<S> {
    account_uid: Option<String>,
    cancel: Option<CancellationToken>,
    presence: Option<StreamHandle>,
    incidents: Option<StreamHandle>,
    geolocation: Option<StreamHandle>,
    surface_task: Option<JoinHandle<()>>,
    reporter: Option<Arc<LocationReporter<S>>>,
    desk: Option<Arc<IncidentDesk<S>>>,
}

impl<S> Default for SessionSlots<S> {
    fn default() -> Self {
        Self {
            account_uid: None,
            cancel: None,
            presence: None,
            incidents: None,
            geolocation: None,
            surface_task: None,
            reporter: None,
            desk: None,
        }
    }
}

struct Inner<S, I, G> {
    config: Config,
    store: Arc<S>,
    identity: Arc<I>,
    geolocation: Arc<G>,
    container: Arc<dyn SurfaceContainer>,
    surface: Arc<SurfaceLifecycle>,
    registry: Arc<MarkerRegistry>,
    published: Published,
    slots: Mutex<SessionSlots<S>>,
}

pub struct SessionController<S, I, G> {
    inner: Arc<Inner<S, I, G>>,
}

impl<S, I, G> Clone for SessionController<S, I, G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, I, G> SessionController<S, I, G>
where
    S: RemoteStore,
    I: IdentityProvider,
    G: GeolocationSource,
{
    pub fn new(
        config: Config,
        store: S,
        identity: I,
        geolocation: G,
        container: Arc<dyn SurfaceContainer>,
    ) -> Self {
        let surface = Arc::new(SurfaceLifecycle::new(
            IconSet::standard(),
            config.initial_zoom,
            config.fallback_position,
        ));
        let registry = MarkerRegistry::new(surface.clone(), config.marker_retry_delay);
        Self {
            inner: Arc::new(Inner {
                config,
                store: Arc::new(store),
                identity: Arc::new(identity),
                geolocation: Arc::new(geolocation),
                container,
                surface,
                registry,
                published: Published::new(),
                slots: Mutex::new(SessionSlots::default()),
            }),
        }
    }

    pub fn view(&self) -> TrackerView {
        self.inner
            .published
            .view(self.inner.surface.subscribe_ready())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<MarkerRegistry> {
        &self.inner.registry
    }

    pub fn surface(&self) -> &Arc<SurfaceLifecycle> {
        &self.inner.surface
    }

    pub fn published(&self) -> &Published {
        &self.inner.published
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.published.session()
    }

    pub fn principal(&self) -> Option<Principal> {
        self.inner.published.principal()
    }

    /// Names of the streams whose drain task is still running.
    pub async fn active_streams(&self) -> Vec<&'static str> {
        let slots = self.inner.slots.lock().await;
        [&slots.presence, &slots.incidents, &slots.geolocation]
            .into_iter()
            .flatten()
            .filter(|handle| !handle.is_finished())
            .map(StreamHandle::name)
            .collect()
    }

    /// Follows the identity provider until `shutdown` fires, then tears down.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut changes = self.inner.identity.principal_changes();
        let initial = changes.borrow_and_update().clone();
        self.handle_principal_change(initial).await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        tracing::warn!("identity provider closed its principal channel");
                        break;
                    }
                    let account = changes.borrow_and_update().clone();
                    self.handle_principal_change(account).await;
                }
            }
        }

        self.handle_principal_change(None).await;
        tracing::info!("session controller stopped");
    }

    pub async fn handle_principal_change(&self, account: Option<Account>) {
        let mut slots = self.inner.slots.lock().await;
        let Some(account) = account else {
            if slots.account_uid.is_some() {
                self.teardown(&mut slots);
            }
            self.inner.published.set_session(SessionState::LoggedOut);
            return;
        };

        if slots.account_uid.as_deref() == Some(account.uid.as_str()) {
            tracing::debug!(user_id = %account.uid, "principal unchanged; session already running");
            return;
        }
        if slots.account_uid.is_some() {
            self.teardown(&mut slots);
        }

        self.inner.published.set_session(SessionState::Initializing);
        let principal =
            resolve_principal(self.inner.store.as_ref(), &self.inner.config, &account).await;
        slots.account_uid = Some(account.uid.clone());
        self.start_session(&mut slots, principal);
        self.inner.published.set_session(SessionState::Active);
    }

    fn start_session(&self, slots: &mut MutexGuard<'_, SessionSlots<S>>, principal: Principal) {
        let inner = &self.inner;
        let config = &inner.config;
        let cancel = CancellationToken::new();
        slots.cancel = Some(cancel.clone());
        inner.published.set_principal(Some(principal.clone()));
        let scope = inner.registry.scope();

        if slots.presence.is_none() {
            let sync = PresenceSynchronizer::new(
                principal.clone(),
                config,
                scope.clone(),
                inner.published.clone(),
            );
            match sync.start(
                inner.store.as_ref(),
                &config.locations_collection,
                cancel.child_token(),
            ) {
                Ok(handle) => slots.presence = Some(handle),
                Err(err) => tracing::error!(error = %err, "failed to start presence stream"),
            }
        }

        if slots.incidents.is_none() {
            let sync =
                IncidentSynchronizer::new(principal.clone(), scope.clone(), inner.published.clone());
            match sync.start(
                inner.store.as_ref(),
                &config.incidents_collection,
                cancel.child_token(),
            ) {
                Ok(handle) => slots.incidents = Some(handle),
                Err(err) => tracing::error!(error = %err, "failed to start incident stream"),
            }
        }

        let reporter = Arc::new(LocationReporter::new(
            inner.store.clone(),
            config.locations_collection.clone(),
            principal.clone(),
            inner.surface.clone(),
            inner.published.clone(),
            cancel.clone(),
        ));
        slots.reporter = Some(reporter.clone());
        slots.desk = Some(Arc::new(IncidentDesk::new(
            inner.store.clone(),
            config.incidents_collection.clone(),
            principal.clone(),
            scope,
            inner.published.clone(),
            config.fallback_position,
        )));

        if slots.geolocation.is_none() {
            slots.geolocation = Some(start_position_driver(
                inner.geolocation.clone(),
                WatchOptions::from(config),
                reporter,
                config.fallback_position,
                cancel.child_token(),
            ));
        }

        if slots.surface_task.is_none() {
            slots.surface_task = Some(self.spawn_surface_request(cancel));
        }

        tracing::info!(
            user_id = %principal.id,
            is_admin = principal.is_admin,
            "session started"
        );
    }

    fn spawn_surface_request(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let surface = self.inner.surface.clone();
        let container = self.inner.container.clone();
        let delay = self.inner.config.surface_retry_delay;
        tokio::spawn(async move {
            let mut attempts = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                attempts += 1;
                if surface.ensure_surface(container.as_ref()).is_some() {
                    tracing::debug!(attempts, "surface ready for session");
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    fn teardown(&self, slots: &mut MutexGuard<'_, SessionSlots<S>>) {
        if let Some(cancel) = slots.cancel.take() {
            cancel.cancel();
        }
        if let Some(geolocation) = slots.geolocation.take() {
            geolocation.stop();
        }
        for handle in [slots.presence.take(), slots.incidents.take()]
            .into_iter()
            .flatten()
        {
            handle.stop();
        }
        if let Some(task) = slots.surface_task.take() {
            task.abort();
        }
        slots.reporter = None;
        slots.desk = None;

        let removed = self.inner.registry.teardown();
        self.inner.surface.destroy_surface();
        self.inner.published.reset();
        let user_id = slots.account_uid.take().unwrap_or_default();
        tracing::info!(%user_id, removed_markers = removed, "session torn down");
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> TrackerResult<Account> {
        let account = match self.inner.identity.sign_in(email, password).await {
            Ok(account) => account,
            Err(err) => {
                let err = TrackerError::from(err);
                tracing::warn!(error = %err, "sign-in failed");
                self.inner.published.notify_failure("Sign-in failed", &err);
                return Err(err);
            }
        };
        self.handle_principal_change(Some(account.clone())).await;
        Ok(account)
    }

    /// Creates the account, stores its profile, and starts the session.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> TrackerResult<Account> {
        let account = match self
            .inner
            .identity
            .sign_up(email, password, display_name)
            .await
        {
            Ok(account) => account,
            Err(err) => {
                let err = TrackerError::from(err);
                tracing::warn!(error = %err, "sign-up failed");
                self.inner.published.notify_failure("Sign-up failed", &err);
                return Err(err);
            }
        };

        let users = &self.inner.config.users_collection;
        let display_name = account
            .display_name
            .clone()
            .or_else(|| account.email.split_once('@').map(|(local, _)| local.to_string()))
            .unwrap_or_else(|| account.uid.clone());
        let mut profile = Fields::new();
        profile.insert("displayName".to_string(), json!(display_name));
        profile.insert("email".to_string(), json!(account.email));
        profile.insert("isAdmin".to_string(), json!(false));
        profile.insert("createdAt".to_string(), timestamp_value(Utc::now()));
        if let Err(source) = self
            .inner
            .store
            .upsert_document(users, &account.uid, profile, WriteMode::Merge)
            .await
        {
            let err = TrackerError::write(format!("{users}/{}", account.uid), source);
            tracing::warn!(user_id = %account.uid, error = %err, "failed to store user profile");
            self.inner
                .published
                .notify_failure("Could not save your profile", &err);
        }

        self.handle_principal_change(Some(account.clone())).await;
        Ok(account)
    }

    pub async fn sign_out(&self) -> TrackerResult<()> {
        self.inner.identity.sign_out().await?;
        self.handle_principal_change(None).await;
        Ok(())
    }

    pub async fn report_incident(&self, message: &str) -> TrackerResult<String> {
        let desk = self.inner.slots.lock().await.desk.clone();
        let desk = desk.ok_or(TrackerError::NoSession)?;
        desk.report_incident(message).await
    }

    pub async fn resolve_incident(&self, incident_id: &str) -> TrackerResult<()> {
        let desk = self.inner.slots.lock().await.desk.clone();
        let desk = desk.ok_or(TrackerError::NoSession)?;
        desk.resolve_incident(incident_id).await
    }
}
