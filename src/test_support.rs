use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::auth::Principal;
use crate::config::Config;
use crate::incidents::{IncidentDesk, IncidentSynchronizer};
use crate::markers::MarkerRegistry;
use crate::model::Document;
use crate::presence::{LocationReporter, PresenceSynchronizer};
use crate::state::Published;
use crate::store::MemoryStore;
use crate::surface::{HeadlessContainer, IconSet, SurfaceLifecycle};

pub fn doc(id: &str, value: JsonValue) -> Document {
    match value {
        JsonValue::Object(fields) => Document::new(id, fields),
        other => panic!("expected object, got {other}"),
    }
}

pub fn test_config() -> Config {
    Config {
        super_admin_id: Some("root".to_string()),
        ..Config::default()
    }
}

/// Polls `condition` on short sleeps; fails the test after about two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// One signed-in session's worth of collaborators wired to in-memory backends.
pub struct SessionFixture {
    pub config: Config,
    pub store: MemoryStore,
    pub container: Arc<HeadlessContainer>,
    pub surface: Arc<SurfaceLifecycle>,
    pub registry: Arc<MarkerRegistry>,
    pub published: Published,
    pub principal: Principal,
    pub reporter: Arc<LocationReporter<MemoryStore>>,
    pub cancel: CancellationToken,
}

pub fn session_fixture(user_id: &str, name: &str, is_admin: bool) -> SessionFixture {
    let config = test_config();
    let store = MemoryStore::new();
    let container = Arc::new(HeadlessContainer::attached());
    let surface = Arc::new(SurfaceLifecycle::new(
        IconSet::standard(),
        config.initial_zoom,
        config.fallback_position,
    ));
    let registry = MarkerRegistry::new(surface.clone(), config.marker_retry_delay);
    let published = Published::new();
    let principal = Principal::new(user_id, name, None, is_admin, false);
    let cancel = CancellationToken::new();
    let reporter = Arc::new(LocationReporter::new(
        Arc::new(store.clone()),
        config.locations_collection.clone(),
        principal.clone(),
        surface.clone(),
        published.clone(),
        cancel.clone(),
    ));
    SessionFixture {
        config,
        store,
        container,
        surface,
        registry,
        published,
        principal,
        reporter,
        cancel,
    }
}

impl SessionFixture {
    pub fn ready_surface(&self) {
        if self.surface.ensure_surface(self.container.as_ref()).is_none() {
            panic!("headless surface should come up when attached");
        }
    }

    pub fn presence(&self) -> PresenceSynchronizer {
        PresenceSynchronizer::new(
            self.principal.clone(),
            &self.config,
            self.registry.scope(),
            self.published.clone(),
        )
    }

    pub fn incidents(&self) -> IncidentSynchronizer {
        IncidentSynchronizer::new(
            self.principal.clone(),
            self.registry.scope(),
            self.published.clone(),
        )
    }

    pub fn desk(&self) -> IncidentDesk<MemoryStore> {
        IncidentDesk::new(
            Arc::new(self.store.clone()),
            self.config.incidents_collection.clone(),
            self.principal.clone(),
            self.registry.scope(),
            self.published.clone(),
            self.config.fallback_position,
        )
    }
}
