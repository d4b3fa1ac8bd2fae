//! Marker registry: the only writer of marker state on the rendering surface.
//!
//! Writes made while the surface is not ready are deferred and retried on a
//! fixed delay. Each deferred write carries two tokens: the registry
//! generation (bumped on teardown) and a per-key ticket (superseded by any
//! later write to the same key). A retry whose tokens are stale does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{TrackerError, TrackerResult};
use crate::model::GeoPoint;
use crate::surface::{IconVariant, MarkerSpec, Popup, SurfaceLifecycle, SurfaceMarkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkerLayer {
    Presence,
    Incident,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MarkerKey {
    pub layer: MarkerLayer,
    pub id: String,
}

impl MarkerKey {
    pub fn presence(id: impl Into<String>) -> Self {
        Self {
            layer: MarkerLayer::Presence,
            id: id.into(),
        }
    }

    pub fn incident(id: impl Into<String>) -> Self {
        Self {
            layer: MarkerLayer::Incident,
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerHandle {
    pub surface_epoch: u64,
    pub surface_id: SurfaceMarkerId,
    pub position: GeoPoint,
    pub icon: IconVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    Deferred,
    /// The scope outlived its session; nothing was done.
    Stale,
}

#[derive(Default)]
struct RegistryState {
    handles: HashMap<MarkerKey, MarkerHandle>,
    pending: HashMap<MarkerKey, u64>,
    next_ticket: u64,
    generation: u64,
}

pub struct MarkerRegistry {
    surface: Arc<SurfaceLifecycle>,
    retry_delay: Duration,
    state: Mutex<RegistryState>,
}

impl MarkerRegistry {
    pub fn new(surface: Arc<SurfaceLifecycle>, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            surface,
            retry_delay,
            state: Mutex::new(RegistryState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A write handle bound to the current generation.
    pub fn scope(self: &Arc<Self>) -> MarkerScope {
        MarkerScope {
            registry: Arc::clone(self),
            generation: self.state().generation,
        }
    }

    pub fn upsert(
        self: &Arc<Self>,
        key: MarkerKey,
        position: GeoPoint,
        icon: IconVariant,
        popup: Popup,
    ) -> TrackerResult<UpsertOutcome> {
        self.scope().upsert(key, position, icon, popup)
    }

    pub fn remove(self: &Arc<Self>, key: &MarkerKey) -> bool {
        self.scope().remove(key)
    }

    pub fn clear(self: &Arc<Self>) -> usize {
        self.scope().clear()
    }

    /// Invalidates every outstanding scope and pending retry, then removes all handles.
    pub fn teardown(&self) -> usize {
        let mut state = self.state();
        state.generation += 1;
        state.pending.clear();
        let handles: Vec<MarkerHandle> = state.handles.drain().map(|(_, handle)| handle).collect();
        self.remove_from_surface(handles.iter());
        tracing::debug!(
            generation = state.generation,
            removed = handles.len(),
            "marker registry torn down"
        );
        handles.len()
    }

    pub fn live_count(&self, layer: MarkerLayer) -> usize {
        self.state()
            .handles
            .keys()
            .filter(|key| key.layer == layer)
            .count()
    }

    pub fn total_live(&self) -> usize {
        self.state().handles.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn keys(&self, layer: MarkerLayer) -> Vec<String> {
        let mut keys: Vec<String> = self
            .state()
            .handles
            .keys()
            .filter(|key| key.layer == layer)
            .map(|key| key.id.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn handle(&self, key: &MarkerKey) -> Option<MarkerHandle> {
        self.state().handles.get(key).cloned()
    }

    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    fn remove_from_surface<'a>(&self, handles: impl Iterator<Item = &'a MarkerHandle>) {
        let Some(ready) = self.surface.current() else {
            return;
        };
        for handle in handles {
            // Handles from an earlier surface died with it.
            if handle.surface_epoch == ready.epoch {
                ready.surface.remove_marker(handle.surface_id);
            }
        }
    }

    fn apply(&self, state: &mut RegistryState, key: &MarkerKey, marker: &MarkerSpec) -> TrackerResult<()> {
        let Some(ready) = self.surface.current() else {
            return Err(TrackerError::SurfaceNotReady);
        };
        if let Some(existing) = state.handles.remove(key) {
            if existing.surface_epoch == ready.epoch {
                ready.surface.remove_marker(existing.surface_id);
            }
        }
        let surface_id = ready.surface.add_marker(marker)?;
        state.handles.insert(
            key.clone(),
            MarkerHandle {
                surface_epoch: ready.epoch,
                surface_id,
                position: marker.position,
                icon: marker.icon,
            },
        );
        Ok(())
    }

    fn upsert_in(
        self: &Arc<Self>,
        generation: u64,
        key: MarkerKey,
        marker: MarkerSpec,
    ) -> TrackerResult<UpsertOutcome> {
        let mut state = self.state();
        if state.generation != generation {
            tracing::trace!(key = %key.id, "ignoring marker upsert from a stale session");
            return Ok(UpsertOutcome::Stale);
        }
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        match self.apply(&mut state, &key, &marker) {
            Ok(()) => {
                state.pending.remove(&key);
                Ok(UpsertOutcome::Applied)
            }
            Err(TrackerError::SurfaceNotReady) => {
                state.pending.insert(key.clone(), ticket);
                drop(state);
                self.schedule_retry(generation, ticket, key, marker);
                Ok(UpsertOutcome::Deferred)
            }
            Err(err) => {
                state.pending.remove(&key);
                Err(err)
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, generation: u64, ticket: u64, key: MarkerKey, marker: MarkerSpec) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %key.id, "no runtime to retry marker upsert; dropping it");
            self.state().pending.remove(&key);
            return;
        };
        let registry = Arc::clone(self);
        let delay = self.retry_delay;
        runtime.spawn(async move {
            let mut attempts = 0u32;
            loop {
                tokio::time::sleep(delay).await;
                attempts += 1;
                let done = {
                    let mut state = registry.state();
                    if state.generation != generation || state.pending.get(&key) != Some(&ticket) {
                        true
                    } else {
                        match registry.apply(&mut state, &key, &marker) {
                            Ok(()) => {
                                state.pending.remove(&key);
                                tracing::debug!(key = %key.id, attempts, "deferred marker applied");
                                true
                            }
                            Err(TrackerError::SurfaceNotReady) => false,
                            Err(err) => {
                                state.pending.remove(&key);
                                tracing::warn!(key = %key.id, error = %err, "deferred marker failed");
                                true
                            }
                        }
                    }
                };
                if done {
                    return;
                }
            }
        });
    }

    fn remove_in(&self, generation: u64, key: &MarkerKey) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        let was_pending = state.pending.remove(key).is_some();
        let handle = state.handles.remove(key);
        if let Some(handle) = &handle {
            self.remove_from_surface(std::iter::once(handle));
        }
        handle.is_some() || was_pending
    }

    fn run_if_live(&self, generation: u64, publish: impl FnOnce()) -> bool {
        let state = self.state();
        if state.generation != generation {
            return false;
        }
        publish();
        true
    }

    fn clear_in(&self, generation: u64, layer: Option<MarkerLayer>) -> usize {
        let mut state = self.state();
        if state.generation != generation {
            return 0;
        }
        let in_layer = |key: &MarkerKey| layer.map(|layer| key.layer == layer).unwrap_or(true);
        state.pending.retain(|key, _| !in_layer(key));
        let keys: Vec<MarkerKey> = state.handles.keys().filter(|key| in_layer(key)).cloned().collect();
        let handles: Vec<MarkerHandle> = keys
            .iter()
            .filter_map(|key| state.handles.remove(key))
            .collect();
        self.remove_from_surface(handles.iter());
        handles.len()
    }
}

/// Marker writes bound to one session. Once the registry is torn down every
/// operation on an old scope is a no-op.
#[derive(Clone)]
pub struct MarkerScope {
    registry: Arc<MarkerRegistry>,
    generation: u64,
}

impl MarkerScope {
    pub fn is_live(&self) -> bool {
        self.registry.generation() == self.generation
    }

    /// Replaces any existing marker for `key`. Deferred while the surface is not ready.
    pub fn upsert(
        &self,
        key: MarkerKey,
        position: GeoPoint,
        icon: IconVariant,
        popup: Popup,
    ) -> TrackerResult<UpsertOutcome> {
        let marker = MarkerSpec {
            label: key.id.clone(),
            position,
            icon,
            popup,
        };
        self.registry.upsert_in(self.generation, key, marker)
    }

    pub fn remove(&self, key: &MarkerKey) -> bool {
        self.registry.remove_in(self.generation, key)
    }

    pub fn clear(&self) -> usize {
        self.registry.clear_in(self.generation, None)
    }

    pub fn clear_layer(&self, layer: MarkerLayer) -> usize {
        self.registry.clear_in(self.generation, Some(layer))
    }

    /// Runs `publish` under the registry lock if this session is still live,
    /// so it lands either before teardown or not at all. `publish` must not
    /// write markers. Returns whether it ran.
    pub fn publish_if_live(&self, publish: impl FnOnce()) -> bool {
        self.registry.run_if_live(self.generation, publish)
    }

    pub fn registry(&self) -> &Arc<MarkerRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{HeadlessContainer, IconSet};

    fn popup(title: &str) -> Popup {
        Popup {
            title: title.to_string(),
            lines: Vec::new(),
            action: None,
        }
    }

    fn fixture() -> (Arc<SurfaceLifecycle>, Arc<MarkerRegistry>, HeadlessContainer) {
        let surface = Arc::new(SurfaceLifecycle::new(
            IconSet::standard(),
            16.0,
            GeoPoint::new(0.0, 0.0),
        ));
        let registry = MarkerRegistry::new(surface.clone(), Duration::from_millis(500));
        (surface, registry, HeadlessContainer::attached())
    }

    #[tokio::test(start_paused = true)]
    async fn upserting_twice_leaves_a_single_handle() {
        let (surface, registry, container) = fixture();
        surface.ensure_surface(&container).unwrap();
        let key = MarkerKey::presence("a");

        registry
            .upsert(key.clone(), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("a"))
            .unwrap();
        registry
            .upsert(key.clone(), GeoPoint::new(2.0, 2.0), IconVariant::AdminUser, popup("a"))
            .unwrap();

        assert_eq!(registry.live_count(MarkerLayer::Presence), 1);
        let drawn = container.last_surface().unwrap();
        assert_eq!(drawn.markers_labelled("a"), 1);
        assert_eq!(registry.handle(&key).unwrap().position, GeoPoint::new(2.0, 2.0));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_upsert_lands_once_surface_is_ready() {
        let (surface, registry, container) = fixture();
        let outcome = registry
            .upsert(MarkerKey::incident("i1"), GeoPoint::new(1.0, 1.0), IconVariant::Incident, popup("i1"))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Deferred);
        assert_eq!(registry.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(1_600)).await;
        assert_eq!(registry.pending_count(), 1, "keeps retrying while the surface is absent");

        surface.ensure_surface(&container).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.live_count(MarkerLayer::Incident), 1);
        assert_eq!(container.last_surface().unwrap().marker_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_write_supersedes_a_pending_retry() {
        let (surface, registry, container) = fixture();
        let key = MarkerKey::presence("a");
        registry
            .upsert(key.clone(), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("old"))
            .unwrap();
        registry
            .upsert(key.clone(), GeoPoint::new(3.0, 3.0), IconVariant::User, popup("new"))
            .unwrap();
        surface.ensure_surface(&container).unwrap();

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let drawn = container.last_surface().unwrap();
        assert_eq!(drawn.marker_count(), 1);
        assert_eq!(drawn.markers()[0].popup.title, "new");
        assert_eq!(registry.handle(&key).unwrap().position, GeoPoint::new(3.0, 3.0));

        let other = MarkerKey::presence("b");
        surface.destroy_surface();
        registry
            .upsert(other.clone(), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("b"))
            .unwrap();
        assert!(registry.remove(&other));
        surface.ensure_surface(&container).unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert!(registry.handle(&other).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_pending_retries_and_stale_scopes() {
        let (surface, registry, container) = fixture();
        let scope = registry.scope();
        scope
            .upsert(MarkerKey::presence("a"), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("a"))
            .unwrap();
        assert_eq!(registry.teardown(), 0);
        assert_eq!(registry.pending_count(), 0);
        assert!(!scope.is_live());

        surface.ensure_surface(&container).unwrap();
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(registry.total_live(), 0);

        let outcome = scope
            .upsert(MarkerKey::presence("b"), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("b"))
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Stale);
        assert_eq!(container.last_surface().unwrap().marker_count(), 0);
    }

    #[test]
    fn publish_if_live_stops_running_after_teardown() {
        let (_surface, registry, _container) = fixture();
        let scope = registry.scope();
        let mut published = Vec::new();

        assert!(scope.publish_if_live(|| published.push("before")));
        registry.teardown();
        assert!(!scope.publish_if_live(|| published.push("after")));
        assert!(registry.scope().publish_if_live(|| published.push("next session")));
        assert_eq!(published, vec!["before", "next session"]);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_layer_only_touches_that_layer() {
        let (surface, registry, container) = fixture();
        surface.ensure_surface(&container).unwrap();
        let scope = registry.scope();
        for id in ["a", "b"] {
            scope
                .upsert(MarkerKey::presence(id), GeoPoint::new(1.0, 1.0), IconVariant::User, popup(id))
                .unwrap();
        }
        scope
            .upsert(MarkerKey::incident("i1"), GeoPoint::new(1.0, 1.0), IconVariant::Incident, popup("i1"))
            .unwrap();

        assert_eq!(scope.clear_layer(MarkerLayer::Incident), 1);
        assert_eq!(registry.keys(MarkerLayer::Presence), vec!["a", "b"]);
        assert_eq!(container.last_surface().unwrap().marker_count(), 2);

        assert_eq!(registry.clear(), 2);
        assert_eq!(container.last_surface().unwrap().marker_count(), 0);
        assert!(!registry.remove(&MarkerKey::presence("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_marker_surfaces_an_error_without_a_handle() {
        let (surface, registry, container) = fixture();
        surface.ensure_surface(&container).unwrap();
        container.last_surface().unwrap().reject_label("bad");

        let err = registry
            .upsert(MarkerKey::presence("bad"), GeoPoint::new(1.0, 1.0), IconVariant::User, popup("bad"))
            .unwrap_err();
        assert!(matches!(err, TrackerError::Surface(_)));
        assert!(err.is_transient());
        assert_eq!(registry.total_live(), 0);
    }
}
