//! Rendering surface seam and its lifecycle: `Absent -> Pending -> Ready -> Absent`.

mod headless;

pub use headless::{HeadlessContainer, HeadlessSurface};

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;

use crate::model::GeoPoint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("container is not attached")]
    Detached,
    #[error("surface rejected marker {label}: {reason}")]
    Rejected { label: String, reason: String },
    #[error("surface backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IconVariant {
    SelfMarker,
    AdminUser,
    User,
    Incident,
}

impl IconVariant {
    pub fn for_presence(is_self: bool, is_admin: bool) -> Self {
        match (is_self, is_admin) {
            (true, _) => IconVariant::SelfMarker,
            (false, true) => IconVariant::AdminUser,
            (false, false) => IconVariant::User,
        }
    }

    pub fn asset_name(self) -> &'static str {
        match self {
            IconVariant::SelfMarker => "marker-self",
            IconVariant::AdminUser => "marker-admin",
            IconVariant::User => "marker-user",
            IconVariant::Incident => "marker-incident",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IconDefinition {
    pub variant: IconVariant,
    pub color: &'static str,
    pub size: (u32, u32),
    pub anchor: (i32, i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IconSet {
    pub icons: Vec<IconDefinition>,
}

impl IconSet {
    pub fn standard() -> Self {
        let pin = |variant: IconVariant, color: &'static str| IconDefinition {
            variant,
            color,
            size: (25, 41),
            anchor: (12, 41),
        };
        Self {
            icons: vec![
                pin(IconVariant::SelfMarker, "green"),
                pin(IconVariant::AdminUser, "violet"),
                pin(IconVariant::User, "blue"),
                IconDefinition {
                    variant: IconVariant::Incident,
                    color: "red",
                    size: (32, 52),
                    anchor: (16, 52),
                },
            ],
        }
    }

    pub fn get(&self, variant: IconVariant) -> Option<&IconDefinition> {
        self.icons.iter().find(|icon| icon.variant == variant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupAction {
    ResolveIncident { incident_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Popup {
    pub title: String,
    pub lines: Vec<String>,
    pub action: Option<PopupAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub label: String,
    pub position: GeoPoint,
    pub icon: IconVariant,
    pub popup: Popup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceMarkerId(pub u64);

pub trait MapSurface: Send + Sync {
    fn install_icons(&self, icons: &IconSet) -> Result<(), SurfaceError>;
    fn add_marker(&self, marker: &MarkerSpec) -> Result<SurfaceMarkerId, SurfaceError>;
    fn remove_marker(&self, id: SurfaceMarkerId);
    fn set_view(&self, center: GeoPoint, zoom: f64);
    fn release(&self);
}

/// The element a surface is mounted into; it may not be attached yet.
pub trait SurfaceContainer: Send + Sync {
    fn is_attached(&self) -> bool;
    fn create_surface(&self) -> Result<Arc<dyn MapSurface>, SurfaceError>;
}

#[derive(Clone)]
pub struct ReadySurface {
    pub epoch: u64,
    pub surface: Arc<dyn MapSurface>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfacePhase {
    Absent,
    Pending,
    Ready,
}

enum Slot {
    Absent,
    Pending { epoch: u64 },
    Ready(ReadySurface),
}

struct LifecycleState {
    slot: Slot,
    next_epoch: u64,
    center: Option<GeoPoint>,
}

pub struct SurfaceLifecycle {
    state: Mutex<LifecycleState>,
    icons: IconSet,
    zoom: f64,
    default_center: GeoPoint,
    ready_tx: watch::Sender<bool>,
}

impl SurfaceLifecycle {
    pub fn new(icons: IconSet, zoom: f64, default_center: GeoPoint) -> Self {
        let (ready_tx, _rx) = watch::channel(false);
        Self {
            state: Mutex::new(LifecycleState {
                slot: Slot::Absent,
                next_epoch: 1,
                center: None,
            }),
            icons,
            zoom,
            default_center,
            ready_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live surface, creating it if the container is attached.
    /// `None` means "not yet": the container is detached or another creation
    /// is in flight, and the caller retries.
    pub fn ensure_surface(&self, container: &dyn SurfaceContainer) -> Option<Arc<dyn MapSurface>> {
        let epoch = {
            let mut state = self.state();
            match &state.slot {
                Slot::Ready(ready) => return Some(ready.surface.clone()),
                Slot::Pending { .. } => {
                    tracing::trace!("surface creation already pending");
                    return None;
                }
                Slot::Absent => {}
            }
            if !container.is_attached() {
                tracing::trace!("surface container not attached yet");
                return None;
            }
            let epoch = state.next_epoch;
            state.next_epoch += 1;
            state.slot = Slot::Pending { epoch };
            epoch
        };

        let created = container.create_surface().and_then(|surface| {
            surface.install_icons(&self.icons)?;
            Ok(surface)
        });

        let mut state = self.state();
        let still_pending = matches!(state.slot, Slot::Pending { epoch: pending } if pending == epoch);
        match created {
            Err(err) => {
                if still_pending {
                    state.slot = Slot::Absent;
                }
                tracing::warn!(error = %err, "surface creation failed");
                None
            }
            Ok(surface) if !still_pending => {
                tracing::debug!(epoch, "surface destroyed while pending; releasing new surface");
                surface.release();
                None
            }
            Ok(surface) => {
                surface.set_view(state.center.unwrap_or(self.default_center), self.zoom);
                state.slot = Slot::Ready(ReadySurface {
                    epoch,
                    surface: surface.clone(),
                });
                self.ready_tx.send_replace(true);
                tracing::info!(epoch, icons = self.icons.icons.len(), "surface ready");
                Some(surface)
            }
        }
    }

    /// Safe to call when no surface exists.
    pub fn destroy_surface(&self) {
        let mut state = self.state();
        state.center = None;
        match std::mem::replace(&mut state.slot, Slot::Absent) {
            Slot::Ready(ready) => {
                ready.surface.release();
                self.ready_tx.send_replace(false);
                tracing::info!(epoch = ready.epoch, "surface destroyed");
            }
            Slot::Pending { epoch } => {
                tracing::debug!(epoch, "pending surface creation abandoned");
            }
            Slot::Absent => {}
        }
    }

    pub fn current(&self) -> Option<ReadySurface> {
        match &self.state().slot {
            Slot::Ready(ready) => Some(ready.clone()),
            _ => None,
        }
    }

    pub fn phase(&self) -> SurfacePhase {
        match self.state().slot {
            Slot::Absent => SurfacePhase::Absent,
            Slot::Pending { .. } => SurfacePhase::Pending,
            Slot::Ready(_) => SurfacePhase::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SurfacePhase::Ready
    }

    /// Moves the view now if the surface is up, otherwise it becomes the initial view.
    pub fn recenter(&self, center: GeoPoint) {
        let mut state = self.state();
        state.center = Some(center);
        if let Slot::Ready(ready) = &state.slot {
            ready.surface.set_view(center, self.zoom);
        }
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lifecycle() -> SurfaceLifecycle {
        SurfaceLifecycle::new(IconSet::standard(), 16.0, GeoPoint::new(51.505, -0.09))
    }

    #[test]
    fn icon_variant_follows_self_and_admin_flags() {
        assert_eq!(IconVariant::for_presence(true, true), IconVariant::SelfMarker);
        assert_eq!(IconVariant::for_presence(false, true), IconVariant::AdminUser);
        assert_eq!(IconVariant::for_presence(false, false), IconVariant::User);
        assert!(IconSet::standard().get(IconVariant::Incident).is_some());
    }

    #[test]
    fn ensure_surface_waits_for_container_then_is_idempotent() {
        let lifecycle = lifecycle();
        let container = HeadlessContainer::detached();
        let ready = lifecycle.subscribe_ready();

        assert!(lifecycle.ensure_surface(&container).is_none());
        assert_eq!(lifecycle.phase(), SurfacePhase::Absent);
        assert_eq!(container.creations(), 0);

        container.attach();
        let first = lifecycle.ensure_surface(&container).unwrap();
        let second = lifecycle.ensure_surface(&container).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(container.creations(), 1);
        assert!(*ready.borrow());

        let surface = container.last_surface().unwrap();
        assert!(surface.icons_installed());
        assert_eq!(surface.view(), Some((GeoPoint::new(51.505, -0.09), 16.0)));
    }

    #[test]
    fn pending_creation_blocks_reentrant_attempts() {
        let lifecycle = lifecycle();
        let container = HeadlessContainer::attached();
        {
            let mut state = lifecycle.state();
            state.slot = Slot::Pending { epoch: 99 };
        }
        assert!(lifecycle.ensure_surface(&container).is_none());
        assert_eq!(container.creations(), 0);
    }

    #[test]
    fn destroy_is_a_noop_when_absent_and_releases_when_ready() {
        let lifecycle = lifecycle();
        lifecycle.destroy_surface();
        assert_eq!(lifecycle.phase(), SurfacePhase::Absent);

        let container = HeadlessContainer::attached();
        lifecycle.ensure_surface(&container).unwrap();
        let first_epoch = lifecycle.current().unwrap().epoch;
        lifecycle.destroy_surface();
        assert!(container.last_surface().unwrap().is_released());
        assert!(!*lifecycle.subscribe_ready().borrow());

        lifecycle.ensure_surface(&container).unwrap();
        assert!(lifecycle.current().unwrap().epoch > first_epoch);
        assert_eq!(container.creations(), 2);
    }

    #[test]
    fn recenter_before_ready_becomes_initial_view() {
        let lifecycle = lifecycle();
        let container = HeadlessContainer::attached();
        lifecycle.recenter(GeoPoint::new(10.0, 20.0));
        lifecycle.ensure_surface(&container).unwrap();
        assert_eq!(
            container.last_surface().unwrap().view(),
            Some((GeoPoint::new(10.0, 20.0), 16.0))
        );

        lifecycle.recenter(GeoPoint::new(11.0, 21.0));
        assert_eq!(
            container.last_surface().unwrap().view(),
            Some((GeoPoint::new(11.0, 21.0), 16.0))
        );
    }

    #[test]
    fn failed_creation_returns_to_absent() {
        let lifecycle = lifecycle();
        let container = HeadlessContainer::attached();
        container.fail_next_creation("gpu lost");
        assert!(lifecycle.ensure_surface(&container).is_none());
        assert_eq!(lifecycle.phase(), SurfacePhase::Absent);
        assert!(lifecycle.ensure_surface(&container).is_some());
    }
}
