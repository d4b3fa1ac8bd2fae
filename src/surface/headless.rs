use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{IconSet, MapSurface, MarkerSpec, SurfaceContainer, SurfaceError, SurfaceMarkerId};
use crate::model::GeoPoint;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Surface that keeps its markers in memory; used by the headless driver and tests.
#[derive(Default)]
pub struct HeadlessSurface {
    markers: Mutex<BTreeMap<u64, MarkerSpec>>,
    next_id: AtomicU64,
    icons_installed: AtomicBool,
    view: Mutex<Option<(GeoPoint, f64)>>,
    released: AtomicBool,
    rejected_labels: Mutex<HashSet<String>>,
}

impl HeadlessSurface {
    pub fn marker_count(&self) -> usize {
        lock(&self.markers).len()
    }

    pub fn markers(&self) -> Vec<MarkerSpec> {
        lock(&self.markers).values().cloned().collect()
    }

    pub fn markers_labelled(&self, label: &str) -> usize {
        lock(&self.markers)
            .values()
            .filter(|marker| marker.label == label)
            .count()
    }

    pub fn view(&self) -> Option<(GeoPoint, f64)> {
        *lock(&self.view)
    }

    pub fn icons_installed(&self) -> bool {
        self.icons_installed.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Makes `add_marker` fail for this label, standing in for a bad entity payload.
    pub fn reject_label(&self, label: &str) {
        lock(&self.rejected_labels).insert(label.to_string());
    }
}

impl MapSurface for HeadlessSurface {
    fn install_icons(&self, icons: &IconSet) -> Result<(), SurfaceError> {
        if icons.icons.is_empty() {
            return Err(SurfaceError::Backend("empty icon set".to_string()));
        }
        self.icons_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn add_marker(&self, marker: &MarkerSpec) -> Result<SurfaceMarkerId, SurfaceError> {
        if self.is_released() {
            return Err(SurfaceError::Backend("surface released".to_string()));
        }
        if lock(&self.rejected_labels).contains(&marker.label) {
            return Err(SurfaceError::Rejected {
                label: marker.label.clone(),
                reason: "rejected by surface".to_string(),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.markers).insert(id, marker.clone());
        Ok(SurfaceMarkerId(id))
    }

    fn remove_marker(&self, id: SurfaceMarkerId) {
        lock(&self.markers).remove(&id.0);
    }

    fn set_view(&self, center: GeoPoint, zoom: f64) {
        *lock(&self.view) = Some((center, zoom));
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        lock(&self.markers).clear();
    }
}

#[derive(Default)]
pub struct HeadlessContainer {
    attached: AtomicBool,
    creations: AtomicUsize,
    last: Mutex<Option<Arc<HeadlessSurface>>>,
    fail_next: Mutex<Option<String>>,
}

impl HeadlessContainer {
    pub fn attached() -> Self {
        let container = Self::default();
        container.attach();
        container
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self) {
        self.attached.store(true, Ordering::SeqCst);
    }

    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    pub fn last_surface(&self) -> Option<Arc<HeadlessSurface>> {
        lock(&self.last).clone()
    }

    pub fn fail_next_creation(&self, reason: &str) {
        *lock(&self.fail_next) = Some(reason.to_string());
    }
}

impl SurfaceContainer for HeadlessContainer {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn create_surface(&self) -> Result<Arc<dyn MapSurface>, SurfaceError> {
        if !self.is_attached() {
            return Err(SurfaceError::Detached);
        }
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(SurfaceError::Backend(reason));
        }
        let surface = Arc::new(HeadlessSurface::default());
        *lock(&self.last) = Some(surface.clone());
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(surface)
    }
}
