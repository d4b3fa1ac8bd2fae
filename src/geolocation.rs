//! Device geolocation seam and the driver that turns samples into location reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TrackerError;
use crate::model::GeoPoint;
use crate::presence::LocationReporter;
use crate::store::{Disposer, RemoteStore};
use crate::stream::StreamHandle;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),
    #[error("timed out waiting for a position")]
    Timeout,
    #[error("geolocation is not supported on this device")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    pub maximum_age: Duration,
}

impl From<&Config> for WatchOptions {
    fn from(config: &Config) -> Self {
        Self {
            high_accuracy: config.geo_high_accuracy,
            timeout: config.geo_timeout,
            maximum_age: config.geo_maximum_age,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

pub type PositionSample = Result<GeoPoint, GeolocationError>;

#[derive(Debug)]
pub struct PositionWatch {
    pub id: WatchId,
    pub samples: mpsc::UnboundedReceiver<PositionSample>,
}

pub trait GeolocationSource: Send + Sync + 'static {
    fn watch(&self, options: WatchOptions) -> Result<PositionWatch, GeolocationError>;
    fn cancel(&self, id: WatchId);
}

#[derive(Default)]
struct ChannelState {
    watches: HashMap<u64, mpsc::UnboundedSender<PositionSample>>,
    next_id: u64,
    unavailable: Option<GeolocationError>,
}

/// Push-driven source: every pushed sample goes to every open watch.
#[derive(Clone, Default)]
pub struct ChannelGeolocation {
    inner: Arc<Mutex<ChannelState>>,
}

impl ChannelGeolocation {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, sample: PositionSample) {
        let mut state = self.state();
        state.watches.retain(|_, tx| tx.send(sample.clone()).is_ok());
    }

    /// Makes future `watch` calls fail, as on a device without a sensor.
    pub fn set_unavailable(&self, err: Option<GeolocationError>) {
        self.state().unavailable = err;
    }

    pub fn active_watches(&self) -> usize {
        self.state()
            .watches
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

impl GeolocationSource for ChannelGeolocation {
    fn watch(&self, options: WatchOptions) -> Result<PositionWatch, GeolocationError> {
        let mut state = self.state();
        if let Some(err) = &state.unavailable {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.next_id;
        state.next_id += 1;
        state.watches.insert(id, tx);
        tracing::debug!(
            watch = id,
            high_accuracy = options.high_accuracy,
            timeout_ms = options.timeout.as_millis() as u64,
            "geolocation watch started"
        );
        Ok(PositionWatch {
            id: WatchId(id),
            samples: rx,
        })
    }

    fn cancel(&self, id: WatchId) {
        if self.state().watches.remove(&id.0).is_some() {
            tracing::debug!(watch = id.0, "geolocation watch cancelled");
        }
    }
}

/// A failed or unusable sample is replaced by the fallback point.
pub fn resolve_sample(sample: PositionSample, fallback: GeoPoint) -> GeoPoint {
    match sample {
        Ok(point) if point.is_valid() => point,
        Ok(point) => {
            tracing::warn!(
                latitude = point.latitude,
                longitude = point.longitude,
                "discarding out-of-range position sample; using fallback"
            );
            fallback
        }
        Err(err) => {
            tracing::warn!(error = %err, "geolocation error; using fallback position");
            fallback
        }
    }
}

/// Starts the watch and reports every sample until `cancel` fires. If the
/// watch cannot be started the fallback position is reported once.
pub fn start_position_driver<S, G>(
    source: Arc<G>,
    options: WatchOptions,
    reporter: Arc<LocationReporter<S>>,
    fallback: GeoPoint,
    cancel: CancellationToken,
) -> StreamHandle
where
    S: RemoteStore,
    G: GeolocationSource,
{
    let watch = match source.watch(options) {
        Ok(watch) => watch,
        Err(err) => {
            let err = TrackerError::from(err);
            tracing::warn!(error = %err, "geolocation watch unavailable; reporting fallback position");
            let token = cancel.clone();
            let task = tokio::spawn(async move {
                if token.is_cancelled() {
                    return;
                }
                // Failures are already surfaced as notices by the reporter.
                let _ = reporter.report(fallback).await;
            });
            return StreamHandle::new("geolocation", cancel, Disposer::noop(), task);
        }
    };

    let PositionWatch { id, mut samples } = watch;
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = samples.recv() => {
                    let Some(sample) = next else {
                        tracing::debug!("geolocation watch closed");
                        break;
                    };
                    let point = resolve_sample(sample, fallback);
                    // Failures are already surfaced as notices by the reporter.
                    let _ = reporter.report(point).await;
                }
            }
        }
    });
    let disposer = Disposer::new(move || source.cancel(id));
    StreamHandle::new("geolocation", cancel, disposer, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{session_fixture, wait_until};

    #[test]
    fn resolve_sample_falls_back_on_errors_and_bad_points() {
        let fallback = GeoPoint::new(51.505, -0.09);
        assert_eq!(
            resolve_sample(Ok(GeoPoint::new(1.0, 2.0)), fallback),
            GeoPoint::new(1.0, 2.0)
        );
        assert_eq!(resolve_sample(Err(GeolocationError::Timeout), fallback), fallback);
        assert_eq!(
            resolve_sample(Ok(GeoPoint::new(f64::NAN, 0.0)), fallback),
            fallback
        );
    }

    #[tokio::test]
    async fn geolocation_failure_writes_the_fallback_coordinate() {
        let fixture = session_fixture("u1", "Ana", false);
        let geo = Arc::new(ChannelGeolocation::new());
        let fallback = fixture.config.fallback_position;
        let handle = start_position_driver(
            geo.clone(),
            WatchOptions::from(&fixture.config),
            fixture.reporter.clone(),
            fallback,
            CancellationToken::new(),
        );
        assert_eq!(geo.active_watches(), 1);

        geo.push(Err(GeolocationError::PositionUnavailable("no fix".to_string())));
        let store = fixture.store.clone();
        wait_until(|| store.document("locations", "u1").is_some()).await;

        let doc = fixture.store.document("locations", "u1").unwrap();
        assert_eq!(doc.get("latitude").and_then(|v| v.as_f64()), Some(fallback.latitude));
        assert_eq!(doc.get("longitude").and_then(|v| v.as_f64()), Some(fallback.longitude));

        handle.stop();
        assert_eq!(geo.active_watches(), 0);
    }

    #[tokio::test]
    async fn unavailable_watch_reports_fallback_once() {
        let fixture = session_fixture("u1", "Ana", false);
        let geo = Arc::new(ChannelGeolocation::new());
        geo.set_unavailable(Some(GeolocationError::PermissionDenied));
        let _handle = start_position_driver(
            geo,
            WatchOptions::from(&fixture.config),
            fixture.reporter.clone(),
            fixture.config.fallback_position,
            CancellationToken::new(),
        );

        let store = fixture.store.clone();
        wait_until(|| store.write_count() == 1).await;
        assert!(fixture.store.document("locations", "u1").is_some());
    }
}
