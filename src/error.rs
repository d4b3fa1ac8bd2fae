use thiserror::Error;

use crate::geolocation::GeolocationError;
use crate::identity::IdentityError;
use crate::store::StoreError;
use crate::surface::SurfaceError;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// Recoverable; the marker registry defers and retries.
    #[error("rendering surface is not ready")]
    SurfaceNotReady,

    #[error("{stream} subscription failed: {source}")]
    Subscription {
        stream: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("write to {path} failed: {source}")]
    Write {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("geolocation unavailable: {0}")]
    Geolocation(#[from] GeolocationError),

    /// Raised locally; the store never sees the request.
    #[error("permission denied: missing capability {0}")]
    PermissionDenied(String),

    #[error("no active session")]
    NoSession,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("marker rendering failed: {0}")]
    Surface(#[from] SurfaceError),
}

impl TrackerError {
    pub fn write(path: impl Into<String>, source: StoreError) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Transient errors are logged only; everything else reaches the user as a notice.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SurfaceNotReady | Self::Surface(_))
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
