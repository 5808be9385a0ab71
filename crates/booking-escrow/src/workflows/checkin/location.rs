use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::workflows::policy::CheckInPolicy;

const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// WGS84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance using the haversine formula.
    pub fn distance_meters(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = lat2 - lat1;
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_METERS * a.sqrt().min(1.0).asin()
    }

    /// Point `meters` due north, handy for building fixtures around a job site.
    pub fn offset_north(&self, meters: f64) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude + (meters / EARTH_RADIUS_METERS).to_degrees(),
            longitude: self.longitude,
        }
    }
}

/// Where the job takes place and how close the provider has to be.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceLocation {
    pub point: GeoPoint,
    #[serde(default)]
    pub radius_meters: Option<f64>,
}

impl ServiceLocation {
    pub fn radius_or(&self, default_radius: f64) -> f64 {
        self.radius_meters
            .filter(|radius| radius.is_finite() && *radius > 0.0)
            .unwrap_or(default_radius)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("no location fix available")]
    NoSignal,
    #[error("location provider failed: {0}")]
    Source(String),
    #[error("location unavailable after {attempts} attempt(s)")]
    Unavailable { attempts: u32 },
}

/// Supplies the provider's current position during check-in.
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn current_fix(&self) -> Result<GeoPoint, LocationError>;
}

/// Coordinates reported by the provider's device alongside the check-in request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportedLocation(pub Option<GeoPoint>);

#[async_trait]
impl LocationSource for ReportedLocation {
    async fn current_fix(&self) -> Result<GeoPoint, LocationError> {
        self.0.ok_or(LocationError::NoSignal)
    }
}

/// Ask the source for a fix, bounded by the policy timeout, retrying up to the policy
/// limit before reporting the location as unavailable.
pub async fn acquire_fix(
    source: &dyn LocationSource,
    policy: &CheckInPolicy,
) -> Result<GeoPoint, LocationError> {
    let attempts = policy.gps_max_retries.max(1);

    for attempt in 1..=attempts {
        match tokio::time::timeout(policy.gps_timeout(), source.current_fix()).await {
            Ok(Ok(fix)) if fix.is_valid() => return Ok(fix),
            Ok(Ok(fix)) => debug!(attempt, ?fix, "discarding out-of-range location fix"),
            Ok(Err(err)) => debug!(attempt, error = %err, "location fix failed"),
            Err(_) => debug!(attempt, "location fix timed out"),
        }
    }

    Err(LocationError::Unavailable { attempts })
}
