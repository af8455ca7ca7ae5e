//! Geographic inputs: validated locations and the providers that supply them.
//!
//! A [`Location`] is an immutable value. When the position changes a new
//! value replaces the old one wholesale. The scheduler is agnostic to where
//! a location comes from (manual configuration, GPS, IP lookup) and only
//! talks to the [`LocationProvider`] trait.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::utils::{read, write};

pub mod solar;
pub mod timezone;

/// A validated geographic position.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    latitude: f64,
    longitude: f64,
    name: Option<String>,
    updated_at: DateTime<Utc>,
    timezone: Tz,
}

impl Location {
    /// Create a location, rejecting coordinates outside [-90, 90] / [-180, 180].
    ///
    /// The governing timezone is resolved from the coordinates.
    pub fn new(latitude: f64, longitude: f64) -> CoreResult<Self> {
        validate_coordinates(latitude, longitude)?;
        Ok(Self {
            latitude,
            longitude,
            name: None,
            updated_at: Utc::now(),
            timezone: timezone::timezone_for(latitude, longitude),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override the resolved timezone.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn updated(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = at;
        self
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// True when both values describe the same point, ignoring name and
    /// update time.
    pub fn same_position(&self, other: &Location) -> bool {
        self.latitude == other.latitude && self.longitude == other.longitude
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ns = if self.latitude >= 0.0 { 'N' } else { 'S' };
        let ew = if self.longitude >= 0.0 { 'E' } else { 'W' };
        match &self.name {
            Some(name) => write!(
                f,
                "{} ({:.4}°{}, {:.4}°{})",
                name,
                self.latitude.abs(),
                ns,
                self.longitude.abs(),
                ew
            ),
            None => write!(
                f,
                "{:.4}°{}, {:.4}°{}",
                self.latitude.abs(),
                ns,
                self.longitude.abs(),
                ew
            ),
        }
    }
}

/// Reject coordinates outside the valid ranges. NaN is rejected too.
pub fn validate_coordinates(latitude: f64, longitude: f64) -> CoreResult<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(CoreError::InvalidInput(format!(
            "latitude {} must be between -90 and 90 degrees",
            latitude
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(CoreError::InvalidInput(format!(
            "longitude {} must be between -180 and 180 degrees",
            longitude
        )));
    }
    Ok(())
}

/// Source of the current location.
///
/// Returning `None` means the position is unknown right now. The scheduler
/// keeps using the last known location when it has one.
#[cfg_attr(test, mockall::automock)]
pub trait LocationProvider: Send + Sync {
    fn current_location(&self) -> Option<Location>;
}

/// Provider for a manually configured location. A configuration reload
/// replaces it with [`StaticLocationProvider::set`].
#[derive(Debug, Default)]
pub struct StaticLocationProvider {
    location: RwLock<Option<Location>>,
}

impl StaticLocationProvider {
    pub fn new(location: Option<Location>) -> Self {
        Self {
            location: RwLock::new(location),
        }
    }

    pub fn set(&self, location: Option<Location>) {
        *write(&self.location) = location;
    }
}

impl LocationProvider for StaticLocationProvider {
    fn current_location(&self) -> Option<Location> {
        read(&self.location).clone()
    }
}
