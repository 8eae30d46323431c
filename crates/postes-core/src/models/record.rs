use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::utm::{self, UtmCoordinate, UtmError};

/// Delivery state of a locally stored record.
///
/// Stored as an integer in the `status_sync` column. Transitions only move
/// forward: `Pending -> Synced` or `Pending -> Failed`. A failed record goes
/// back to pending only through an explicit requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    /// Dead letter: rejected by the server too many times to keep retrying.
    Failed,
}

impl SyncStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            SyncStatus::Pending => 0,
            SyncStatus::Synced => 1,
            SyncStatus::Failed => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(SyncStatus::Pending),
            1 => Some(SyncStatus::Synced),
            2 => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

/// A pole observation as captured on the device, before the store has
/// assigned it an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub city: String,
    pub neighborhood: String,
    pub utm_zone: i64,
    pub utm_easting: f64,
    pub utm_northing: f64,
    pub notes: Option<String>,
    pub photo_ref: Option<PathBuf>,
}

impl NewRecord {
    pub fn new(city: impl Into<String>, neighborhood: impl Into<String>, utm: UtmCoordinate) -> Self {
        Self {
            city: city.into(),
            neighborhood: neighborhood.into(),
            utm_zone: i64::from(utm.zone),
            utm_easting: utm.easting,
            utm_northing: utm.northing,
            notes: None,
            photo_ref: None,
        }
    }

    /// Build a record from a raw GPS fix.
    pub fn from_position(
        city: impl Into<String>,
        neighborhood: impl Into<String>,
        latitude: f64,
        longitude: f64,
    ) -> Result<Self, UtmError> {
        let utm = utm::from_lat_lon(latitude, longitude)?;
        Ok(Self::new(city, neighborhood, utm))
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        let notes = notes.into();
        self.notes = if notes.trim().is_empty() { None } else { Some(notes) };
        self
    }

    pub fn with_photo(mut self, photo: impl Into<PathBuf>) -> Self {
        self.photo_ref = Some(photo.into());
        self
    }
}

/// A record persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub city: String,
    pub neighborhood: String,
    pub utm_zone: i64,
    pub utm_easting: f64,
    pub utm_northing: f64,
    pub notes: Option<String>,
    pub photo_ref: Option<PathBuf>,
    pub sync_status: SyncStatus,
    /// Number of rejected submissions seen for this record.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Record {
    /// Materialize a record that was never persisted, e.g. for a direct
    /// submission while online. Such records carry id 0.
    pub fn unsaved(new: NewRecord) -> Self {
        Self {
            id: 0,
            city: new.city,
            neighborhood: new.neighborhood,
            utm_zone: new.utm_zone,
            utm_easting: new.utm_easting,
            utm_northing: new.utm_northing,
            notes: new.notes,
            photo_ref: new.photo_ref,
            sync_status: SyncStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn into_new(self) -> NewRecord {
        NewRecord {
            city: self.city,
            neighborhood: self.neighborhood,
            utm_zone: self.utm_zone,
            utm_easting: self.utm_easting,
            utm_northing: self.utm_northing,
            notes: self.notes,
            photo_ref: self.photo_ref,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_the_persisted_column() {
        assert_eq!(SyncStatus::Pending.as_i64(), 0);
        assert_eq!(SyncStatus::Synced.as_i64(), 1);
        assert_eq!(SyncStatus::from_i64(2), Some(SyncStatus::Failed));
        assert_eq!(SyncStatus::from_i64(7), None);
    }

    #[test]
    fn blank_notes_are_dropped() {
        let utm = UtmCoordinate { zone: 23, band: 'K', easting: 1.0, northing: 2.0 };
        let record = NewRecord::new("Rio", "Centro", utm).with_notes("   ");
        assert_eq!(record.notes, None);
        assert_eq!(record.utm_zone, 23);
    }

    #[test]
    fn from_position_converts_to_utm() {
        let record = NewRecord::from_position("Rio", "Centro", -22.9068, -43.1729).unwrap();
        assert_eq!(record.utm_zone, 23);
        assert!(record.utm_northing > 7_000_000.0);
    }
}
