//! Wire events pushed to tracking viewers.
//!
//! Every message is a JSON object tagged by `event`:
//!
//! ```json
//! {"event":"scan.updated","delivery_id":42,"event_type":"IN",
//!  "location":"Hub A","timestamp":"2024-05-01T10:00:00Z"}
//! ```

use crate::error::HubResult;
use crate::types::ResourceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a parcel scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl std::fmt::Display for ScanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanType::In => f.write_str("IN"),
            ScanType::Out => f.write_str("OUT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum TrackingEvent {
    #[serde(rename = "scan.updated")]
    ScanUpdated {
        delivery_id: u64,
        event_type: ScanType,
        location: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "status.changed")]
    StatusChanged {
        delivery_id: u64,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_status: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "damage.reported")]
    DamageReported {
        delivery_id: u64,
        damage_type: String,
        description: String,
        timestamp: DateTime<Utc>,
    },
}

impl TrackingEvent {
    pub fn scan_updated(
        delivery_id: u64,
        event_type: ScanType,
        location: impl Into<String>,
    ) -> Self {
        TrackingEvent::ScanUpdated {
            delivery_id,
            event_type,
            location: location.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn status_changed(
        delivery_id: u64,
        status: impl Into<String>,
        previous_status: Option<String>,
    ) -> Self {
        TrackingEvent::StatusChanged {
            delivery_id,
            status: status.into(),
            previous_status,
            timestamp: Utc::now(),
        }
    }

    pub fn damage_reported(
        delivery_id: u64,
        damage_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        TrackingEvent::DamageReported {
            delivery_id,
            damage_type: damage_type.into(),
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn delivery_id(&self) -> u64 {
        match self {
            TrackingEvent::ScanUpdated { delivery_id, .. }
            | TrackingEvent::StatusChanged { delivery_id, .. }
            | TrackingEvent::DamageReported { delivery_id, .. } => *delivery_id,
        }
    }

    /// Resource key viewers of this delivery subscribe under.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::from(self.delivery_id())
    }

    /// The `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            TrackingEvent::ScanUpdated { .. } => "scan.updated",
            TrackingEvent::StatusChanged { .. } => "status.changed",
            TrackingEvent::DamageReported { .. } => "damage.reported",
        }
    }

    pub fn to_json(&self) -> HubResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
