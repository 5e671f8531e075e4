//! Shared domain types.
//!
//! Beacon identity, proximity tiers, raw ranging samples and the transient
//! events produced once samples have been stabilized.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use utoipa::ToSchema;
use uuid::Uuid;

/// Error returned when a string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    /// What was being parsed.
    pub kind: &'static str,
    /// The rejected input.
    pub value: String,
}

/// Proximity tier reported by the radio layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Proximity {
    /// The tier could not be determined; treated as "not in range".
    Unknown,
    /// Within a few centimetres.
    Immediate,
    /// Within a couple of metres.
    Near,
    /// Further away but still received.
    Far,
}

impl Proximity {
    /// Distance rank, closest first. `Unknown` has no rank.
    #[must_use]
    pub const fn rank(self) -> Option<u8> {
        match self {
            Self::Unknown => None,
            Self::Immediate => Some(0),
            Self::Near => Some(1),
            Self::Far => Some(2),
        }
    }

    /// Returns `true` unless the tier is `Unknown`.
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Returns `true` if this tier is `limit` or closer.
    #[must_use]
    pub fn within(self, limit: Self) -> bool {
        match (self.rank(), limit.rank()) {
            (Some(own), Some(max)) => own <= max,
            _ => false,
        }
    }

    /// Wire name of the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Immediate => "immediate",
            Self::Near => "near",
            Self::Far => "far",
        }
    }
}

impl fmt::Display for Proximity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Proximity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "immediate" => Ok(Self::Immediate),
            "near" => Ok(Self::Near),
            "far" => Ok(Self::Far),
            _ => Err(UnknownVariant {
                kind: "proximity",
                value: s.to_string(),
            }),
        }
    }
}

/// The beacon-proximity transition being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum EventType {
    /// The beacon became present.
    #[serde(rename = "enter")]
    Enter,
    /// The beacon is no longer present.
    #[serde(rename = "leave", alias = "exit")]
    Exit,
    /// The beacon is still present but its proximity or accuracy changed.
    #[serde(rename = "range")]
    Range,
}

impl EventType {
    /// Wire name of the event type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enter => "enter",
            Self::Exit => "leave",
            Self::Range => "range",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enter" => Ok(Self::Enter),
            "leave" | "exit" => Ok(Self::Exit),
            "range" => Ok(Self::Range),
            _ => Err(UnknownVariant {
                kind: "event type",
                value: s.to_string(),
            }),
        }
    }
}

/// Radio identity of a beacon: namespace UUID plus major/minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct BeaconId {
    /// Namespace UUID shared by all beacons of a deployment.
    pub proximity_uuid: Uuid,
    /// Major number.
    pub major: u16,
    /// Minor number.
    pub minor: u16,
}

impl BeaconId {
    /// Create a beacon identity.
    #[must_use]
    pub const fn new(proximity_uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            proximity_uuid,
            major,
            minor,
        }
    }

    /// Stable identifier string, `UUID-major-minor` with an uppercase UUID.
    #[must_use]
    pub fn identifier(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BeaconId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let uuid = self.proximity_uuid.hyphenated().to_string().to_ascii_uppercase();
        write!(f, "{uuid}-{}-{}", self.major, self.minor)
    }
}

impl FromStr for BeaconId {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || UnknownVariant {
            kind: "beacon identifier",
            value: s.to_string(),
        };

        let mut parts = s.trim().rsplitn(3, '-');
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let uuid = parts
            .next()
            .and_then(|p| Uuid::parse_str(p).ok())
            .ok_or_else(invalid)?;

        Ok(Self::new(uuid, major, minor))
    }
}

/// Signal measurements attached to a sample or event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Reading {
    /// Proximity tier.
    pub proximity: Proximity,
    /// Estimated distance in metres; negative when unknown.
    pub accuracy: f64,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// One raw ranging sample as delivered by the scanning layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "proximity_uuid": "F7826DA6-4FA2-4E98-8024-BC5B71E0893E",
    "major": 1,
    "minor": 7,
    "proximity": "near",
    "accuracy": 1.4,
    "rssi": -63
}))]
pub struct RangedSample {
    /// Namespace UUID.
    pub proximity_uuid: Uuid,
    /// Major number.
    pub major: u16,
    /// Minor number.
    pub minor: u16,
    /// Proximity tier.
    pub proximity: Proximity,
    /// Estimated distance in metres.
    pub accuracy: f64,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

impl RangedSample {
    /// Identity of the sampled beacon.
    #[must_use]
    pub const fn beacon_id(&self) -> BeaconId {
        BeaconId::new(self.proximity_uuid, self.major, self.minor)
    }

    /// Signal part of the sample.
    #[must_use]
    pub const fn reading(&self) -> Reading {
        Reading {
            proximity: self.proximity,
            accuracy: self.accuracy,
            rssi: self.rssi,
        }
    }
}

/// A stabilized proximity transition for one beacon.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconEvent {
    /// Unique id of this event instance.
    pub event_id: Uuid,
    /// Transition kind.
    pub kind: EventType,
    /// Beacon the event is about.
    pub beacon: BeaconId,
    /// Monotonic time the event was classified.
    pub at: Instant,
    /// Wall-clock time the event was classified.
    pub observed_at: DateTime<Utc>,
    /// Signal snapshot at classification time.
    pub reading: Reading,
}

impl BeaconEvent {
    /// Create a new event stamped with the current time.
    #[must_use]
    pub fn new(kind: EventType, beacon: BeaconId, reading: Reading) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            beacon,
            at: Instant::now(),
            observed_at: Utc::now(),
            reading,
        }
    }
}

/// Runtime state the engine keeps for a beacon between events.
#[derive(Debug, Clone, PartialEq)]
pub struct BeaconSnapshot {
    /// Latest signal measurements.
    pub reading: Reading,
    /// Last time a sample or event touched this beacon.
    pub last_seen: DateTime<Utc>,
    /// Start of the current (or most recent) stay.
    pub entered_at: Option<DateTime<Utc>>,
    /// Whether the beacon is currently in range.
    pub present: bool,
}

impl BeaconSnapshot {
    /// Time since the last enter, measured at `now`.
    #[must_use]
    pub fn stays_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.entered_at
            .and_then(|entered| (now - entered).to_std().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beacon_identifier_roundtrip() {
        let uuid = Uuid::parse_str("f7826da6-4fa2-4e98-8024-bc5b71e0893e").unwrap();
        let id = BeaconId::new(uuid, 1, 7);
        assert_eq!(id.identifier(), "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-1-7");
        assert_eq!(id.identifier().parse::<BeaconId>().unwrap(), id);
    }

    #[test]
    fn test_beacon_identifier_rejects_garbage() {
        assert!("not-a-beacon".parse::<BeaconId>().is_err());
        assert!("F7826DA6-4FA2-4E98-8024-BC5B71E0893E-1".parse::<BeaconId>().is_err());
        assert!("F7826DA6-4FA2-4E98-8024-BC5B71E0893E-1-70000"
            .parse::<BeaconId>()
            .is_err());
    }

    #[test]
    fn test_proximity_ordering() {
        assert!(Proximity::Immediate.within(Proximity::Near));
        assert!(Proximity::Near.within(Proximity::Near));
        assert!(!Proximity::Far.within(Proximity::Near));
        assert!(!Proximity::Unknown.within(Proximity::Far));
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!("leave".parse::<EventType>().unwrap(), EventType::Exit);
        assert_eq!("exit".parse::<EventType>().unwrap(), EventType::Exit);
        assert_eq!(
            serde_json::to_string(&EventType::Exit).unwrap(),
            "\"leave\""
        );
        let parsed: EventType = serde_json::from_str("\"range\"").unwrap();
        assert_eq!(parsed, EventType::Range);
    }

    #[test]
    fn test_stays_duration() {
        let now = Utc::now();
        let snapshot = BeaconSnapshot {
            reading: Reading {
                proximity: Proximity::Near,
                accuracy: 1.0,
                rssi: -60,
            },
            last_seen: now,
            entered_at: Some(now - chrono::Duration::seconds(90)),
            present: true,
        };
        assert_eq!(snapshot.stays_duration(now), Some(Duration::from_secs(90)));
    }
}
