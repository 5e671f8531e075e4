//! Zone definitions and loading.
//!
//! A zone file holds either a single zone object or `{ "zones": [...] }`, in
//! JSON or TOML. Loading validates identifiers and uniqueness; condition tags
//! and parameters are resolved later, when a [`BeaconIndex`](crate::index::BeaconIndex)
//! is built against a condition registry.

use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::types::BeaconId;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._:-]{1,128}$").expect("IDENTIFIER_RE is a compile-time constant"));

/// Returns `true` if `id` is a usable zone, trigger or action identifier.
///
/// # Examples
///
/// ```
/// use beaconkit_core::zone::is_valid_identifier;
///
/// assert!(is_valid_identifier("lobby.entrance-1"));
/// assert!(!is_valid_identifier(""));
/// assert!(!is_valid_identifier("has space"));
/// ```
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    IDENTIFIER_RE.is_match(id)
}

/// Geographic anchor of a zone or beacon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Building floor, if relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<i32>,
}

/// Reference to an action the dispatcher knows how to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ActionRef {
    /// Action identifier.
    pub id: String,
    /// Action type tag, interpreted only by the dispatcher.
    #[serde(rename = "type")]
    pub kind: String,
    /// Free-form action parameters.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub parameters: Map<String, Value>,
}

/// A condition as declared: type tag plus parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionDefinition {
    /// Condition type tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Expression text for types that take one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// A trigger as declared: ordered conditions and one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Identifier, unique per beacon.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free-form note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Conditions in evaluation order.
    #[serde(default)]
    pub conditions: Vec<ConditionDefinition>,
    /// Action fired when every condition holds.
    pub action: ActionRef,
}

/// A beacon as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconDefinition {
    /// Namespace UUID.
    #[serde(alias = "proximityUUID", alias = "uuid")]
    pub proximity_uuid: Uuid,
    /// Major number.
    pub major: u16,
    /// Minor number.
    pub minor: u16,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Physical placement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Free-form parameters available to conditions and actions.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Triggers in configuration order.
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,
}

impl BeaconDefinition {
    /// Radio identity of the beacon.
    #[must_use]
    pub const fn beacon_id(&self) -> BeaconId {
        BeaconId::new(self.proximity_uuid, self.major, self.minor)
    }
}

/// A zone as declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDefinition {
    /// Zone identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Time to live in seconds.
    #[serde(default, alias = "ttl", skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<u64>,
    /// Geographic anchor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Beacons governed by the zone.
    #[serde(default)]
    pub beacons: Vec<BeaconDefinition>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ZoneFile {
    Many { zones: Vec<ZoneDefinition> },
    One(ZoneDefinition),
}

impl From<ZoneFile> for Vec<ZoneDefinition> {
    fn from(file: ZoneFile) -> Self {
        match file {
            ZoneFile::Many { zones } => zones,
            ZoneFile::One(zone) => vec![zone],
        }
    }
}

/// A validated set of zone definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZoneSet {
    zones: Vec<ZoneDefinition>,
}

impl ZoneSet {
    /// Build a set from definitions, validating them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for malformed identifiers and
    /// [`ConfigError::Duplicate`] for repeated zones, beacons or triggers.
    pub fn new(zones: Vec<ZoneDefinition>) -> Result<Self, ConfigError> {
        let set = Self { zones };
        set.validate()?;
        Ok(set)
    }

    /// Parse a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input, or a validation error.
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let file: ZoneFile = serde_json::from_str(input).map_err(|e| ConfigError::Parse {
            format: "json",
            message: e.to_string(),
        })?;
        Self::new(file.into())
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input, or a validation error.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: ZoneFile = toml::from_str(input).map_err(|e| ConfigError::Parse {
            format: "toml",
            message: e.to_string(),
        })?;
        Self::new(file.into())
    }

    /// Load a zone file, choosing the format from its extension.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read,
    /// [`ConfigError::UnsupportedFormat`] for extensions other than `.json`
    /// and `.toml`, or any parse or validation error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let read = || {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        };

        let set = match extension.as_deref() {
            Some("json") => Self::from_json_str(&read()?)?,
            Some("toml") => Self::from_toml_str(&read()?)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        debug!(path = %path.display(), zones = set.zones.len(), "loaded zone definitions");
        Ok(set)
    }

    /// Zone definitions in configuration order.
    #[must_use]
    pub fn zones(&self) -> &[ZoneDefinition] {
        &self.zones
    }

    /// Returns `true` if no zones are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Check identifiers and uniqueness across the whole set.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut zone_ids = HashSet::new();
        let mut beacon_ids = HashSet::new();

        for zone in &self.zones {
            check_identifier("zone.id", &zone.id)?;
            if !zone_ids.insert(zone.id.as_str()) {
                return Err(ConfigError::Duplicate {
                    kind: "zone",
                    id: zone.id.clone(),
                });
            }

            for beacon in &zone.beacons {
                let beacon_id = beacon.beacon_id();
                if !beacon_ids.insert(beacon_id) {
                    return Err(ConfigError::Duplicate {
                        kind: "beacon",
                        id: beacon_id.identifier(),
                    });
                }

                let mut trigger_ids = HashSet::new();
                for trigger in &beacon.triggers {
                    check_identifier("trigger.id", &trigger.id)?;
                    check_identifier("trigger.action.id", &trigger.action.id)?;
                    if trigger.action.kind.trim().is_empty() {
                        return Err(ConfigError::Validation {
                            field: "trigger.action.type".to_string(),
                            message: format!("trigger '{}' has an empty action type", trigger.id),
                        });
                    }
                    if !trigger_ids.insert(trigger.id.as_str()) {
                        return Err(ConfigError::Duplicate {
                            kind: "trigger",
                            id: format!("{beacon_id}/{}", trigger.id),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_identifier(field: &str, id: &str) -> Result<(), ConfigError> {
    if is_valid_identifier(id) {
        Ok(())
    } else {
        Err(ConfigError::Validation {
            field: field.to_string(),
            message: format!("'{id}' must be 1-128 characters of letters, digits, '.', '_', ':' or '-'"),
        })
    }
}
