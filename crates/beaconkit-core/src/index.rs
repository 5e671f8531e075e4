//! Compiled beacon and trigger index.
//!
//! Built once per zone set. Beacons are owned here by value; the zone
//! relation is a lookup by zone id rather than a back-pointer.

use std::collections::HashMap;

use crate::condition::{ConditionCheck, ConditionRegistry};
use crate::error::ConfigError;
use crate::types::{BeaconId, EventType};
use crate::zone::{ActionRef, BeaconDefinition, TriggerDefinition, ZoneDefinition, ZoneSet};

/// A trigger with its conditions resolved to checks.
#[derive(Debug)]
pub struct Trigger {
    definition: TriggerDefinition,
    conditions: Vec<Box<dyn ConditionCheck>>,
}

impl Trigger {
    fn compile(definition: &TriggerDefinition, registry: &ConditionRegistry) -> Result<Self, ConfigError> {
        let conditions = definition
            .conditions
            .iter()
            .map(|condition| registry.compile(&definition.id, condition))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            definition: definition.clone(),
            conditions,
        })
    }

    /// Trigger identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Display name, falling back to the identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        if self.definition.name.is_empty() {
            &self.definition.id
        } else {
            &self.definition.name
        }
    }

    /// Action to dispatch when the trigger fires.
    #[must_use]
    pub const fn action(&self) -> &ActionRef {
        &self.definition.action
    }

    /// Conditions in evaluation order.
    #[must_use]
    pub fn conditions(&self) -> &[Box<dyn ConditionCheck>] {
        &self.conditions
    }

    /// Returns `true` if every event restriction on the trigger admits `event`.
    /// A trigger with no restriction applies to all event types.
    #[must_use]
    pub fn applies_to(&self, event: EventType) -> bool {
        self.conditions
            .iter()
            .filter_map(|condition| condition.applicable_events())
            .all(|events| events.contains(&event))
    }
}

/// A beacon with its compiled triggers.
#[derive(Debug)]
pub struct IndexedBeacon {
    id: BeaconId,
    zone: String,
    definition: BeaconDefinition,
    triggers: Vec<Trigger>,
}

impl IndexedBeacon {
    /// Radio identity.
    #[must_use]
    pub const fn id(&self) -> BeaconId {
        self.id
    }

    /// Identifier of the owning zone.
    #[must_use]
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Display name, falling back to the identifier.
    #[must_use]
    pub fn name(&self) -> String {
        if self.definition.name.is_empty() {
            self.id.identifier()
        } else {
            self.definition.name.clone()
        }
    }

    /// Triggers that apply to `event`, in configuration order.
    pub fn triggers_for(&self, event: EventType) -> impl Iterator<Item = &Trigger> {
        self.triggers.iter().filter(move |trigger| trigger.applies_to(event))
    }
}

/// Beacons by identity plus zone metadata.
#[derive(Debug, Default)]
pub struct BeaconIndex {
    beacons: HashMap<BeaconId, IndexedBeacon>,
    zones: HashMap<String, ZoneDefinition>,
}

impl BeaconIndex {
    /// Compile every trigger of every beacon in `zones`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] from validation or condition
    /// compilation.
    pub fn build(zones: &ZoneSet, registry: &ConditionRegistry) -> Result<Self, ConfigError> {
        zones.validate()?;

        let mut index = Self::default();
        for zone in zones.zones() {
            for beacon in &zone.beacons {
                let triggers = beacon
                    .triggers
                    .iter()
                    .map(|trigger| Trigger::compile(trigger, registry))
                    .collect::<Result<Vec<_>, _>>()?;
                let id = beacon.beacon_id();
                index.beacons.insert(
                    id,
                    IndexedBeacon {
                        id,
                        zone: zone.id.clone(),
                        definition: beacon.clone(),
                        triggers,
                    },
                );
            }

            let mut metadata = zone.clone();
            metadata.beacons.clear();
            index.zones.insert(zone.id.clone(), metadata);
        }
        Ok(index)
    }

    /// Look up a beacon.
    #[must_use]
    pub fn beacon(&self, id: BeaconId) -> Option<&IndexedBeacon> {
        self.beacons.get(&id)
    }

    /// Zone metadata (without beacons) for `zone_id`.
    #[must_use]
    pub fn zone(&self, zone_id: &str) -> Option<&ZoneDefinition> {
        self.zones.get(zone_id)
    }

    /// Zone owning the beacon.
    #[must_use]
    pub fn zone_of(&self, id: BeaconId) -> Option<&ZoneDefinition> {
        self.beacon(id).and_then(|beacon| self.zone(&beacon.zone))
    }

    /// Number of zones.
    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Number of beacons.
    #[must_use]
    pub fn beacon_count(&self) -> usize {
        self.beacons.len()
    }

    /// Number of compiled triggers.
    #[must_use]
    pub fn trigger_count(&self) -> usize {
        self.beacons.values().map(|beacon| beacon.triggers.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ZONES: &str = r#"{ "zones": [{
        "id": "hall",
        "name": "Main hall",
        "beacons": [{
            "proximity_uuid": "f7826da6-4fa2-4e98-8024-bc5b71e0893e",
            "major": 3,
            "minor": 9,
            "triggers": [
                { "id": "on-enter",
                  "conditions": [{ "type": "event_type", "parameters": { "events": ["enter"] } }],
                  "action": { "id": "a1", "type": "log" } },
                { "id": "any",
                  "action": { "id": "a2", "type": "log" } },
                { "id": "on-leave",
                  "conditions": [{ "type": "event_type", "parameters": { "events": ["leave"] } }],
                  "action": { "id": "a3", "type": "log" } }
            ]
        }]
    }] }"#;

    fn build() -> BeaconIndex {
        let zones = ZoneSet::from_json_str(ZONES).unwrap();
        BeaconIndex::build(&zones, &ConditionRegistry::default()).unwrap()
    }

    #[test]
    fn test_counts_and_zone_lookup() {
        let index = build();
        assert_eq!(index.zone_count(), 1);
        assert_eq!(index.beacon_count(), 1);
        assert_eq!(index.trigger_count(), 3);

        let id = "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-3-9".parse().unwrap();
        assert_eq!(index.zone_of(id).map(|z| z.name.as_str()), Some("Main hall"));
        assert!(index.zone("hall").unwrap().beacons.is_empty());
    }

    #[test]
    fn test_triggers_filtered_by_event_in_order() {
        let index = build();
        let id = "F7826DA6-4FA2-4E98-8024-BC5B71E0893E-3-9".parse().unwrap();
        let beacon = index.beacon(id).unwrap();

        let enter: Vec<&str> = beacon.triggers_for(EventType::Enter).map(Trigger::id).collect();
        let leave: Vec<&str> = beacon.triggers_for(EventType::Exit).map(Trigger::id).collect();
        let range: Vec<&str> = beacon.triggers_for(EventType::Range).map(Trigger::id).collect();

        assert_eq!(enter, vec!["on-enter", "any"]);
        assert_eq!(leave, vec!["any", "on-leave"]);
        assert_eq!(range, vec!["any"]);
    }

    #[test]
    fn test_unknown_condition_fails_build() {
        let json = ZONES.replace("event_type", "unheard_of");
        let zones = ZoneSet::from_json_str(&json).unwrap();
        let err = BeaconIndex::build(&zones, &ConditionRegistry::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownConditionType { .. }));
    }
}
