//! Catalog of peripherals discovered during the current scan.

use std::collections::HashMap;

use log::{debug, warn};

use crate::protocol::normalize_uuid;
use crate::types::{ConnectionState, DiscoveryEvent, GattTarget, PeripheralRecord, ServiceRecord};

/// Owns every [`PeripheralRecord`] for the lifetime of one scan.
///
/// Records are kept in insertion order for display and indexed by id so
/// that repeated advertisements from the same device update one entry.
/// All mutation goes through `&mut self`, which is what keeps the
/// one-record-per-id invariant under concurrent discovery and session
/// traffic: the owner serializes access.
#[derive(Debug, Default)]
pub struct PeripheralRegistry {
    records: Vec<PeripheralRecord>,
    index: HashMap<String, usize>,
}

impl PeripheralRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly seen peripheral or refresh an existing one.
    ///
    /// RSSI is always replaced. The name is replaced when the report
    /// carries one; reports without a name (typical for advertisements
    /// split from their scan response) keep the known name. Returns `true`
    /// when a new record was created.
    pub fn upsert(&mut self, event: DiscoveryEvent) -> bool {
        let advertised: Vec<String> = event
            .service_uuids
            .iter()
            .map(|u| normalize_uuid(u))
            .collect();

        if let Some(&i) = self.index.get(&event.id) {
            let record = &mut self.records[i];
            record.rssi = event.rssi;
            if event.name.is_some() {
                record.display_name = event.name;
            }
            if !advertised.is_empty() {
                record.advertised_services = advertised;
            }
            return false;
        }

        debug!(
            "registry: new peripheral {} ({}) rssi={}",
            event.id,
            event.name.as_deref().unwrap_or("?"),
            event.rssi
        );
        self.index.insert(event.id.clone(), self.records.len());
        self.records.push(PeripheralRecord {
            id: event.id,
            display_name: event.name,
            rssi: event.rssi,
            connection_state: ConnectionState::Disconnected,
            services: vec![],
            advertised_services: advertised,
        });
        true
    }

    /// Forget every record.
    pub fn clear(&mut self) {
        self.clear_except(None);
    }

    /// Forget every record but `keep`, which stays with its link state and
    /// services. Called at the start of each scan with the peripheral of
    /// the live session, if any.
    pub fn clear_except(&mut self, keep: Option<&str>) {
        let kept = keep
            .and_then(|id| self.index.get(id).copied())
            .map(|i| self.records.swap_remove(i));
        self.records.clear();
        self.index.clear();
        if let Some(record) = kept {
            debug!("registry: keeping {} across the new scan", record.id);
            self.index.insert(record.id.clone(), 0);
            self.records.push(record);
        }
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Update the link state of `id`. Unknown ids are ignored: late events
    /// can refer to devices a newer scan already cleared.
    pub fn set_connection_state(&mut self, id: &str, state: ConnectionState) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.connection_state = state;
                true
            }
            None => {
                warn!("registry: connection state {state:?} for unknown peripheral {id} ignored");
                false
            }
        }
    }

    /// Replace the whole service list of `id`.
    pub fn set_services(&mut self, id: &str, services: Vec<ServiceRecord>) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.services = services;
                true
            }
            None => {
                warn!("registry: services for unknown peripheral {id} ignored");
                false
            }
        }
    }

    pub fn set_rssi(&mut self, id: &str, rssi: i16) -> bool {
        match self.get_mut(id) {
            Some(record) => {
                record.rssi = rssi;
                true
            }
            None => {
                warn!("registry: rssi for unknown peripheral {id} ignored");
                false
            }
        }
    }

    /// Mark the characteristic at `target` as (un)subscribed. Returns
    /// `false` if the registry does not hold that characteristic.
    pub fn set_subscribed(&mut self, target: &GattTarget, subscribed: bool) -> bool {
        let characteristic = self
            .get_mut(&target.peripheral_id)
            .and_then(|r| r.services.iter_mut().find(|s| s.uuid == target.service_uuid))
            .and_then(|s| {
                s.characteristics
                    .iter_mut()
                    .find(|c| c.uuid == target.characteristic_uuid)
            });
        match characteristic {
            Some(c) => {
                c.subscribed = subscribed;
                true
            }
            None => {
                debug!(
                    "registry: no characteristic {} on {}",
                    target.characteristic_uuid, target.peripheral_id
                );
                false
            }
        }
    }

    /// All records in the order they were first discovered.
    pub fn list(&self) -> &[PeripheralRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut PeripheralRecord> {
        let i = *self.index.get(id)?;
        self.records.get_mut(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CharacteristicRecord;

    fn advert(id: &str, name: Option<&str>, rssi: i16) -> DiscoveryEvent {
        DiscoveryEvent::new(id, name, rssi)
    }

    #[test]
    fn repeated_upserts_keep_one_record_with_latest_values() {
        let mut registry = PeripheralRegistry::new();
        assert!(registry.upsert(advert("AA:BB", Some("echo"), -70)));
        assert!(!registry.upsert(advert("AA:BB", Some("echo"), -55)));
        assert!(!registry.upsert(advert("AA:BB", Some("echo-2"), -40)));

        assert_eq!(registry.len(), 1);
        let record = registry.get("AA:BB").unwrap();
        assert_eq!(record.rssi, -40);
        assert_eq!(record.display_name.as_deref(), Some("echo-2"));
        assert_eq!(record.connection_state, ConnectionState::Disconnected);
    }

    #[test]
    fn nameless_report_keeps_known_name() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert(advert("AA:BB", Some("echo"), -70));
        registry.upsert(advert("AA:BB", None, -60));

        let record = registry.get("AA:BB").unwrap();
        assert_eq!(record.label(), "echo");
        assert_eq!(record.rssi, -60);
    }

    #[test]
    fn list_preserves_discovery_order() {
        let mut registry = PeripheralRegistry::new();
        for id in ["C", "A", "B"] {
            registry.upsert(advert(id, None, -50));
        }
        registry.upsert(advert("A", Some("again"), -30));

        let ids: Vec<&str> = registry.list().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["C", "A", "B"]);
    }

    #[test]
    fn clear_empties_the_registry() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert(advert("A", None, -50));
        registry.upsert(advert("B", None, -50));
        registry.clear();

        assert!(registry.list().is_empty());
        assert!(registry.get("A").is_none());
        assert!(registry.upsert(advert("A", None, -50)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_except_keeps_one_record_intact() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert(advert("A", None, -50));
        registry.upsert(advert("B", Some("live"), -40));
        registry.upsert(advert("C", None, -60));
        registry.set_connection_state("B", ConnectionState::Connected);
        registry.set_services("B", vec![ServiceRecord::new("ec00")]);

        registry.clear_except(Some("B"));

        assert_eq!(registry.len(), 1);
        assert!(registry.get("A").is_none());
        let record = registry.get("B").unwrap();
        assert_eq!(record.connection_state, ConnectionState::Connected);
        assert_eq!(record.services.len(), 1);
        assert!(!registry.upsert(advert("B", None, -30)));
        assert!(registry.upsert(advert("A", None, -50)));
        let ids: Vec<&str> = registry.list().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["B", "A"]);

        registry.clear_except(Some("gone"));
        assert!(registry.is_empty());
    }

    #[test]
    fn updates_for_unknown_ids_are_ignored() {
        let mut registry = PeripheralRegistry::new();
        assert!(!registry.set_connection_state("nope", ConnectionState::Connected));
        assert!(!registry.set_services("nope", vec![ServiceRecord::new("ec00")]));
        assert!(!registry.set_rssi("nope", -10));
        assert!(registry.is_empty());
    }

    #[test]
    fn set_services_overwrites_instead_of_merging() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert(advert("A", None, -50));
        registry.set_services(
            "A",
            vec![
                ServiceRecord::new("1800"),
                ServiceRecord::with_characteristics(
                    "ec00",
                    vec![CharacteristicRecord::new("ec0e", true)],
                ),
            ],
        );
        registry.set_services("A", vec![ServiceRecord::new("180d")]);

        let services = &registry.get("A").unwrap().services;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].uuid, "180d");
    }

    #[test]
    fn set_subscribed_flags_one_characteristic() {
        let mut registry = PeripheralRegistry::new();
        registry.upsert(advert("A", None, -50));
        registry.set_services(
            "A",
            vec![ServiceRecord::with_characteristics(
                "ec00",
                vec![
                    CharacteristicRecord::new("ec0e", true),
                    CharacteristicRecord::new("ec0f", true),
                ],
            )],
        );
        let target = GattTarget {
            peripheral_id: "A".into(),
            service_uuid: "ec00".into(),
            characteristic_uuid: "ec0e".into(),
        };

        assert!(registry.set_subscribed(&target, true));
        let chars = &registry.get("A").unwrap().services[0].characteristics;
        assert!(chars[0].subscribed);
        assert!(!chars[1].subscribed);

        let missing = GattTarget {
            characteristic_uuid: "ffff".into(),
            ..target
        };
        assert!(!registry.set_subscribed(&missing, true));
    }

    #[test]
    fn advertised_services_are_normalized() {
        let mut registry = PeripheralRegistry::new();
        let mut event = advert("A", Some("hr"), -50);
        event.service_uuids = vec!["180D".into()];
        registry.upsert(event);

        assert_eq!(
            registry.get("A").unwrap().advertised_services,
            ["0000180d00001000800000805f9b34fb"]
        );
    }
}
