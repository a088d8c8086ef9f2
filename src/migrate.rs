//! Adoption of entity records whose persisted key predates the identifier scoped shape.
//!
//! A pass is planned in full before anything is written. Planning needs the live identifier
//! only when masked records are present; if it cannot be obtained the pass is abandoned
//! without touching the registry and is retried on the next start.

use crate::bus::Bus;
use crate::host::{ConfigStore, ConfigStoreError, ConfigurationRecord, EntityRegistry, PersistedEntityRecord};
use crate::identifier::{self, HardwareIdentifier};
use crate::platform::{self, Domain, EntityDescriptor};
use crate::setup::{self, Timeouts};
use std::collections::{BTreeSet, HashSet};
use tracing::{error, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not resolve the live identifier of the device at `{1}`, will retry on the next start")]
    Resolve(#[source] setup::Error, String),
    #[error("the device reports the identifier {live}, but the configuration is for {configured}")]
    IdentifierMismatch { configured: HardwareIdentifier, live: HardwareIdentifier },
    #[error("could not update the configuration record")]
    Store(#[source] ConfigStoreError),
}

#[derive(Clone, Debug, Default)]
pub struct Options {
    /// Remove records whose function moved to an entity of another domain.
    pub remove_orphans: bool,
    pub timeouts: Timeouts,
}

/// Maps a key used by earlier integrations to the current entity key.
pub type KeyMap = fn(&str) -> &str;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Rewrite { entity_id: String, from: String, to: String },
    /// The target key is already held by `holder`, or produced earlier in the same pass.
    Collision { entity_id: String, from: String, to: String, holder: String },
    /// The entity key now belongs to another domain, so the record cannot be renamed.
    CrossDomain { entity_id: String, unique_id: String, domains: BTreeSet<Domain> },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct MigrationReport {
    pub rewritten: usize,
    pub collisions: usize,
    pub skipped_cross_domain: usize,
    pub removed_orphans: usize,
    pub failed: usize,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum Candidate<'a> {
    Legacy(&'a str),
    Masked(&'a str),
}

/// Classify `record` and extract its entity key, `None` if it needs no migration.
fn candidate<'a>(
    record: &'a PersistedEntityRecord,
    config: &ConfigurationRecord,
) -> Option<Candidate<'a>> {
    let prefix = config.legacy_prefix.as_str();
    let rest = record.unique_id.strip_prefix(prefix)?;
    if record.unique_id.starts_with(&config.identifier.persisted_key_prefix()) {
        return None;
    }
    let foreign = record.platform != crate::DOMAIN;
    if identifier::is_masked_unique_id(&record.unique_id) {
        let ours = record.config_entry_id.as_deref() == Some(config.entry_id.as_str());
        if !(foreign || ours || record.config_entry_id.is_none()) {
            return None;
        }
        return identifier::masked_entity_key(&record.unique_id, prefix).map(Candidate::Masked);
    }
    if !(foreign || record.config_entry_id.is_none()) || rest.is_empty() {
        return None;
    }
    Some(Candidate::Legacy(rest))
}

/// Whether any record needs the live identifier to be migrated.
pub fn needs_live_identifier(records: &[PersistedEntityRecord], config: &ConfigurationRecord) -> bool {
    records.iter().any(|r| matches!(candidate(r, config), Some(Candidate::Masked(_))))
}

/// Decide what happens to every record, in listing order.
///
/// Masked records are left out when `live` is `None`.
pub fn plan(
    records: &[PersistedEntityRecord],
    config: &ConfigurationRecord,
    live: Option<&HardwareIdentifier>,
    key_map: KeyMap,
) -> Vec<Action> {
    let mut targets = HashSet::new();
    let mut actions = Vec::new();
    for record in records {
        let key = match candidate(record, config) {
            None => continue,
            Some(Candidate::Masked(_)) if live.is_none() => continue,
            Some(Candidate::Legacy(key) | Candidate::Masked(key)) => key_map(key),
        };
        let domains = EntityDescriptor::domains_of(key);
        let same_domain = record.domain().is_some_and(|d| domains.contains(&d));
        if !domains.is_empty() && !same_domain {
            actions.push(Action::CrossDomain {
                entity_id: record.entity_id.clone(),
                unique_id: record.unique_id.clone(),
                domains,
            });
            continue;
        }
        let to = config.identifier.persisted_key(key);
        let domain = record.domain();
        let holder = records
            .iter()
            .find(|other| {
                other.unique_id == to && other.domain() == domain && other.entity_id != record.entity_id
            })
            .map(|other| other.entity_id.clone());
        let holder = match holder {
            Some(holder) => Some(holder),
            None if targets.contains(&(domain, to.clone())) => {
                Some("an earlier record of this pass".to_string())
            }
            None => None,
        };
        let from = record.unique_id.clone();
        let entity_id = record.entity_id.clone();
        match holder {
            Some(holder) => actions.push(Action::Collision { entity_id, from, to, holder }),
            None => {
                targets.insert((domain, to.clone()));
                actions.push(Action::Rewrite { entity_id, from, to });
            }
        }
    }
    actions
}

/// Run one migration pass for `config` with the built-in legacy key table.
pub async fn run<H: EntityRegistry + ConfigStore>(
    bus: &impl Bus,
    host: &H,
    config: &mut ConfigurationRecord,
    options: &Options,
) -> Result<MigrationReport, Error> {
    run_with_keys(bus, host, config, options, platform::translate_legacy_key).await
}

pub async fn run_with_keys<H: EntityRegistry + ConfigStore>(
    bus: &impl Bus,
    host: &H,
    config: &mut ConfigurationRecord,
    options: &Options,
    key_map: KeyMap,
) -> Result<MigrationReport, Error> {
    let records = host.list_records();
    let live = if needs_live_identifier(&records, config) {
        let live = setup::resolve_identifier(bus, &config.topic, &options.timeouts)
            .await
            .map_err(|e| {
                warn!(
                    topic = %config.topic,
                    error = (&e as &dyn std::error::Error),
                    "could not resolve the identifier, skipping the migration"
                );
                Error::Resolve(e, config.topic.clone())
            })?;
        if live != config.identifier {
            warn!(configured = %config.identifier, %live, "a different device answers on the topic");
            return Err(Error::IdentifierMismatch { configured: config.identifier.clone(), live });
        }
        Some(live)
    } else {
        None
    };

    let mut report = MigrationReport::default();
    for action in plan(&records, config, live.as_ref(), key_map) {
        match action {
            Action::Rewrite { entity_id, from, to } => {
                match host.rewrite_record(&entity_id, &to, &config.entry_id) {
                    Ok(_) => {
                        info!(%entity_id, %from, %to, "rewrote the persisted key");
                        report.rewritten += 1;
                    }
                    Err(e) => {
                        error!(
                            %entity_id,
                            error = (&e as &dyn std::error::Error),
                            "could not rewrite the persisted key"
                        );
                        report.failed += 1;
                    }
                }
            }
            Action::Collision { entity_id, from, to, holder } => {
                warn!(%entity_id, %from, %to, %holder, "the target key is taken, remove one of them by hand");
                report.collisions += 1;
            }
            Action::CrossDomain { entity_id, unique_id, domains } => {
                report.skipped_cross_domain += 1;
                if !options.remove_orphans {
                    info!(%entity_id, %unique_id, ?domains, "left in place, the entity moved to another domain");
                    continue;
                }
                match host.remove_record(&entity_id) {
                    Ok(()) => {
                        info!(%entity_id, %unique_id, "removed the orphaned record");
                        report.removed_orphans += 1;
                    }
                    Err(e) => {
                        error!(
                            %entity_id,
                            error = (&e as &dyn std::error::Error),
                            "could not remove the orphaned record"
                        );
                        report.failed += 1;
                    }
                }
            }
        }
    }

    if config.migrate_legacy {
        config.migrate_legacy = false;
        host.update_config(config.clone()).map_err(Error::Store)?;
    }
    if !report.is_empty() {
        info!(
            unique_id = %config.unique_id,
            rewritten = report.rewritten,
            collisions = report.collisions,
            skipped_cross_domain = report.skipped_cross_domain,
            removed_orphans = report.removed_orphans,
            failed = report.failed,
            "migration finished"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::registry::Store;
    use crate::registry::fixtures::record;
    use std::collections::BTreeMap;

    async fn configured(store: &Store, identifier: &str) -> ConfigurationRecord {
        let identifier = HardwareIdentifier::new(identifier).unwrap();
        setup::create_configuration_record(store, "Pool", "SmartPool", identifier, Some("neopool_mqtt_"))
            .await
            .unwrap()
    }

    fn keys(store: &Store) -> BTreeMap<String, String> {
        store.list_records().into_iter().map(|r| (r.entity_id, r.unique_id)).collect()
    }

    fn scenario_keys(key: &str) -> &str {
        match key {
            "old_temp" => "temp",
            key => key,
        }
    }

    fn aux_keys(key: &str) -> &str {
        match key {
            "relay_aux1" => "aux1",
            key => key,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn adopts_unscoped_records() {
        let bus = MemoryBus::new();
        let store = Store::new();
        store.insert_record(record(
            "sensor.neopool_water_temperature",
            "neopool_mqtt_water_temperature",
            "mqtt",
            None,
        ));
        let mut config = configured(&store, "ABC123").await;
        assert!(config.migrate_legacy);

        let report = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert_eq!(report, MigrationReport { rewritten: 1, ..Default::default() });
        let migrated = store.record("sensor.neopool_water_temperature").unwrap();
        assert_eq!(migrated.unique_id, "neopool_mqtt_ABC123_water_temperature");
        assert_eq!(migrated.config_entry_id.as_deref(), Some(config.entry_id.as_str()));
        assert_eq!(migrated.platform, crate::DOMAIN);
        assert!(!config.migrate_legacy);
        assert!(!store.get_config(&config.unique_id).unwrap().migrate_legacy);
        // Only masked records need the device.
        assert!(bus.published().is_empty());
        assert_eq!(bus.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_colliding_targets() {
        let bus = MemoryBus::new();
        bus.retain("tele/SmartPool/SENSOR", r#"{"NeoPool":{"Powerunit":{"NodeID":"ABC123"}}}"#);
        let store = Store::new();
        store.insert_record(record("sensor.masked_temp", "neopool_mqtt_XXXX_temp", "mqtt", None));
        store.insert_record(record("sensor.old_temp", "neopool_mqtt_old_temp", "mqtt", None));
        let mut config = configured(&store, "ABC123").await;

        let report =
            run_with_keys(&bus, &store, &mut config, &Options::default(), scenario_keys).await.unwrap();
        assert_eq!(report, MigrationReport { rewritten: 1, collisions: 1, ..Default::default() });
        let keys = keys(&store);
        assert_eq!(keys["sensor.masked_temp"], "neopool_mqtt_ABC123_temp");
        assert_eq!(keys["sensor.old_temp"], "neopool_mqtt_old_temp");
    }

    #[tokio::test(start_paused = true)]
    async fn collides_with_existing_keys() {
        let bus = MemoryBus::new();
        let store = Store::new();
        store.insert_record(record("sensor.ph", "neopool_mqtt_ph_data", "mqtt", None));
        let mut config = configured(&store, "ABC123").await;
        store.insert_record(record(
            "sensor.pool_ph",
            "neopool_mqtt_ABC123_ph_data",
            crate::DOMAIN,
            Some(config.entry_id.as_str()),
        ));
        let report = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert_eq!(report, MigrationReport { collisions: 1, ..Default::default() });
        assert_eq!(keys(&store)["sensor.ph"], "neopool_mqtt_ph_data");
    }

    #[tokio::test(start_paused = true)]
    async fn second_pass_changes_nothing() {
        let bus = MemoryBus::new();
        bus.retain("tele/SmartPool/SENSOR", r#"{"NeoPool":{"Powerunit":{"NodeID":"ABC123"}}}"#);
        let store = Store::new();
        store.insert_record(record("sensor.ph", "neopool_mqtt_ph_data", "mqtt", None));
        store.insert_record(record(
            "sensor.redox",
            "neopool_mqtt_XXXX XXXX XXXX XXXX XXXX 3435_redox_data",
            "mqtt",
            None,
        ));
        store.insert_record(record("switch.light", "neopool_mqtt_light", "mqtt", None));
        let mut config = configured(&store, "ABC123").await;

        let first = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert_eq!(first.rewritten, 3);
        let after_first = keys(&store);
        assert_eq!(after_first["sensor.redox"], "neopool_mqtt_ABC123_redox_data");

        let second = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(keys(&store), after_first);

        let unique = keys(&store).into_values().collect::<BTreeSet<_>>();
        assert_eq!(unique.len(), store.list_records().len());
    }

    #[tokio::test(start_paused = true)]
    async fn leaves_cross_domain_records() {
        let bus = MemoryBus::new();
        let store = Store::new();
        store.insert_record(record(
            "binary_sensor.neopool_relay_aux1_state",
            "neopool_mqtt_relay_aux1_state",
            "mqtt",
            None,
        ));
        let mut config = configured(&store, "ABC123").await;

        let report = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert_eq!(report, MigrationReport { skipped_cross_domain: 1, ..Default::default() });
        assert_eq!(
            keys(&store)["binary_sensor.neopool_relay_aux1_state"],
            "neopool_mqtt_relay_aux1_state"
        );

        let options = Options { remove_orphans: true, ..Default::default() };
        let report = run(&bus, &store, &mut config, &options).await.unwrap();
        assert_eq!(
            report,
            MigrationReport { skipped_cross_domain: 1, removed_orphans: 1, ..Default::default() }
        );
        assert!(store.list_records().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_identifier_aborts_the_pass() {
        let bus = MemoryBus::new();
        let store = Store::new();
        store.insert_record(record("sensor.ph", "neopool_mqtt_ph_data", "mqtt", None));
        store.insert_record(record("sensor.redox", "neopool_mqtt_XXXX_redox_data", "mqtt", None));
        let mut config = configured(&store, "ABC123").await;
        let before = keys(&store);

        let result = run(&bus, &store, &mut config, &Options::default()).await;
        assert!(matches!(result, Err(Error::Resolve(setup::Error::Timeout(..), _))));
        assert_eq!(keys(&store), before);
        assert!(config.migrate_legacy);
        assert_eq!(bus.active_subscriptions(), 0);

        bus.retain("tele/SmartPool/SENSOR", r#"{"NeoPool":{"Powerunit":{"NodeID":"FFFF01"}}}"#);
        let result = run(&bus, &store, &mut config, &Options::default()).await;
        assert!(matches!(result, Err(Error::IdentifierMismatch { .. })));
        assert_eq!(keys(&store), before);
    }

    #[tokio::test]
    async fn ignores_records_of_other_devices() {
        let store = Store::new();
        let config = configured(&store, "ABC123").await;
        let records = vec![
            record("sensor.a", "neopool_mqtt_ABC123_ph_data", crate::DOMAIN, Some(config.entry_id.as_str())),
            record("sensor.b", "neopool_mqtt_FFFF01_ph_data", crate::DOMAIN, Some("other")),
            record("sensor.c", "neopool_mqtt_XXXX_ph_data", crate::DOMAIN, Some("other")),
            record("sensor.d", "unrelated_ph_data", "mqtt", None),
        ];
        assert!(!needs_live_identifier(&records, &config));
        assert!(plan(&records, &config, None, platform::translate_legacy_key).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_in_two_domains_is_not_a_collision() {
        let bus = MemoryBus::new();
        let store = Store::new();
        store.insert_record(record("sensor.pool_filtration", "neopool_mqtt_filtration_mode", "mqtt", None));
        store.insert_record(record("select.pool_filtration", "neopool_mqtt_filtration_mode", "mqtt", None));
        let mut config = configured(&store, "ABC123").await;
        store.insert_record(record(
            "select.pool_filtration_speed",
            "neopool_mqtt_ABC123_filtration_speed",
            crate::DOMAIN,
            Some(config.entry_id.as_str()),
        ));
        store.insert_record(record("sensor.pool_speed", "neopool_mqtt_filtration_speed", "mqtt", None));

        let report = run(&bus, &store, &mut config, &Options::default()).await.unwrap();
        assert_eq!(report, MigrationReport { rewritten: 3, ..Default::default() });
        let keys = keys(&store);
        assert_eq!(keys["sensor.pool_filtration"], "neopool_mqtt_ABC123_filtration_mode");
        assert_eq!(keys["select.pool_filtration"], "neopool_mqtt_ABC123_filtration_mode");
        assert_eq!(keys["sensor.pool_speed"], "neopool_mqtt_ABC123_filtration_speed");
    }

    #[tokio::test]
    async fn translates_legacy_keys() {
        let store = Store::new();
        let config = configured(&store, "ABC123").await;
        let records = vec![
            record("switch.aux1", "neopool_mqtt_relay_aux1", "mqtt", None),
            record("sensor.masked", "neopool_mqtt_XXXX_ph_data", "mqtt", None),
        ];
        assert!(needs_live_identifier(&records, &config));
        // Without the live identifier masked records wait for the next pass.
        let actions = plan(&records, &config, None, aux_keys);
        assert_eq!(
            actions,
            vec![Action::Rewrite {
                entity_id: "switch.aux1".into(),
                from: "neopool_mqtt_relay_aux1".into(),
                to: "neopool_mqtt_ABC123_aux1".into(),
            }]
        );
    }
}
