use crate::identifier::HardwareIdentifier;
use crate::platform::{Domain, EntityValue};
use std::collections::BTreeSet;
use std::str::FromStr;

/// Schema version of [`ConfigurationRecord`] written by this release.
pub const CONFIG_VERSION: u32 = 2;
pub const DEFAULT_LEGACY_PREFIX: &str = "neopool_mqtt_";

/// The registry entry of a single entity.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PersistedEntityRecord {
    /// `{domain}.{object_id}`. Recorded history is keyed by this.
    pub entity_id: String,
    /// The persisted key.
    pub unique_id: String,
    /// Integration that provides the entity, such as `mqtt` or this bridge's domain.
    pub platform: String,
    /// Configuration record owning the entity.
    pub config_entry_id: Option<String>,
}

impl PersistedEntityRecord {
    pub fn domain_str(&self) -> &str {
        self.entity_id.split_once('.').map_or("", |(domain, _)| domain)
    }

    pub fn domain(&self) -> Option<Domain> {
        Domain::from_str(self.domain_str()).ok()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum InvalidOption {
    #[error("the failures threshold {0} is not within 1..=10")]
    FailuresThreshold(u32),
    #[error("the offline timeout of {0}s is not within 60..=3600 seconds")]
    OfflineTimeout(u64),
}

/// User adjustable behaviour of a configured device.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConfigOptions {
    pub enable_repair_notification: bool,
    /// Consecutive offline reports before a repair issue is raised.
    pub failures_threshold: u32,
    /// Seconds without telemetry after which the device counts as offline.
    pub offline_timeout: u64,
    /// Script suggested in the repair issue.
    pub recovery_script: String,
}

impl Default for ConfigOptions {
    fn default() -> Self {
        Self {
            enable_repair_notification: true,
            failures_threshold: 3,
            offline_timeout: 300,
            recovery_script: String::new(),
        }
    }
}

impl ConfigOptions {
    pub fn validate(&self) -> Result<(), InvalidOption> {
        if !(1..=10).contains(&self.failures_threshold) {
            return Err(InvalidOption::FailuresThreshold(self.failures_threshold));
        }
        if !(60..=3600).contains(&self.offline_timeout) {
            return Err(InvalidOption::OfflineTimeout(self.offline_timeout));
        }
        Ok(())
    }
}

fn default_legacy_prefix() -> String {
    DEFAULT_LEGACY_PREFIX.to_string()
}

/// One configured physical device.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigurationRecord {
    pub entry_id: String,
    /// `sugar_valley_neopool_{identifier}`. At most one record may exist per unique id.
    pub unique_id: String,
    pub version: u32,
    pub title: String,
    pub device_name: String,
    pub topic: String,
    pub identifier: HardwareIdentifier,
    /// Legacy entity records still need to be adopted.
    #[serde(default)]
    pub migrate_legacy: bool,
    #[serde(default = "default_legacy_prefix")]
    pub legacy_prefix: String,
    #[serde(default)]
    pub options: ConfigOptions,
    /// Unique ids of the entities registered for this record so far.
    #[serde(default)]
    pub created_entities: BTreeSet<String>,
    pub created_at: jiff::Timestamp,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("the configuration record is of version {0}, newer than the supported {CONFIG_VERSION}")]
pub struct DowngradeError(pub u32);

impl ConfigurationRecord {
    /// Bring a record written by an earlier release up to [`CONFIG_VERSION`].
    ///
    /// Returns whether anything changed.
    pub fn upgrade(&mut self) -> Result<bool, DowngradeError> {
        if self.version > CONFIG_VERSION {
            return Err(DowngradeError(self.version));
        }
        if self.version == CONFIG_VERSION {
            return Ok(false);
        }
        // Options were introduced with version 2 and got their defaults when deserialized.
        tracing::info!(
            entry_id = %self.entry_id,
            from = self.version,
            to = CONFIG_VERSION,
            "upgrading configuration record"
        );
        self.version = CONFIG_VERSION;
        Ok(true)
    }
}

/// The device all entities of a configuration record belong to.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub identifiers: (String, String),
    pub name: String,
    pub manufacturer: String,
    pub model: String,
    pub sw_version: String,
    pub configuration_url: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct StateUpdate {
    pub entity_id: String,
    pub unique_id: String,
    pub domain: Domain,
    pub key: &'static str,
    pub value: Option<EntityValue>,
    pub available: bool,
    pub at: jiff::Timestamp,
}

/// A problem the user should act on.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    pub description: String,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("there is no entity `{0}` in the registry")]
    NotFound(String),
    #[error("the unique id `{1}` is already used by `{0}`")]
    UniqueIdTaken(String, String),
}

pub trait EntityRegistry {
    fn list_records(&self) -> Vec<PersistedEntityRecord>;

    /// Look up the entity with `unique_id` in `domain`, registering it if there is none.
    ///
    /// An existing record is returned unchanged, so that the entity keeps its entity id.
    fn get_or_create(
        &self,
        domain: Domain,
        unique_id: &str,
        suggested_object_id: &str,
        owner: &str,
    ) -> Result<PersistedEntityRecord, RegistryError>;

    /// Change the persisted key and owner of an entity, keeping its entity id.
    ///
    /// Only the key changes, so the entity necessarily stays within its domain.
    fn rewrite_record(
        &self,
        entity_id: &str,
        new_unique_id: &str,
        owner: &str,
    ) -> Result<PersistedEntityRecord, RegistryError>;

    fn remove_record(&self, entity_id: &str) -> Result<(), RegistryError>;
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigStoreError {
    #[error("a configuration record with unique id `{0}` already exists")]
    AlreadyExists(String),
    #[error("there is no configuration record with unique id `{0}`")]
    NotFound(String),
}

pub trait ConfigStore {
    fn entries(&self) -> Vec<ConfigurationRecord>;
    fn get_config(&self, unique_id: &str) -> Option<ConfigurationRecord>;
    fn create_config(&self, record: ConfigurationRecord) -> Result<(), ConfigStoreError>;
    fn update_config(&self, record: ConfigurationRecord) -> Result<(), ConfigStoreError>;
}

pub trait StateSink {
    fn register_device(&self, device: &DeviceInfo);
    fn write_state(&self, update: &StateUpdate);
    fn raise_issue(&self, issue: &Issue);
    fn clear_issue(&self, id: &str);
}

impl<S: StateSink> StateSink for &S {
    fn register_device(&self, device: &DeviceInfo) {
        (**self).register_device(device)
    }
    fn write_state(&self, update: &StateUpdate) {
        (**self).write_state(update)
    }
    fn raise_issue(&self, issue: &Issue) {
        (**self).raise_issue(issue)
    }
    fn clear_issue(&self, id: &str) {
        (**self).clear_issue(id)
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) devices: Mutex<Vec<DeviceInfo>>,
        pub(crate) states: Mutex<Vec<StateUpdate>>,
        pub(crate) issues: Mutex<Vec<Issue>>,
    }

    impl RecordingSink {
        pub(crate) fn states(&self) -> Vec<StateUpdate> {
            self.states.lock().unwrap().clone()
        }

        pub(crate) fn issues(&self) -> Vec<Issue> {
            self.issues.lock().unwrap().clone()
        }
    }

    impl StateSink for RecordingSink {
        fn register_device(&self, device: &DeviceInfo) {
            self.devices.lock().unwrap().push(device.clone());
        }
        fn write_state(&self, update: &StateUpdate) {
            self.states.lock().unwrap().push(update.clone());
        }
        fn raise_issue(&self, issue: &Issue) {
            let mut issues = self.issues.lock().unwrap();
            issues.retain(|i| i.id != issue.id);
            issues.push(issue.clone());
        }
        fn clear_issue(&self, id: &str) {
            self.issues.lock().unwrap().retain(|i| i.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_json(version: u32) -> String {
        format!(
            r#"{{"entry_id":"e1","unique_id":"sugar_valley_neopool_ABC123","version":{version},
            "title":"NeoPool","device_name":"NeoPool","topic":"SmartPool",
            "identifier":"ABC123","created_at":"2026-01-01T00:00:00Z"}}"#
        )
    }

    #[test]
    fn upgrades_version_one() {
        let mut record: ConfigurationRecord = serde_json::from_str(&record_json(1)).unwrap();
        assert_eq!(record.options, ConfigOptions::default());
        assert_eq!(record.legacy_prefix, DEFAULT_LEGACY_PREFIX);
        assert!(!record.migrate_legacy);
        assert_eq!(record.upgrade(), Ok(true));
        assert_eq!(record.version, CONFIG_VERSION);
        assert_eq!(record.upgrade(), Ok(false));
    }

    #[test]
    fn refuses_newer_records() {
        let mut record: ConfigurationRecord = serde_json::from_str(&record_json(3)).unwrap();
        assert_eq!(record.upgrade(), Err(DowngradeError(3)));
    }

    #[test]
    fn option_ranges() {
        assert_eq!(ConfigOptions::default().validate(), Ok(()));
        let options = ConfigOptions { failures_threshold: 11, ..Default::default() };
        assert_eq!(options.validate(), Err(InvalidOption::FailuresThreshold(11)));
        let options = ConfigOptions { offline_timeout: 59, ..Default::default() };
        assert_eq!(options.validate(), Err(InvalidOption::OfflineTimeout(59)));
    }

    #[test]
    fn record_domains() {
        let record = PersistedEntityRecord {
            entity_id: "binary_sensor.neopool_relay_aux1_state".into(),
            unique_id: "neopool_mqtt_relay_aux1_state".into(),
            platform: "mqtt".into(),
            config_entry_id: None,
        };
        assert_eq!(record.domain(), Some(Domain::BinarySensor));
        let odd = PersistedEntityRecord { entity_id: "nodot".into(), ..record };
        assert_eq!(odd.domain_str(), "");
        assert_eq!(odd.domain(), None);
    }
}
