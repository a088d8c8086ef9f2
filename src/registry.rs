use crate::host::{
    ConfigStore, ConfigStoreError, ConfigurationRecord, EntityRegistry, PersistedEntityRecord,
    RegistryError,
};
use crate::platform::Domain;
use crate::storage::{self, Storage, StorageFile};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

pub const ENTITY_REGISTRY_KEY: &str = "core.entity_registry";
pub const CONFIG_ENTRIES_KEY: &str = "sugar_valley_neopool.config_entries";
const STORAGE_VERSION: u32 = 1;
const STORAGE_MINOR_VERSION: u32 = 1;

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct EntityRegistryData {
    entities: Vec<PersistedEntityRecord>,
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct ConfigEntriesData {
    entries: Vec<ConfigurationRecord>,
}

#[derive(Default)]
pub struct Store {
    entities: Mutex<Vec<PersistedEntityRecord>>,
    entries: Mutex<Vec<ConfigurationRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lowercase alphanumerics separated by single underscores.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() { "unnamed".to_string() } else { slug }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<PersistedEntityRecord>) -> Self {
        Self { entities: Mutex::new(records), entries: Default::default() }
    }

    /// Add a record as another integration would have.
    pub fn insert_record(&self, record: PersistedEntityRecord) {
        lock(&self.entities).push(record);
    }

    pub fn record(&self, entity_id: &str) -> Option<PersistedEntityRecord> {
        lock(&self.entities).iter().find(|r| r.entity_id == entity_id).cloned()
    }

    pub async fn load(storage: &Storage) -> Result<Self, storage::Error> {
        let entities = storage
            .load::<EntityRegistryData>(ENTITY_REGISTRY_KEY, STORAGE_VERSION)
            .await?
            .map(|f| f.data)
            .unwrap_or_default();
        let entries = storage
            .load::<ConfigEntriesData>(CONFIG_ENTRIES_KEY, STORAGE_VERSION)
            .await?
            .map(|f| f.data)
            .unwrap_or_default();
        debug!(
            entities = entities.entities.len(),
            entries = entries.entries.len(),
            "loaded the registry"
        );
        Ok(Self { entities: Mutex::new(entities.entities), entries: Mutex::new(entries.entries) })
    }

    pub async fn save(&self, storage: &Storage) -> Result<(), storage::Error> {
        let entities = EntityRegistryData { entities: lock(&self.entities).clone() };
        let entries = ConfigEntriesData { entries: lock(&self.entries).clone() };
        storage
            .save(&StorageFile::new(
                ENTITY_REGISTRY_KEY,
                entities,
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await?;
        storage
            .save(&StorageFile::new(
                CONFIG_ENTRIES_KEY,
                entries,
                STORAGE_VERSION,
                STORAGE_MINOR_VERSION,
            ))
            .await
    }
}

impl EntityRegistry for Store {
    fn list_records(&self) -> Vec<PersistedEntityRecord> {
        lock(&self.entities).clone()
    }

    fn get_or_create(
        &self,
        domain: Domain,
        unique_id: &str,
        suggested_object_id: &str,
        owner: &str,
    ) -> Result<PersistedEntityRecord, RegistryError> {
        let mut entities = lock(&self.entities);
        if let Some(existing) = entities
            .iter()
            .find(|r| r.unique_id == unique_id && r.domain() == Some(domain))
        {
            return Ok(existing.clone());
        }
        let base = format!("{domain}.{}", slugify(suggested_object_id));
        let mut entity_id = base.clone();
        let mut suffix = 2;
        while entities.iter().any(|r| r.entity_id == entity_id) {
            entity_id = format!("{base}_{suffix}");
            suffix += 1;
        }
        let record = PersistedEntityRecord {
            entity_id,
            unique_id: unique_id.to_string(),
            platform: crate::DOMAIN.to_string(),
            config_entry_id: Some(owner.to_string()),
        };
        info!(entity.id = %record.entity_id, unique_id, "registered a new entity");
        entities.push(record.clone());
        Ok(record)
    }

    fn rewrite_record(
        &self,
        entity_id: &str,
        new_unique_id: &str,
        owner: &str,
    ) -> Result<PersistedEntityRecord, RegistryError> {
        let mut entities = lock(&self.entities);
        let index = entities
            .iter()
            .position(|r| r.entity_id == entity_id)
            .ok_or_else(|| RegistryError::NotFound(entity_id.to_string()))?;
        let domain = entities[index].domain_str().to_string();
        if let Some(holder) = entities.iter().find(|r| {
            r.entity_id != entity_id && r.unique_id == new_unique_id && r.domain_str() == domain
        }) {
            return Err(RegistryError::UniqueIdTaken(
                holder.entity_id.clone(),
                new_unique_id.to_string(),
            ));
        }
        let record = &mut entities[index];
        record.unique_id = new_unique_id.to_string();
        record.platform = crate::DOMAIN.to_string();
        record.config_entry_id = Some(owner.to_string());
        Ok(record.clone())
    }

    fn remove_record(&self, entity_id: &str) -> Result<(), RegistryError> {
        let mut entities = lock(&self.entities);
        let before = entities.len();
        entities.retain(|r| r.entity_id != entity_id);
        if entities.len() == before {
            return Err(RegistryError::NotFound(entity_id.to_string()));
        }
        Ok(())
    }
}

impl ConfigStore for Store {
    fn entries(&self) -> Vec<ConfigurationRecord> {
        lock(&self.entries).clone()
    }

    fn get_config(&self, unique_id: &str) -> Option<ConfigurationRecord> {
        lock(&self.entries).iter().find(|e| e.unique_id == unique_id).cloned()
    }

    fn create_config(&self, record: ConfigurationRecord) -> Result<(), ConfigStoreError> {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|e| e.unique_id == record.unique_id) {
            return Err(ConfigStoreError::AlreadyExists(record.unique_id));
        }
        entries.push(record);
        Ok(())
    }

    fn update_config(&self, record: ConfigurationRecord) -> Result<(), ConfigStoreError> {
        let mut entries = lock(&self.entries);
        let existing = entries
            .iter_mut()
            .find(|e| e.unique_id == record.unique_id)
            .ok_or_else(|| ConfigStoreError::NotFound(record.unique_id.clone()))?;
        *existing = record;
        Ok(())
    }
}
