use crate::bus::{self, Bus, Subscription};
use crate::host::{
    ConfigOptions, ConfigStore, ConfigStoreError, ConfigurationRecord, DeviceInfo,
    DowngradeError, EntityRegistry, Issue, RegistryError, StateSink,
};
use crate::migrate;
use crate::platform::EntityDescriptor;
use crate::platform::entity::Entity;
use crate::topics;
use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not load the configuration of `{1}`")]
    Upgrade(#[source] DowngradeError, String),
    #[error("could not update the configuration record")]
    Store(#[source] ConfigStoreError),
    #[error("could not register the entity `{1}`")]
    Register(#[source] RegistryError, String),
    #[error("could not subscribe for `{1}`")]
    Subscribe(#[source] bus::Error, String),
}

pub fn device_info(config: &ConfigurationRecord) -> DeviceInfo {
    DeviceInfo {
        identifiers: (crate::DOMAIN.to_string(), config.identifier.to_string()),
        name: config.device_name.clone(),
        manufacturer: crate::MANUFACTURER.to_string(),
        model: crate::MODEL.to_string(),
        sw_version: env!("CARGO_PKG_VERSION").to_string(),
        configuration_url: crate::CONFIGURATION_URL.to_string(),
    }
}

/// A started device, ready to follow its telemetry.
pub struct Device {
    pub config: ConfigurationRecord,
    pub entities: Vec<Entity>,
    pub monitor: AvailabilityMonitor,
}

impl Device {
    pub fn entity(&self, key: &str) -> Option<&Entity> {
        self.entities.iter().find(|e| e.descriptor().key() == key)
    }

    /// Forward state changes to `sink` until the bus goes away.
    pub async fn run(self, sink: &impl StateSink) {
        let entities = join_all(self.entities.into_iter().map(|e| e.run(sink)));
        futures::future::join(entities, self.monitor.run(sink)).await;
    }
}

/// Start the device described by `config`.
///
/// A failing migration is logged and left for the next start, it never prevents the entities
/// from coming up.
pub async fn start<B: Bus, H: EntityRegistry + ConfigStore>(
    bus: &B,
    host: &H,
    sink: &impl StateSink,
    mut config: ConfigurationRecord,
    migration: &migrate::Options,
) -> Result<Device, Error> {
    if config.upgrade().map_err(|e| Error::Upgrade(e, config.unique_id.clone()))? {
        host.update_config(config.clone()).map_err(Error::Store)?;
    }
    match migrate::run(bus, host, &mut config, migration).await {
        Ok(report) => debug!(?report, "migration pass done"),
        Err(e) => warn!(
            unique_id = %config.unique_id,
            error = (&e as &dyn std::error::Error),
            "migration pass abandoned"
        ),
    }

    sink.register_device(&device_info(&config));
    let mut entities = Vec::new();
    let mut created = config.created_entities.clone();
    for descriptor in EntityDescriptor::all() {
        let unique_id = config.identifier.persisted_key(descriptor.key());
        let suggested = format!("{} {}", config.device_name, descriptor.name());
        let record = host
            .get_or_create(descriptor.domain(), &unique_id, &suggested, &config.entry_id)
            .map_err(|e| Error::Register(e, unique_id.clone()))?;
        created.insert(record.unique_id.clone());
        entities.push(Entity::new(descriptor, &config.topic, record.unique_id, record.entity_id));
    }
    if created != config.created_entities {
        config.created_entities = created;
        host.update_config(config.clone()).map_err(Error::Store)?;
    }
    for entity in &mut entities {
        entity
            .activate(bus)
            .await
            .map_err(|e| Error::Subscribe(e, entity.entity_id().to_string()))?;
    }
    let monitor = AvailabilityMonitor::subscribe(bus, &config).await?;
    info!(
        unique_id = %config.unique_id,
        topic = %config.topic,
        entities = entities.len(),
        "device started"
    );
    Ok(Device { config, entities, monitor })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Observation {
    Online,
    Offline,
    Telemetry,
    /// Nothing was heard from the device for the offline timeout.
    Silence,
}

/// Counts consecutive failures of a device and raises a repair issue once they reach the
/// configured threshold.
pub struct AvailabilityMonitor {
    entry_id: String,
    device_name: String,
    topic: String,
    options: ConfigOptions,
    failures: u32,
    raised: bool,
    liveness: Option<Subscription>,
    telemetry: Option<Subscription>,
}

impl AvailabilityMonitor {
    pub fn new(config: &ConfigurationRecord) -> Self {
        Self {
            entry_id: config.entry_id.clone(),
            device_name: config.device_name.clone(),
            topic: config.topic.clone(),
            options: config.options.clone(),
            failures: 0,
            raised: false,
            liveness: None,
            telemetry: None,
        }
    }

    pub async fn subscribe(bus: &impl Bus, config: &ConfigurationRecord) -> Result<Self, Error> {
        let mut monitor = Self::new(config);
        let liveness = topics::liveness(&config.topic);
        monitor.liveness =
            Some(bus.subscribe(&liveness).await.map_err(|e| Error::Subscribe(e, liveness))?);
        let telemetry = topics::telemetry(&config.topic);
        monitor.telemetry =
            Some(bus.subscribe(&telemetry).await.map_err(|e| Error::Subscribe(e, telemetry))?);
        Ok(monitor)
    }

    pub fn issue_id(&self) -> String {
        format!("device_offline_{}", self.entry_id)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn issue(&self) -> Issue {
        let mut description = format!(
            "No telemetry has been received from `{}` after {} consecutive failures.",
            self.topic, self.failures
        );
        if !self.options.recovery_script.is_empty() {
            description.push_str(&format!(
                " Run the `{}` script to recover the device.",
                self.options.recovery_script
            ));
        }
        Issue { id: self.issue_id(), title: format!("{} is offline", self.device_name), description }
    }

    pub fn observe(&mut self, observation: Observation, sink: &impl StateSink) {
        match observation {
            Observation::Online | Observation::Telemetry => {
                if self.raised {
                    info!(topic = %self.topic, "device is back online");
                    sink.clear_issue(&self.issue_id());
                    self.raised = false;
                }
                self.failures = 0;
            }
            Observation::Offline | Observation::Silence => {
                self.failures = self.failures.saturating_add(1);
                warn!(topic = %self.topic, failures = self.failures, ?observation, "device unreachable");
                let notify = self.options.enable_repair_notification;
                if notify && !self.raised && self.failures >= self.options.failures_threshold {
                    sink.raise_issue(&self.issue());
                    self.raised = true;
                }
            }
        }
    }

    pub async fn run(mut self, sink: &impl StateSink) {
        let (Some(mut liveness), Some(mut telemetry)) = (self.liveness.take(), self.telemetry.take())
        else {
            return;
        };
        let timeout = Duration::from_secs(self.options.offline_timeout);
        loop {
            let observation = tokio::select! {
                message = liveness.recv() => match message {
                    None => break,
                    Some(m) if m.payload == topics::PAYLOAD_OFFLINE.as_bytes() => Observation::Offline,
                    Some(m) if m.payload == topics::PAYLOAD_ONLINE.as_bytes() => Observation::Online,
                    Some(_) => continue,
                },
                message = telemetry.recv() => match message {
                    None => break,
                    Some(_) => Observation::Telemetry,
                },
                () = tokio::time::sleep(timeout) => Observation::Silence,
            };
            self.observe(observation, sink);
        }
        debug!(topic = %self.topic, "availability monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::host::recording::RecordingSink;
    use crate::identifier::HardwareIdentifier;
    use crate::platform::{Domain, EntityValue};
    use crate::registry::Store;
    use crate::registry::fixtures::record;
    use crate::setup::create_configuration_record;

    async fn configured(store: &Store) -> ConfigurationRecord {
        let identifier = HardwareIdentifier::new("ABC123").unwrap();
        create_configuration_record(store, "Pool", "SmartPool", identifier, Some("neopool_mqtt_"))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn starts_every_entity() {
        let bus = MemoryBus::new();
        bus.retain("tele/SmartPool/LWT", "Online");
        bus.retain("tele/SmartPool/SENSOR", r#"{"NeoPool":{"Temperature":27.5}}"#);
        let store = Store::new();
        store.insert_record(record(
            "sensor.neopool_water_temperature",
            "neopool_mqtt_water_temperature",
            "mqtt",
            None,
        ));
        let sink = RecordingSink::default();
        let config = configured(&store).await;

        let device =
            start(&bus, &store, &sink, config, &migrate::Options::default()).await.unwrap();
        assert_eq!(device.entities.len(), EntityDescriptor::all().count());
        // The adopted record keeps its entity id.
        let temperature = device.entity("water_temperature").unwrap();
        assert_eq!(temperature.entity_id(), "sensor.neopool_water_temperature");
        assert_eq!(temperature.unique_id(), "neopool_mqtt_ABC123_water_temperature");
        assert!(!device.config.migrate_legacy);

        let stored = store.get_config(&device.config.unique_id).unwrap();
        assert_eq!(stored.created_entities.len(), device.entities.len());
        let devices = sink.devices.lock().unwrap().clone();
        assert_eq!(devices[0].identifiers, ("sugar_valley_neopool".into(), "ABC123".into()));
        assert_eq!(devices[0].manufacturer, "Sugar Valley");

        let light = device.entity("light").unwrap();
        assert_eq!(light.entity_id(), "switch.pool_light");
        assert!(store.list_records().iter().any(|r| r.domain() == Some(Domain::Button)));
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_keep_entity_ids() {
        let bus = MemoryBus::new();
        let store = Store::new();
        let sink = RecordingSink::default();
        let config = configured(&store).await;
        let first = start(&bus, &store, &sink, config, &Default::default()).await.unwrap();
        let count = store.list_records().len();
        let config = store.get_config(&first.config.unique_id).unwrap();
        drop(first);
        let second = start(&bus, &store, &sink, config, &Default::default()).await.unwrap();
        assert_eq!(store.list_records().len(), count);
        assert_eq!(second.entity("ph_data").unwrap().entity_id(), "sensor.pool_ph");
    }

    #[tokio::test(start_paused = true)]
    async fn streams_states() {
        let bus = MemoryBus::new();
        let store = Store::new();
        let sink = RecordingSink::default();
        let config = configured(&store).await;
        let device = start(&bus, &store, &sink, config, &Default::default()).await.unwrap();
        let running = tokio::time::timeout(Duration::from_secs(1), device.run(&sink));
        let publishing = async {
            bus.inject("tele/SmartPool/LWT", "Online");
            bus.inject("tele/SmartPool/SENSOR", r#"{"NeoPool":{"Temperature":27.5}}"#);
        };
        let (result, ()) = tokio::join!(running, publishing);
        assert!(result.is_err());
        let temperature = sink
            .states()
            .into_iter()
            .filter(|s| s.key == "water_temperature")
            .last()
            .unwrap();
        assert!(temperature.available);
        assert_eq!(temperature.value, Some(EntityValue::Number(27.5)));
        assert!(sink.issues().is_empty());
    }

    #[test]
    fn raises_and_clears_issues() {
        let sink = RecordingSink::default();
        let mut config = {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(configured(&Store::new()))
        };
        config.options.recovery_script = "script.restart_pool".into();
        let mut monitor = AvailabilityMonitor::new(&config);
        monitor.observe(Observation::Offline, &sink);
        monitor.observe(Observation::Silence, &sink);
        assert!(sink.issues().is_empty());
        monitor.observe(Observation::Offline, &sink);
        let issues = sink.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].title, "Pool is offline");
        assert!(issues[0].description.contains("script.restart_pool"));
        monitor.observe(Observation::Offline, &sink);
        assert_eq!(sink.issues().len(), 1);
        monitor.observe(Observation::Telemetry, &sink);
        assert!(sink.issues().is_empty());
        assert_eq!(monitor.failures(), 0);

        config.options.enable_repair_notification = false;
        let mut quiet = AvailabilityMonitor::new(&config);
        for _ in 0..5 {
            quiet.observe(Observation::Offline, &sink);
        }
        assert!(sink.issues().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_counts_as_failure() {
        let bus = MemoryBus::new();
        let store = Store::new();
        let sink = RecordingSink::default();
        let config = configured(&store).await;
        let monitor = AvailabilityMonitor::subscribe(&bus, &config).await.unwrap();
        let waited = Duration::from_secs(config.options.offline_timeout * 3 + 1);
        let _ = tokio::time::timeout(waited, monitor.run(&sink)).await;
        assert_eq!(sink.issues().len(), 1);
        assert_eq!(bus.active_subscriptions(), 0);
    }
}
