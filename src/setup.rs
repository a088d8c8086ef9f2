use crate::bus::{self, Bus, Message, Subscription};
use crate::host::{
    CONFIG_VERSION, ConfigOptions, ConfigStore, ConfigStoreError, ConfigurationRecord,
    DEFAULT_LEGACY_PREFIX, EntityRegistry, InvalidOption,
};
use crate::identifier::{self, HardwareIdentifier};
use crate::topics::{self, InvalidTopic};
use crate::values::{display_raw, get_nested_value, parse_json_payload};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{1}` cannot be used as a device topic")]
    InvalidTopic(#[source] InvalidTopic, String),
    #[error("no NeoPool telemetry arrived on `{0}` within {1:?}")]
    Timeout(String, Duration),
    #[error(
        "the device at `{0}` did not reveal its NodeID, run `SetOption157 1` in its Tasmota console"
    )]
    CannotExposeIdentifier(String),
    #[error("the device with unique id `{0}` is already configured")]
    AlreadyConfigured(String),
    #[error("the NodeID cannot be used")]
    InvalidIdentifier(#[source] identifier::InvalidIdentifier),
    #[error("the options are not valid")]
    InvalidOption(#[source] InvalidOption),
    #[error("could not store the configuration record")]
    Store(#[source] ConfigStoreError),
    #[error("could not communicate with the broker")]
    Bus(#[source] bus::Error),
    #[error("the subscription to `{0}` ended unexpectedly")]
    Closed(String),
    #[error("the input does not apply to the {0} step")]
    UnexpectedInput(Step),
}

#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    /// How long to wait for the first telemetry document.
    pub validate: Duration,
    /// Time given to the device to apply `SetOption157`.
    pub settle: Duration,
    /// How long to wait for an unmasked NodeID afterwards.
    pub revalidate: Duration,
    /// How long to listen for any NeoPool device when looking for one.
    pub detect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            validate: Duration::from_secs(10),
            settle: Duration::from_secs(2),
            revalidate: Duration::from_secs(10),
            detect: Duration::from_secs(10),
        }
    }
}

#[derive(clap::Parser, Clone)]
#[group(id = "setup::TimeoutArgs")]
pub struct TimeoutArgs {
    /// How long to wait for the device telemetry.
    #[arg(long, default_value = "10s")]
    validate_timeout: humantime::Duration,
    /// How long the device is given to apply `SetOption157` before looking at its telemetry
    /// again.
    #[arg(long, default_value = "2s")]
    settle_delay: humantime::Duration,
    #[arg(long, default_value = "10s")]
    revalidate_timeout: humantime::Duration,
    /// How long to listen for NeoPool telemetry when looking for a device.
    #[arg(long, default_value = "10s")]
    detect_timeout: humantime::Duration,
}

impl From<&TimeoutArgs> for Timeouts {
    fn from(args: &TimeoutArgs) -> Self {
        Self {
            validate: *args.validate_timeout,
            settle: *args.settle_delay,
            revalidate: *args.revalidate_timeout,
            detect: *args.detect_timeout,
        }
    }
}

/// A telemetry document received from a device.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicValidation {
    /// The NodeID as reported, which may be hidden or masked.
    pub identifier: Option<String>,
    pub document: Value,
}

impl TopicValidation {
    fn from_document(document: Value) -> Self {
        let identifier = get_nested_value(&document, topics::NODE_ID_PATH).map(display_raw);
        Self { identifier, document }
    }

    pub fn valid_identifier(&self) -> Option<HardwareIdentifier> {
        HardwareIdentifier::new(self.identifier.as_deref()?).ok()
    }
}

/// Wait until `deadline` for a NeoPool telemetry document, skipping anything else.
async fn next_document(
    subscription: &mut Subscription,
    deadline: Instant,
) -> Result<Option<(Message, Value)>, Error> {
    loop {
        let message = match tokio::time::timeout_at(deadline, subscription.recv()).await {
            Err(_elapsed) => return Ok(None),
            Ok(None) => return Err(Error::Closed(subscription.filter().to_string())),
            Ok(Some(message)) => message,
        };
        let Some(document) = parse_json_payload(&message.payload) else {
            continue;
        };
        if document.get(topics::MARKER_KEY).is_none() {
            debug!(topic = %message.topic, "not a NeoPool document, still waiting");
            continue;
        }
        return Ok(Some((message, document)));
    }
}

/// Wait for the first NeoPool telemetry document published under `topic`.
pub async fn validate_topic(
    bus: &impl Bus,
    topic: &str,
    timeout: Duration,
) -> Result<TopicValidation, Error> {
    topics::validate_topic(topic).map_err(|e| Error::InvalidTopic(e, topic.to_string()))?;
    let deadline = Instant::now() + timeout;
    let filter = topics::telemetry(topic);
    let mut subscription = bus.subscribe(&filter).await.map_err(Error::Bus)?;
    match next_document(&mut subscription, deadline).await? {
        Some((_, document)) => Ok(TopicValidation::from_document(document)),
        None => {
            warn!(topic, ?timeout, "no NeoPool telemetry within the deadline");
            Err(Error::Timeout(filter, timeout))
        }
    }
}

/// Ask the device at `topic` to stop masking its NodeID and wait until it does.
///
/// Sending the command to a device that already exposes the NodeID changes nothing.
pub async fn ensure_identifier_exposed(
    bus: &impl Bus,
    topic: &str,
    timeouts: &Timeouts,
) -> Result<TopicValidation, Error> {
    topics::validate_topic(topic).map_err(|e| Error::InvalidTopic(e, topic.to_string()))?;
    // Subscribed before sending the command so that the next report cannot be missed.
    let mut subscription = bus.subscribe(&topics::telemetry(topic)).await.map_err(Error::Bus)?;
    let command = topics::command(topic, topics::EXPOSE_IDENTIFIER_COMMAND);
    bus.publish(&command, "1").await.map_err(Error::Bus)?;
    warn!(topic, "the NodeID is hidden, asked the device to expose it");
    tokio::time::sleep(timeouts.settle).await;
    let deadline = Instant::now() + timeouts.revalidate;
    while let Some((_, document)) = next_document(&mut subscription, deadline).await? {
        let validation = TopicValidation::from_document(document);
        if let Some(identifier) = validation.valid_identifier() {
            info!(topic, %identifier, "the device exposes its NodeID");
            return Ok(validation);
        }
        debug!(topic, identifier = ?validation.identifier, "the NodeID is still hidden");
    }
    warn!(topic, "the device did not expose its NodeID");
    Err(Error::CannotExposeIdentifier(topic.to_string()))
}

/// The identifier of the device at `topic`, asking the device to expose it if necessary.
pub async fn resolve_identifier(
    bus: &impl Bus,
    topic: &str,
    timeouts: &Timeouts,
) -> Result<HardwareIdentifier, Error> {
    let validation = validate_topic(bus, topic, timeouts.validate).await?;
    if let Some(identifier) = validation.valid_identifier() {
        return Ok(identifier);
    }
    let validation = ensure_identifier_exposed(bus, topic, timeouts).await?;
    validation.valid_identifier().ok_or_else(|| Error::CannotExposeIdentifier(topic.to_string()))
}

/// Listen for NeoPool telemetry from any device and return its topic.
pub async fn auto_detect_topic(bus: &impl Bus, timeout: Duration) -> Result<Option<String>, Error> {
    let deadline = Instant::now() + timeout;
    let mut subscription =
        bus.subscribe(topics::TELEMETRY_DISCOVERY_FILTER).await.map_err(Error::Bus)?;
    while let Some((message, _)) = next_document(&mut subscription, deadline).await? {
        if let Some(device) = topics::device_from_telemetry(&message.topic) {
            info!(topic = device, "found a NeoPool device");
            return Ok(Some(device.to_string()));
        }
    }
    debug!("no NeoPool device found");
    Ok(None)
}

fn new_entry_id(created_at: jiff::Timestamp) -> String {
    format!("{:x}", created_at.as_nanosecond())
}

/// Persist a new configuration record for the device identified by `identifier`.
///
/// `legacy_prefix` requests adoption of the records created by an earlier integration on the
/// next start.
pub async fn create_configuration_record(
    host: &impl ConfigStore,
    device_name: &str,
    topic: &str,
    identifier: HardwareIdentifier,
    legacy_prefix: Option<&str>,
) -> Result<ConfigurationRecord, Error> {
    topics::validate_topic(topic).map_err(|e| Error::InvalidTopic(e, topic.to_string()))?;
    let unique_id = identifier.config_unique_id();
    if host.get_config(&unique_id).is_some() {
        info!(unique_id, "the device is already configured");
        return Err(Error::AlreadyConfigured(unique_id));
    }
    let created_at = jiff::Timestamp::now();
    let record = ConfigurationRecord {
        entry_id: new_entry_id(created_at),
        unique_id,
        version: CONFIG_VERSION,
        title: device_name.to_string(),
        device_name: device_name.to_string(),
        topic: topic.to_string(),
        identifier,
        migrate_legacy: legacy_prefix.is_some(),
        legacy_prefix: legacy_prefix.unwrap_or(DEFAULT_LEGACY_PREFIX).to_string(),
        options: ConfigOptions::default(),
        created_entities: Default::default(),
        created_at,
    };
    host.create_config(record.clone()).map_err(|e| match e {
        ConfigStoreError::AlreadyExists(unique_id) => Error::AlreadyConfigured(unique_id),
        e => Error::Store(e),
    })?;
    info!(
        unique_id = %record.unique_id,
        topic,
        migrate_legacy = record.migrate_legacy,
        "created the configuration record"
    );
    Ok(record)
}

/// Replace the options of an existing configuration record.
pub fn update_options(
    host: &impl ConfigStore,
    unique_id: &str,
    options: ConfigOptions,
) -> Result<ConfigurationRecord, Error> {
    options.validate().map_err(Error::InvalidOption)?;
    let mut record = host
        .get_config(unique_id)
        .ok_or_else(|| Error::Store(ConfigStoreError::NotFound(unique_id.to_string())))?;
    record.options = options;
    host.update_config(record.clone()).map_err(Error::Store)?;
    info!(unique_id, "updated the options");
    Ok(record)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    User,
    LegacyTopic,
    LegacyPrefix,
    LegacyConfirm,
    Manual,
    DiscoveryConfirm,
    Reconfigure,
}

/// Problems reported back on a form, after which the step can be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FormError {
    InvalidTopic,
    CannotConnect,
    NoEntitiesFound,
    ConfirmationRequired,
    CannotExposeIdentifier,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AbortReason {
    AlreadyConfigured,
    CannotExposeIdentifier,
    InvalidDiscoveryInfo,
    NotNeopoolDevice,
    UniqueIdMismatch,
}

#[derive(Debug, PartialEq)]
pub enum FlowResult {
    Form { step: Step, error: Option<FormError>, placeholders: BTreeMap<&'static str, String> },
    Created(ConfigurationRecord),
    Updated(ConfigurationRecord),
    Aborted(AbortReason),
}

impl FlowResult {
    fn form(step: Step) -> Self {
        FlowResult::Form { step, error: None, placeholders: BTreeMap::new() }
    }

    fn form_error(step: Step, error: FormError) -> Self {
        FlowResult::Form { step, error: Some(error), placeholders: BTreeMap::new() }
    }
}

#[derive(Clone, Debug)]
pub enum UserInput {
    /// Choose between adopting an earlier installation and setting up a device by hand.
    Start { migrate_legacy: bool },
    LegacyTopic { topic: String },
    LegacyPrefix { prefix: String },
    LegacyConfirm { confirmed: bool },
    Manual { device_name: String, topic: String },
    /// Optionally override the suggested device name.
    DiscoveryConfirm { device_name: Option<String> },
    Reconfigure { device_name: String, topic: String },
}

#[derive(Clone, Debug)]
struct LegacyCandidate {
    topic: String,
    identifier: HardwareIdentifier,
    prefix: String,
    entity_ids: Vec<String>,
}

#[derive(Clone, Debug)]
enum FlowState {
    User,
    LegacyTopic,
    LegacyPrefix { topic: String, identifier: HardwareIdentifier },
    LegacyConfirm(LegacyCandidate),
    Manual,
    DiscoveryConfirm { topic: String, identifier: HardwareIdentifier, device_name: String },
    Reconfigure(Box<ConfigurationRecord>),
    Finished,
}

impl FlowState {
    fn step(&self) -> Step {
        match self {
            FlowState::User | FlowState::Finished => Step::User,
            FlowState::LegacyTopic => Step::LegacyTopic,
            FlowState::LegacyPrefix { .. } => Step::LegacyPrefix,
            FlowState::LegacyConfirm(_) => Step::LegacyConfirm,
            FlowState::Manual => Step::Manual,
            FlowState::DiscoveryConfirm { .. } => Step::DiscoveryConfirm,
            FlowState::Reconfigure(_) => Step::Reconfigure,
        }
    }
}

enum Identified {
    Valid(HardwareIdentifier),
    NoTelemetry,
    Hidden,
}

/// The interactive setup of a single device.
///
/// A flow begins with [`SetupFlow::new`] (the user picks a path), [`SetupFlow::discovered`]
/// (a device announced itself) or [`SetupFlow::reconfigure`], and is then driven by
/// [`SetupFlow::submit`] until it produces a record or aborts.
pub struct SetupFlow<'a, B, H> {
    bus: &'a B,
    host: &'a H,
    timeouts: Timeouts,
    state: FlowState,
}

impl<'a, B: Bus, H: ConfigStore + EntityRegistry> SetupFlow<'a, B, H> {
    pub fn new(bus: &'a B, host: &'a H, timeouts: Timeouts) -> (Self, FlowResult) {
        let flow = Self { bus, host, timeouts, state: FlowState::User };
        (flow, FlowResult::form(Step::User))
    }

    /// Start from telemetry a device published on its own.
    pub async fn discovered(
        bus: &'a B,
        host: &'a H,
        timeouts: Timeouts,
        message: &Message,
    ) -> Result<(Self, FlowResult), Error> {
        let mut flow = Self { bus, host, timeouts, state: FlowState::Finished };
        let result = flow.start_discovery(message).await?;
        Ok((flow, result))
    }

    pub fn reconfigure(
        bus: &'a B,
        host: &'a H,
        timeouts: Timeouts,
        record: ConfigurationRecord,
    ) -> (Self, FlowResult) {
        let placeholders = BTreeMap::from([
            ("device_name", record.device_name.clone()),
            ("topic", record.topic.clone()),
        ]);
        let flow = Self { bus, host, timeouts, state: FlowState::Reconfigure(Box::new(record)) };
        let result = FlowResult::Form { step: Step::Reconfigure, error: None, placeholders };
        (flow, result)
    }

    pub fn step(&self) -> Step {
        self.state.step()
    }

    pub async fn submit(&mut self, input: UserInput) -> Result<FlowResult, Error> {
        let state = std::mem::replace(&mut self.state, FlowState::Finished);
        let result = match (state, input) {
            (FlowState::User, UserInput::Start { migrate_legacy: false }) => {
                self.state = FlowState::Manual;
                Ok(FlowResult::Form {
                    step: Step::Manual,
                    error: None,
                    placeholders: BTreeMap::from([
                        ("device_name", crate::DEFAULT_DEVICE_NAME.to_string()),
                        ("topic", crate::DEFAULT_MQTT_TOPIC.to_string()),
                    ]),
                })
            }
            (FlowState::User, UserInput::Start { migrate_legacy: true }) => {
                self.detect_legacy().await
            }
            (FlowState::LegacyTopic, UserInput::LegacyTopic { topic }) => {
                self.submit_legacy_topic(topic).await
            }
            (FlowState::LegacyPrefix { topic, identifier }, UserInput::LegacyPrefix { prefix }) => {
                Ok(self.submit_legacy_prefix(topic, identifier, prefix))
            }
            (FlowState::LegacyConfirm(candidate), UserInput::LegacyConfirm { confirmed }) => {
                self.submit_legacy_confirm(candidate, confirmed).await
            }
            (FlowState::Manual, UserInput::Manual { device_name, topic }) => {
                self.submit_manual(device_name, topic).await
            }
            (
                FlowState::DiscoveryConfirm { topic, identifier, device_name },
                UserInput::DiscoveryConfirm { device_name: chosen },
            ) => {
                let device_name = chosen.filter(|n| !n.trim().is_empty()).unwrap_or(device_name);
                self.finish(&device_name, &topic, identifier, None).await
            }
            (FlowState::Reconfigure(record), UserInput::Reconfigure { device_name, topic }) => {
                self.submit_reconfigure(*record, device_name, topic).await
            }
            (state, _) => {
                let step = state.step();
                self.state = state;
                return Err(Error::UnexpectedInput(step));
            }
        };
        if let Ok(FlowResult::Form { step, error: Some(error), .. }) = &result {
            debug!(%step, %error, "setup step needs another attempt");
        }
        result
    }

    /// Validate `topic` and make sure its device exposes a usable identifier.
    async fn identify(&self, topic: &str) -> Result<Identified, Error> {
        let validation = match validate_topic(self.bus, topic, self.timeouts.validate).await {
            Ok(validation) => validation,
            Err(Error::Timeout(..) | Error::InvalidTopic(..)) => return Ok(Identified::NoTelemetry),
            Err(e) => return Err(e),
        };
        if let Some(identifier) = validation.valid_identifier() {
            return Ok(Identified::Valid(identifier));
        }
        self.expose(topic).await
    }

    async fn expose(&self, topic: &str) -> Result<Identified, Error> {
        match ensure_identifier_exposed(self.bus, topic, &self.timeouts).await {
            Ok(validation) => Ok(validation
                .valid_identifier()
                .map_or(Identified::Hidden, Identified::Valid)),
            Err(Error::CannotExposeIdentifier(_)) => Ok(Identified::Hidden),
            Err(e) => Err(e),
        }
    }

    fn ask_legacy_topic(&mut self, error: Option<FormError>) -> FlowResult {
        self.state = FlowState::LegacyTopic;
        FlowResult::Form {
            step: Step::LegacyTopic,
            error,
            placeholders: BTreeMap::from([("topic", crate::DEFAULT_MQTT_TOPIC.to_string())]),
        }
    }

    async fn detect_legacy(&mut self) -> Result<FlowResult, Error> {
        let Some(topic) = auto_detect_topic(self.bus, self.timeouts.detect).await? else {
            return Ok(self.ask_legacy_topic(None));
        };
        match self.identify(&topic).await? {
            Identified::Valid(identifier) => {
                Ok(self.find_legacy_entities(topic, identifier, DEFAULT_LEGACY_PREFIX, None))
            }
            Identified::NoTelemetry | Identified::Hidden => Ok(self.ask_legacy_topic(None)),
        }
    }

    async fn submit_legacy_topic(&mut self, topic: String) -> Result<FlowResult, Error> {
        let topic = topic.trim().to_string();
        if topics::validate_topic(&topic).is_err() {
            return Ok(self.ask_legacy_topic(Some(FormError::InvalidTopic)));
        }
        match self.identify(&topic).await? {
            Identified::Valid(identifier) => {
                Ok(self.find_legacy_entities(topic, identifier, DEFAULT_LEGACY_PREFIX, None))
            }
            Identified::NoTelemetry => Ok(self.ask_legacy_topic(Some(FormError::CannotConnect))),
            Identified::Hidden => {
                self.state = FlowState::Finished;
                Ok(FlowResult::Aborted(AbortReason::CannotExposeIdentifier))
            }
        }
    }

    fn submit_legacy_prefix(
        &mut self,
        topic: String,
        identifier: HardwareIdentifier,
        prefix: String,
    ) -> FlowResult {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            self.state = FlowState::LegacyPrefix { topic, identifier };
            return FlowResult::form_error(Step::LegacyPrefix, FormError::NoEntitiesFound);
        }
        self.find_legacy_entities(topic, identifier, prefix, Some(FormError::NoEntitiesFound))
    }

    /// Look for records nobody owns whose key starts with `prefix`.
    ///
    /// `error` is reported on the prefix form when nothing is found.
    fn find_legacy_entities(
        &mut self,
        topic: String,
        identifier: HardwareIdentifier,
        prefix: &str,
        error: Option<FormError>,
    ) -> FlowResult {
        let entity_ids = self
            .host
            .list_records()
            .into_iter()
            .filter(|r| r.unique_id.starts_with(prefix) && r.config_entry_id.is_none())
            .map(|r| r.entity_id)
            .collect::<Vec<_>>();
        if entity_ids.is_empty() {
            debug!(prefix, "no legacy entities found");
            self.state = FlowState::LegacyPrefix { topic, identifier };
            return FlowResult::Form {
                step: Step::LegacyPrefix,
                error,
                placeholders: BTreeMap::from([("prefix", DEFAULT_LEGACY_PREFIX.to_string())]),
            };
        }
        info!(prefix, count = entity_ids.len(), "found legacy entities");
        let candidate =
            LegacyCandidate { topic, identifier, prefix: prefix.to_string(), entity_ids };
        self.confirm_legacy(candidate, None)
    }

    fn confirm_legacy(&mut self, candidate: LegacyCandidate, error: Option<FormError>) -> FlowResult {
        let mut entity_list = candidate.entity_ids.iter().take(5).cloned().collect::<Vec<_>>();
        if candidate.entity_ids.len() > 5 {
            entity_list.push(format!("...and {} more", candidate.entity_ids.len() - 5));
        }
        let placeholders = BTreeMap::from([
            ("topic", candidate.topic.clone()),
            ("nodeid", candidate.identifier.to_string()),
            ("entity_count", candidate.entity_ids.len().to_string()),
            ("entity_list", entity_list.join("\n")),
        ]);
        self.state = FlowState::LegacyConfirm(candidate);
        FlowResult::Form { step: Step::LegacyConfirm, error, placeholders }
    }

    async fn submit_legacy_confirm(
        &mut self,
        candidate: LegacyCandidate,
        confirmed: bool,
    ) -> Result<FlowResult, Error> {
        if !confirmed {
            return Ok(self.confirm_legacy(candidate, Some(FormError::ConfirmationRequired)));
        }
        let device_name = format!("{} {}", crate::DEFAULT_DEVICE_NAME, candidate.topic);
        self.finish(&device_name, &candidate.topic, candidate.identifier, Some(&candidate.prefix))
            .await
    }

    async fn submit_manual(&mut self, device_name: String, topic: String) -> Result<FlowResult, Error> {
        let topic = topic.trim().to_string();
        if topics::validate_topic(&topic).is_err() {
            self.state = FlowState::Manual;
            return Ok(FlowResult::form_error(Step::Manual, FormError::InvalidTopic));
        }
        match self.identify(&topic).await? {
            Identified::Valid(identifier) => self.finish(&device_name, &topic, identifier, None).await,
            Identified::NoTelemetry => {
                self.state = FlowState::Manual;
                Ok(FlowResult::form_error(Step::Manual, FormError::CannotConnect))
            }
            Identified::Hidden => Ok(FlowResult::Aborted(AbortReason::CannotExposeIdentifier)),
        }
    }

    async fn start_discovery(&mut self, message: &Message) -> Result<FlowResult, Error> {
        let Some(topic) = topics::device_from_telemetry(&message.topic) else {
            debug!(topic = %message.topic, "discovery message on an unexpected topic");
            return Ok(FlowResult::Aborted(AbortReason::InvalidDiscoveryInfo));
        };
        let Some(document) = parse_json_payload(&message.payload) else {
            return Ok(FlowResult::Aborted(AbortReason::InvalidDiscoveryInfo));
        };
        if document.get(topics::MARKER_KEY).is_none() {
            return Ok(FlowResult::Aborted(AbortReason::NotNeopoolDevice));
        }
        let identifier = match TopicValidation::from_document(document).valid_identifier() {
            Some(identifier) => identifier,
            None => match self.expose(topic).await? {
                Identified::Valid(identifier) => identifier,
                Identified::NoTelemetry | Identified::Hidden => {
                    return Ok(FlowResult::Aborted(AbortReason::CannotExposeIdentifier));
                }
            },
        };
        if self.host.get_config(&identifier.config_unique_id()).is_some() {
            debug!(%identifier, "discovered a device that is already configured");
            return Ok(FlowResult::Aborted(AbortReason::AlreadyConfigured));
        }
        let device_name = format!("{} {topic}", crate::DEFAULT_DEVICE_NAME);
        let placeholders = BTreeMap::from([
            ("device_name", device_name.clone()),
            ("topic", topic.to_string()),
            ("nodeid", identifier.to_string()),
        ]);
        self.state =
            FlowState::DiscoveryConfirm { topic: topic.to_string(), identifier, device_name };
        Ok(FlowResult::Form { step: Step::DiscoveryConfirm, error: None, placeholders })
    }

    async fn submit_reconfigure(
        &mut self,
        mut record: ConfigurationRecord,
        device_name: String,
        topic: String,
    ) -> Result<FlowResult, Error> {
        let topic = topic.trim().to_string();
        let retry = |this: &mut Self,
                     record: ConfigurationRecord,
                     error: FormError|
         -> Result<FlowResult, Error> {
            this.state = FlowState::Reconfigure(Box::new(record));
            Ok(FlowResult::form_error(Step::Reconfigure, error))
        };
        if topics::validate_topic(&topic).is_err() {
            return retry(self, record, FormError::InvalidTopic);
        }
        let identifier = match self.identify(&topic).await? {
            Identified::Valid(identifier) => identifier,
            Identified::NoTelemetry => return retry(self, record, FormError::CannotConnect),
            Identified::Hidden => return retry(self, record, FormError::CannotExposeIdentifier),
        };
        if identifier.config_unique_id() != record.unique_id {
            warn!(
                expected = %record.unique_id,
                found = %identifier.config_unique_id(),
                "a different device answers on the new topic"
            );
            return Ok(FlowResult::Aborted(AbortReason::UniqueIdMismatch));
        }
        record.title = device_name.clone();
        record.device_name = device_name;
        record.topic = topic;
        self.host.update_config(record.clone()).map_err(Error::Store)?;
        info!(unique_id = %record.unique_id, topic = %record.topic, "reconfigured");
        Ok(FlowResult::Updated(record))
    }

    async fn finish(
        &mut self,
        device_name: &str,
        topic: &str,
        identifier: HardwareIdentifier,
        legacy_prefix: Option<&str>,
    ) -> Result<FlowResult, Error> {
        self.state = FlowState::Finished;
        match create_configuration_record(self.host, device_name, topic, identifier, legacy_prefix)
            .await
        {
            Ok(record) => Ok(FlowResult::Created(record)),
            Err(Error::AlreadyConfigured(_)) => Ok(FlowResult::Aborted(AbortReason::AlreadyConfigured)),
            Err(e) => Err(e),
        }
    }
}
