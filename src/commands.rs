fn runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_current_thread().enable_all().build()
}

pub mod entities {
    use crate::output;
    use crate::platform::{Domain, EntityCategory, EntityDescriptor};

    /// Search and output the entities exposed for every device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        /// Only list entities whose key, name or JSON path contains this text.
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct EntitySchema {
        pub domain: Domain,
        pub key: &'static str,
        pub name: &'static str,
        pub json_path: Option<&'static str>,
        pub command: Option<&'static str>,
        pub unit: Option<&'static str>,
        pub category: Option<EntityCategory>,
        pub enabled_by_default: bool,
    }

    impl EntitySchema {
        pub fn all_entities() -> impl Iterator<Item = Self> {
            EntityDescriptor::all().map(|descriptor| {
                let common = descriptor.common();
                EntitySchema {
                    domain: descriptor.domain(),
                    key: descriptor.key(),
                    name: descriptor.name(),
                    json_path: descriptor.json_path(),
                    command: descriptor.command(),
                    unit: descriptor.unit(),
                    category: common.category,
                    enabled_by_default: common.enabled_by_default,
                }
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.key.contains(&pattern)
                || self.name.to_lowercase().contains(&pattern)
                || self.json_path.is_some_and(|p| p.to_lowercase().contains(&pattern))
        }

        fn table_row(&self) -> Vec<String> {
            vec![
                self.domain.to_string(),
                self.key.to_string(),
                self.name.to_string(),
                self.json_path.unwrap_or_default().to_string(),
                self.command.unwrap_or_default().to_string(),
                self.unit.unwrap_or_default().to_string(),
            ]
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output
            .table_headers(vec!["Domain", "Key", "Name", "JSON path", "Command", "Unit"])
            .map_err(Error::Output)?;
        for entity in EntitySchema::all_entities() {
            if let Some(pattern) = &args.filter {
                if !entity.is_match(pattern) {
                    continue;
                }
            }
            output.result(|| entity.table_row(), || &entity).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}

pub mod setup {
    use super::runtime;
    use crate::bus::Bus as _;
    use crate::connection::{self, Connection};
    use crate::host::{ConfigStore as _, ConfigurationRecord};
    use crate::output;
    use crate::registry::Store;
    use crate::setup::{
        self as flow, FlowResult, FormError, SetupFlow, Step, TimeoutArgs, Timeouts, UserInput,
    };
    use crate::{storage, topics};
    use std::collections::BTreeMap;

    /// Configure a device and store its configuration record.
    ///
    /// Without `--discover`, `--migrate-legacy` or `--reconfigure` the device at `--topic` is
    /// set up by hand.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        storage: storage::Args,
        #[clap(flatten)]
        timeouts: TimeoutArgs,
        #[clap(flatten)]
        output: output::Args,
        /// The device topic, `SmartPool` in `tele/SmartPool/SENSOR`.
        #[arg(long, short = 't')]
        topic: Option<String>,
        /// Name of the device. Defaults to `NeoPool` or `NeoPool {topic}`.
        #[arg(long, short = 'n')]
        name: Option<String>,
        /// Wait for any NeoPool device to publish its telemetry and set it up.
        #[arg(long, conflicts_with_all = ["topic", "migrate_legacy", "reconfigure"])]
        discover: bool,
        /// Set up the device so that it adopts the entities of an earlier installation.
        #[arg(long, conflicts_with = "reconfigure")]
        migrate_legacy: bool,
        /// Key prefix of the earlier entities, when it is not `neopool_mqtt_`.
        #[arg(long, requires = "migrate_legacy")]
        legacy_prefix: Option<String>,
        /// Confirm the adoption of the entities found with `--migrate-legacy`.
        #[arg(long, short = 'y', requires = "migrate_legacy")]
        yes: bool,
        /// Change the name and topic of the device with this unique id.
        #[arg(long, requires = "topic")]
        reconfigure: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the broker")]
        Connection(#[source] connection::Error),
        #[error("could not load the stored state")]
        Load(#[source] storage::Error),
        #[error("could not store the configuration")]
        Save(#[source] storage::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
        #[error("the setup failed")]
        Setup(#[source] flow::Error),
        #[error("the {0} step needs `--{1}`")]
        Missing(Step, &'static str),
        #[error("the {0} step failed with {1}")]
        Rejected(Step, FormError),
        #[error("the setup was aborted: {0}")]
        Aborted(flow::AbortReason),
        #[error("no NeoPool device published its telemetry")]
        NothingDiscovered,
        #[error("there is no configured device with unique id `{0}`")]
        UnknownDevice(String),
    }

    fn answer(args: &Args, step: Step, placeholders: &BTreeMap<&str, String>) -> Result<UserInput, Error> {
        let topic = || args.topic.clone().ok_or(Error::Missing(step, "topic"));
        Ok(match step {
            Step::User => UserInput::Start { migrate_legacy: args.migrate_legacy },
            Step::Manual => UserInput::Manual {
                device_name: args.name.clone().unwrap_or_else(|| crate::DEFAULT_DEVICE_NAME.into()),
                topic: topic()?,
            },
            Step::LegacyTopic => UserInput::LegacyTopic { topic: topic()? },
            Step::LegacyPrefix => match &args.legacy_prefix {
                Some(prefix) => UserInput::LegacyPrefix { prefix: prefix.clone() },
                None => return Err(Error::Rejected(step, FormError::NoEntitiesFound)),
            },
            Step::LegacyConfirm => {
                tracing::info!(
                    topic = placeholders.get("topic").map(String::as_str).unwrap_or_default(),
                    nodeid = placeholders.get("nodeid").map(String::as_str).unwrap_or_default(),
                    count = placeholders.get("entity_count").map(String::as_str).unwrap_or_default(),
                    "entities to adopt:\n{}",
                    placeholders.get("entity_list").map(String::as_str).unwrap_or_default(),
                );
                UserInput::LegacyConfirm { confirmed: args.yes }
            }
            Step::DiscoveryConfirm => UserInput::DiscoveryConfirm { device_name: args.name.clone() },
            Step::Reconfigure => UserInput::Reconfigure {
                device_name: args.name.clone().unwrap_or_else(|| {
                    placeholders.get("device_name").cloned().unwrap_or_default()
                }),
                topic: topic()?,
            },
        })
    }

    /// Answer every form of `flow` from the command line arguments.
    async fn drive<B: crate::bus::Bus>(
        args: &Args,
        flow: &mut SetupFlow<'_, B, Store>,
        mut result: FlowResult,
    ) -> Result<ConfigurationRecord, Error> {
        loop {
            let input = match result {
                FlowResult::Created(record) | FlowResult::Updated(record) => return Ok(record),
                FlowResult::Aborted(reason) => return Err(Error::Aborted(reason)),
                FlowResult::Form { step, error: Some(error), .. } => {
                    return Err(Error::Rejected(step, error));
                }
                FlowResult::Form { step, error: None, placeholders } => {
                    answer(args, step, &placeholders)?
                }
            };
            result = flow.submit(input).await.map_err(Error::Setup)?;
        }
    }

    async fn discover(
        connection: &Connection,
        timeouts: &Timeouts,
    ) -> Result<crate::bus::Message, Error> {
        let deadline = tokio::time::Instant::now() + timeouts.detect;
        let mut subscription = connection
            .subscribe(topics::TELEMETRY_DISCOVERY_FILTER)
            .await
            .map_err(|e| Error::Setup(flow::Error::Bus(e)))?;
        loop {
            match tokio::time::timeout_at(deadline, subscription.recv()).await {
                Ok(Some(message)) => {
                    let neopool = crate::values::parse_json_payload(&message.payload)
                        .is_some_and(|d| d.get(topics::MARKER_KEY).is_some());
                    if neopool {
                        return Ok(message);
                    }
                }
                Ok(None) | Err(_) => return Err(Error::NothingDiscovered),
            }
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        runtime().map_err(Error::Runtime)?.block_on(async move {
            let storage = args.storage.to_storage();
            let store = Store::load(&storage).await.map_err(Error::Load)?;
            let connection = Connection::new(&args.connection).map_err(Error::Connection)?;
            let timeouts = Timeouts::from(&args.timeouts);
            let record = if args.discover {
                let message = discover(&connection, &timeouts).await?;
                let (mut flow, result) =
                    SetupFlow::discovered(&connection, &store, timeouts, &message)
                        .await
                        .map_err(Error::Setup)?;
                drive(&args, &mut flow, result).await?
            } else if let Some(unique_id) = &args.reconfigure {
                let existing = store
                    .get_config(unique_id)
                    .ok_or_else(|| Error::UnknownDevice(unique_id.clone()))?;
                let (mut flow, form) =
                    SetupFlow::reconfigure(&connection, &store, timeouts, existing);
                drive(&args, &mut flow, form).await?
            } else {
                let (mut flow, result) = SetupFlow::new(&connection, &store, timeouts);
                drive(&args, &mut flow, result).await?
            };
            store.save(&storage).await.map_err(Error::Save)?;
            connection.disconnect().await;

            let mut output = args.output.to_output().map_err(Error::Output)?;
            output
                .table_headers(vec!["Unique ID", "Name", "Topic", "NodeID", "Adopt legacy"])
                .map_err(Error::Output)?;
            output
                .result(
                    || {
                        vec![
                            record.unique_id.clone(),
                            record.device_name.clone(),
                            record.topic.clone(),
                            record.identifier.to_string(),
                            if record.migrate_legacy { record.legacy_prefix.clone() } else { "-".into() },
                        ]
                    },
                    || &record,
                )
                .map_err(Error::Output)?;
            output.commit().map_err(Error::Output)
        })
    }
}

pub mod options {
    use crate::host::{ConfigOptions, ConfigStore as _};
    use crate::registry::Store;
    use crate::{setup, storage};

    /// Change the behaviour of a configured device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        storage: storage::Args,
        /// Unique id of the device, such as `sugar_valley_neopool_4C7525BFB344`.
        device: String,
        /// Whether to raise a repair issue when the device stays unreachable.
        #[arg(long)]
        repair_notification: Option<bool>,
        /// Consecutive failures before the repair issue is raised, 1 to 10.
        #[arg(long)]
        failures_threshold: Option<u32>,
        /// Time without telemetry after which the device counts as unreachable.
        #[arg(long)]
        offline_timeout: Option<humantime::Duration>,
        /// Script suggested in the repair issue.
        #[arg(long)]
        recovery_script: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not load the stored state")]
        Load(#[source] storage::Error),
        #[error("could not store the options")]
        Save(#[source] storage::Error),
        #[error("there is no configured device with unique id `{0}`")]
        UnknownDevice(String),
        #[error("could not change the options")]
        Update(#[source] setup::Error),
    }

    fn apply(args: &Args, mut options: ConfigOptions) -> ConfigOptions {
        if let Some(notify) = args.repair_notification {
            options.enable_repair_notification = notify;
        }
        if let Some(threshold) = args.failures_threshold {
            options.failures_threshold = threshold;
        }
        if let Some(timeout) = args.offline_timeout {
            options.offline_timeout = timeout.as_secs();
        }
        if let Some(script) = &args.recovery_script {
            options.recovery_script = script.clone();
        }
        options
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let storage = args.storage.to_storage();
            let store = Store::load(&storage).await.map_err(Error::Load)?;
            let record = store
                .get_config(&args.device)
                .ok_or_else(|| Error::UnknownDevice(args.device.clone()))?;
            let options = apply(&args, record.options);
            setup::update_options(&store, &args.device, options).map_err(Error::Update)?;
            store.save(&storage).await.map_err(Error::Save)
        })
    }
}

pub mod migrate {
    use crate::connection::{self, Connection};
    use crate::host::ConfigStore as _;
    use crate::migrate::{self as migration, MigrationReport};
    use crate::registry::Store;
    use crate::setup::{TimeoutArgs, Timeouts};
    use crate::{output, storage};

    /// Adopt the entity records of earlier installations for every configured device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        storage: storage::Args,
        #[clap(flatten)]
        timeouts: TimeoutArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Remove records that cannot be adopted because their entity moved to another domain.
        #[arg(long)]
        remove_orphans: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the broker")]
        Connection(#[source] connection::Error),
        #[error("could not load the stored state")]
        Load(#[source] storage::Error),
        #[error("could not store the migrated records")]
        Save(#[source] storage::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Row<'a> {
        unique_id: &'a str,
        #[serde(flatten)]
        report: Option<&'a MigrationReport>,
        error: Option<String>,
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let storage = args.storage.to_storage();
            let store = Store::load(&storage).await.map_err(Error::Load)?;
            let connection = Connection::new(&args.connection).map_err(Error::Connection)?;
            let options = migration::Options {
                remove_orphans: args.remove_orphans,
                timeouts: Timeouts::from(&args.timeouts),
            };
            let mut output = args.output.to_output().map_err(Error::Output)?;
            output
                .table_headers(vec![
                    "Unique ID",
                    "Rewritten",
                    "Collisions",
                    "Cross-domain",
                    "Removed",
                    "Failed",
                    "Error",
                ])
                .map_err(Error::Output)?;
            for mut config in store.entries() {
                let result = migration::run(&connection, &store, &mut config, &options).await;
                let (report, error) = match &result {
                    Ok(report) => (Some(report), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                let cell = |f: fn(&MigrationReport) -> usize| {
                    report.map(|r| f(r).to_string()).unwrap_or_default()
                };
                output
                    .result(
                        || {
                            vec![
                                config.unique_id.clone(),
                                cell(|r| r.rewritten),
                                cell(|r| r.collisions),
                                cell(|r| r.skipped_cross_domain),
                                cell(|r| r.removed_orphans),
                                cell(|r| r.failed),
                                error.clone().unwrap_or_default(),
                            ]
                        },
                        || Row { unique_id: &config.unique_id, report, error: error.clone() },
                    )
                    .map_err(Error::Output)?;
            }
            store.save(&storage).await.map_err(Error::Save)?;
            connection.disconnect().await;
            output.commit().map_err(Error::Output)
        })
    }
}

pub mod run {
    use crate::bridge;
    use crate::connection::{self, Connection};
    use crate::host::{ConfigStore as _, DeviceInfo, Issue, StateSink, StateUpdate};
    use crate::migrate;
    use crate::output::{self, Output};
    use crate::registry::Store;
    use crate::setup::{TimeoutArgs, Timeouts};
    use crate::storage;
    use futures::future::join_all;
    use std::cell::RefCell;
    use tracing::{error, info, warn};

    /// Follow every configured device and output entity states as they change.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        storage: storage::Args,
        #[clap(flatten)]
        timeouts: TimeoutArgs,
        #[clap(flatten)]
        output: output::Args,
        /// Remove records that cannot be adopted because their entity moved to another domain.
        #[arg(long)]
        remove_orphans: bool,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the broker")]
        Connection(#[source] connection::Error),
        #[error("could not load the stored state")]
        Load(#[source] storage::Error),
        #[error("could not store the entity registry")]
        Save(#[source] storage::Error),
        #[error("could not produce the output")]
        Output(#[source] output::Error),
        #[error("could not start the device `{1}`")]
        Start(#[source] bridge::Error, String),
        #[error("no device is configured, run `setup` first")]
        NothingConfigured,
        #[error("the MQTT connection task has ended")]
        Disconnected,
    }

    struct OutputSink {
        output: RefCell<Output>,
    }

    impl StateSink for OutputSink {
        fn register_device(&self, device: &DeviceInfo) {
            info!(name = %device.name, identifier = %device.identifiers.1, "device registered");
        }

        fn write_state(&self, update: &StateUpdate) {
            let mut output = self.output.borrow_mut();
            let written = output
                .result(
                    || {
                        vec![
                            update.at.to_string(),
                            update.entity_id.clone(),
                            update.value.as_ref().map(|v| v.to_string()).unwrap_or_default(),
                            update.available.to_string(),
                        ]
                    },
                    || update,
                )
                .and_then(|()| output.flush());
            if let Err(e) = written {
                error!(error = (&e as &dyn std::error::Error), "could not output a state");
            }
        }

        fn raise_issue(&self, issue: &Issue) {
            warn!(id = %issue.id, title = %issue.title, "{}", issue.description);
        }

        fn clear_issue(&self, id: &str) {
            info!(id, "issue resolved");
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let storage = args.storage.to_storage();
            let store = Store::load(&storage).await.map_err(Error::Load)?;
            let mut connection = Connection::new(&args.connection).map_err(Error::Connection)?;
            let mut output = args.output.to_output().map_err(Error::Output)?;
            output
                .table_headers(vec!["Time", "Entity", "State", "Available"])
                .map_err(Error::Output)?;
            let sink = OutputSink { output: RefCell::new(output) };
            let options = migrate::Options {
                remove_orphans: args.remove_orphans,
                timeouts: Timeouts::from(&args.timeouts),
            };
            let entries = store.entries();
            if entries.is_empty() {
                return Err(Error::NothingConfigured);
            }
            let mut devices = Vec::new();
            for config in entries {
                let unique_id = config.unique_id.clone();
                let device = bridge::start(&connection, &store, &sink, config, &options)
                    .await
                    .map_err(|e| Error::Start(e, unique_id))?;
                devices.push(device);
            }
            store.save(&storage).await.map_err(Error::Save)?;

            let running = join_all(devices.into_iter().map(|d| d.run(&sink)));
            let result = tokio::select! {
                _ = running => Ok(()),
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, stopping");
                    Ok(())
                }
                _ = &mut connection.worker => Err(Error::Disconnected),
            };
            connection.disconnect().await;
            sink.output.into_inner().commit().map_err(Error::Output)?;
            result
        })
    }
}

pub mod command {
    use crate::connection::{self, Connection};
    use crate::platform::entity::{self, CommandError, CommandRequest};
    use crate::platform::{Domain, EntityDescriptor};

    /// Operate an entity of the device at `--topic`.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        /// The device topic, `SmartPool` in `cmnd/SmartPool/NPFiltration`.
        #[arg(long, short = 't', default_value = crate::DEFAULT_MQTT_TOPIC)]
        topic: String,
        /// Key of the entity, as listed by the `entities` command.
        #[arg(long, short = 'e')]
        entity: String,
        /// Needed only when the key is used by entities of several domains.
        #[arg(long, short = 'd')]
        domain: Option<String>,
        /// `on`/`off` for switches, an option for selects, a number for numbers. Ignored for
        /// buttons.
        #[arg(default_value = "")]
        value: String,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not start the async runtime")]
        Runtime(#[source] std::io::Error),
        #[error("could not connect to the broker")]
        Connection(#[source] connection::Error),
        #[error("`{0}` is not an entity domain")]
        Domain(String),
        #[error("there is no entity `{0}` that accepts commands")]
        UnknownEntity(String),
        #[error("`{0}` names entities of several domains, pick one with `--domain`")]
        Ambiguous(String),
        #[error("could not send the command")]
        Command(#[source] CommandError),
    }

    fn descriptor(key: &str, domain: Option<&str>) -> Result<EntityDescriptor, Error> {
        let domain = domain
            .map(|d| d.parse::<Domain>().map_err(|_| Error::Domain(d.to_string())))
            .transpose()?;
        let mut candidates = EntityDescriptor::all()
            .filter(|d| d.key() == key && d.command().is_some())
            .filter(|d| domain.is_none_or(|domain| d.domain() == domain));
        let found = candidates.next().ok_or_else(|| Error::UnknownEntity(key.to_string()))?;
        if candidates.next().is_some() {
            return Err(Error::Ambiguous(key.to_string()));
        }
        Ok(found)
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let descriptor = descriptor(&args.entity, args.domain.as_deref())?;
        let request = CommandRequest::parse(descriptor, &args.value).map_err(Error::Command)?;
        super::runtime().map_err(Error::Runtime)?.block_on(async move {
            let connection = Connection::new(&args.connection).map_err(Error::Connection)?;
            entity::send_command(&connection, &args.topic, descriptor, &request)
                .await
                .map_err(Error::Command)?;
            connection.disconnect().await;
            // The worker ends once the queued requests, including the disconnect, went out.
            let _ = connection.worker.await;
            Ok(())
        })
    }

}
