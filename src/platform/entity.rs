use super::{Domain, EntityDescriptor, EntityValue};
use crate::bus::{self, Bus, Subscription};
use crate::host::{StateSink, StateUpdate};
use crate::topics;
use crate::values::{display_raw, get_nested_value, parse_json_payload};
use tracing::{debug, warn};

pub struct Entity {
    descriptor: EntityDescriptor,
    topic: String,
    unique_id: String,
    entity_id: String,
    value: Option<EntityValue>,
    available: bool,
    telemetry: Option<Subscription>,
    liveness: Option<Subscription>,
}

enum Source {
    Telemetry,
    Liveness,
}

impl Entity {
    pub fn new(
        descriptor: EntityDescriptor,
        topic: &str,
        unique_id: String,
        entity_id: String,
    ) -> Self {
        Self {
            descriptor,
            topic: topic.to_string(),
            unique_id,
            entity_id,
            value: None,
            available: !descriptor.tracks_availability(),
            telemetry: None,
            liveness: None,
        }
    }

    pub fn descriptor(&self) -> EntityDescriptor {
        self.descriptor
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn value(&self) -> Option<&EntityValue> {
        self.value.as_ref()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn is_active(&self) -> bool {
        self.telemetry.is_some()
    }

    /// Start following the device liveness and telemetry.
    pub async fn activate(&mut self, bus: &impl Bus) -> Result<(), bus::Error> {
        if !self.descriptor.tracks_availability() {
            return Ok(());
        }
        let liveness = bus.subscribe(&topics::liveness(&self.topic)).await?;
        let telemetry = bus.subscribe(&topics::telemetry(&self.topic)).await?;
        self.liveness = Some(liveness);
        self.telemetry = Some(telemetry);
        debug!(entity.id = %self.entity_id, topic = %self.topic, "entity activated");
        Ok(())
    }

    /// Release both subscriptions.
    pub fn deactivate(&mut self) {
        self.telemetry = None;
        self.liveness = None;
        debug!(entity.id = %self.entity_id, "entity deactivated");
    }

    /// Returns whether the state changed and should be written.
    pub fn handle_telemetry(&mut self, payload: &[u8]) -> bool {
        let Some(path) = self.descriptor.json_path() else {
            return false;
        };
        let Some(document) = parse_json_payload(payload) else {
            return false;
        };
        let Some(raw) = get_nested_value(&document, path) else {
            return false;
        };
        let Some(value) = self.descriptor.state_from(raw) else {
            debug!(
                entity.key = self.descriptor.key(),
                raw = %display_raw(raw),
                "unrecognised value, keeping the current state"
            );
            return false;
        };
        self.value = value;
        self.available = true;
        true
    }

    pub fn handle_liveness(&mut self, payload: &[u8]) -> bool {
        self.available = payload == topics::PAYLOAD_ONLINE.as_bytes();
        true
    }

    pub fn state(&self) -> StateUpdate {
        StateUpdate {
            entity_id: self.entity_id.clone(),
            unique_id: self.unique_id.clone(),
            domain: self.descriptor.domain(),
            key: self.descriptor.key(),
            value: self.value.clone(),
            available: self.available,
            at: jiff::Timestamp::now(),
        }
    }

    /// Wait until a message changes the state.
    ///
    /// Returns `None` if the entity is not active or the bus went away.
    pub async fn next_update(&mut self) -> Option<StateUpdate> {
        loop {
            let (Some(telemetry), Some(liveness)) = (&mut self.telemetry, &mut self.liveness)
            else {
                return None;
            };
            let (source, message) = tokio::select! {
                m = telemetry.recv() => (Source::Telemetry, m?),
                m = liveness.recv() => (Source::Liveness, m?),
            };
            let changed = match source {
                Source::Telemetry => self.handle_telemetry(&message.payload),
                Source::Liveness => self.handle_liveness(&message.payload),
            };
            if changed {
                return Some(self.state());
            }
        }
    }

    /// Push every state change to `sink` for as long as the entity is active.
    pub async fn run(mut self, sink: &impl StateSink) {
        sink.write_state(&self.state());
        while let Some(update) = self.next_update().await {
            sink.write_state(&update);
        }
        debug!(entity.id = %self.entity_id, "entity stopped");
    }

    pub async fn command(&self, bus: &impl Bus, request: &CommandRequest) -> Result<(), CommandError> {
        send_command(bus, &self.topic, self.descriptor, request).await
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CommandRequest {
    TurnOn,
    TurnOff,
    SelectOption(String),
    SetValue(f64),
    Press,
}

#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("the {1} `{0}` cannot be operated this way")]
    Unsupported(&'static str, Domain),
    #[error("`{1}` is not an option of `{0}`")]
    UnknownOption(&'static str, String),
    #[error("{1} is outside of the {2}..={3} range of `{0}`")]
    OutOfRange(&'static str, f64, f64, f64),
    #[error("could not interpret `{1}` as a value for `{0}`")]
    ParseValue(&'static str, String),
    #[error("could not send the `{1}` command")]
    Publish(#[source] bus::Error, &'static str),
}

impl CommandRequest {
    /// Interpret a textual value the way it would be typed on the command line.
    pub fn parse(descriptor: EntityDescriptor, raw: &str) -> Result<Self, CommandError> {
        let key = descriptor.key();
        match descriptor {
            EntityDescriptor::Switch(_) => match raw.trim().to_lowercase().as_str() {
                "on" | "1" | "true" => Ok(CommandRequest::TurnOn),
                "off" | "0" | "false" => Ok(CommandRequest::TurnOff),
                _ => Err(CommandError::ParseValue(key, raw.to_string())),
            },
            EntityDescriptor::Select(_) => Ok(CommandRequest::SelectOption(raw.to_string())),
            EntityDescriptor::Number(_) => raw
                .trim()
                .parse::<f64>()
                .map(CommandRequest::SetValue)
                .map_err(|_| CommandError::ParseValue(key, raw.to_string())),
            EntityDescriptor::Button(_) => Ok(CommandRequest::Press),
            EntityDescriptor::Sensor(_) | EntityDescriptor::BinarySensor(_) => {
                Err(CommandError::Unsupported(key, descriptor.domain()))
            }
        }
    }
}

/// The command name and payload to publish for `request`.
pub fn command_payload(
    descriptor: EntityDescriptor,
    request: &CommandRequest,
) -> Result<(&'static str, String), CommandError> {
    use CommandRequest::*;
    match (descriptor, request) {
        (EntityDescriptor::Switch(d), TurnOn) => Ok((d.command, d.payload(true).to_string())),
        (EntityDescriptor::Switch(d), TurnOff) => Ok((d.command, d.payload(false).to_string())),
        (EntityDescriptor::Select(d), SelectOption(option)) => {
            let code = (d.code)(option)
                .ok_or_else(|| CommandError::UnknownOption(d.common.key, option.clone()))?;
            Ok((d.command, code.to_string()))
        }
        (EntityDescriptor::Number(d), SetValue(value)) => {
            if !value.is_finite() || !d.in_range(*value) {
                return Err(CommandError::OutOfRange(d.common.key, *value, d.min, d.max));
            }
            Ok((d.command, d.payload(*value)))
        }
        (EntityDescriptor::Button(d), Press) => Ok((d.command, d.payload.to_string())),
        (descriptor, _) => Err(CommandError::Unsupported(descriptor.key(), descriptor.domain())),
    }
}

/// Publish the command for `request` to the device at `topic`.
///
/// Nothing is published when the request is not valid for the entity.
pub async fn send_command(
    bus: &impl Bus,
    topic: &str,
    descriptor: EntityDescriptor,
    request: &CommandRequest,
) -> Result<(), CommandError> {
    let (command, payload) = command_payload(descriptor, request).inspect_err(|e| {
        warn!(
            entity.key = descriptor.key(),
            error = (e as &dyn std::error::Error),
            "not sending the command"
        )
    })?;
    let topic = topics::command(topic, command);
    bus.publish(&topic, &payload).await.map_err(|e| CommandError::Publish(e, command))?;
    debug!(%topic, %payload, "command sent");
    Ok(())
}
