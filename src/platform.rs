use serde_json::Value;
use std::collections::BTreeSet;

pub mod binary_sensor;
pub mod button;
pub mod entity;
pub mod maps;
pub mod number;
pub mod select;
pub mod sensor;
pub mod switch;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
    strum::EnumIter,
    serde::Serialize,
    serde::Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Sensor,
    BinarySensor,
    Switch,
    Select,
    Number,
    Button,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EntityCategory {
    Config,
    Diagnostic,
}

/// A state value as it is handed over to the host.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(String),
}

impl std::fmt::Display for EntityValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityValue::Bool(true) => f.write_str("on"),
            EntityValue::Bool(false) => f.write_str("off"),
            EntityValue::Integer(i) => write!(f, "{i}"),
            EntityValue::Number(n) => write!(f, "{n}"),
            EntityValue::Text(t) => f.write_str(t),
        }
    }
}

/// Converts the raw telemetry value into the entity state.
pub type Transform = fn(&Value) -> Option<EntityValue>;

/// Attributes every entity kind has.
#[derive(Debug)]
pub struct Common {
    pub key: &'static str,
    pub name: &'static str,
    /// Dot-separated path into the telemetry document. Buttons have none.
    pub json_path: Option<&'static str>,
    pub icon: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub category: Option<EntityCategory>,
    pub enabled_by_default: bool,
}

impl Common {
    pub const fn new(key: &'static str, name: &'static str, json_path: &'static str) -> Self {
        Self {
            key,
            name,
            json_path: Some(json_path),
            icon: None,
            device_class: None,
            category: None,
            enabled_by_default: true,
        }
    }

    pub const fn stateless(key: &'static str, name: &'static str) -> Self {
        Self {
            key,
            name,
            json_path: None,
            icon: None,
            device_class: None,
            category: None,
            enabled_by_default: true,
        }
    }

    pub const fn icon(mut self, icon: &'static str) -> Self {
        self.icon = Some(icon);
        self
    }

    pub const fn class(mut self, device_class: &'static str) -> Self {
        self.device_class = Some(device_class);
        self
    }

    pub const fn category(mut self, category: EntityCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub const fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub enum EntityDescriptor {
    Sensor(&'static sensor::Descriptor),
    BinarySensor(&'static binary_sensor::Descriptor),
    Switch(&'static switch::Descriptor),
    Select(&'static select::Descriptor),
    Number(&'static number::Descriptor),
    Button(&'static button::Descriptor),
}

impl EntityDescriptor {
    pub fn all() -> impl Iterator<Item = EntityDescriptor> {
        let sensors = sensor::ENTITIES.iter().map(EntityDescriptor::Sensor);
        let binary_sensors = binary_sensor::ENTITIES.iter().map(EntityDescriptor::BinarySensor);
        let switches = switch::ENTITIES.iter().map(EntityDescriptor::Switch);
        let selects = select::ENTITIES.iter().map(EntityDescriptor::Select);
        let numbers = number::ENTITIES.iter().map(EntityDescriptor::Number);
        let buttons = button::ENTITIES.iter().map(EntityDescriptor::Button);
        sensors.chain(binary_sensors).chain(switches).chain(selects).chain(numbers).chain(buttons)
    }

    /// Keys are only unique within a domain: `filtration_mode` is both a sensor and a select.
    pub fn find(domain: Domain, key: &str) -> Option<EntityDescriptor> {
        Self::all().find(|d| d.domain() == domain && d.key() == key)
    }

    /// Every domain that declares an entity with `key`.
    pub fn domains_of(key: &str) -> BTreeSet<Domain> {
        Self::all().filter(|d| d.key() == key).map(|d| d.domain()).collect()
    }

    pub fn common(&self) -> &'static Common {
        match *self {
            EntityDescriptor::Sensor(d) => &d.common,
            EntityDescriptor::BinarySensor(d) => &d.common,
            EntityDescriptor::Switch(d) => &d.common,
            EntityDescriptor::Select(d) => &d.common,
            EntityDescriptor::Number(d) => &d.common,
            EntityDescriptor::Button(d) => &d.common,
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            EntityDescriptor::Sensor(_) => Domain::Sensor,
            EntityDescriptor::BinarySensor(_) => Domain::BinarySensor,
            EntityDescriptor::Switch(_) => Domain::Switch,
            EntityDescriptor::Select(_) => Domain::Select,
            EntityDescriptor::Number(_) => Domain::Number,
            EntityDescriptor::Button(_) => Domain::Button,
        }
    }

    pub fn key(&self) -> &'static str {
        self.common().key
    }

    pub fn name(&self) -> &'static str {
        self.common().name
    }

    pub fn json_path(&self) -> Option<&'static str> {
        self.common().json_path
    }

    /// The command published when the entity is operated, if it can be.
    pub fn command(&self) -> Option<&'static str> {
        match self {
            EntityDescriptor::Sensor(_) | EntityDescriptor::BinarySensor(_) => None,
            EntityDescriptor::Switch(d) => Some(d.command),
            EntityDescriptor::Select(d) => Some(d.command),
            EntityDescriptor::Number(d) => Some(d.command),
            EntityDescriptor::Button(d) => Some(d.command),
        }
    }

    pub fn unit(&self) -> Option<&'static str> {
        match self {
            EntityDescriptor::Sensor(d) => d.unit,
            EntityDescriptor::Number(d) => d.unit,
            _ => None,
        }
    }

    /// Whether the entity reports its availability through the device's liveness topic.
    pub fn tracks_availability(&self) -> bool {
        !matches!(self, EntityDescriptor::Button(_))
    }

    /// Compute the new state from the value found at [`Self::json_path`].
    ///
    /// The outer `None` means the current state is to be kept as is.
    pub fn state_from(&self, raw: &Value) -> Option<Option<EntityValue>> {
        match self {
            EntityDescriptor::Sensor(d) => Some((d.transform)(raw)),
            EntityDescriptor::BinarySensor(d) => Some(d.state_from(raw).map(EntityValue::Bool)),
            EntityDescriptor::Switch(d) => Some(d.state_from(raw).map(EntityValue::Bool)),
            EntityDescriptor::Select(d) => (d.state)(raw).map(Some),
            EntityDescriptor::Number(d) => Some(d.state_from(raw).map(EntityValue::Number)),
            EntityDescriptor::Button(_) => None,
        }
    }
}

/// Entity keys used by earlier releases, mapped to the current ones.
pub const LEGACY_KEYS: &[(&str, &str)] = &[
    ("filtration_switch", "filtration"),
    ("light_switch", "light"),
    ("aux1_switch", "aux1"),
    ("aux2_switch", "aux2"),
    ("aux3_switch", "aux3"),
    ("aux4_switch", "aux4"),
    ("clear_error_state", "clear_error"),
    ("hydrolysis_data", "hydrolysis_percent"),
    ("hydrolysis_data_gh", "hydrolysis_data"),
    ("hydrolysis_data_g_h", "hydrolysis_data"),
    ("hydrolysis_runtime_pol_changes", "hydrolysis_polarity_changes"),
    ("hydrolysis_runtime_polarity_changes", "hydrolysis_polarity_changes"),
    ("hydrolysis_ctrl_fl1_water_flow", "hydrolysis_water_flow"),
    ("hydrolysis_ctrl_fl1", "hydrolysis_fl1"),
    ("ph_ctrl_fl1", "ph_fl1"),
    ("ph_module", "modules_ph"),
    ("redox_module", "modules_redox"),
    ("hydrolysis_module", "modules_hydrolysis"),
    ("chlorine_module", "modules_chlorine"),
    ("conductivity_module", "modules_conductivity"),
    ("ionization_module", "modules_ionization"),
    ("hydrolysis_boost_mode", "boost_mode"),
    ("conndiag_system_requests", "connection_requests"),
    ("conndiag_system_responses", "connection_responses"),
    ("conndiag_missed_system_responses", "connection_no_response"),
    ("conndiag_outofrange_system_responses", "connection_out_of_range"),
    ("connection_system_requests", "connection_requests"),
    ("connection_system_responses", "connection_responses"),
    ("connection_missed_system_responses", "connection_no_response"),
    ("connection_out_of_range_system_responses", "connection_out_of_range"),
    // These used to be read-only relay indicators and are now switches.
    ("relay_aux1_state", "aux1"),
    ("relay_aux2_state", "aux2"),
    ("relay_aux3_state", "aux3"),
    ("relay_aux4_state", "aux4"),
];

pub fn translate_legacy_key(key: &str) -> &str {
    LEGACY_KEYS.iter().find(|(old, _)| *old == key).map(|(_, new)| *new).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;

    #[test]
    fn keys_are_unique_per_domain() {
        let mut seen = HashSet::new();
        for descriptor in EntityDescriptor::all() {
            assert!(
                seen.insert((descriptor.domain(), descriptor.key())),
                "{} {}",
                descriptor.domain(),
                descriptor.key()
            );
        }
        assert_eq!(
            EntityDescriptor::domains_of("filtration_mode"),
            BTreeSet::from([Domain::Sensor, Domain::Select])
        );
        assert!(EntityDescriptor::domains_of("nonexistent").is_empty());
    }

    #[test]
    fn every_operable_entity_has_a_command() {
        for descriptor in EntityDescriptor::all() {
            let operable = matches!(
                descriptor.domain(),
                Domain::Switch | Domain::Select | Domain::Number | Domain::Button
            );
            assert_eq!(descriptor.command().is_some(), operable, "{}", descriptor.key());
            assert_eq!(
                descriptor.json_path().is_some(),
                descriptor.domain() != Domain::Button,
                "{}",
                descriptor.key()
            );
        }
    }

    #[test]
    fn legacy_keys_lead_to_declared_entities() {
        for (old, new) in LEGACY_KEYS {
            assert!(!EntityDescriptor::domains_of(new).is_empty(), "{old} -> {new}");
        }
        assert_eq!(translate_legacy_key("light_switch"), "light");
        assert_eq!(translate_legacy_key("water_temperature"), "water_temperature");
        assert_eq!(translate_legacy_key("relay_aux2_state"), "aux2");
    }

    #[test]
    fn domain_names() {
        assert_eq!(Domain::BinarySensor.to_string(), "binary_sensor");
        assert_eq!(Domain::from_str("select"), Ok(Domain::Select));
        assert!(Domain::from_str("light").is_err());
    }
}
