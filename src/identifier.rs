//! The NeoPool power unit `NodeID` and the persisted keys derived from it.
//!
//! Tasmota masks the `NodeID` unless `SetOption157` is enabled, in which case the reported
//! value looks like `XXXX XXXX XXXX XXXX XXXX 3435`. A real `NodeID` is reported with spaces
//! between the hex groups (`0026 0051 5443 5016 2036 3435`), so spaces alone are not a sign of
//! masking.

use std::fmt;

/// Prefix of every entity key persisted by this bridge and its predecessors.
pub const UNIQUE_ID_PREFIX: &str = "neopool_mqtt";

const HIDDEN_SENTINELS: [&str; 2] = ["hidden", "hidden_by_default"];
const MASK_TOKEN: &str = "xxxx";

/// A validated and normalised hardware identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HardwareIdentifier(String);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidIdentifier {
    #[error("the identifier is empty")]
    Empty,
    #[error("the identifier `{0}` is hidden by the device")]
    Hidden(String),
    #[error("the identifier `{0}` is masked by the device")]
    Masked(String),
}

impl HardwareIdentifier {
    pub fn new(raw: &str) -> Result<Self, InvalidIdentifier> {
        if raw.trim().is_empty() {
            return Err(InvalidIdentifier::Empty);
        }
        let lower = raw.to_lowercase();
        if HIDDEN_SENTINELS.contains(&lower.as_str()) {
            return Err(InvalidIdentifier::Hidden(raw.to_string()));
        }
        if is_masked(raw) {
            return Err(InvalidIdentifier::Masked(raw.to_string()));
        }
        Ok(Self(normalize(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The persisted key of the entity `entity_key` belonging to this device.
    pub fn persisted_key(&self, entity_key: &str) -> String {
        format!("{UNIQUE_ID_PREFIX}_{}_{entity_key}", self.0)
    }

    /// Prefix shared by all persisted keys of this device.
    pub fn persisted_key_prefix(&self) -> String {
        format!("{UNIQUE_ID_PREFIX}_{}_", self.0)
    }

    /// Unique key of the configuration record for this device.
    pub fn config_unique_id(&self) -> String {
        format!("{}_{}", crate::DOMAIN, self.0)
    }
}

impl fmt::Display for HardwareIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for HardwareIdentifier {
    type Error = InvalidIdentifier;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<HardwareIdentifier> for String {
    fn from(value: HardwareIdentifier) -> Self {
        value.0
    }
}

impl std::str::FromStr for HardwareIdentifier {
    type Err = InvalidIdentifier;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Whether the identifier can be used as the foundation of persisted keys.
pub fn is_valid(raw: Option<&str>) -> bool {
    raw.is_some_and(|raw| HardwareIdentifier::new(raw).is_ok())
}

/// An absent identifier is treated as masked.
pub fn is_masked(raw: &str) -> bool {
    raw.is_empty() || raw.to_lowercase().contains("xxxx xxxx")
}

pub fn normalize(raw: &str) -> String {
    raw.replace(' ', "").to_uppercase()
}

/// Whether a persisted key was derived from a masked identifier.
pub fn is_masked_unique_id(unique_id: &str) -> bool {
    unique_id.to_lowercase().contains(MASK_TOKEN)
}

/// Recover the entity key from a persisted key derived from a masked identifier.
///
/// The identifier segment is made of `_`-separated parts whose space-separated tokens are all
/// either `XXXX` placeholders or groups of four hex digits. Everything after it is the entity
/// key: `neopool_mqtt_XXXX XXXX XXXX XXXX XXXX 3435_ph_data` gives `ph_data`.
pub fn masked_entity_key<'a>(unique_id: &'a str, prefix: &str) -> Option<&'a str> {
    let mut remainder = unique_id.strip_prefix(prefix)?;
    let mut masked = false;
    loop {
        let Some((part, rest)) = remainder.split_once('_') else {
            break;
        };
        if !is_identifier_part(part) {
            break;
        }
        masked |= part.to_lowercase().contains(MASK_TOKEN);
        remainder = rest;
    }
    (masked && !remainder.is_empty()).then_some(remainder)
}

fn is_identifier_part(part: &str) -> bool {
    let mut tokens = part.split(' ').filter(|t| !t.is_empty()).peekable();
    tokens.peek().is_some()
        && tokens.all(|t| {
            t.eq_ignore_ascii_case(MASK_TOKEN)
                || (t.len() == 4 && t.bytes().all(|b| b.is_ascii_hexdigit()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity() {
        assert!(is_valid(Some("4C7525BFB344")));
        assert!(is_valid(Some("0026 0051 5443 5016 2036 3435")));
        assert!(!is_valid(None));
        assert!(!is_valid(Some("")));
        for hidden in ["hidden", "HIDDEN", "Hidden", "hidden_by_default", "HIDDEN_BY_DEFAULT"] {
            assert!(!is_valid(Some(hidden)), "{hidden}");
        }
        assert!(!is_valid(Some("XXXX XXXX 3435")));
        assert!(!is_valid(Some("xxxx xxxx xxxx xxxx xxxx 3435")));
        // A single placeholder group is not the masked shape.
        assert!(is_valid(Some("XXXX 3435")));
    }

    #[test]
    fn normalisation() {
        let id = HardwareIdentifier::new("0026 0051 5443 5016 2036 3435").unwrap();
        assert_eq!(id.as_str(), "002600515443501620363435");
        let id = HardwareIdentifier::new("4c7525bfb344").unwrap();
        assert_eq!(id.as_str(), "4C7525BFB344");
        assert_eq!(id.persisted_key("ph_data"), "neopool_mqtt_4C7525BFB344_ph_data");
        assert_eq!(id.config_unique_id(), "sugar_valley_neopool_4C7525BFB344");
        assert_eq!(
            HardwareIdentifier::new("XXXX XXXX 3435"),
            Err(InvalidIdentifier::Masked("XXXX XXXX 3435".into()))
        );
    }

    #[test]
    fn masked_keys() {
        let prefix = "neopool_mqtt_";
        assert!(is_masked_unique_id("neopool_mqtt_XXXX_temp"));
        assert!(!is_masked_unique_id("neopool_mqtt_ABC123_temp"));
        assert_eq!(masked_entity_key("neopool_mqtt_XXXX_temp", prefix), Some("temp"));
        assert_eq!(
            masked_entity_key("neopool_mqtt_XXXX XXXX XXXX XXXX XXXX 3435_ph_data", prefix),
            Some("ph_data")
        );
        assert_eq!(
            masked_entity_key("neopool_mqtt_xxxx xxxx 3435_hydrolysis_runtime_total", prefix),
            Some("hydrolysis_runtime_total")
        );
        assert_eq!(masked_entity_key("neopool_mqtt_water_temperature", prefix), None);
        assert_eq!(masked_entity_key("neopool_mqtt_XXXX", prefix), None);
        assert_eq!(masked_entity_key("other_XXXX_temp", prefix), None);
    }

    #[test]
    fn serde_validates() {
        let id: HardwareIdentifier = serde_json::from_str("\"abc 123\"").unwrap();
        assert_eq!(id.as_str(), "ABC123");
        assert!(serde_json::from_str::<HardwareIdentifier>("\"hidden\"").is_err());
    }
}
