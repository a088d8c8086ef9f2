use super::EntityValue;
use crate::values::{display_raw, safe_int};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_json::Value;
use std::str::FromStr;
use strum::IntoEnumIterator;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum PhState {
    #[strum(to_string = "No Alarm")]
    NoAlarm = 0,
    #[strum(to_string = "pH too high")]
    TooHigh = 1,
    #[strum(to_string = "pH too low")]
    TooLow = 2,
    #[strum(to_string = "Pump exceeded working time")]
    PumpExceededWorkingTime = 3,
    #[strum(to_string = "pH high")]
    High = 4,
    #[strum(to_string = "pH low")]
    Low = 5,
    #[strum(to_string = "Tank level low")]
    TankLevelLow = 6,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum PhPump {
    #[strum(to_string = "Control Off")]
    ControlOff = 0,
    #[strum(to_string = "Active")]
    Active = 1,
    #[strum(to_string = "Not Active")]
    NotActive = 2,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum FiltrationMode {
    Manual = 0,
    Auto = 1,
    Heating = 2,
    Smart = 3,
    Intelligent = 4,
    Backwash = 13,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum FiltrationSpeed {
    Slow = 1,
    Medium = 2,
    Fast = 3,
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    num_derive::FromPrimitive,
    num_derive::ToPrimitive,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum BoostMode {
    Off = 0,
    On = 1,
    #[strum(to_string = "On (Redox)")]
    OnRedox = 2,
}

/// Hydrolysis cell state, reported as a short mnemonic rather than a number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter)]
pub enum HydrolysisState {
    #[strum(serialize = "OFF", to_string = "Cell Inactive")]
    Off,
    #[strum(serialize = "FLOW", to_string = "Flow Alarm")]
    Flow,
    #[strum(serialize = "POL1", to_string = "Pol1 active")]
    Pol1,
    #[strum(serialize = "POL2", to_string = "Pol2 active")]
    Pol2,
}

/// Label for a numeric code, or `Unknown (raw)` for codes the driver does not document.
pub fn label<T: FromPrimitive + std::fmt::Display>(raw: &Value) -> Option<EntityValue> {
    let label = safe_int(raw)
        .and_then(T::from_i64)
        .map(|v| v.to_string())
        .unwrap_or_else(|| format!("Unknown ({})", display_raw(raw)));
    Some(EntityValue::Text(label))
}

pub fn hydrolysis_state(raw: &Value) -> Option<EntityValue> {
    let label = HydrolysisState::from_str(&display_raw(raw).to_uppercase())
        .map(|v| v.to_string())
        .unwrap_or_else(|_| format!("Unknown ({})", display_raw(raw)));
    Some(EntityValue::Text(label))
}

/// Current option of a select, `None` for unknown codes.
pub fn option<T: FromPrimitive + std::fmt::Display>(raw: &Value) -> Option<EntityValue> {
    let value = safe_int(raw).and_then(T::from_i64)?;
    Some(EntityValue::Text(value.to_string()))
}

pub fn options<T: IntoEnumIterator + std::fmt::Display>() -> Vec<String> {
    T::iter().map(|v| v.to_string()).collect()
}

/// Numeric code to send for the option labelled `label`.
pub fn code<T: FromStr + ToPrimitive>(label: &str) -> Option<i64> {
    T::from_str(label).ok()?.to_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn labels() {
        assert_eq!(label::<PhState>(&json!(1)), Some(EntityValue::Text("pH too high".into())));
        assert_eq!(label::<PhState>(&json!("6")), Some(EntityValue::Text("Tank level low".into())));
        assert_eq!(label::<PhPump>(&json!(9)), Some(EntityValue::Text("Unknown (9)".into())));
        assert_eq!(
            label::<FiltrationMode>(&json!("abc")),
            Some(EntityValue::Text("Unknown (abc)".into()))
        );
        assert_eq!(
            label::<FiltrationMode>(&json!(13)),
            Some(EntityValue::Text("Backwash".into()))
        );
        assert_eq!(
            hydrolysis_state(&json!("pol1")),
            Some(EntityValue::Text("Pol1 active".into()))
        );
        assert_eq!(hydrolysis_state(&json!("x")), Some(EntityValue::Text("Unknown (x)".into())));
    }

    #[test]
    fn select_options() {
        assert_eq!(options::<BoostMode>(), ["Off", "On", "On (Redox)"]);
        assert_eq!(options::<FiltrationSpeed>(), ["Slow", "Medium", "Fast"]);
        assert_eq!(code::<BoostMode>("On (Redox)"), Some(2));
        assert_eq!(code::<FiltrationMode>("Backwash"), Some(13));
        assert_eq!(code::<FiltrationMode>("Turbo"), None);
        assert_eq!(option::<FiltrationSpeed>(&json!(0)), None);
        assert_eq!(option::<FiltrationSpeed>(&json!(2)), Some(EntityValue::Text("Medium".into())));
    }
}
