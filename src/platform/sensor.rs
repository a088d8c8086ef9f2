use super::maps::{self, FiltrationMode, FiltrationSpeed, PhPump, PhState};
use super::{Common, EntityCategory, EntityValue, Transform};
use crate::values::{display_raw, parse_runtime_duration, round_to, safe_float, safe_int};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    pub unit: Option<&'static str>,
    pub state_class: Option<StateClass>,
    pub transform: Transform,
}

impl Descriptor {
    const fn new(common: Common, transform: Transform) -> Self {
        Self { common, unit: None, state_class: None, transform }
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn measurement(mut self) -> Self {
        self.state_class = Some(StateClass::Measurement);
        self
    }

    const fn total_increasing(mut self) -> Self {
        self.state_class = Some(StateClass::TotalIncreasing);
        self
    }
}

/// The value as reported, without any conversion.
fn raw(value: &Value) -> Option<EntityValue> {
    Some(match value {
        Value::Bool(b) => EntityValue::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => EntityValue::Integer(i),
            None => EntityValue::Number(n.as_f64()?),
        },
        other => EntityValue::Text(display_raw(other)),
    })
}

fn float(value: &Value) -> Option<EntityValue> {
    safe_float(value).map(EntityValue::Number)
}

fn int(value: &Value) -> Option<EntityValue> {
    safe_int(value).map(EntityValue::Integer)
}

fn whole_percent(value: &Value) -> Option<EntityValue> {
    Some(EntityValue::Number(round_to(safe_float(value).unwrap_or(0.0), 0)))
}

fn grams_per_hour(value: &Value) -> Option<EntityValue> {
    Some(EntityValue::Number(round_to(safe_float(value).unwrap_or(0.0), 1)))
}

fn runtime_hours(value: &Value) -> Option<EntityValue> {
    parse_runtime_duration(&display_raw(value)).map(EntityValue::Number)
}

const CONNECTION_ICON: &str = "mdi:source-branch-check";

pub static ENTITIES: &[Descriptor] = &[
    Descriptor::new(
        Common::new("system_model", "System Model", "NeoPool.Type").icon("mdi:information-outline"),
        raw,
    ),
    Descriptor::new(
        Common::new("water_temperature", "Water Temperature", "NeoPool.Temperature")
            .class("temperature"),
        float,
    )
    .unit("°C")
    .measurement(),
    Descriptor::new(Common::new("ph_data", "pH", "NeoPool.pH.Data").class("ph"), float)
        .measurement(),
    Descriptor::new(
        Common::new("ph_state", "pH State", "NeoPool.pH.State").icon("mdi:ph"),
        maps::label::<PhState>,
    ),
    Descriptor::new(
        Common::new("ph_pump", "pH Pump", "NeoPool.pH.Pump").icon("mdi:ph"),
        maps::label::<PhPump>,
    ),
    Descriptor::new(
        Common::new("redox_data", "Redox (ORP)", "NeoPool.Redox.Data").class("voltage"),
        float,
    )
    .unit("mV")
    .measurement(),
    Descriptor::new(
        Common::new("hydrolysis_percent", "Hydrolysis", "NeoPool.Hydrolysis.Percent.Data")
            .icon("mdi:water-opacity"),
        whole_percent,
    )
    .unit("%")
    .measurement(),
    Descriptor::new(
        Common::new("hydrolysis_data", "Hydrolysis (g/h)", "NeoPool.Hydrolysis.Data")
            .icon("mdi:water-opacity"),
        grams_per_hour,
    )
    .unit("g/h")
    .measurement(),
    Descriptor::new(
        Common::new("hydrolysis_state", "Hydrolysis State", "NeoPool.Hydrolysis.State")
            .icon("mdi:water-opacity"),
        maps::hydrolysis_state,
    ),
    Descriptor::new(
        Common::new(
            "hydrolysis_runtime_total",
            "Hydrolysis Runtime Total",
            "NeoPool.Hydrolysis.Runtime.Total",
        )
        .class("duration"),
        runtime_hours,
    )
    .unit("h")
    .total_increasing(),
    Descriptor::new(
        Common::new(
            "hydrolysis_runtime_part",
            "Hydrolysis Runtime Part",
            "NeoPool.Hydrolysis.Runtime.Part",
        )
        .class("duration"),
        runtime_hours,
    )
    .unit("h")
    .measurement(),
    Descriptor::new(
        Common::new(
            "hydrolysis_polarity_changes",
            "Hydrolysis Polarity Changes",
            "NeoPool.Hydrolysis.Runtime.Changes",
        )
        .icon("mdi:swap-horizontal"),
        int,
    )
    .total_increasing(),
    Descriptor::new(
        Common::new("filtration_mode", "Filtration Mode", "NeoPool.Filtration.Mode")
            .icon("mdi:pump"),
        maps::label::<FiltrationMode>,
    ),
    Descriptor::new(
        Common::new("filtration_speed", "Filtration Speed", "NeoPool.Filtration.Speed")
            .icon("mdi:speedometer"),
        maps::label::<FiltrationSpeed>,
    ),
    Descriptor::new(
        Common::new("powerunit_version", "Powerunit Version", "NeoPool.Powerunit.Version")
            .icon("mdi:information-outline"),
        raw,
    ),
    Descriptor::new(
        Common::new("powerunit_5v", "Powerunit 5V", "NeoPool.Powerunit.5V").class("voltage"),
        float,
    )
    .unit("V")
    .measurement(),
    Descriptor::new(
        Common::new("powerunit_12v", "Powerunit 12V", "NeoPool.Powerunit.12V").class("voltage"),
        float,
    )
    .unit("V")
    .measurement(),
    Descriptor::new(
        Common::new("powerunit_24v", "Powerunit 24-30V", "NeoPool.Powerunit.24-30V")
            .class("voltage"),
        float,
    )
    .unit("V")
    .measurement(),
    Descriptor::new(
        Common::new("powerunit_4ma", "Powerunit 4-20mA", "NeoPool.Powerunit.4-20mA")
            .class("current"),
        float,
    )
    .unit("mA")
    .measurement(),
    Descriptor::new(
        Common::new("connection_requests", "Connection Requests", "NeoPool.Connection.MBRequests")
            .icon(CONNECTION_ICON)
            .category(EntityCategory::Diagnostic)
            .disabled_by_default(),
        int,
    )
    .total_increasing(),
    Descriptor::new(
        Common::new("connection_responses", "Connection Responses", "NeoPool.Connection.MBNoError")
            .icon(CONNECTION_ICON)
            .category(EntityCategory::Diagnostic)
            .disabled_by_default(),
        int,
    )
    .total_increasing(),
    Descriptor::new(
        Common::new(
            "connection_no_response",
            "Connection No Response",
            "NeoPool.Connection.MBNoResponse",
        )
        .icon(CONNECTION_ICON)
        .category(EntityCategory::Diagnostic)
        .disabled_by_default(),
        int,
    )
    .total_increasing(),
    Descriptor::new(
        Common::new(
            "connection_out_of_range",
            "Connection Out of Range",
            "NeoPool.Connection.DataOutOfRange",
        )
        .icon(CONNECTION_ICON)
        .category(EntityCategory::Diagnostic)
        .disabled_by_default(),
        int,
    )
    .total_increasing(),
    Descriptor::new(
        Common::new("powerunit_nodeid", "Powerunit NodeID", "NeoPool.Powerunit.NodeID")
            .icon("mdi:identifier")
            .category(EntityCategory::Diagnostic),
        raw,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn find(key: &str) -> &'static Descriptor {
        ENTITIES.iter().find(|d| d.common.key == key).unwrap()
    }

    #[test]
    fn transforms() {
        let apply = |key: &str, raw: Value| (find(key).transform)(&raw);
        assert_eq!(apply("water_temperature", json!("27.5")), Some(EntityValue::Number(27.5)));
        assert_eq!(apply("water_temperature", json!("n/a")), None);
        assert_eq!(apply("hydrolysis_percent", json!(54.6)), Some(EntityValue::Number(55.0)));
        assert_eq!(apply("hydrolysis_percent", json!("bad")), Some(EntityValue::Number(0.0)));
        assert_eq!(apply("hydrolysis_data", json!(12.34)), Some(EntityValue::Number(12.3)));
        assert_eq!(
            apply("hydrolysis_runtime_total", json!("123T04:30:00")),
            Some(EntityValue::Number(2956.5))
        );
        assert_eq!(apply("hydrolysis_polarity_changes", json!("42")), Some(EntityValue::Integer(42)));
        assert_eq!(apply("ph_state", json!(0)), Some(EntityValue::Text("No Alarm".into())));
        assert_eq!(apply("hydrolysis_state", json!("FLOW")), Some(EntityValue::Text("Flow Alarm".into())));
        assert_eq!(apply("system_model", json!("Hidrolife")), Some(EntityValue::Text("Hidrolife".into())));
        assert_eq!(apply("powerunit_version", json!(3)), Some(EntityValue::Integer(3)));
    }

    #[test]
    fn diagnostics_are_hidden() {
        let requests = find("connection_requests");
        assert_eq!(requests.common.category, Some(EntityCategory::Diagnostic));
        assert!(!requests.common.enabled_by_default);
        assert_eq!(requests.state_class, Some(StateClass::TotalIncreasing));
        assert!(find("powerunit_nodeid").common.enabled_by_default);
        assert_eq!(find("powerunit_24v").common.json_path, Some("NeoPool.Powerunit.24-30V"));
    }
}
