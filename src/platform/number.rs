use super::Common;
use crate::values::{clamp, safe_float};
use serde_json::Value;

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    pub command: &'static str,
    pub unit: Option<&'static str>,
    pub min: f64,
    pub max: f64,
    pub step: f64,
    /// Payload with `{value}` standing in for the integral value.
    pub template: Option<&'static str>,
}

impl Descriptor {
    pub fn state_from(&self, raw: &Value) -> Option<f64> {
        safe_float(raw)
    }

    pub fn in_range(&self, value: f64) -> bool {
        clamp(value, self.min, self.max) == value
    }

    /// Render the command payload for `value`.
    pub fn payload(&self, value: f64) -> String {
        if let Some(template) = self.template {
            template.replace("{value}", &(value.trunc() as i64).to_string())
        } else if self.step >= 1.0 {
            (value.trunc() as i64).to_string()
        } else if value.fract() == 0.0 {
            format!("{value:.1}")
        } else {
            value.to_string()
        }
    }
}

pub static ENTITIES: &[Descriptor] = &[
    Descriptor {
        common: Common::new("ph_min", "pH Min", "NeoPool.pH.Min").icon("mdi:ph").class("ph"),
        command: "NPpHMin",
        unit: None,
        min: 0.0,
        max: 14.0,
        step: 0.1,
        template: None,
    },
    Descriptor {
        common: Common::new("ph_max", "pH Max", "NeoPool.pH.Max").icon("mdi:ph").class("ph"),
        command: "NPpHMax",
        unit: None,
        min: 0.0,
        max: 14.0,
        step: 0.1,
        template: None,
    },
    Descriptor {
        common: Common::new("redox_setpoint", "Redox Setpoint", "NeoPool.Redox.Setpoint")
            .icon("mdi:flash"),
        command: "NPRedox",
        unit: Some("mV"),
        min: 0.0,
        max: 1000.0,
        step: 1.0,
        template: None,
    },
    Descriptor {
        common: Common::new(
            "hydrolysis_setpoint",
            "Hydrolysis Setpoint",
            "NeoPool.Hydrolysis.Percent.Setpoint",
        )
        .icon("mdi:water-opacity"),
        command: "NPHydrolysis",
        unit: Some("%"),
        min: 0.0,
        max: 100.0,
        step: 1.0,
        template: Some("{value} %"),
    },
];
