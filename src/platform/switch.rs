use super::Common;
use crate::values::bit_to_bool;
use serde_json::Value;

pub const PAYLOAD_ON: &str = "1";
pub const PAYLOAD_OFF: &str = "0";

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    pub command: &'static str,
}

impl Descriptor {
    const fn new(common: Common, command: &'static str) -> Self {
        Self { common, command }
    }

    pub fn state_from(&self, raw: &Value) -> Option<bool> {
        bit_to_bool(raw)
    }

    pub fn payload(&self, on: bool) -> &'static str {
        if on { PAYLOAD_ON } else { PAYLOAD_OFF }
    }
}

pub static ENTITIES: &[Descriptor] = &[
    Descriptor::new(
        Common::new("filtration", "Filtration", "NeoPool.Filtration.State").icon("mdi:pump"),
        "NPFiltration",
    ),
    Descriptor::new(Common::new("light", "Light", "NeoPool.Light").icon("mdi:lightbulb"), "NPLight"),
    Descriptor::new(
        Common::new("aux1", "AUX1", "NeoPool.Relay.Aux.0").icon("mdi:electric-switch"),
        "NPAux1",
    ),
    Descriptor::new(
        Common::new("aux2", "AUX2", "NeoPool.Relay.Aux.1").icon("mdi:electric-switch"),
        "NPAux2",
    ),
    Descriptor::new(
        Common::new("aux3", "AUX3", "NeoPool.Relay.Aux.2").icon("mdi:electric-switch"),
        "NPAux3",
    ),
    Descriptor::new(
        Common::new("aux4", "AUX4", "NeoPool.Relay.Aux.3").icon("mdi:electric-switch"),
        "NPAux4",
    ),
];
