use super::Common;
use crate::values::bit_to_bool;
use serde_json::Value;

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    /// Report `on` when the device reports `0`.
    pub invert: bool,
}

impl Descriptor {
    const fn new(common: Common) -> Self {
        Self { common, invert: false }
    }

    const fn inverted(common: Common) -> Self {
        Self { common, invert: true }
    }

    pub fn state_from(&self, raw: &Value) -> Option<bool> {
        bit_to_bool(raw).map(|on| on != self.invert)
    }
}

pub static ENTITIES: &[Descriptor] = &[
    Descriptor::new(Common::new("modules_ph", "pH Module", "NeoPool.Modules.pH").icon("mdi:ph")),
    Descriptor::new(
        Common::new("modules_redox", "Redox Module", "NeoPool.Modules.Redox").icon("mdi:flash"),
    ),
    Descriptor::new(
        Common::new("modules_hydrolysis", "Hydrolysis Module", "NeoPool.Modules.Hydrolysis")
            .icon("mdi:water-opacity"),
    ),
    Descriptor::new(
        Common::new("modules_chlorine", "Chlorine Module", "NeoPool.Modules.Chlorine")
            .icon("mdi:beaker"),
    ),
    Descriptor::new(
        Common::new("modules_conductivity", "Conductivity Module", "NeoPool.Modules.Conductivity")
            .icon("mdi:flash-circle"),
    ),
    Descriptor::new(
        Common::new("modules_ionization", "Ionization Module", "NeoPool.Modules.Ionization")
            .icon("mdi:atom"),
    ),
    Descriptor::new(
        Common::new("relay_ph_state", "Relay pH State", "NeoPool.Relay.State.0")
            .icon("mdi:electric-switch"),
    ),
    Descriptor::new(
        Common::new("relay_filtration_state", "Relay Filtration State", "NeoPool.Relay.State.1")
            .class("running"),
    ),
    Descriptor::new(
        Common::new("relay_light_state", "Relay Light State", "NeoPool.Relay.State.2")
            .class("light"),
    ),
    Descriptor::new(
        Common::new("relay_acid_state", "Relay Acid State", "NeoPool.Relay.Acid").icon("mdi:flask"),
    ),
    Descriptor::new(Common::new("ph_fl1", "pH FL1", "NeoPool.pH.FL1").icon("mdi:waves-arrow-right")),
    Descriptor::new(
        Common::new("hydrolysis_fl1", "Hydrolysis FL1", "NeoPool.Hydrolysis.FL1")
            .icon("mdi:waves-arrow-right"),
    ),
    // FL1 is 1 when there is no flow.
    Descriptor::inverted(
        Common::new("hydrolysis_water_flow", "Water Flow", "NeoPool.Hydrolysis.FL1")
            .class("running"),
    ),
    // Tank is 1 while the level is fine.
    Descriptor::inverted(
        Common::new("ph_tank_level", "pH Tank Level Low", "NeoPool.pH.Tank").class("problem"),
    ),
    Descriptor::inverted(
        Common::new("redox_tank_level", "Redox Tank Level Low", "NeoPool.Redox.Tank")
            .class("problem"),
    ),
    Descriptor::new(
        Common::new("hydrolysis_cover", "Hydrolysis Cover", "NeoPool.Hydrolysis.Cover")
            .icon("mdi:pool"),
    ),
    Descriptor::new(
        Common::new("hydrolysis_low_production", "Hydrolysis Low Production", "NeoPool.Hydrolysis.Low")
            .class("problem"),
    ),
];
