use super::maps::{self, BoostMode, FiltrationMode, FiltrationSpeed};
use super::{Common, Transform};

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    pub command: &'static str,
    /// Current option for a reported code, `None` when the code is unknown.
    pub state: Transform,
    pub options: fn() -> Vec<String>,
    /// Code to send for an option label.
    pub code: fn(&str) -> Option<i64>,
}

pub static ENTITIES: &[Descriptor] = &[
    Descriptor {
        common: Common::new("filtration_mode", "Filtration Mode", "NeoPool.Filtration.Mode")
            .icon("mdi:pump"),
        command: "NPFiltrationmode",
        state: maps::option::<FiltrationMode>,
        options: maps::options::<FiltrationMode>,
        code: maps::code::<FiltrationMode>,
    },
    Descriptor {
        common: Common::new("filtration_speed", "Filtration Speed", "NeoPool.Filtration.Speed")
            .icon("mdi:speedometer"),
        command: "NPFiltrationSpeed",
        state: maps::option::<FiltrationSpeed>,
        options: maps::options::<FiltrationSpeed>,
        code: maps::code::<FiltrationSpeed>,
    },
    Descriptor {
        common: Common::new("boost_mode", "Boost Mode", "NeoPool.Hydrolysis.Boost")
            .icon("mdi:rocket-launch"),
        command: "NPBoost",
        state: maps::option::<BoostMode>,
        options: maps::options::<BoostMode>,
        code: maps::code::<BoostMode>,
    },
];
