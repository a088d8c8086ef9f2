use super::{Common, EntityCategory};

#[derive(Debug)]
pub struct Descriptor {
    pub common: Common,
    pub command: &'static str,
    pub payload: &'static str,
}

pub static ENTITIES: &[Descriptor] = &[Descriptor {
    common: Common::stateless("clear_error", "Clear Error State")
        .icon("mdi:alert-remove")
        .category(EntityCategory::Config),
    command: "NPEscape",
    payload: "",
}];
