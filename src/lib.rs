pub mod bridge;
pub mod bus;
pub mod commands;
pub mod connection;
pub mod host;
pub mod identifier;
pub mod migrate;
pub mod output;
pub mod platform;
pub mod registry;
pub mod setup;
pub mod storage;
pub mod topics;
pub mod values;

/// Namespace of configuration records and device groups created by this bridge.
pub const DOMAIN: &str = "sugar_valley_neopool";
pub const MANUFACTURER: &str = "Sugar Valley";
pub const MODEL: &str = "NeoPool Controller";
pub const CONFIGURATION_URL: &str = "https://tasmota.github.io/docs/NeoPool/";
pub const DEFAULT_DEVICE_NAME: &str = "NeoPool";
pub const DEFAULT_MQTT_TOPIC: &str = "SmartPool";
