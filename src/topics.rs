pub const PAYLOAD_ONLINE: &str = "Online";
pub const PAYLOAD_OFFLINE: &str = "Offline";

/// Top-level key present in every telemetry document produced by the NeoPool driver.
pub const MARKER_KEY: &str = "NeoPool";
pub const NODE_ID_PATH: &str = "NeoPool.Powerunit.NodeID";

/// Command that makes Tasmota report the unmasked `NodeID`.
pub const EXPOSE_IDENTIFIER_COMMAND: &str = "SetOption157";

/// Filter matching the telemetry of every Tasmota device on the broker.
pub const TELEMETRY_DISCOVERY_FILTER: &str = "tele/+/SENSOR";

pub fn telemetry(topic: &str) -> String {
    format!("tele/{topic}/SENSOR")
}

pub fn liveness(topic: &str) -> String {
    format!("tele/{topic}/LWT")
}

pub fn command(topic: &str, command: &str) -> String {
    format!("cmnd/{topic}/{command}")
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidTopic {
    #[error("the topic is empty")]
    Empty,
    #[error("the topic `{0}` contains a wildcard character")]
    Wildcard(String),
    #[error("the topic `{0}` must be a single level")]
    MultiLevel(String),
    #[error("the topic contains a NUL character")]
    Nul,
}

/// Check that `topic` can be used as the device part of the Tasmota topics.
pub fn validate_topic(topic: &str) -> Result<(), InvalidTopic> {
    if topic.trim().is_empty() {
        return Err(InvalidTopic::Empty);
    }
    if topic.contains(['+', '#']) {
        return Err(InvalidTopic::Wildcard(topic.to_string()));
    }
    if topic.contains('/') {
        return Err(InvalidTopic::MultiLevel(topic.to_string()));
    }
    if topic.contains('\0') {
        return Err(InvalidTopic::Nul);
    }
    Ok(())
}

/// Extract the device topic from a `tele/{device}/SENSOR` topic.
pub fn device_from_telemetry(topic: &str) -> Option<&str> {
    let rest = topic.strip_prefix("tele/")?;
    let device = rest.strip_suffix("/SENSOR")?;
    validate_topic(device).ok()?;
    Some(device)
}

/// MQTT filter matching with support for the `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(telemetry("SmartPool"), "tele/SmartPool/SENSOR");
        assert_eq!(liveness("SmartPool"), "tele/SmartPool/LWT");
        assert_eq!(command("SmartPool", "NPLight"), "cmnd/SmartPool/NPLight");
    }

    #[test]
    fn validation() {
        assert_eq!(validate_topic("SmartPool"), Ok(()));
        assert_eq!(validate_topic(""), Err(InvalidTopic::Empty));
        assert_eq!(validate_topic("  "), Err(InvalidTopic::Empty));
        assert!(matches!(validate_topic("Smart+"), Err(InvalidTopic::Wildcard(_))));
        assert!(matches!(validate_topic("#"), Err(InvalidTopic::Wildcard(_))));
        assert!(matches!(validate_topic("a/b"), Err(InvalidTopic::MultiLevel(_))));
        assert_eq!(validate_topic("a\0"), Err(InvalidTopic::Nul));
    }

    #[test]
    fn discovery_topics() {
        assert_eq!(device_from_telemetry("tele/SmartPool/SENSOR"), Some("SmartPool"));
        assert_eq!(device_from_telemetry("tele/a/b/SENSOR"), None);
        assert_eq!(device_from_telemetry("stat/SmartPool/SENSOR"), None);
        assert_eq!(device_from_telemetry("tele/SmartPool/STATE"), None);
    }

    #[test]
    fn matching() {
        assert!(topic_matches("tele/+/SENSOR", "tele/SmartPool/SENSOR"));
        assert!(!topic_matches("tele/+/SENSOR", "tele/SmartPool/LWT"));
        assert!(topic_matches("tele/#", "tele/SmartPool/LWT"));
        assert!(topic_matches("tele/SmartPool/LWT", "tele/SmartPool/LWT"));
        assert!(!topic_matches("tele/SmartPool", "tele/SmartPool/LWT"));
        assert!(!topic_matches("tele/SmartPool/LWT/x", "tele/SmartPool/LWT"));
    }
}
