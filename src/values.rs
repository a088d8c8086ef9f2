use serde_json::Value;

/// Look up a dot-separated `path` in `document`.
///
/// Segments that consist only of digits index into arrays. `null` is treated the same as a
/// missing value.
pub fn get_nested_value<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    let mut value = document;
    for segment in path.split('.') {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) if is_index(segment) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!value.is_null()).then_some(value)
}

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

/// Decode a raw bus payload as a JSON document.
pub fn parse_json_payload(payload: &[u8]) -> Option<Value> {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(error = (&e as &dyn std::error::Error), "payload is not UTF-8");
            return None;
        }
    };
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = (&e as &dyn std::error::Error), "payload is not JSON");
            None
        }
    }
}

/// Parse the `DDDThh:mm:ss` runtime counters into hours, rounded to two decimals.
pub fn parse_runtime_duration(duration: &str) -> Option<f64> {
    let (days, time) = duration.split_once('T')?;
    let parsed = (|| {
        if time.contains('T') {
            return None;
        }
        let days = days.trim().parse::<i64>().ok()?;
        let mut parts = time.split(':').map(|p| p.trim().parse::<i64>().ok());
        let (Some(Some(hours)), Some(Some(minutes)), Some(Some(seconds)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return None;
        };
        let hours = days.checked_mul(24)?.checked_add(hours)?;
        let total = hours as f64 + minutes as f64 / 60.0 + seconds as f64 / 3600.0;
        Some(round_to(total, 2))
    })();
    if parsed.is_none() {
        tracing::warn!(duration, "could not parse the runtime duration");
    }
    parsed
}

/// `"1"`/`1` is `true`, `"0"`/`0` is `false`, anything else is unknown.
pub fn bit_to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::String(s) if s == "1" => Some(true),
        Value::String(s) if s == "0" => Some(false),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

/// Any positive integer is `true`. Values that are not integers are `false`.
pub fn int_to_bool(value: &Value) -> bool {
    let int = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    int.is_some_and(|i| i > 0)
}

pub fn safe_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

/// Integer conversion going through a float first, so that `"1e2"` is `100` and `-3.7` is `-3`.
pub fn safe_int(value: &Value) -> Option<i64> {
    if let Value::Number(n) = value {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    let float = safe_float(value)?;
    float.is_finite().then(|| float.trunc() as i64)
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    min.max(max.min(value))
}

pub fn round_to(value: f64, digits: u32) -> f64 {
    let scale = 10f64.powi(digits as i32);
    (value * scale).round() / scale
}

/// Render a raw value the way it appears in the device output, without JSON quoting.
pub fn display_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_lookup() {
        let doc = json!({"NeoPool": {"pH": {"Data": 7.2}, "Relay": {"Aux": [0, 1, 0, 0]}}});
        assert_eq!(get_nested_value(&doc, "NeoPool.pH.Data"), Some(&json!(7.2)));
        assert_eq!(get_nested_value(&doc, "NeoPool.Relay.Aux.1"), Some(&json!(1)));
        assert_eq!(get_nested_value(&doc, "NeoPool.Relay.Aux.7"), None);
        assert_eq!(get_nested_value(&doc, "NeoPool.Relay.Aux.x"), None);
        assert_eq!(get_nested_value(&doc, "NeoPool.pH.Data.More"), None);
        assert_eq!(get_nested_value(&doc, "Missing"), None);
        assert_eq!(get_nested_value(&json!({"a": null}), "a"), None);
    }

    #[test]
    fn runtime_duration() {
        assert_eq!(parse_runtime_duration("123T04:30:00"), Some(2956.5));
        assert_eq!(parse_runtime_duration("0T00:00:00"), Some(0.0));
        assert_eq!(parse_runtime_duration("1T00:00:36"), Some(24.01));
        assert_eq!(parse_runtime_duration("10T12:30"), None);
        assert_eq!(parse_runtime_duration("abcT12:30:00"), None);
        assert_eq!(parse_runtime_duration("12:30:00"), None);
        assert_eq!(parse_runtime_duration("1T2T03:00:00"), None);
        assert_eq!(parse_runtime_duration(""), None);
        assert_eq!(parse_runtime_duration("999999999999999999T00:00:00"), None);
        assert_eq!(parse_runtime_duration("384307168202282325T08:00:00"), None);
    }

    #[test]
    fn bits() {
        assert_eq!(bit_to_bool(&json!("1")), Some(true));
        assert_eq!(bit_to_bool(&json!(0)), Some(false));
        assert_eq!(bit_to_bool(&json!(2)), None);
        assert_eq!(bit_to_bool(&json!("on")), None);
        assert_eq!(bit_to_bool(&Value::Null), None);
        assert!(int_to_bool(&json!(3)));
        assert!(int_to_bool(&json!("2")));
        assert!(!int_to_bool(&json!("0")));
        assert!(!int_to_bool(&json!("1.5")));
        assert!(!int_to_bool(&json!({})));
    }

    #[test]
    fn numbers() {
        assert_eq!(safe_float(&json!("7.25")), Some(7.25));
        assert_eq!(safe_float(&json!(true)), Some(1.0));
        assert_eq!(safe_float(&json!("abc")), None);
        assert_eq!(safe_float(&json!([1])), None);
        assert_eq!(safe_int(&json!("1e2")), Some(100));
        assert_eq!(safe_int(&json!(-3.7)), Some(-3));
        assert_eq!(safe_int(&json!(true)), Some(1));
        assert_eq!(safe_int(&json!({"a": 1})), None);
        assert_eq!(safe_int(&Value::Null), None);
        assert_eq!(clamp(15.0, 0.0, 14.0), 14.0);
        assert_eq!(clamp(-1.0, 0.0, 14.0), 0.0);
        assert_eq!(round_to(12.345, 1), 12.3);
    }

    #[test]
    fn payloads() {
        assert_eq!(parse_json_payload(br#"{"a":1}"#), Some(json!({"a": 1})));
        assert_eq!(parse_json_payload(b"Online"), None);
        assert_eq!(parse_json_payload(&[0xff, 0xfe]), None);
    }
}
