use serde_json::Value;

/// Coerce a JSON number or numeric string into a finite f64.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Coerce a JSON value into a non-negative integer rank.
pub fn coerce_u32(value: &Value) -> Option<u32> {
    let v = coerce_f64(value)?;
    if v < 0.0 || v > u32::MAX as f64 {
        return None;
    }
    Some(v as u32)
}

/// Coerce a JSON value into a non-empty trimmed string.
pub fn coerce_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_f64() {
        assert_eq!(coerce_f64(&json!(1.5)), Some(1.5));
        assert_eq!(coerce_f64(&json!(" 42.25 ")), Some(42.25));
        assert_eq!(coerce_f64(&json!("abc")), None);
        assert_eq!(coerce_f64(&json!("NaN")), None);
        assert_eq!(coerce_f64(&json!(null)), None);
        assert_eq!(coerce_f64(&json!(true)), None);
    }

    #[test]
    fn test_coerce_u32() {
        assert_eq!(coerce_u32(&json!(3)), Some(3));
        assert_eq!(coerce_u32(&json!("7")), Some(7));
        assert_eq!(coerce_u32(&json!(-1)), None);
    }

    #[test]
    fn test_coerce_string() {
        assert_eq!(coerce_string(&json!(" btc ")), Some("btc".to_string()));
        assert_eq!(coerce_string(&json!("")), None);
        assert_eq!(coerce_string(&json!(null)), None);
    }
}
