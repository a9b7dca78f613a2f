//! Small general-purpose helpers: human-readable number formatting,
//! percentages and JSON numeric coercion for the loosely-typed payloads
//! Twitch delivers over PubSub and GQL.

use serde_json::Value;

/// Converts a number to a human-readable string with SI suffixes,
/// e.g. `1500` -> `"1.5K"`, `2000000` -> `"2M"`.
pub fn millify(n: i64, precision: usize) -> String {
    let abs = n.unsigned_abs() as f64;
    let sign = if n < 0 { "-" } else { "" };

    const SUFFIXES: [(f64, &str); 5] = [
        (1e15, "Q"),
        (1e12, "T"),
        (1e9, "B"),
        (1e6, "M"),
        (1e3, "K"),
    ];

    for (threshold, suffix) in SUFFIXES {
        if abs >= threshold {
            let formatted = format_trimmed(abs / threshold, precision);
            return format!("{sign}{formatted}{suffix}");
        }
    }

    n.to_string()
}

fn format_trimmed(f: f64, precision: usize) -> String {
    let s = format!("{f:.precision$}");
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_owned()
    } else {
        s
    }
}

/// Integer percentage of a/b, 0 when either side is 0.
pub fn percentage(a: u64, b: u64) -> u64 {
    if a == 0 || b == 0 {
        return 0;
    }
    ((a as f64 / b as f64) * 100.0) as u64
}

/// Rounds a float to the given number of decimal places.
pub fn float_round(number: f64, ndigits: i32) -> f64 {
    let pow = 10f64.powi(ndigits);
    (number * pow).round() / pow
}

/// Coerces a JSON value to u64. Twitch sends numeric fields as integers,
/// floats, or quoted strings depending on the endpoint.
pub fn int_from_value(v: Option<&Value>) -> u64 {
    match v {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().map(|f| f.max(0.0) as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.parse::<u64>().unwrap_or(0),
        _ => 0,
    }
}

/// Coerces a JSON value to f64, accepting integers, floats and quoted strings.
pub fn float_from_value(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Extracts a string from a JSON value, empty when absent or not a string.
pub fn string_from_value(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

pub fn bool_from_value(v: Option<&Value>) -> bool {
    matches!(v, Some(Value::Bool(true)))
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn millify_values() {
        assert_eq!(millify(950, 2), "950");
        assert_eq!(millify(1000, 2), "1K");
        assert_eq!(millify(1500, 2), "1.5K");
        assert_eq!(millify(1_500_000, 1), "1.5M");
        assert_eq!(millify(-2_000_000_000, 2), "-2B");
    }

    #[test]
    fn percentage_zero_guard() {
        assert_eq!(percentage(0, 10), 0);
        assert_eq!(percentage(10, 0), 0);
        assert_eq!(percentage(5, 10), 50);
    }

    #[test]
    fn float_round_two_digits() {
        assert_eq!(float_round(66.66666, 2), 66.67);
        assert_eq!(float_round(0.005, 2), 0.01);
    }

    #[test]
    fn numeric_coercion_accepts_all_shapes() {
        assert_eq!(int_from_value(Some(&json!(42))), 42);
        assert_eq!(int_from_value(Some(&json!(42.9))), 42);
        assert_eq!(int_from_value(Some(&json!("42"))), 42);
        assert_eq!(int_from_value(Some(&json!(null))), 0);
        assert_eq!(int_from_value(None), 0);

        assert_eq!(float_from_value(Some(&json!(1.5))), 1.5);
        assert_eq!(float_from_value(Some(&json!("1.5"))), 1.5);
        assert_eq!(float_from_value(Some(&json!(3))), 3.0);
    }
}
