//! Coercion of provider values into metric numbers.

use crate::sources::FieldValue;

/// Outcome of coercing one provider value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coerced {
    Value(f64),
    /// Empty cell, explicit null, placeholder dash, or a sentinel.
    Missing,
    /// Text that is not a number. Treated as missing by the caller.
    Garbage,
}

/// Parse a string-encoded number, stripping `thousands` separators.
///
/// `"1,234.5"` with `','` parses as `1234.5`. Empty strings and a lone `-`
/// are missing values.
pub fn parse_number(raw: &str, thousands: Option<char>) -> Coerced {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "-" || trimmed.eq_ignore_ascii_case("nan") {
        return Coerced::Missing;
    }

    let cleaned: String = match thousands {
        Some(sep) => trimmed.chars().filter(|c| *c != sep).collect(),
        None => trimmed.to_string(),
    };

    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() => Coerced::Value(v),
        Ok(_) => Coerced::Missing,
        Err(_) => Coerced::Garbage,
    }
}

pub fn coerce(value: &FieldValue, thousands: Option<char>, sentinels: &[f64]) -> Coerced {
    let coerced = match value {
        FieldValue::Null => Coerced::Missing,
        FieldValue::Number(v) if v.is_finite() => Coerced::Value(*v),
        FieldValue::Number(_) => Coerced::Missing,
        FieldValue::Text(s) => parse_number(s, thousands),
    };

    match coerced {
        Coerced::Value(v) if sentinels.iter().any(|s| *s == v) => Coerced::Missing,
        other => other,
    }
}
