//! Subfield extractors for property paths.
//!
//! A subfield maps a value to a derived value: `P625@lat` extracts the
//! latitude of a coordinate, `P571@year` the year of a timestamp when its
//! precision warrants it. Unknown names and non-matching source variants
//! yield [`Value::Undefined`], which the evaluator drops.

use crate::value::{ParsedTime, Value, canonical_url};

pub const SUBFIELD_NAMES: &[&str] = &[
    "lat", "lng", "year", "month", "day", "hour", "minute", "second", "isodate", "iso",
    "urlscheme", "netloc", "urlpath",
];

pub fn apply(name: &str, value: &Value) -> Value {
    match name {
        "lat" => coords_component(value, |lat, _| lat),
        "lng" => coords_component(value, |_, lng| lng),
        "year" => time_component(value, 9, |t| t.year as f64),
        "month" => time_component(value, 10, |t| t.month as f64),
        "day" => time_component(value, 11, |t| t.day as f64),
        "hour" => time_component(value, 12, |t| t.hour as f64),
        "minute" => time_component(value, 13, |t| t.minute as f64),
        "second" => time_component(value, 14, |t| t.second as f64),
        "isodate" => time_rendering(value, ParsedTime::iso_date),
        "iso" => time_rendering(value, ParsedTime::iso),
        "urlscheme" => url_component(value, |url| Some(url.scheme().to_string())),
        "netloc" => url_component(value, |url| url.host_str().map(str::to_string)),
        "urlpath" => url_component(value, |url| Some(url.path().to_string())),
        _ => Value::Undefined,
    }
}

fn coords_component(value: &Value, pick: fn(f64, f64) -> f64) -> Value {
    match value {
        Value::Coords {
            latitude: Some(lat),
            longitude: Some(lng),
            ..
        } => Value::Quantity {
            amount: Some(pick(*lat, *lng)),
            unit: None,
        },
        _ => Value::Undefined,
    }
}

/// Time components are only meaningful up to the claim's precision:
/// extracting a month from a year-precision date yields Undefined.
fn time_component(value: &Value, min_precision: u8, pick: fn(&ParsedTime) -> f64) -> Value {
    match value {
        Value::Time { time, precision } => {
            if (*precision).unwrap_or(0) < min_precision {
                return Value::Undefined;
            }
            match time.as_deref().and_then(ParsedTime::parse) {
                Some(parsed) => Value::Quantity {
                    amount: Some(pick(&parsed)),
                    unit: None,
                },
                None => Value::Undefined,
            }
        }
        _ => Value::Undefined,
    }
}

fn time_rendering(value: &Value, render: fn(&ParsedTime) -> String) -> Value {
    match value {
        Value::Time { time, .. } => match time.as_deref().and_then(ParsedTime::parse) {
            Some(parsed) => Value::Identifier {
                value: Some(render(&parsed)),
            },
            None => Value::Undefined,
        },
        _ => Value::Undefined,
    }
}

fn url_component(value: &Value, pick: fn(&url::Url) -> Option<String>) -> Value {
    match value {
        Value::Url { value: Some(raw) } => {
            // Reuse the same parse the matcher relies on: no host, no URL.
            if canonical_url(raw).is_none() {
                return Value::Undefined;
            }
            match url::Url::parse(raw.trim()).ok().and_then(|url| pick(&url)) {
                Some(part) => Value::Identifier { value: Some(part) },
                None => Value::Undefined,
            }
        }
        _ => Value::Undefined,
    }
}
