//! The claim value model.
//!
//! [`Value`] is the typed union of everything a Wikibase snak can carry.
//! Every variant knows how to score itself against a reconciliation string
//! ([`Value::match_with_str`]) and how to render itself as a data-extension
//! cell ([`Value::as_cell`]).
//!
//! Somevalue and novalue snaks both decode to an empty payload; the
//! distinction is preserved on the [`crate::itemstore::Snak`] itself for
//! callers that need it.

use crate::itemstore::{Snak, StoreSession};
use crate::matching::{fuzzy_match_strings, match_floats};
use crate::sitelink;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    Item {
        id: Option<String>,
    },
    String {
        value: Option<String>,
    },
    Identifier {
        value: Option<String>,
    },
    Url {
        value: Option<String>,
    },
    Quantity {
        amount: Option<f64>,
        unit: Option<String>,
    },
    Time {
        time: Option<String>,
        /// Wikibase precision, 0 (billion years) to 14 (second).
        precision: Option<u8>,
    },
    Coords {
        latitude: Option<f64>,
        longitude: Option<f64>,
        precision: Option<f64>,
        globe: Option<String>,
    },
    Monolingual {
        text: Option<String>,
        language: Option<String>,
    },
    Media {
        value: Option<String>,
    },
    DataTable {
        value: Option<String>,
    },
    /// Returned by subfields and filters that have nothing to say. Unlike a
    /// novalue this does not represent an explicit empty claim.
    Undefined,
}

/// A cell of the data-extension response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Entity { id: String, name: String },
    Str { str: String },
    Float { float: f64 },
    Date { date: String },
    Empty {},
}

impl Value {
    /// Decodes the mainsnak (or a qualifier snak) of a minified claim.
    /// Unknown datatypes decode to [`Value::Undefined`]; somevalue and
    /// novalue snaks yield the empty payload of their datatype.
    pub fn from_snak(snak: &Snak) -> Value {
        let payload = snak.datavalue.as_ref().and_then(|dv| dv.get("value"));
        match snak.datatype.as_str() {
            "wikibase-item" => Value::Item {
                id: payload
                    .and_then(|v| v.get("id"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
            },
            "string" => Value::String {
                value: payload.and_then(Json::as_str).map(str::to_string),
            },
            "external-id" => Value::Identifier {
                value: payload.and_then(Json::as_str).map(str::to_string),
            },
            "url" => Value::Url {
                value: payload.and_then(Json::as_str).map(str::to_string),
            },
            "commonsMedia" => Value::Media {
                value: payload.and_then(Json::as_str).map(str::to_string),
            },
            "tabular-data" => Value::DataTable {
                value: payload.and_then(Json::as_str).map(str::to_string),
            },
            "quantity" => Value::Quantity {
                amount: payload
                    .and_then(|v| v.get("amount"))
                    .and_then(json_number),
                unit: payload
                    .and_then(|v| v.get("unit"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
            },
            "time" => Value::Time {
                time: payload
                    .and_then(|v| v.get("time"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
                precision: payload
                    .and_then(|v| v.get("precision"))
                    .and_then(Json::as_u64)
                    .map(|p| p.min(u8::MAX as u64) as u8),
            },
            "globe-coordinate" => Value::Coords {
                latitude: payload.and_then(|v| v.get("latitude")).and_then(json_number),
                longitude: payload.and_then(|v| v.get("longitude")).and_then(json_number),
                precision: payload.and_then(|v| v.get("precision")).and_then(json_number),
                globe: payload
                    .and_then(|v| v.get("globe"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
            },
            "monolingualtext" => Value::Monolingual {
                text: payload
                    .and_then(|v| v.get("text"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
                language: payload
                    .and_then(|v| v.get("language"))
                    .and_then(Json::as_str)
                    .map(str::to_string),
            },
            _ => Value::Undefined,
        }
    }

    /// An explicit empty value (somevalue/novalue claim).
    pub fn is_novalue(&self) -> bool {
        match self {
            Value::Item { id } => id.is_none(),
            Value::String { value }
            | Value::Identifier { value }
            | Value::Url { value }
            | Value::Media { value }
            | Value::DataTable { value } => value.is_none(),
            Value::Quantity { amount, .. } => amount.is_none(),
            Value::Time { time, .. } => time.as_deref().and_then(ParsedTime::parse).is_none(),
            Value::Coords {
                latitude, longitude, ..
            } => latitude.is_none() || longitude.is_none(),
            Value::Monolingual { text, .. } => text.is_none(),
            Value::Undefined => false,
        }
    }

    /// Scores this value against a reconciliation candidate string,
    /// in [0, 100].
    pub async fn match_with_str(&self, s: &str, session: &StoreSession<'_>) -> Result<f64> {
        let config = session.config();
        match self {
            Value::Item { id } => {
                let Some(id) = id else { return Ok(0.0) };
                // Qids compare exactly, sitelinks resolve then compare.
                if let Some(target) = config.item_id(s) {
                    return Ok(if &target == id { 100.0 } else { 0.0 });
                }
                if let Some(link) = sitelink::normalize(s) {
                    let resolved = session.resolve_sitelink(&link).await?;
                    return Ok(if resolved.as_deref() == Some(id.as_str()) {
                        100.0
                    } else {
                        0.0
                    });
                }
                let Some(item) = session.get_item(id).await? else {
                    return Ok(0.0);
                };
                let best = item
                    .labels
                    .values()
                    .map(String::as_str)
                    .chain(item.aliases.iter().map(String::as_str))
                    .map(|name| fuzzy_match_strings(config, s, name))
                    .fold(0.0f64, f64::max);
                Ok(best)
            }
            Value::Identifier { value } | Value::Media { value } | Value::DataTable { value } => {
                let Some(value) = value else { return Ok(0.0) };
                Ok(if s.trim() == value { 100.0 } else { 0.0 })
            }
            Value::String { value } => {
                let Some(value) = value else { return Ok(0.0) };
                Ok(fuzzy_match_strings(config, value, s))
            }
            Value::Monolingual { text, .. } => {
                let Some(text) = text else { return Ok(0.0) };
                Ok(fuzzy_match_strings(config, text, s))
            }
            Value::Url { value } => {
                let Some(canonical) = value.as_deref().and_then(canonical_url) else {
                    return Ok(0.0);
                };
                let candidate = canonical_url(s).unwrap_or_else(|| s.to_string());
                Ok(if candidate == canonical { 100.0 } else { 0.0 })
            }
            Value::Quantity { amount, .. } => {
                let Some(amount) = amount else { return Ok(0.0) };
                match s.trim().parse::<f64>() {
                    Ok(candidate) => Ok(match_floats(*amount, candidate)),
                    Err(_) => Ok(0.0),
                }
            }
            Value::Time { time, precision } => {
                let Some(parsed) = time.as_deref().and_then(ParsedTime::parse) else {
                    return Ok(0.0);
                };
                Ok(parsed.match_date_string(s, (*precision).unwrap_or(11)))
            }
            Value::Coords {
                latitude, longitude, ..
            } => {
                let (Some(lat), Some(lng)) = (latitude, longitude) else {
                    return Ok(0.0);
                };
                Ok(match_coords_string(s, *lat, *lng))
            }
            Value::Undefined => Ok(0.0),
        }
    }

    /// Renders this value as a data-extension cell. Novalues render as the
    /// empty cell.
    pub async fn as_cell(&self, lang: &str, session: &StoreSession<'_>) -> Result<Cell> {
        if self.is_novalue() {
            return Ok(Cell::Empty {});
        }
        match self {
            Value::Item { id: Some(id) } => Ok(Cell::Entity {
                id: id.clone(),
                name: session.get_label(id, lang).await?,
            }),
            Value::String { value: Some(value) }
            | Value::Identifier { value: Some(value) }
            | Value::Url { value: Some(value) }
            | Value::Media { value: Some(value) }
            | Value::DataTable { value: Some(value) } => Ok(Cell::Str { str: value.clone() }),
            Value::Quantity {
                amount: Some(amount),
                ..
            } => Ok(Cell::Float { float: *amount }),
            Value::Monolingual { text: Some(text), .. } => Ok(Cell::Str { str: text.clone() }),
            Value::Time { time, .. } => {
                match time.as_deref().and_then(ParsedTime::parse) {
                    Some(parsed) => Ok(Cell::Date {
                        date: parsed.iso(),
                    }),
                    None => Ok(Cell::Empty {}),
                }
            }
            Value::Coords { .. } => Ok(Cell::Str {
                str: self.as_string(),
            }),
            _ => Ok(Cell::Empty {}),
        }
    }

    /// Plain string rendering, for the single-value API and image lookup.
    pub fn as_string(&self) -> String {
        match self {
            Value::Item { id } => id.clone().unwrap_or_default(),
            Value::String { value }
            | Value::Identifier { value }
            | Value::Url { value }
            | Value::Media { value }
            | Value::DataTable { value } => value.clone().unwrap_or_default(),
            Value::Quantity { amount, .. } => {
                amount.map(|a| format_amount(a)).unwrap_or_default()
            }
            Value::Time { time, .. } => time.clone().unwrap_or_default(),
            Value::Coords {
                latitude: Some(lat),
                longitude: Some(lng),
                ..
            } => format!("{},{}", format_amount(*lat), format_amount(*lng)),
            Value::Coords { .. } => String::new(),
            Value::Monolingual { text, .. } => text.clone().unwrap_or_default(),
            Value::Undefined => String::new(),
        }
    }
}

fn json_number(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        // Quantity amounts come over the wire as strings like "+130".
        Json::String(s) => s.trim_start_matches('+').parse().ok(),
        _ => None,
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Canonical form of a URL for exact matching: host, path, query and
/// fragment, scheme deliberately dropped.
pub(crate) fn canonical_url(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?;
    let mut out = String::from("//");
    out.push_str(host);
    if let Some(port) = parsed.port() {
        out.push(':');
        out.push_str(&port.to_string());
    }
    out.push_str(parsed.path());
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    Some(out)
}

/// Wikibase timestamp broken into components. Wikibase uses `00` for
/// unknown months/days, which parse as January / the 1st.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTime {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl ParsedTime {
    pub fn parse(time: &str) -> Option<ParsedTime> {
        let trimmed = time.trim().trim_start_matches('+');
        let (negative, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };
        let (date_part, time_part) = match rest.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (rest, None),
        };
        let mut date_fields = date_part.split('-');
        let year: i64 = date_fields.next()?.parse().ok()?;
        let mut month: u32 = date_fields.next().map_or(Ok(1), str::parse).ok()?;
        let mut day: u32 = date_fields.next().map_or(Ok(1), str::parse).ok()?;
        if date_fields.next().is_some() {
            return None;
        }
        if month == 0 {
            month = 1;
        }
        if day == 0 {
            day = 1;
        }
        if month > 12 || day > 31 {
            return None;
        }
        let (mut hour, mut minute, mut second) = (0, 0, 0);
        if let Some(time_part) = time_part {
            let time_part = time_part.trim_end_matches('Z');
            let mut fields = time_part.split(':');
            hour = fields.next().map_or(Ok(0), str::parse).ok()?;
            minute = fields.next().map_or(Ok(0), str::parse).ok()?;
            second = fields.next().map_or(Ok(0), str::parse).ok()?;
            if hour > 23 || minute > 59 || second > 60 {
                return None;
            }
        }
        Some(ParsedTime {
            year: if negative { -year } else { year },
            month,
            day,
            hour,
            minute,
            second,
        })
    }

    /// Full ISO rendering with an explicit UTC offset.
    pub fn iso(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}+00:00",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }

    /// Date-only ISO rendering.
    pub fn iso_date(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    /// Scores a `Y`, `Y-M` or `Y-M-D` string against this timestamp:
    /// all components up to the claim's precision must agree.
    fn match_date_string(&self, s: &str, precision: u8) -> f64 {
        let parts: Vec<i64> = match s
            .trim()
            .split('-')
            .map(|part| part.parse::<i64>())
            .collect::<std::result::Result<_, _>>()
        {
            Ok(parts) => parts,
            Err(_) => return 0.0,
        };
        if parts.len() > 3 || parts.is_empty() {
            return 0.0;
        }
        let own = [self.year, self.month as i64, self.day as i64];
        let compared = match precision {
            0..=9 => 1,
            10 => 2,
            _ => parts.len(),
        };
        let all_match = parts
            .iter()
            .take(compared)
            .zip(own.iter())
            .all(|(a, b)| a == b);
        if all_match { 100.0 } else { 0.0 }
    }
}

/// Flat-earth distance scoring: full marks at zero distance, falling to
/// zero one kilometre out.
fn match_coords_string(s: &str, latitude: f64, longitude: f64) -> f64 {
    let mut parts = s.split(',');
    let (Some(lat_str), Some(lng_str), None) = (parts.next(), parts.next(), parts.next()) else {
        return 0.0;
    };
    let (Ok(lat), Ok(lng)) = (lat_str.trim().parse::<f64>(), lng_str.trim().parse::<f64>())
    else {
        return 0.0;
    };
    let diff_lat = lat - latitude;
    let diff_lng = lng - longitude;
    let dist = (diff_lat * diff_lat + diff_lng * diff_lng).sqrt();
    let dist_in_km = dist / 180.0 * std::f64::consts::PI * 6371.0;
    100.0 * (1.0 - dist_in_km).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snak(datatype: &str, datavalue: Option<Json>) -> Snak {
        Snak {
            snaktype: crate::itemstore::SnakType::Value,
            datatype: datatype.to_string(),
            datavalue,
        }
    }

    #[test]
    fn decodes_item_snaks() {
        let s = snak(
            "wikibase-item",
            Some(json!({"value": {"entity-type": "item", "id": "Q42"}, "type": "wikibase-entityid"})),
        );
        assert_eq!(Value::from_snak(&s), Value::Item { id: Some("Q42".into()) });
        // somevalue: no datavalue at all
        let s = snak("wikibase-item", None);
        let v = Value::from_snak(&s);
        assert_eq!(v, Value::Item { id: None });
        assert!(v.is_novalue());
    }

    #[test]
    fn decodes_quantity_amount_strings() {
        let s = snak("quantity", Some(json!({"value": {"amount": "+130", "unit": "1"}})));
        assert_eq!(
            Value::from_snak(&s),
            Value::Quantity {
                amount: Some(130.0),
                unit: Some("1".into())
            }
        );
    }

    #[test]
    fn unknown_datatype_is_undefined() {
        let s = snak("wikibase-form", Some(json!({"value": "x"})));
        assert_eq!(Value::from_snak(&s), Value::Undefined);
        assert!(!Value::Undefined.is_novalue());
    }

    #[test]
    fn parses_wikibase_timestamps() {
        let t = ParsedTime::parse("+1096-01-01T00:00:00Z").unwrap();
        assert_eq!((t.year, t.month, t.day), (1096, 1, 1));
        // unknown month/day normalize to January 1st
        let t = ParsedTime::parse("+1996-00-00T00:00:00Z").unwrap();
        assert_eq!((t.month, t.day), (1, 1));
        assert_eq!(ParsedTime::parse("+1996-13-01T00:00:00Z"), None);
        assert_eq!(ParsedTime::parse("garbage"), None);
        let t = ParsedTime::parse("-0044-03-15T00:00:00Z").unwrap();
        assert_eq!(t.year, -44);
    }

    #[test]
    fn iso_renderings() {
        let t = ParsedTime::parse("+1996-03-17T04:15:08Z").unwrap();
        assert_eq!(t.iso(), "1996-03-17T04:15:08+00:00");
        assert_eq!(t.iso_date(), "1996-03-17");
    }

    #[test]
    fn time_matching_respects_precision() {
        let year_only = ParsedTime::parse("+1096-01-01T00:00:00Z").unwrap();
        assert_eq!(year_only.match_date_string("1096", 9), 100.0);
        assert_eq!(year_only.match_date_string("1096-06", 9), 100.0);
        assert_eq!(year_only.match_date_string("1097", 9), 0.0);

        let day = ParsedTime::parse("+1996-03-17T00:00:00Z").unwrap();
        assert_eq!(day.match_date_string("1996-03-17", 11), 100.0);
        assert_eq!(day.match_date_string("1996-03-18", 11), 0.0);
        assert_eq!(day.match_date_string("1996-03", 11), 100.0);
        assert_eq!(day.match_date_string("1996-03-17-01", 11), 0.0);
        assert_eq!(day.match_date_string("not a date", 11), 0.0);
    }

    #[test]
    fn coords_distance_scoring() {
        assert_eq!(match_coords_string("51.47,0.0", 51.47, 0.0), 100.0);
        // ~1km off the mark scores near zero
        let score = match_coords_string("51.48,0.0", 51.47, 0.0);
        assert!(score < 100.0);
        assert!(score >= 0.0);
        assert_eq!(match_coords_string("not,coords", 51.47, 0.0), 0.0);
        assert_eq!(match_coords_string("51.47", 51.47, 0.0), 0.0);
    }

    #[test]
    fn url_canonicalization_ignores_scheme() {
        assert_eq!(
            canonical_url("http://www.gnu.org/software/emacs/"),
            canonical_url("https://www.gnu.org/software/emacs/")
        );
        assert_ne!(
            canonical_url("https://www.gnu.org/a"),
            canonical_url("https://www.gnu.org/b")
        );
        assert_eq!(canonical_url("not a url"), None);
    }

    #[test]
    fn cell_serialization_shapes() {
        assert_eq!(
            serde_json::to_value(Cell::Str { str: "GB".into() }).unwrap(),
            json!({"str": "GB"})
        );
        assert_eq!(
            serde_json::to_value(Cell::Float { float: 3.0 }).unwrap(),
            json!({"float": 3.0})
        );
        assert_eq!(serde_json::to_value(Cell::Empty {}).unwrap(), json!({}));
        assert_eq!(
            serde_json::to_value(Cell::Entity { id: "Q34433".into(), name: "University of Oxford".into() })
                .unwrap(),
            json!({"id": "Q34433", "name": "University of Oxford"})
        );
    }
}
