//! Field normalization for scraped listing payloads.
//!
//! Everything here is pure: raw, loosely-typed values from the scraper go in,
//! canonical numbers, enums and strings come out.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

static LEADING_FLOAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(?:[0-9]+(?:\.[0-9]*)?|\.[0-9]+)").expect("float regex"));
static LEADING_INT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?[0-9]+").expect("int regex"));
static COMBINED_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)\s*совмещ").expect("combined regex"));
static SEPARATE_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([0-9]+)\s*раздель").expect("separate regex"));

const COMBINED_STEM: &str = "совмещ";
const SEPARATE_STEM: &str = "раздель";
const UNDERGROUND_STEM: &str = "подзем";
const NOT_SPECIFIED: &str = "Не указано";

/// Result of a by-name search in a scraped document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    Null,
    Missing,
}

impl<'a> Lookup<'a> {
    /// The value, if one was found and it is not `null`.
    pub fn value(self) -> Option<&'a Value> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Null | Lookup::Missing => None,
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Lookup::Missing)
    }

    /// Falls through to `other` when this lookup produced nothing usable.
    pub fn or(self, other: Lookup<'a>) -> Lookup<'a> {
        match self {
            Lookup::Found(_) => self,
            Lookup::Null | Lookup::Missing => other,
        }
    }

    /// Non-empty text for strings, decimal text for numbers.
    pub fn text(self) -> Option<String> {
        match self.value()? {
            Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

/// Depth-first, pre-order search for `key`.
///
/// A node's own entries are checked before any nested container is entered.
/// A present `null` is reported as [`Lookup::Null`], never as missing.
pub fn find_value<'a>(node: &'a Value, key: &str) -> Lookup<'a> {
    match node {
        Value::Object(map) => {
            if let Some(value) = map.get(key) {
                return if value.is_null() {
                    Lookup::Null
                } else {
                    Lookup::Found(value)
                };
            }
            map.values()
                .filter(|value| value.is_object() || value.is_array())
                .map(|value| find_value(value, key))
                .find(|lookup| !lookup.is_missing())
                .unwrap_or(Lookup::Missing)
        }
        Value::Array(items) => items
            .iter()
            .filter(|value| value.is_object() || value.is_array())
            .map(|value| find_value(value, key))
            .find(|lookup| !lookup.is_missing())
            .unwrap_or(Lookup::Missing),
        _ => Lookup::Missing,
    }
}

/// Parses an area and rounds it up to the next multiple of five.
///
/// Anything in `[93, 94]` is published as 100.
pub fn round_area(raw: Option<&Value>) -> Option<f64> {
    let area = match raw? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => parse_leading_float(&text.replacen(',', ".", 1))?,
        _ => return None,
    };
    if (93.0..=94.0).contains(&area) {
        return Some(100.0);
    }
    if area % 5.0 == 0.0 {
        return Some(area);
    }
    Some((area / 5.0).ceil() * 5.0)
}

/// Lenient number parsing: `"45 000 ₽"` → 45000, `"1,5"` → 1.5.
pub fn parse_number(raw: Option<&Value>) -> Option<f64> {
    let text = scalar_text(raw?)?;
    let cleaned: String = text
        .chars()
        .filter(|ch| !ch.is_whitespace())
        .collect::<String>()
        .replacen(',', ".", 1)
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    parse_leading_float(&cleaned)
}

/// Leading integer of the value's text form: `"5 этаж"` → 5, `3.7` → 3.
pub fn parse_leading_int(raw: Option<&Value>) -> Option<i64> {
    let text = scalar_text(raw?)?;
    LEADING_INT
        .find(text.trim_start())
        .and_then(|m| m.as_str().parse::<i64>().ok())
}

fn parse_leading_float(text: &str) -> Option<f64> {
    let matched = LEADING_FLOAT.find(text.trim_start())?;
    matched
        .as_str()
        .trim_end_matches('.')
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BathroomCounts {
    pub combined: Option<u32>,
    pub separate: Option<u32>,
}

/// Reads `"1 совмещенный, 2 раздельных"`-style text.
///
/// `None` means the text says nothing about that kind of bathroom.
pub fn parse_bathrooms(text: &str) -> BathroomCounts {
    let normalized = text.to_lowercase();
    BathroomCounts {
        combined: bathroom_count(&normalized, &COMBINED_COUNT, COMBINED_STEM),
        separate: bathroom_count(&normalized, &SEPARATE_COUNT, SEPARATE_STEM),
    }
}

fn bathroom_count(normalized: &str, pattern: &Regex, stem: &str) -> Option<u32> {
    if let Some(captures) = pattern.captures(normalized) {
        return captures.get(1).and_then(|m| m.as_str().parse().ok());
    }
    normalized.contains(stem).then_some(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParkingCategory {
    #[serde(rename = "Подземная")]
    Underground,
    #[serde(rename = "Наземная")]
    Surface,
}

/// Anything that mentions parking but not an underground garage is surface parking.
pub fn normalize_parking(raw: Option<&Value>) -> Option<ParkingCategory> {
    let text = match raw? {
        Value::Null | Value::Bool(false) => return None,
        Value::String(text) if text.is_empty() => return None,
        Value::Number(number) if number.as_f64() == Some(0.0) => return None,
        Value::String(text) => text.to_lowercase(),
        other => other.to_string().to_lowercase(),
    };
    if text.contains(UNDERGROUND_STEM) {
        Some(ParkingCategory::Underground)
    } else {
        Some(ParkingCategory::Surface)
    }
}

/// `45000.4` → `"45 000 ₽"`.
pub fn format_price(amount: Option<f64>) -> String {
    let Some(amount) = amount.filter(|value| value.is_finite()) else {
        return NOT_SPECIFIED.to_string();
    };
    let rounded = amount.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    let sign = if rounded < 0 { "-" } else { "" };
    format!("{sign}{grouped} ₽")
}

/// Apartments ("апартаменты") are tagged separately from flats.
pub fn classify_property_type(raw: Option<&Value>) -> &'static str {
    let text = raw.and_then(scalar_text).unwrap_or_default().to_lowercase();
    if text.contains("апарт") {
        "апартаменты"
    } else {
        "квартира"
    }
}

pub fn mentions(raw: Option<&Value>, stem: &str) -> bool {
    raw.and_then(scalar_text)
        .map(|text| text.to_lowercase().contains(stem))
        .unwrap_or(false)
}

pub fn list_mentions(raw: Option<&Value>, stem: &str) -> bool {
    raw.and_then(Value::as_array)
        .map(|items| items.iter().any(|item| mentions(Some(item), stem)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn find_value_prefers_own_entries_then_depth_first() {
        let doc = json!({
            "meta": {"price": 1, "inner": {"price": 2}},
            "offer": {"price": 3},
            "price": 4
        });
        assert_eq!(find_value(&doc, "price"), Lookup::Found(&json!(4)));

        let nested = json!({"meta": {"inner": {"price": 2}}, "offer": {"price": 3}});
        assert_eq!(find_value(&nested, "price").value(), Some(&json!(2)));
    }

    #[test]
    fn find_value_distinguishes_null_from_missing() {
        let doc = json!({"details": {"deposit": null}});
        assert_eq!(find_value(&doc, "deposit"), Lookup::Null);
        assert_eq!(find_value(&doc, "prepayment"), Lookup::Missing);
        assert_eq!(find_value(&json!("scalar"), "price"), Lookup::Missing);
    }

    #[test]
    fn find_value_descends_into_lists() {
        let doc = json!({"blocks": [{"a": 1}, {"floor": 7}]});
        assert_eq!(find_value(&doc, "floor").value(), Some(&json!(7)));
    }

    #[test]
    fn lookup_or_falls_through_null() {
        let doc = json!({"payment_deposit": null, "deposit": "10 000"});
        let chosen = find_value(&doc, "payment_deposit").or(find_value(&doc, "deposit"));
        assert_eq!(parse_number(chosen.value()), Some(10000.0));
    }

    #[test]
    fn round_area_properties_hold() {
        let mut x = 0.1_f64;
        while x < 300.0 {
            if !(93.0..=94.0).contains(&x) {
                let rounded = round_area(Some(&json!(x))).expect("parseable");
                assert_eq!(rounded % 5.0, 0.0, "x = {x}");
                assert!(rounded >= x, "x = {x}");
                assert!(rounded - 5.0 < x, "x = {x}");
            }
            x += 0.7;
        }
    }

    #[test]
    fn round_area_special_cases() {
        assert_eq!(round_area(Some(&json!("52,3"))), Some(55.0));
        assert_eq!(round_area(Some(&json!("52.3 м²"))), Some(55.0));
        assert_eq!(round_area(Some(&json!(60))), Some(60.0));
        assert_eq!(round_area(Some(&json!("93"))), Some(100.0));
        assert_eq!(round_area(Some(&json!(93.5))), Some(100.0));
        assert_eq!(round_area(Some(&json!("94,0"))), Some(100.0));
        assert_eq!(round_area(Some(&json!(94.1))), Some(95.0));
        assert_eq!(round_area(Some(&json!("около"))), None);
        assert_eq!(round_area(Some(&json!(true))), None);
        assert_eq!(round_area(None), None);
    }

    #[test]
    fn parse_number_strips_noise() {
        assert_eq!(parse_number(Some(&json!("45 000"))), Some(45000.0));
        assert_eq!(parse_number(Some(&json!("45 000 ₽/мес."))), Some(45000.0));
        assert_eq!(parse_number(Some(&json!("1,5"))), Some(1.5));
        assert_eq!(parse_number(Some(&json!(12.5))), Some(12.5));
        assert_eq!(parse_number(Some(&json!("по договорённости"))), None);
        assert_eq!(parse_number(Some(&json!(""))), None);
        assert_eq!(parse_number(Some(&json!({"v": 1}))), None);
        assert_eq!(parse_number(None), None);
    }

    #[test]
    fn parse_leading_int_behaves_like_prefix_parse() {
        assert_eq!(parse_leading_int(Some(&json!("5 этаж"))), Some(5));
        assert_eq!(parse_leading_int(Some(&json!(3.7))), Some(3));
        assert_eq!(parse_leading_int(Some(&json!("этаж 5"))), None);
        assert_eq!(parse_leading_int(None), None);
    }

    #[test]
    fn bathrooms_default_to_one_without_count() {
        let counts = parse_bathrooms("Раздельный");
        assert_eq!(counts.separate, Some(1));
        assert_eq!(counts.combined, None);
    }

    #[test]
    fn bathrooms_read_explicit_counts() {
        let counts = parse_bathrooms("1 совмещ, 2 раздельных");
        assert_eq!(counts.combined, Some(1));
        assert_eq!(counts.separate, Some(2));
        assert_eq!(parse_bathrooms("1 совмещ").separate, None);
    }

    #[test]
    fn bathrooms_absent_are_unknown_not_zero() {
        assert_eq!(
            parse_bathrooms("есть ванна"),
            BathroomCounts {
                combined: None,
                separate: None
            }
        );
        assert_eq!(parse_bathrooms(""), BathroomCounts::default());
    }

    #[test]
    fn parking_defaults_to_surface() {
        assert_eq!(normalize_parking(None), None);
        assert_eq!(normalize_parking(Some(&json!(""))), None);
        assert_eq!(
            normalize_parking(Some(&json!("Подземная парковка"))),
            Some(ParkingCategory::Underground)
        );
        assert_eq!(
            normalize_parking(Some(&json!("парковка"))),
            Some(ParkingCategory::Surface)
        );
        assert_eq!(
            normalize_parking(Some(&json!("наземная"))),
            Some(ParkingCategory::Surface)
        );
    }

    #[test]
    fn parking_serializes_to_store_labels() {
        assert_eq!(
            serde_json::to_value(ParkingCategory::Underground).unwrap(),
            json!("Подземная")
        );
    }

    #[test]
    fn price_formatting_groups_thousands() {
        assert_eq!(format_price(Some(45000.0)), "45 000 ₽");
        assert_eq!(format_price(Some(1234567.6)), "1 234 568 ₽");
        assert_eq!(format_price(Some(999.0)), "999 ₽");
        assert_eq!(format_price(None), "Не указано");
    }

    #[test]
    fn property_type_detects_apartments() {
        assert_eq!(
            classify_property_type(Some(&json!("Апартаменты, 2 комн."))),
            "апартаменты"
        );
        assert_eq!(classify_property_type(Some(&json!("Квартира"))), "квартира");
        assert_eq!(classify_property_type(None), "квартира");
    }

    #[test]
    fn amenity_mentions() {
        let amenities = json!(["Холодильник", "Кондиционер"]);
        assert!(list_mentions(Some(&amenities), "кондиционер"));
        assert!(!list_mentions(Some(&json!("Кондиционер")), "кондиционер"));
        assert!(mentions(Some(&json!("Ванна и душ")), "душ"));
    }
}
