use serde_json::{Map, Value};
use std::collections::HashSet;

/// Index of the photo published as the listing's main image.
pub const MAIN_PHOTO_INDEX: usize = 1;

/// Primary URLs first, then auxiliary ones; empties dropped, first occurrence wins.
pub fn merge_photos(primary: &[String], auxiliary: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for url in primary.iter().chain(auxiliary) {
        if url.is_empty() {
            continue;
        }
        if seen.insert(url.as_str()) {
            merged.push(url.clone());
        }
    }
    merged
}

/// String entries of a scraped `photos` array.
pub fn photo_urls(raw: Option<&Value>) -> Vec<String> {
    raw.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhotoSlots {
    pub main: Option<String>,
    /// Photos after the main one, keyed `"1"`, `"2"`, … in slot order.
    pub secondary: Option<Map<String, Value>>,
}

pub fn photo_slots(photos: &[String], primary_index: usize) -> PhotoSlots {
    let main = photos
        .get(primary_index)
        .or_else(|| photos.first())
        .filter(|url| !url.is_empty())
        .cloned();
    let rest: Vec<&String> = photos
        .iter()
        .skip(primary_index + 1)
        .filter(|url| !url.is_empty())
        .collect();
    let secondary = (!rest.is_empty()).then(|| {
        rest.into_iter()
            .enumerate()
            .map(|(idx, url)| ((idx + 1).to_string(), Value::String(url.clone())))
            .collect()
    });
    PhotoSlots { main, secondary }
}
