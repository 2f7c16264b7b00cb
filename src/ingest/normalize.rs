// src/ingest/normalize.rs
//! Raw payload → canonical records.
//!
//! Order per item: parse → required-field check → synonym mapping → numeric
//! cleaning → item canonicalization + classification → stamp run instant.
//! Anything that fails is counted as a `ValidationError`, never raised.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;

use crate::error::ValidationError;
use crate::ingest::normalize_text;
use crate::ingest::tables::NormalizeTables;
use crate::ingest::types::{
    CanonicalRecord, ExtractRules, FetchResult, FieldRule, PayloadFormat, SourceDescriptor,
};

/// Field name → raw string value for one extracted item.
pub type RawItem = BTreeMap<String, String>;

#[derive(Debug, Default, Clone)]
pub struct Normalized {
    pub records: Vec<CanonicalRecord>,
    pub dropped: Vec<ValidationError>,
}

/// Normalize one fetch result. Failed results yield an empty set.
pub fn normalize(
    result: &FetchResult,
    desc: &SourceDescriptor,
    tables: &NormalizeTables,
    observed_at: DateTime<Utc>,
) -> Normalized {
    let mut out = Normalized::default();
    if !result.success() {
        return out;
    }

    let mut items = Vec::new();
    for part in result.parts() {
        let parsed = match desc.format {
            PayloadFormat::Json => parse_json_items(&part.body, &desc.extract),
            PayloadFormat::Html => Ok(parse_html_items(&part.body, &desc.extract)),
            PayloadFormat::Text => Ok(parse_text_items(&part.body, &desc.extract)),
        };
        match parsed {
            Ok(mut v) => items.append(&mut v),
            Err(e) => {
                tracing::warn!(target: "ingest", source = %desc.name, url = %part.url, error = %e, "payload not parseable");
            }
        }
    }

    for (index, raw) in items.into_iter().enumerate() {
        match to_record(index, raw, desc, tables, observed_at) {
            Ok(r) => out.records.push(r),
            Err(e) => {
                tracing::debug!(target: "ingest", error = %e, "item dropped");
                out.dropped.push(e);
            }
        }
    }
    out
}

fn to_record(
    index: usize,
    raw: RawItem,
    desc: &SourceDescriptor,
    tables: &NormalizeTables,
    observed_at: DateTime<Utc>,
) -> Result<CanonicalRecord, ValidationError> {
    // a required name matches a raw key directly or through its canonical field
    for field in &desc.required_fields {
        let present = raw.iter().any(|(k, v)| {
            !v.trim().is_empty()
                && (k.eq_ignore_ascii_case(field)
                    || tables.canonical_field(k).is_some_and(|c| c == field.as_str()))
        });
        if !present {
            return Err(ValidationError::MissingField {
                source_name: desc.name.clone(),
                index,
                field: field.clone(),
            });
        }
    }

    let mut canon: BTreeMap<&str, String> = BTreeMap::new();
    for (k, v) in &raw {
        let v = v.trim();
        if v.is_empty() {
            continue;
        }
        if let Some(c) = tables.canonical_field(k) {
            // first writer wins; BTreeMap order keeps this deterministic
            canon.entry(c).or_insert_with(|| v.to_string());
        }
    }

    // an item that only carries a ticker is named by it
    let name = canon
        .get("name")
        .or_else(|| canon.get("symbol"))
        .cloned()
        .unwrap_or_default();
    if name.trim().is_empty() {
        return Err(ValidationError::NoName {
            source_name: desc.name.clone(),
            index,
        });
    }

    let raw_value = canon.get("value").cloned().unwrap_or_default();
    let bounds = tables.bounds();
    let value = clean_price(&raw_value)
        .filter(|v| v.is_finite() && bounds.value.contains(*v))
        .ok_or_else(|| ValidationError::BadValue {
            source_name: desc.name.clone(),
            index,
            raw: raw_value.clone(),
        })?;

    let mut change_percent = canon.get("change_percent").and_then(|s| clean_percent(s));
    let mut change_amount = None;
    if let Some(ch) = canon.get("change") {
        if ch.contains('%') {
            if change_percent.is_none() {
                change_percent = clean_percent(ch);
            }
        } else {
            change_amount = clean_price(ch);
        }
    }

    let item = tables.canonical_item(&name);
    let category = desc.category.unwrap_or_else(|| tables.classify(&item));

    Ok(CanonicalRecord {
        item,
        category,
        value,
        unit: canon.get("unit").cloned().or_else(|| desc.default_unit.clone()),
        change_percent: change_percent.filter(|v| v.is_finite() && bounds.change_percent.contains(*v)),
        change_amount: change_amount.filter(|v| v.is_finite()),
        currency: canon.get("currency").map(|c| c.to_ascii_uppercase()),
        symbol: canon.get("symbol").cloned(),
        source: desc.name.clone(),
        observed_at,
    })
}

/* ----------------------------
Numeric cleaning
---------------------------- */

/// Parse a price-like string: strips currency symbols/units and resolves
/// thousands separators vs decimal commas.
pub fn clean_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let mut t: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect();
    if t.is_empty() {
        return None;
    }
    match (t.rfind(','), t.rfind('.')) {
        (Some(comma), Some(dot)) => {
            if dot > comma {
                t = t.replace(',', "");
            } else {
                t = t.replace('.', "").replace(',', ".");
            }
        }
        (Some(_), None) => {
            let parts: Vec<&str> = t.split(',').collect();
            if parts.len() == 2 && parts[1].len() <= 2 {
                t = t.replace(',', ".");
            } else {
                t = t.replace(',', "");
            }
        }
        _ => {}
    }
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a percent string (`"+1.25%"`, `"-0,4 %"`).
pub fn clean_percent(s: &str) -> Option<f64> {
    let t: String = s
        .trim()
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | ',' | '-' | '+'))
        .collect::<String>()
        .replace(',', ".");
    t.parse::<f64>().ok().filter(|v| v.is_finite())
}

/* ----------------------------
Payload parsers
---------------------------- */

/// JSON payloads: optional dot path, then array / keyed map / flat object.
pub fn parse_json_items(body: &str, rules: &ExtractRules) -> Result<Vec<RawItem>, serde_json::Error> {
    let root: Value = serde_json::from_str(body)?;
    let mut node = &root;
    if let Some(path) = rules.json_path.as_deref().filter(|p| !p.is_empty()) {
        for key in path.split('.') {
            node = match node {
                Value::Object(m) => m.get(key).unwrap_or(&Value::Null),
                Value::Array(a) => key.parse::<usize>().ok().and_then(|i| a.get(i)).unwrap_or(&Value::Null),
                _ => &Value::Null,
            };
        }
    }

    let items = match node {
        Value::Array(a) => a.iter().filter_map(|v| object_item(v, None, rules)).collect(),
        Value::Object(m) if !m.is_empty() && m.values().all(Value::is_object) && !looks_flat(m, rules) => m
            .iter()
            .filter_map(|(k, v)| object_item(v, Some(k), rules))
            .collect(),
        v @ Value::Object(_) => object_item(v, None, rules).into_iter().collect(),
        _ => Vec::new(),
    };
    Ok(items)
}

/// A keyed map is `{ "gold": {...}, "silver": {...} }`; a flat item has at
/// least one mapped key at the top level.
fn looks_flat(m: &serde_json::Map<String, Value>, rules: &ExtractRules) -> bool {
    rules.field_mapping.values().any(|raw| m.contains_key(raw))
}

fn object_item(v: &Value, key_name: Option<&String>, rules: &ExtractRules) -> Option<RawItem> {
    let Value::Object(m) = v else {
        return None;
    };
    let mut item = RawItem::new();
    if let Some(k) = key_name {
        item.insert("name".to_string(), k.clone());
    }
    if rules.field_mapping.is_empty() {
        for (k, v) in m {
            if let Some(s) = scalar(v) {
                item.insert(k.clone(), s);
            }
        }
    } else {
        for (canonical, raw_key) in &rules.field_mapping {
            if let Some(s) = m.get(raw_key).and_then(scalar) {
                item.insert(canonical.clone(), s);
            }
        }
    }
    Some(item)
}

fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// HTML payloads: one item per container match; field rules are CSS
/// selectors relative to the container.
pub fn parse_html_items(body: &str, rules: &ExtractRules) -> Vec<RawItem> {
    let doc = Html::parse_document(body);

    let container_sel = rules
        .container
        .as_deref()
        .and_then(|c| Selector::parse(c).ok())
        .or_else(|| Selector::parse("tr").ok());
    let Some(container_sel) = container_sel else {
        return Vec::new();
    };

    let compiled: Vec<(&String, Option<Selector>, Option<&String>, Option<Regex>)> = rules
        .fields
        .iter()
        .map(|(field, rule)| match rule {
            FieldRule::Selector(s) => (field, Selector::parse(s).ok(), None, None),
            FieldRule::Detailed {
                selector,
                attribute,
                regex,
            } => (
                field,
                selector.as_deref().and_then(|s| Selector::parse(s).ok()),
                attribute.as_ref(),
                regex.as_deref().and_then(|r| Regex::new(r).ok()),
            ),
        })
        .collect();

    let mut out = Vec::new();
    for container in doc.select(&container_sel) {
        let mut item = RawItem::new();
        if compiled.is_empty() {
            // No field rules: treat cells as name, value, change, change_percent.
            let cells: Vec<String> = container
                .child_elements()
                .map(|c| element_text(&c))
                .filter(|t| !t.is_empty())
                .collect();
            for (field, cell) in ["name", "value", "change", "change_percent"].iter().zip(cells) {
                item.insert(field.to_string(), cell);
            }
        } else {
            for (field, sel, attr, re) in &compiled {
                let target = match sel {
                    Some(sel) => container.select(sel).next(),
                    None => Some(container),
                };
                let Some(el) = target else { continue };
                let mut value = match attr {
                    Some(a) => el.value().attr(a).map(str::to_string).unwrap_or_default(),
                    None => element_text(&el),
                };
                if let Some(re) = re {
                    value = re
                        .captures(&value)
                        .and_then(|c| c.get(1).or_else(|| c.get(0)))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                }
                if !value.is_empty() {
                    item.insert((*field).clone(), value);
                }
            }
        }
        if !item.is_empty() {
            out.push(item);
        }
    }
    out
}

fn element_text(el: &ElementRef<'_>) -> String {
    normalize_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// Text payloads: every match of the named-group pattern is one item.
pub fn parse_text_items(body: &str, rules: &ExtractRules) -> Vec<RawItem> {
    let Some(re) = rules.pattern.as_deref().and_then(|p| Regex::new(p).ok()) else {
        return Vec::new();
    };
    let names: Vec<&str> = re.capture_names().flatten().collect();
    re.captures_iter(body)
        .map(|caps| {
            names
                .iter()
                .filter_map(|n| caps.name(n).map(|m| (n.to_string(), m.as_str().trim().to_string())))
                .collect::<RawItem>()
        })
        .filter(|item| !item.is_empty())
        .collect()
}
