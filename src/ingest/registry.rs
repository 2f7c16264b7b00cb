// src/ingest/registry.rs
//! Typed, read-only catalog of source descriptors.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::error::{ConfigError, UnknownSourceError};
use crate::ingest::config::{RawSource, SourcesDocument};
use crate::ingest::types::{Category, FetchMethod, FieldRule, PayloadFormat, SourceDescriptor};

/// A descriptor that was skipped at load time, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadWarning {
    pub source: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    descriptors: Vec<SourceDescriptor>,
    index: HashMap<String, usize>,
}

impl Registry {
    /// Validate a parsed document into a registry. Bad descriptors are
    /// skipped and reported as warnings; loading only fails when the document
    /// declares nothing at all.
    pub fn load(doc: SourcesDocument) -> Result<(Registry, Vec<LoadWarning>), ConfigError> {
        if doc.sources.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut reg = Registry::default();
        let mut warnings = Vec::new();

        for raw in doc.sources {
            let name = raw.name.trim().to_string();
            if name.is_empty() {
                warnings.push(LoadWarning {
                    source: "<unnamed>".into(),
                    reason: "empty source name".into(),
                });
                continue;
            }
            if reg.index.contains_key(&name) {
                warnings.push(LoadWarning {
                    source: name,
                    reason: "duplicate source name".into(),
                });
                continue;
            }
            match validate(raw) {
                Ok(d) => {
                    reg.index.insert(d.name.clone(), reg.descriptors.len());
                    reg.descriptors.push(d);
                }
                Err(reason) => {
                    tracing::warn!(target: "ingest", source = %name, %reason, "skipping source descriptor");
                    warnings.push(LoadWarning { source: name, reason });
                }
            }
        }

        Ok((reg, warnings))
    }

    /// Build directly from descriptors (names must be unique; later
    /// duplicates are ignored).
    pub fn from_descriptors(descriptors: Vec<SourceDescriptor>) -> Self {
        let mut reg = Registry::default();
        for d in descriptors {
            if reg.index.contains_key(&d.name) {
                continue;
            }
            reg.index.insert(d.name.clone(), reg.descriptors.len());
            reg.descriptors.push(d);
        }
        reg
    }

    /// `None` → all enabled descriptors in declaration order.
    /// `Some(names)` → matching enabled descriptors in the given order; any
    /// name not in the registry fails the whole selection.
    pub fn select(&self, names: Option<&[String]>) -> Result<Vec<SourceDescriptor>, UnknownSourceError> {
        let Some(names) = names else {
            return Ok(self.descriptors.iter().filter(|d| d.enabled).cloned().collect());
        };

        let unknown: Vec<String> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !self.index.contains_key(*n))
            .map(str::to_string)
            .collect();
        if !unknown.is_empty() {
            let suggestions = unknown
                .iter()
                .filter_map(|u| self.closest(u).map(|k| (u.clone(), k.to_string())))
                .collect();
            return Err(UnknownSourceError { unknown, suggestions });
        }

        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(names.len());
        for n in names.iter().map(|n| n.trim()) {
            if !seen.insert(n) {
                continue;
            }
            let d = &self.descriptors[self.index[n]];
            if d.enabled {
                out.push(d.clone());
            } else {
                tracing::warn!(target: "ingest", source = %n, "selected source is disabled; skipping");
            }
        }
        Ok(out)
    }

    /// All names regardless of enabled state, in declaration order.
    pub fn list_available(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&SourceDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    /// Declaration position; used as merge tie-break.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn descriptors(&self) -> &[SourceDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn closest(&self, unknown: &str) -> Option<&str> {
        self.descriptors
            .iter()
            .map(|d| (d.name.as_str(), strsim::jaro_winkler(unknown, &d.name)))
            .filter(|(_, score)| *score >= 0.8)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(n, _)| n)
    }
}

fn secs(v: Option<f64>, field: &str) -> Result<Option<Duration>, String> {
    match v {
        None => Ok(None),
        Some(s) => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|_| format!("{field} must be a non-negative number of seconds in range, got {s}")),
    }
}

fn validate(raw: RawSource) -> Result<SourceDescriptor, String> {
    let method = FetchMethod::parse(&raw.method)
        .ok_or_else(|| format!("unrecognized fetch method `{}`", raw.method))?;

    let urls = raw.urls.into_vec();
    if urls.is_empty() {
        return Err("no urls configured".into());
    }
    for u in &urls {
        if !(u.starts_with("http://") || u.starts_with("https://") || u.starts_with("file://")) {
            return Err(format!("unsupported url `{u}`"));
        }
    }

    let format = match raw.format.as_deref() {
        Some(f) => PayloadFormat::parse(f).ok_or_else(|| format!("unrecognized payload format `{f}`"))?,
        None if method == FetchMethod::Http && raw.extract.container.is_none() => PayloadFormat::Json,
        None => PayloadFormat::Html,
    };

    let category = match raw.category.as_deref() {
        Some(c) => Some(Category::parse(c).ok_or_else(|| format!("unrecognized category `{c}`"))?),
        None => None,
    };

    // Compile-check extraction rules now so fetch/normalize never meet a bad one.
    if let Some(p) = &raw.extract.pattern {
        Regex::new(p).map_err(|e| format!("invalid extract.pattern: {e}"))?;
    }
    if format == PayloadFormat::Text && raw.extract.pattern.is_none() {
        return Err("text format requires extract.pattern".into());
    }
    if let Some(c) = &raw.extract.container {
        scraper::Selector::parse(c).map_err(|e| format!("invalid extract.container: {e}"))?;
    }
    for (field, rule) in &raw.extract.fields {
        let (selector, regex) = match rule {
            FieldRule::Selector(s) => (Some(s), None),
            FieldRule::Detailed { selector, regex, .. } => (selector.as_ref(), regex.as_ref()),
        };
        if let Some(s) = selector {
            scraper::Selector::parse(s).map_err(|e| format!("invalid selector for `{field}`: {e}"))?;
        }
        if let Some(r) = regex {
            Regex::new(r).map_err(|e| format!("invalid regex for `{field}`: {e}"))?;
        }
    }

    Ok(SourceDescriptor {
        name: raw.name.trim().to_string(),
        display_name: raw.display_name,
        urls,
        method,
        format,
        headers: raw.headers,
        required_fields: raw
            .required_fields
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        wait_time: secs(raw.wait_time_secs, "wait_time_secs")?,
        min_interval: secs(raw.min_interval_secs, "min_interval_secs")?,
        timeout: secs(raw.timeout_secs, "timeout_secs")?.unwrap_or(SourceDescriptor::DEFAULT_TIMEOUT),
        retries: raw.retries.unwrap_or(0).min(SourceDescriptor::MAX_RETRIES),
        enabled: raw.enabled,
        extract: raw.extract,
        default_unit: raw.unit,
        category,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::parse_toml;

    fn doc() -> SourcesDocument {
        parse_toml(
            r#"
[[sources]]
name = "gold_api"
urls = ["https://gold.test/api"]
required_fields = ["price"]

[[sources]]
name = "off_site"
urls = ["https://off.test"]
enabled = false

[[sources]]
name = "fx_page"
method = "selenium"
urls = ["https://fx.test"]
wait_time_secs = 3

[[sources]]
name = "gold_api"
urls = ["https://dup.test"]

[[sources]]
name = "empty"
urls = []

[[sources]]
name = "weird"
method = "carrier_pigeon"
urls = ["https://x.test"]
"#,
            "inline",
        )
        .unwrap()
    }

    #[test]
    fn bad_descriptors_are_isolated() {
        let (reg, warnings) = Registry::load(doc()).unwrap();
        assert_eq!(reg.list_available(), vec!["gold_api", "off_site", "fx_page"]);
        let skipped: Vec<_> = warnings.iter().map(|w| w.source.as_str()).collect();
        assert_eq!(skipped, vec!["gold_api", "empty", "weird"]);
        assert!(warnings[0].reason.contains("duplicate"));
        assert!(warnings[2].reason.contains("carrier_pigeon"));
    }

    #[test]
    fn select_none_returns_enabled_in_order() {
        let (reg, _) = Registry::load(doc()).unwrap();
        let names: Vec<_> = reg.select(None).unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["gold_api", "fx_page"]);
    }

    #[test]
    fn select_keeps_given_order_and_rejects_unknown() {
        let (reg, _) = Registry::load(doc()).unwrap();
        let sel = vec!["fx_page".to_string(), "gold_api".to_string()];
        let names: Vec<_> = reg.select(Some(&sel)).unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["fx_page", "gold_api"]);

        let typo = vec!["gold_apj".to_string(), "fx_page".to_string()];
        let err = reg.select(Some(&typo)).unwrap_err();
        assert_eq!(err.unknown, vec!["gold_apj"]);
        assert_eq!(err.suggestions, vec![("gold_apj".to_string(), "gold_api".to_string())]);
    }

    #[test]
    fn descriptor_fields_resolved() {
        let (reg, _) = Registry::load(doc()).unwrap();
        let fx = reg.get("fx_page").unwrap();
        assert_eq!(fx.method, FetchMethod::RenderedPage);
        assert_eq!(fx.format, PayloadFormat::Html);
        assert_eq!(fx.wait_time, Some(Duration::from_secs(3)));
        let gold = reg.get("gold_api").unwrap();
        assert_eq!(gold.format, PayloadFormat::Json);
        assert_eq!(gold.required_fields, vec!["price"]);
        assert_eq!(reg.position("fx_page"), Some(2));
    }

    #[test]
    fn oversized_durations_are_a_warning_not_a_panic() {
        let doc = parse_toml(
            r#"
[[sources]]
name = "forever"
urls = ["https://forever.test"]
wait_time_secs = 1e30

[[sources]]
name = "negative"
urls = ["https://neg.test"]
timeout_secs = -1

[[sources]]
name = "fine"
urls = ["https://fine.test"]
retries = 200
"#,
            "inline",
        )
        .unwrap();

        let (reg, warnings) = Registry::load(doc).unwrap();
        assert_eq!(reg.list_available(), vec!["fine"]);
        let skipped: Vec<_> = warnings.iter().map(|w| w.source.as_str()).collect();
        assert_eq!(skipped, vec!["forever", "negative"]);
        assert!(warnings[0].reason.contains("wait_time_secs"));
        assert_eq!(reg.get("fine").unwrap().retries, SourceDescriptor::MAX_RETRIES);
    }

    #[test]
    fn empty_document_fails() {
        assert!(matches!(
            Registry::load(SourcesDocument::default()),
            Err(ConfigError::Empty)
        ));
    }
}
