// src/ingest/config.rs
//! Sources document loading (TOML or JSON).
//!
//! Lookup order for the default document:
//! 1) `$MARKET_FEED_SOURCES_PATH`
//! 2) `config/sources.toml`
//! 3) `config/sources.json`
//!
//! Parse failures carry the line/column of the offending input so a broken
//! document is rejected before anything is fetched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::ingest::types::ExtractRules;

pub const ENV_SOURCES_PATH: &str = "MARKET_FEED_SOURCES_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/sources.toml";
pub const DEFAULT_JSON_PATH: &str = "config/sources.json";

/// Top-level document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesDocument {
    #[serde(default)]
    pub settings: RunSettings,
    #[serde(default)]
    pub sources: Vec<RawSource>,
}

/// Optional run-wide settings; env vars override these in the binary.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RunSettings {
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub run_deadline_secs: Option<u64>,
    #[serde(default)]
    pub reports_dir: Option<String>,
    #[serde(default)]
    pub formats: Option<Vec<String>>,
}

/// A source entry exactly as written. Semantic checks (method names,
/// duplicates, empty URL lists) happen in the registry so that one bad entry
/// does not sink the others.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSource {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, alias = "url")]
    pub urls: UrlList,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub wait_time_secs: Option<f64>,
    #[serde(default)]
    pub min_interval_secs: Option<f64>,
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    #[serde(default)]
    pub retries: Option<u8>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub extract: ExtractRules,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_method() -> String {
    "http".to_string()
}

fn default_enabled() -> bool {
    true
}

/// `url = "..."` or `urls = ["...", "..."]`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UrlList {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl UrlList {
    pub fn into_vec(self) -> Vec<String> {
        let v = match self {
            UrlList::None => Vec::new(),
            UrlList::One(u) => vec![u],
            UrlList::Many(v) => v,
        };
        v.into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }
}

/// Load a document from an explicit path. Format follows the extension.
pub fn load_document_from(path: &Path) -> Result<SourcesDocument, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let origin = path.display().to_string();
    match ext.as_str() {
        "toml" => parse_toml(&content, &origin),
        "json" => parse_json(&content, &origin),
        other => Err(ConfigError::Format(other.to_string())),
    }
}

/// Resolve the default document location (env var first, then fallbacks).
pub fn default_document_path() -> Result<PathBuf, ConfigError> {
    if let Ok(p) = std::env::var(ENV_SOURCES_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        return Err(ConfigError::Io {
            path: pb,
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{ENV_SOURCES_PATH} points to a non-existent path"),
            ),
        });
    }
    for candidate in [DEFAULT_TOML_PATH, DEFAULT_JSON_PATH] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return Ok(pb);
        }
    }
    Err(ConfigError::Io {
        path: PathBuf::from(DEFAULT_TOML_PATH),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no sources document found"),
    })
}

pub fn load_document_default() -> Result<SourcesDocument, ConfigError> {
    load_document_from(&default_document_path()?)
}

pub fn parse_toml(s: &str, origin: &str) -> Result<SourcesDocument, ConfigError> {
    toml::from_str::<SourcesDocument>(s).map_err(|e| {
        let (line, column) = e
            .span()
            .map(|span| line_col(s, span.start))
            .unwrap_or((0, 0));
        ConfigError::Parse {
            origin: origin.to_string(),
            line,
            column,
            message: e.message().to_string(),
        }
    })
}

pub fn parse_json(s: &str, origin: &str) -> Result<SourcesDocument, ConfigError> {
    serde_json::from_str::<SourcesDocument>(s).map_err(|e| ConfigError::Parse {
        origin: origin.to_string(),
        line: e.line(),
        column: e.column(),
        message: e.to_string(),
    })
}

/// 1-based line/column of a byte offset.
fn line_col(s: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(s.len());
    let before = &s[..offset];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|nl| before[nl + 1..].chars().count())
        .unwrap_or_else(|| before.chars().count())
        + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_and_urls_both_accepted() {
        let doc = parse_toml(
            r#"
[[sources]]
name = "a"
url = "https://a.test/x"

[[sources]]
name = "b"
urls = [" https://b.test/1 ", ""]
"#,
            "inline",
        )
        .unwrap();
        assert_eq!(doc.sources[0].urls.clone().into_vec(), vec!["https://a.test/x"]);
        assert_eq!(doc.sources[1].urls.clone().into_vec(), vec!["https://b.test/1"]);
        assert_eq!(doc.sources[0].method, "http");
        assert!(doc.sources[0].enabled);
    }

    #[test]
    fn toml_error_reports_location() {
        let bad = "[[sources]]\nname = \"a\"\nenabled = maybe\n";
        match parse_toml(bad, "inline.toml") {
            Err(ConfigError::Parse { line, origin, .. }) => {
                assert_eq!(line, 3);
                assert_eq!(origin, "inline.toml");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn json_error_reports_location() {
        let bad = "{\n  \"sources\": [\n    {\"urls\": []}\n  ]\n}";
        match parse_json(bad, "inline.json") {
            Err(ConfigError::Parse { line, message, .. }) => {
                assert_eq!(line, 3);
                assert!(message.contains("name"), "{message}");
            }
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn line_col_counts_from_one() {
        assert_eq!(line_col("ab\ncd", 0), (1, 1));
        assert_eq!(line_col("ab\ncd", 4), (2, 2));
    }
}
