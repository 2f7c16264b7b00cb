// src/ingest/types.rs
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// How a source is fetched. Closed set, validated when the registry loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    Http,
    RenderedPage,
    Rpa,
}

impl FetchMethod {
    /// Accepts the canonical names plus the historical aliases used in
    /// source documents (`requests`, `selenium`, `applescript`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "http" | "requests" | "api" | "http_request" => Some(Self::Http),
            "rendered" | "rendered_page" | "render" | "browser" | "selenium" | "cdp" => {
                Some(Self::RenderedPage)
            }
            "rpa" | "applescript" | "automation" | "desktop" => Some(Self::Rpa),
            _ => None,
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchMethod::Http => "http",
            FetchMethod::RenderedPage => "rendered_page",
            FetchMethod::Rpa => "rpa",
        })
    }
}

/// Shape of the raw payload, decides which parser the normalizer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    Json,
    Html,
    Text,
}

impl PayloadFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "html" | "dom" => Some(Self::Html),
            "text" | "regex" => Some(Self::Text),
            _ => None,
        }
    }
}

/// One extraction rule for an HTML field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldRule {
    /// Bare CSS selector, text content is taken.
    Selector(String),
    Detailed {
        #[serde(default)]
        selector: Option<String>,
        #[serde(default)]
        attribute: Option<String>,
        /// First capture group is kept.
        #[serde(default)]
        regex: Option<String>,
    },
}

/// Per-source extraction rules. Every part is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractRules {
    /// Dot path into a JSON document (`data.items`).
    #[serde(default)]
    pub json_path: Option<String>,
    /// canonical field <- raw key
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    /// CSS selector for one item container (HTML).
    #[serde(default)]
    pub container: Option<String>,
    /// canonical field -> rule (HTML).
    #[serde(default)]
    pub fields: BTreeMap<String, FieldRule>,
    /// Regex with named groups (Text).
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Declarative definition of one data origin. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub display_name: Option<String>,
    pub urls: Vec<String>,
    pub method: FetchMethod,
    pub format: PayloadFormat,
    pub headers: BTreeMap<String, String>,
    pub required_fields: Vec<String>,
    pub wait_time: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub timeout: Duration,
    pub retries: u8,
    pub enabled: bool,
    pub extract: ExtractRules,
    pub default_unit: Option<String>,
    pub category: Option<Category>,
}

impl SourceDescriptor {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_RETRIES: u8 = 8;

    /// Minimal enabled HTTP/JSON descriptor. Handy for tests and tooling.
    pub fn http(name: impl Into<String>, urls: Vec<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            urls,
            method: FetchMethod::Http,
            format: PayloadFormat::Json,
            headers: BTreeMap::new(),
            required_fields: Vec::new(),
            wait_time: None,
            min_interval: None,
            timeout: Self::DEFAULT_TIMEOUT,
            retries: 0,
            enabled: true,
            extract: ExtractRules::default(),
            default_unit: None,
            category: None,
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Body fetched from one URL.
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadPart {
    pub url: String,
    pub body: String,
}

/// Raw outcome of one source invocation. Exactly one of `payload` / `error`
/// is populated; use the constructors.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub source: String,
    pub payload: Option<Vec<PayloadPart>>,
    pub error: Option<FetchError>,
    pub fetched_at: DateTime<Utc>,
    pub elapsed: Duration,
    /// Per-URL error details kept when some (not all) URLs failed.
    pub partial_errors: Vec<FetchError>,
}

impl FetchResult {
    pub fn ok(source: &str, parts: Vec<PayloadPart>, elapsed: Duration) -> Self {
        Self {
            source: source.to_string(),
            payload: Some(parts),
            error: None,
            fetched_at: Utc::now(),
            elapsed,
            partial_errors: Vec::new(),
        }
    }

    pub fn failed(source: &str, error: FetchError, elapsed: Duration) -> Self {
        Self {
            source: source.to_string(),
            payload: None,
            error: Some(error),
            fetched_at: Utc::now(),
            elapsed,
            partial_errors: Vec::new(),
        }
    }

    pub fn with_partial_errors(mut self, errs: Vec<FetchError>) -> Self {
        self.partial_errors = errs;
        self
    }

    pub fn success(&self) -> bool {
        self.payload.is_some()
    }

    pub fn parts(&self) -> &[PayloadPart] {
        self.payload.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    PreciousMetal,
    Energy,
    Agricultural,
    IndustrialMetal,
    Currency,
    Index,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::PreciousMetal,
        Category::Energy,
        Category::Agricultural,
        Category::IndustrialMetal,
        Category::Currency,
        Category::Index,
        Category::Other,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "precious_metal" | "precious_metals" => Some(Self::PreciousMetal),
            "energy" => Some(Self::Energy),
            "agricultural" | "agriculture" => Some(Self::Agricultural),
            "industrial_metal" | "industrial_metals" => Some(Self::IndustrialMetal),
            "currency" | "fx" | "forex" => Some(Self::Currency),
            "index" | "indices" => Some(Self::Index),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::PreciousMetal => "Precious metals",
            Category::Energy => "Energy",
            Category::Agricultural => "Agricultural",
            Category::IndustrialMetal => "Industrial metals",
            Category::Currency => "Currencies",
            Category::Index => "Indices",
            Category::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        f.write_str(&s)
    }
}

/// Normalized output unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub item: String,
    pub category: Category,
    pub value: f64,
    pub unit: Option<String>,
    pub change_percent: Option<f64>,
    pub change_amount: Option<f64>,
    pub currency: Option<String>,
    pub symbol: Option<String>,
    pub source: String,
    pub observed_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Count of populated optional attributes; the merge tie metric.
    pub fn populated_fields(&self) -> usize {
        [
            self.unit.is_some(),
            self.change_percent.is_some(),
            self.change_amount.is_some(),
            self.currency.is_some(),
            self.symbol.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }

    pub fn key(&self) -> (&str, &str, DateTime<Utc>) {
        (&self.item, &self.source, self.observed_at)
    }
}
