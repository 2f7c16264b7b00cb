//! # Normalization tables
//!
//! Configuration data used by the normalizer:
//!
//! - `synonyms`: canonical field → raw keys that carry it (`value` ← `price`,
//!   `current_price`, `last`, ...). Matching is case-insensitive and ignores
//!   separators, so `changePercent`, `change_percent` and `Change %` collide.
//! - `aliases`: raw item names → canonical item names (`Oil (WTI)` → `WTI`).
//! - `categories`: canonical item name → category, plus keyword lists used as
//!   a containment fallback (`"brent crude"` contains `brent` → energy).
//!
//! - `bounds`: plausible ranges for `value` and `change_percent`. A value
//!   outside its range drops the item; a percent outside its range is
//!   discarded and the item kept.
//!
//! Loaded from TOML; falls back to `default_seed()` when no file exists.
//! Items that no table entry covers are classified as `other`.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::ingest::types::Category;

pub const ENV_TABLES_PATH: &str = "NORMALIZE_TABLES_PATH";
pub const DEFAULT_TABLES_PATH: &str = "config/normalize.toml";

/// Canonical fields the normalizer understands.
pub const CANONICAL_FIELDS: [&str; 7] = [
    "name",
    "value",
    "unit",
    "change_percent",
    "change",
    "currency",
    "symbol",
];

#[derive(Debug, Clone, Deserialize, Default)]
struct TablesFile {
    #[serde(default)]
    synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    #[serde(default)]
    categories: BTreeMap<String, String>,
    #[serde(default)]
    keywords: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    bounds: BoundsFile,
    /// When true the file extends the built-in seed instead of replacing it.
    #[serde(default = "default_extend")]
    extend_seed: bool,
}

fn default_extend() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BoundsFile {
    value: Option<Range>,
    change_percent: Option<Range>,
}

/// Inclusive range; a missing end is open.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn contains(&self, v: f64) -> bool {
        self.min.map_or(true, |m| v >= m) && self.max.map_or(true, |m| v <= m)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueBounds {
    pub value: Range,
    pub change_percent: Range,
}

impl Default for ValueBounds {
    fn default() -> Self {
        Self {
            value: Range::new(0.0, 1_000_000.0),
            change_percent: Range::new(-100.0, 1_000.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NormalizeTables {
    /// folded raw key -> canonical field
    synonyms: HashMap<String, String>,
    /// folded raw name -> canonical item
    aliases: HashMap<String, String>,
    /// canonical item -> category
    categories: HashMap<String, Category>,
    /// ordered (keyword, category); first hit wins
    keywords: Vec<(String, Category)>,
    bounds: ValueBounds,
}

impl NormalizeTables {
    /// Load using env var + fallback path, else the built-in seed.
    pub fn load_default() -> Self {
        let path = std::env::var(ENV_TABLES_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_TABLES_PATH));
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            Self::default_seed()
        }
    }

    /// Load from a TOML file. Falls back to `default_seed()` on error.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(s) => Self::from_toml_str(&s).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "bad normalize tables; using seed");
                Self::default_seed()
            }),
            Err(_) => Self::default_seed(),
        }
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let file: TablesFile = toml::from_str(s)?;
        let mut out = if file.extend_seed {
            Self::default_seed()
        } else {
            Self::empty()
        };
        for (canon, raws) in file.synonyms {
            for raw in raws {
                out.synonyms.insert(fold(&raw), canon.clone());
            }
            out.synonyms.insert(fold(&canon), canon);
        }
        for (raw, canon) in file.aliases {
            out.aliases.insert(fold(&raw), canonical_item(&canon));
        }
        for (item, cat) in file.categories {
            let c = Category::parse(&cat)
                .ok_or_else(|| anyhow::anyhow!("unknown category `{cat}` for `{item}`"))?;
            out.categories.insert(canonical_item(&item), c);
        }
        // File keywords take precedence over seeded ones.
        let mut kws = Vec::new();
        for (cat, words) in file.keywords {
            let c = Category::parse(&cat).ok_or_else(|| anyhow::anyhow!("unknown category `{cat}`"))?;
            for w in words {
                kws.push((w.to_ascii_lowercase(), c));
            }
        }
        kws.append(&mut out.keywords);
        out.keywords = kws;

        if let Some(r) = file.bounds.value {
            out.bounds.value = r;
        }
        if let Some(r) = file.bounds.change_percent {
            out.bounds.change_percent = r;
        }
        Ok(out)
    }

    fn empty() -> Self {
        let mut synonyms = HashMap::new();
        for f in CANONICAL_FIELDS {
            synonyms.insert(fold(f), f.to_string());
        }
        Self {
            synonyms,
            aliases: HashMap::new(),
            categories: HashMap::new(),
            keywords: Vec::new(),
            bounds: ValueBounds::default(),
        }
    }

    pub fn bounds(&self) -> &ValueBounds {
        &self.bounds
    }

    /// Canonical field for a raw key, if any.
    pub fn canonical_field(&self, raw_key: &str) -> Option<&str> {
        self.synonyms.get(&fold(raw_key)).map(String::as_str)
    }

    /// Canonical item identifier: alias lookup, then upper snake case.
    pub fn canonical_item(&self, raw_name: &str) -> String {
        match self.aliases.get(&fold(raw_name)) {
            Some(c) => c.clone(),
            None => canonical_item(raw_name),
        }
    }

    /// Category for a canonical item: exact entry, then keyword containment,
    /// else `Other`.
    pub fn classify(&self, item: &str) -> Category {
        if let Some(c) = self.categories.get(item) {
            return *c;
        }
        let lower = item.to_ascii_lowercase().replace('_', " ");
        for (kw, c) in &self.keywords {
            if lower.split(' ').any(|tok| tok == kw) || (kw.contains(' ') && lower.contains(kw.as_str())) {
                return *c;
            }
        }
        Category::Other
    }

    /// Built-in seed with the common commodity, FX and index vocabulary.
    pub fn default_seed() -> Self {
        let mut t = Self::empty();

        for (canon, raws) in [
            ("name", &["item", "commodity", "title", "pair", "instrument", "label"][..]),
            (
                "value",
                &["price", "current_price", "last", "last_price", "rate", "close", "mid", "mid_price", "quote"][..],
            ),
            ("change_percent", &["pct_change", "percent_change", "change_pct", "chg_pct", "change %", "percentchange"][..]),
            ("change", &["change_amount", "chg", "net_change", "delta"][..]),
            ("unit", &["units", "uom"][..]),
            ("currency", &["ccy", "quote_currency"][..]),
            ("symbol", &["ticker", "code"][..]),
        ] {
            for r in raws {
                t.synonyms.insert(fold(r), canon.to_string());
            }
        }

        for (raw, canon) in [
            ("oil (wti)", "WTI"),
            ("wti crude", "WTI"),
            ("crude oil wti", "WTI"),
            ("oil (brent)", "BRENT"),
            ("brent crude", "BRENT"),
            ("brentoil", "BRENT"),
            ("natural gas (henry hub)", "NATURAL_GAS"),
            ("ng", "NATURAL_GAS"),
            ("xau", "GOLD"),
            ("xauusd", "GOLD"),
            ("xag", "SILVER"),
            ("xagusd", "SILVER"),
            ("soybeans", "SOYBEAN"),
            ("dow jones", "DJIA"),
            ("s&p 500", "SPX"),
        ] {
            t.aliases.insert(fold(raw), canon.to_string());
        }

        for (item, c) in [
            ("GOLD", Category::PreciousMetal),
            ("SILVER", Category::PreciousMetal),
            ("PLATINUM", Category::PreciousMetal),
            ("PALLADIUM", Category::PreciousMetal),
            ("WTI", Category::Energy),
            ("BRENT", Category::Energy),
            ("NATURAL_GAS", Category::Energy),
            ("COPPER", Category::IndustrialMetal),
            ("ALUMINUM", Category::IndustrialMetal),
            ("ZINC", Category::IndustrialMetal),
            ("NICKEL", Category::IndustrialMetal),
            ("WHEAT", Category::Agricultural),
            ("CORN", Category::Agricultural),
            ("SOYBEAN", Category::Agricultural),
            ("SUGAR", Category::Agricultural),
            ("COFFEE", Category::Agricultural),
            ("DJIA", Category::Index),
            ("SPX", Category::Index),
        ] {
            t.categories.insert(item.to_string(), c);
        }

        for (c, words) in [
            (Category::Energy, &["oil", "gas", "gasoline", "heating", "brent", "wti", "crude"][..]),
            (Category::PreciousMetal, &["gold", "silver", "platinum", "palladium"][..]),
            (
                Category::IndustrialMetal,
                &["copper", "aluminum", "aluminium", "zinc", "nickel", "lead", "tin", "iron"][..],
            ),
            (
                Category::Agricultural,
                &["corn", "wheat", "soybean", "cotton", "sugar", "coffee", "cocoa", "cattle", "hog", "rice"][..],
            ),
        ] {
            for w in words {
                t.keywords.push((w.to_string(), c));
            }
        }
        t
    }
}

/// Fold a key for lookup: lowercase, drop separators and whitespace.
fn fold(s: &str) -> String {
    s.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Upper snake case, punctuation collapsed.
pub fn canonical_item(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.trim().chars() {
        if ch.is_alphanumeric() || ch == '/' || ch == '&' {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.extend(ch.to_uppercase());
        } else {
            pending_sep = true;
        }
    }
    out
}
