// src/report/emit.rs
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::RunReport;
use crate::error::EmitError;
use crate::ingest::types::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    Csv,
    Json,
    Markdown,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 3] = [ReportFormat::Csv, ReportFormat::Json, ReportFormat::Markdown];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Comma-separated list; unknown entries are ignored, duplicates removed.
    pub fn parse_list(s: &str) -> Vec<Self> {
        let mut out = Vec::new();
        for f in s.split(',').filter_map(Self::parse) {
            if !out.contains(&f) {
                out.push(f);
            }
        }
        out
    }

    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
            ReportFormat::Markdown => "md",
        }
    }
}

/// Writes report artifacts into one directory, created on first use.
#[derive(Debug, Clone)]
pub struct ReportEmitter {
    dir: PathBuf,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    item: &'a str,
    category: Category,
    value: f64,
    unit: Option<&'a str>,
    change_percent: Option<f64>,
    change_amount: Option<f64>,
    currency: Option<&'a str>,
    source: &'a str,
    observed_at: String,
}

impl ReportEmitter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `market_report_<YYYYMMDD_HHMMSS>.<ext>` from the run's finish time.
    pub fn file_name(report: &RunReport, format: ReportFormat) -> String {
        format!(
            "market_report_{}.{}",
            report.finished_at.format("%Y%m%d_%H%M%S"),
            format.extension()
        )
    }

    pub fn emit(&self, report: &RunReport, format: ReportFormat) -> Result<PathBuf, EmitError> {
        fs::create_dir_all(&self.dir).map_err(|source| EmitError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(Self::file_name(report, format));
        match format {
            ReportFormat::Csv => write_csv(&path, report)?,
            ReportFormat::Json => {
                let body = serde_json::to_string_pretty(report)?;
                write_file(&path, &body)?;
            }
            ReportFormat::Markdown => write_file(&path, &render_markdown(report))?,
        }
        tracing::info!(target: "ingest", path = %path.display(), ?format, "report written");
        Ok(path)
    }

    pub fn emit_all(&self, report: &RunReport, formats: &[ReportFormat]) -> Result<Vec<PathBuf>, EmitError> {
        formats.iter().map(|f| self.emit(report, *f)).collect()
    }
}

fn write_file(path: &Path, body: &str) -> Result<(), EmitError> {
    fs::write(path, body).map_err(|source| EmitError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Column order of `CsvRow`.
const CSV_HEADER: [&str; 9] = [
    "item",
    "category",
    "value",
    "unit",
    "change_percent",
    "change_amount",
    "currency",
    "source",
    "observed_at",
];

fn write_csv(path: &Path, report: &RunReport) -> Result<(), EmitError> {
    let mut wtr = csv::Writer::from_path(path)?;
    // serialize() only emits the header alongside the first row
    if report.records.is_empty() {
        wtr.write_record(CSV_HEADER)?;
    }
    for r in &report.records {
        wtr.serialize(CsvRow {
            item: &r.item,
            category: r.category,
            value: r.value,
            unit: r.unit.as_deref(),
            change_percent: r.change_percent,
            change_amount: r.change_amount,
            currency: r.currency.as_deref(),
            source: &r.source,
            observed_at: r.observed_at.to_rfc3339(),
        })?;
    }
    wtr.flush().map_err(|source| EmitError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn arrow(pct: Option<f64>) -> &'static str {
    match pct {
        Some(p) if p > 0.0 => "▲",
        Some(p) if p < 0.0 => "▼",
        Some(_) => "=",
        None => "",
    }
}

fn fmt_opt(v: Option<f64>, suffix: &str) -> String {
    v.map(|x| format!("{x:+.2}{suffix}")).unwrap_or_else(|| "-".into())
}

/// Plain Markdown: records grouped by category, then per-source outcomes.
pub fn render_markdown(report: &RunReport) -> String {
    let mut md = String::new();
    let s = &report.summary;

    let _ = writeln!(md, "# Market report {}\n", report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(md, "- Run: `{}` ({:?})", report.run_id, report.outcome());
    let _ = writeln!(
        md,
        "- Records: {} (▲ {} / ▼ {} / = {}), mean change {}",
        s.count,
        s.up,
        s.down,
        s.flat,
        fmt_opt(s.mean_change_percent, "%")
    );
    let _ = writeln!(
        md,
        "- Dropped by validation: {}, merged duplicates: {}\n",
        report.validation_drops, report.dedup_collisions
    );

    for cat in Category::ALL {
        let rows: Vec<_> = report.records.iter().filter(|r| r.category == cat).collect();
        if rows.is_empty() {
            continue;
        }
        let _ = writeln!(md, "## {}\n", cat.label());
        let _ = writeln!(md, "| Item | Value | Unit | Change | Source |");
        let _ = writeln!(md, "|---|---:|---|---:|---|");
        for r in rows {
            let _ = writeln!(
                md,
                "| {} | {} | {} | {} {} | {} |",
                r.item,
                r.value,
                r.unit.as_deref().unwrap_or("-"),
                arrow(r.change_percent),
                fmt_opt(r.change_percent, "%"),
                r.source
            );
        }
        md.push('\n');
    }

    let _ = writeln!(md, "## Sources\n");
    let _ = writeln!(md, "| Source | Method | Status | Records | Detail |");
    let _ = writeln!(md, "|---|---|---|---:|---|");
    for o in &report.outcomes {
        let detail = o.error.as_ref().map(|e| e.to_string()).unwrap_or_else(|| {
            if o.partial_errors.is_empty() {
                String::new()
            } else {
                format!("{} url(s) failed", o.partial_errors.len())
            }
        });
        let _ = writeln!(
            md,
            "| {} | {} | {} | {} | {} |",
            o.source,
            o.method,
            if o.success { "ok" } else { "failed" },
            o.record_count,
            detail.replace('|', "\\|")
        );
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::CanonicalRecord;
    use chrono::{TimeZone, Utc};

    fn report() -> RunReport {
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 5).unwrap();
        let mut r = RunReport::new(t);
        let rec = CanonicalRecord {
            item: "GOLD".into(),
            category: Category::PreciousMetal,
            value: 2021.5,
            unit: Some("USD/oz".into()),
            change_percent: Some(0.4),
            change_amount: None,
            currency: Some("USD".into()),
            symbol: None,
            source: "gold_api".into(),
            observed_at: t,
        };
        r.finalize(vec![rec], t);
        r
    }

    #[test]
    fn empty_run_still_gets_a_csv_header() {
        let dir = tempfile::tempdir().unwrap();
        let t = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut empty = RunReport::new(t);
        empty.finalize(vec![], t);

        let path = ReportEmitter::new(dir.path()).emit(&empty, ReportFormat::Csv).unwrap();
        let csv = std::fs::read_to_string(path).unwrap();
        assert_eq!(csv.lines().collect::<Vec<_>>(), vec![CSV_HEADER.join(",")]);
    }

    #[test]
    fn format_list_parsing() {
        assert_eq!(
            ReportFormat::parse_list("csv, md,bogus,csv"),
            vec![ReportFormat::Csv, ReportFormat::Markdown]
        );
    }

    #[test]
    fn writes_all_formats_with_timestamped_names() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let paths = ReportEmitter::new(&out).emit_all(&report(), &ReportFormat::ALL).unwrap();
        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "market_report_20250301_083005.csv",
                "market_report_20250301_083005.json",
                "market_report_20250301_083005.md"
            ]
        );

        let csv = std::fs::read_to_string(&paths[0]).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "item,category,value,unit,change_percent,change_amount,currency,source,observed_at"
        );
        assert!(lines.next().unwrap().starts_with("GOLD,precious_metal,2021.5,USD/oz,0.4,,USD,gold_api,"));

        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&paths[1]).unwrap()).unwrap();
        assert_eq!(json["summary"]["count"], 1);

        let md = std::fs::read_to_string(&paths[2]).unwrap();
        assert!(md.contains("## Precious metals"));
        assert!(md.contains("▲ +0.40%"));
    }
}
