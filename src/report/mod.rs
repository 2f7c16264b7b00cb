// src/report/mod.rs
//! Run report: per-source outcomes, final records and summary statistics.
//!
//! The summary is a pure function of the record set; it is never updated
//! incrementally.

pub mod emit;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{FetchError, ValidationError};
use crate::ingest::types::{CanonicalRecord, Category, FetchMethod, FetchResult};

pub use emit::{ReportEmitter, ReportFormat};

/// How one selected source fared.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub method: FetchMethod,
    pub success: bool,
    /// Records this source contributed before dedup.
    pub record_count: usize,
    pub dropped: usize,
    pub error: Option<FetchError>,
    /// Failures of individual URLs when the source still succeeded.
    pub partial_errors: Vec<FetchError>,
    pub elapsed_ms: u64,
}

impl SourceOutcome {
    pub fn from_result(result: &FetchResult, method: FetchMethod, record_count: usize, dropped: usize) -> Self {
        Self {
            source: result.source.clone(),
            method,
            success: result.success(),
            record_count,
            dropped,
            error: result.error.clone(),
            partial_errors: result.partial_errors.clone(),
            elapsed_ms: result.elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CategorySummary {
    pub count: usize,
    pub mean_change_percent: Option<f64>,
    pub up: usize,
    pub down: usize,
}

/// Aggregate statistics over the final record set. Records without a
/// percent change count toward `count` only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean_change_percent: Option<f64>,
    pub up: usize,
    pub down: usize,
    pub flat: usize,
    pub by_category: BTreeMap<Category, CategorySummary>,
}

impl Summary {
    pub fn from_records(records: &[CanonicalRecord]) -> Self {
        let mut s = Summary {
            count: records.len(),
            ..Default::default()
        };
        let mut sums: BTreeMap<Category, (f64, usize)> = BTreeMap::new();
        let (mut total, mut n) = (0.0, 0usize);

        for r in records {
            let cat = s.by_category.entry(r.category).or_default();
            cat.count += 1;
            let Some(pct) = r.change_percent else { continue };
            total += pct;
            n += 1;
            let e = sums.entry(r.category).or_insert((0.0, 0));
            e.0 += pct;
            e.1 += 1;
            if pct > 0.0 {
                s.up += 1;
                cat.up += 1;
            } else if pct < 0.0 {
                s.down += 1;
                cat.down += 1;
            } else {
                s.flat += 1;
            }
        }

        s.mean_change_percent = (n > 0).then(|| total / n as f64);
        for (cat, (sum, k)) in sums {
            if let Some(c) = s.by_category.get_mut(&cat) {
                c.mean_change_percent = Some(sum / k as f64);
            }
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    AllSucceeded,
    Partial,
    TotalFailure,
}

impl RunOutcome {
    /// Process exit code for one-shot runs: 2 when the run produced no
    /// records, 0 otherwise.
    pub fn exit_code(self) -> i32 {
        match self {
            RunOutcome::AllSucceeded | RunOutcome::Partial => 0,
            RunOutcome::TotalFailure => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Declaration order of the selection.
    pub outcomes: Vec<SourceOutcome>,
    /// Deduplicated; sorted by category, item, source.
    pub records: Vec<CanonicalRecord>,
    pub validation_drops: usize,
    pub validation_errors: Vec<ValidationError>,
    pub dedup_collisions: usize,
    pub summary: Summary,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: format!("run_{}", started_at.format("%Y%m%d_%H%M%S")),
            started_at,
            finished_at: started_at,
            outcomes: Vec::new(),
            records: Vec::new(),
            validation_drops: 0,
            validation_errors: Vec::new(),
            dedup_collisions: 0,
            summary: Summary::default(),
        }
    }

    /// Seal the report: set the final record set and recompute the summary.
    pub fn finalize(&mut self, records: Vec<CanonicalRecord>, finished_at: DateTime<Utc>) {
        self.summary = Summary::from_records(&records);
        self.records = records;
        self.finished_at = finished_at;
    }

    /// Total failure means no canonical records from a non-empty selection,
    /// whatever the fetch results were. An empty selection counts as
    /// all-succeeded.
    pub fn outcome(&self) -> RunOutcome {
        if self.outcomes.is_empty() {
            RunOutcome::AllSucceeded
        } else if self.records.is_empty() {
            RunOutcome::TotalFailure
        } else if self.outcomes.iter().all(|o| o.success) {
            RunOutcome::AllSucceeded
        } else {
            RunOutcome::Partial
        }
    }

    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn rec(item: &str, category: Category, pct: Option<f64>) -> CanonicalRecord {
        CanonicalRecord {
            item: item.into(),
            category,
            value: 1.0,
            unit: None,
            change_percent: pct,
            change_amount: None,
            currency: None,
            symbol: None,
            source: "s".into(),
            observed_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn summary_counts_and_means() {
        let s = Summary::from_records(&[
            rec("GOLD", Category::PreciousMetal, Some(1.0)),
            rec("SILVER", Category::PreciousMetal, Some(-3.0)),
            rec("WTI", Category::Energy, Some(0.0)),
            rec("EUR/USD", Category::Currency, None),
        ]);
        assert_eq!(s.count, 4);
        assert_eq!((s.up, s.down, s.flat), (1, 1, 1));
        assert_eq!(s.mean_change_percent, Some(-2.0 / 3.0));
        let pm = &s.by_category[&Category::PreciousMetal];
        assert_eq!(pm.count, 2);
        assert_eq!(pm.mean_change_percent, Some(-1.0));
        assert_eq!(s.by_category[&Category::Currency].mean_change_percent, None);
    }

    #[test]
    fn empty_summary_has_no_mean() {
        let s = Summary::from_records(&[]);
        assert_eq!(s.count, 0);
        assert_eq!(s.mean_change_percent, None);
    }

    #[test]
    fn outcome_classification() {
        let mut r = RunReport::new(Utc::now());
        assert_eq!(r.outcome(), RunOutcome::AllSucceeded);

        let ok = FetchResult::ok("a", vec![], Duration::ZERO);
        let bad = FetchResult::failed("b", FetchError::Unexpected, Duration::ZERO);
        r.outcomes = vec![SourceOutcome::from_result(&ok, FetchMethod::Http, 1, 0)];
        r.finalize(vec![rec("GOLD", Category::PreciousMetal, Some(1.0))], Utc::now());
        assert_eq!(r.outcome(), RunOutcome::AllSucceeded);
        r.outcomes.push(SourceOutcome::from_result(&bad, FetchMethod::Http, 0, 0));
        assert_eq!(r.outcome(), RunOutcome::Partial);
        assert_eq!(r.outcome().exit_code(), 0);

        // every fetch may succeed and still leave nothing behind
        r.outcomes.remove(1);
        r.finalize(vec![], Utc::now());
        assert_eq!(r.outcome(), RunOutcome::TotalFailure);
        assert_eq!(r.outcome().exit_code(), 2);
    }
}
