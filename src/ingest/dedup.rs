// src/ingest/dedup.rs
//! Run-level merge of canonical records.
//!
//! Records sharing `(item, source, observed_at)` collapse into one. The
//! survivor has the most populated optional fields; ties go to the source
//! declared earlier in the registry, then to the first arrival.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ingest::registry::Registry;
use crate::ingest::types::CanonicalRecord;

/// Returns the surviving records (sorted by category, item, source) and the
/// number of records merged away.
pub fn dedup(records: Vec<CanonicalRecord>, registry: &Registry) -> (Vec<CanonicalRecord>, usize) {
    let total = records.len();
    let mut groups: HashMap<(String, String, DateTime<Utc>), (usize, CanonicalRecord)> =
        HashMap::with_capacity(total);

    for (arrival, rec) in records.into_iter().enumerate() {
        let key = (rec.item.clone(), rec.source.clone(), rec.observed_at);
        match groups.get_mut(&key) {
            None => {
                groups.insert(key, (arrival, rec));
            }
            Some(slot) => {
                if beats(&rec, arrival, &slot.1, slot.0, registry) {
                    *slot = (arrival, rec);
                }
            }
        }
    }

    let mut out: Vec<CanonicalRecord> = groups.into_values().map(|(_, r)| r).collect();
    sort_records(&mut out);
    let collisions = total - out.len();
    if collisions > 0 {
        tracing::debug!(target: "ingest", collisions, "dedup merged records");
    }
    (out, collisions)
}

fn beats(
    cand: &CanonicalRecord,
    cand_arrival: usize,
    cur: &CanonicalRecord,
    cur_arrival: usize,
    registry: &Registry,
) -> bool {
    let rank = |r: &CanonicalRecord| registry.position(&r.source).unwrap_or(usize::MAX);
    cand.populated_fields()
        .cmp(&cur.populated_fields())
        .then_with(|| rank(cur).cmp(&rank(cand)))
        .then_with(|| cur_arrival.cmp(&cand_arrival))
        .is_gt()
}

/// Report order: category, then item, then source.
pub fn sort_records(records: &mut [CanonicalRecord]) {
    records.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then_with(|| a.item.cmp(&b.item))
            .then_with(|| a.source.cmp(&b.source))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{Category, SourceDescriptor};
    use chrono::TimeZone;

    fn reg() -> Registry {
        Registry::from_descriptors(vec![
            SourceDescriptor::http("first", vec!["https://a.test".into()]),
            SourceDescriptor::http("second", vec!["https://b.test".into()]),
        ])
    }

    fn rec(item: &str, source: &str, value: f64) -> CanonicalRecord {
        CanonicalRecord {
            item: item.into(),
            category: Category::PreciousMetal,
            value,
            unit: None,
            change_percent: None,
            change_amount: None,
            currency: None,
            symbol: None,
            source: source.into(),
            observed_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn more_populated_record_wins_regardless_of_order() {
        let sparse = rec("GOLD", "first", 1.0);
        let mut rich = rec("GOLD", "first", 2.0);
        rich.unit = Some("USD/oz".into());
        rich.change_percent = Some(0.5);

        let (a, ca) = dedup(vec![sparse.clone(), rich.clone()], &reg());
        let (b, cb) = dedup(vec![rich.clone(), sparse], &reg());
        assert_eq!(a, vec![rich.clone()]);
        assert_eq!(b, vec![rich]);
        assert_eq!((ca, cb), (1, 1));
    }

    #[test]
    fn equal_richness_keeps_first_arrival() {
        let (out, n) = dedup(vec![rec("GOLD", "first", 1.0), rec("GOLD", "first", 2.0)], &reg());
        assert_eq!(n, 1);
        assert_eq!(out[0].value, 1.0);
    }

    #[test]
    fn distinct_sources_do_not_collide() {
        let (out, n) = dedup(vec![rec("GOLD", "second", 1.0), rec("GOLD", "first", 2.0)], &reg());
        assert_eq!(n, 0);
        let sources: Vec<_> = out.iter().map(|r| r.source.as_str()).collect();
        assert_eq!(sources, vec!["first", "second"]);
    }

    #[test]
    fn idempotent() {
        let mut c = rec("SILVER", "second", 3.0);
        c.category = Category::PreciousMetal;
        let input = vec![rec("GOLD", "first", 1.0), rec("GOLD", "first", 2.0), c];
        let (once, _) = dedup(input, &reg());
        let (twice, n) = dedup(once.clone(), &reg());
        assert_eq!(once, twice);
        assert_eq!(n, 0);
    }
}
