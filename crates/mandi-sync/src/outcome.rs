use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use mandi_core::{DateWindow, PriceRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Committed, but some rows were rejected or collided.
    PartialSuccess,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub collisions: usize,
    pub code_conflicts: usize,
    pub appended: usize,
}

/// Shape of the accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub states: usize,
    pub markets: usize,
    pub commodities: usize,
    pub rejections_by_kind: BTreeMap<String, usize>,
}

impl QualitySummary {
    pub fn from_batch<'a>(
        accepted: impl IntoIterator<Item = &'a PriceRecord>,
        rejections_by_kind: BTreeMap<String, usize>,
    ) -> Self {
        let mut tally = QualityTally::default();
        tally.extend(accepted);
        tally.summary(rejections_by_kind)
    }
}

/// Running distinct-value counts over accepted rows seen in several batches.
#[derive(Debug, Default)]
pub struct QualityTally {
    states: BTreeSet<String>,
    markets: BTreeSet<(String, String, String)>,
    commodities: BTreeSet<String>,
    first_date: Option<NaiveDate>,
    last_date: Option<NaiveDate>,
}

impl QualityTally {
    pub fn extend<'a>(&mut self, accepted: impl IntoIterator<Item = &'a PriceRecord>) {
        for record in accepted {
            let key = &record.key;
            if !self.states.contains(&key.state) {
                self.states.insert(key.state.clone());
            }
            if !self.commodities.contains(&key.commodity) {
                self.commodities.insert(key.commodity.clone());
            }
            self.markets
                .insert((key.state.clone(), key.district.clone(), key.market.clone()));
            let date = key.arrival_date;
            self.first_date = Some(self.first_date.map_or(date, |d| d.min(date)));
            self.last_date = Some(self.last_date.map_or(date, |d| d.max(date)));
        }
    }

    pub fn summary(&self, rejections_by_kind: BTreeMap<String, usize>) -> QualitySummary {
        QualitySummary {
            first_date: self.first_date,
            last_date: self.last_date,
            states: self.states.len(),
            markets: self.markets.len(),
            commodities: self.commodities.len(),
            rejections_by_kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub source: String,
    pub status: RunStatus,
    pub exit_code: i32,
    pub window: Option<DateWindow>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub counts: RunCounts,
    pub quality: QualitySummary,
    pub partitions_rewritten: Vec<i32>,
    pub generation: u64,
    pub total_rows: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunStatus {
    pub fn for_counts(counts: &RunCounts) -> Self {
        if counts.rejected > 0 || counts.collisions > 0 || counts.code_conflicts > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::PartialSuccess)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mandi_core::{NaturalKey, PriceQuote};
    use rust_decimal::Decimal;

    fn record(day: u32, state: &str, market: &str, commodity: &str) -> PriceRecord {
        PriceRecord {
            key: NaturalKey {
                arrival_date: NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
                commodity: commodity.into(),
                state: state.into(),
                district: "D".into(),
                market: market.into(),
                variety: String::new(),
                grade: None,
            },
            prices: PriceQuote {
                min: Decimal::ONE,
                max: Decimal::TEN,
                modal: Decimal::TWO,
            },
            commodity_code: None,
        }
    }

    #[test]
    fn quality_summary_counts_distinct_values() {
        let batch = [
            record(3, "Kerala", "Punalur", "Banana"),
            record(1, "Kerala", "Punalur", "Tapioca"),
            record(2, "Kerala", "Anchal", "Banana"),
            record(2, "Goa", "Mapusa", "Banana"),
        ];
        let q = QualitySummary::from_batch(&batch, BTreeMap::new());
        assert_eq!(q.first_date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(q.last_date, NaiveDate::from_ymd_opt(2024, 6, 3));
        assert_eq!((q.states, q.markets, q.commodities), (2, 3, 2));

        let empty = QualitySummary::from_batch(&Vec::new(), BTreeMap::new());
        assert_eq!(empty.first_date, None);
    }

    #[test]
    fn tally_counts_distinct_values_across_batches() {
        let mut tally = QualityTally::default();
        tally.extend(&[
            record(3, "Kerala", "Punalur", "Banana"),
            record(2, "Kerala", "Anchal", "Banana"),
        ]);
        tally.extend(&[
            record(1, "Kerala", "Punalur", "Tapioca"),
            record(2, "Goa", "Mapusa", "Banana"),
        ]);
        let q = tally.summary(BTreeMap::new());
        assert_eq!(q.first_date, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(q.last_date, NaiveDate::from_ymd_opt(2024, 6, 3));
        assert_eq!((q.states, q.markets, q.commodities), (2, 3, 2));
    }

    #[test]
    fn status_reflects_imperfections() {
        let clean = RunCounts {
            fetched: 5,
            accepted: 5,
            appended: 5,
            ..RunCounts::default()
        };
        assert_eq!(RunStatus::for_counts(&clean), RunStatus::Success);
        let collided = RunCounts {
            collisions: 1,
            ..clean
        };
        assert_eq!(RunStatus::for_counts(&collided), RunStatus::PartialSuccess);
        assert!(RunStatus::PartialSuccess.is_success());
        assert!(!RunStatus::Failed.is_success());
    }
}
