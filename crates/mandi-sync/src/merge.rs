//! Reconciles an accepted batch against the archive.
//!
//! Lookups go through an [`ArchiveIndex`] covering only the dates the batch
//! touches. A key already stored with the same values is a duplicate; with
//! different values it is a collision and the stored row wins.

use std::collections::{BTreeMap, HashMap};

use mandi_core::{DateWindow, NaturalKey, PriceRecord};
use mandi_storage::{ArchiveStore, Manifest, StoreError};
use serde::Serialize;
use tracing::debug;

/// Stored records whose arrival date falls inside one window.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    window: Option<DateWindow>,
    records: HashMap<NaturalKey, PriceRecord>,
}

impl ArchiveIndex {
    /// Reads the partitions of the years `window` spans. Partitions are in
    /// date order, so each read stops at the first row past the window end.
    pub fn load(
        store: &ArchiveStore,
        manifest: &Manifest,
        window: DateWindow,
    ) -> Result<Self, StoreError> {
        let mut records = HashMap::new();
        let mut scanned = 0u64;
        for year in window.years() {
            let Some(entry) = manifest.partitions.get(&year) else {
                continue;
            };
            if entry.last_date.is_some_and(|d| d < window.start)
                || entry.first_date.is_some_and(|d| d > window.end)
            {
                continue;
            }
            let mut reader = store.open_partition(entry)?;
            while let Some(record) = reader.next_record()? {
                scanned += 1;
                let date = record.arrival_date();
                if date > window.end {
                    break;
                }
                if date >= window.start {
                    records.insert(record.key.clone(), record);
                }
            }
        }
        debug!(%window, scanned, indexed = records.len(), "archive index loaded");
        Ok(Self {
            window: Some(window),
            records,
        })
    }

    pub fn window(&self) -> Option<DateWindow> {
        self.window
    }

    pub fn get(&self, key: &NaturalKey) -> Option<&PriceRecord> {
        self.records.get(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionSource {
    /// The key is already in the archive.
    Archive,
    /// The key appeared earlier in the same batch.
    Batch,
}

/// An incoming record whose key is taken by a record with other values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision {
    pub key: NaturalKey,
    pub kept: PriceRecord,
    pub incoming: PriceRecord,
    pub against: CollisionSource,
}

/// A record that would give a commodity a second code, or a code a second
/// commodity name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CodeConflict {
    CodeReassigned {
        code: u32,
        known_commodity: String,
        record: PriceRecord,
    },
    CommodityRecoded {
        commodity: String,
        known_code: u32,
        record: PriceRecord,
    },
}

#[derive(Debug, Default)]
pub struct MergePlan {
    /// New records grouped by partition year, each group in archive order.
    pub additions: BTreeMap<i32, Vec<PriceRecord>>,
    pub duplicates: usize,
    pub collisions: Vec<Collision>,
    pub code_conflicts: Vec<CodeConflict>,
    /// Code map after the additions.
    pub commodity_codes: BTreeMap<u32, String>,
}

impl MergePlan {
    pub fn appended(&self) -> usize {
        self.additions.values().map(Vec::len).sum()
    }

    pub fn touched_years(&self) -> Vec<i32> {
        self.additions.keys().copied().collect()
    }
}

/// Commodity <-> code map, checked in both directions.
struct CodeBook {
    by_code: BTreeMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl CodeBook {
    fn new(codes: &BTreeMap<u32, String>) -> Self {
        Self {
            by_code: codes.clone(),
            by_name: codes.iter().map(|(code, name)| (name.clone(), *code)).collect(),
        }
    }

    fn check(&self, record: &PriceRecord) -> Result<(), CodeConflict> {
        let Some(code) = record.commodity_code else {
            return Ok(());
        };
        let commodity = &record.key.commodity;
        if let Some(known) = self.by_code.get(&code) {
            if known != commodity {
                return Err(CodeConflict::CodeReassigned {
                    code,
                    known_commodity: known.clone(),
                    record: record.clone(),
                });
            }
        }
        if let Some(known) = self.by_name.get(commodity) {
            if *known != code {
                return Err(CodeConflict::CommodityRecoded {
                    commodity: commodity.clone(),
                    known_code: *known,
                    record: record.clone(),
                });
            }
        }
        Ok(())
    }

    fn learn(&mut self, record: &PriceRecord) {
        if let Some(code) = record.commodity_code {
            self.by_code.insert(code, record.key.commodity.clone());
            self.by_name.insert(record.key.commodity.clone(), code);
        }
    }
}

/// Sorts `accepted` into additions, duplicates, collisions and code
/// conflicts. `index` must cover every arrival date in the batch.
pub fn plan_merge(
    index: &ArchiveIndex,
    codes: &BTreeMap<u32, String>,
    accepted: impl IntoIterator<Item = PriceRecord>,
) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut book = CodeBook::new(codes);
    let mut pending: HashMap<NaturalKey, PriceRecord> = HashMap::new();

    for record in accepted {
        let existing = index
            .get(&record.key)
            .map(|stored| (stored, CollisionSource::Archive))
            .or_else(|| pending.get(&record.key).map(|p| (p, CollisionSource::Batch)));

        if let Some((kept, against)) = existing {
            if kept.same_values(&record) {
                plan.duplicates += 1;
            } else {
                plan.collisions.push(Collision {
                    key: record.key.clone(),
                    kept: kept.clone(),
                    incoming: record,
                    against,
                });
            }
            continue;
        }

        if let Err(conflict) = book.check(&record) {
            plan.code_conflicts.push(conflict);
            continue;
        }
        book.learn(&record);
        pending.insert(record.key.clone(), record);
    }

    for (_, record) in pending {
        plan.additions
            .entry(record.partition_year())
            .or_default()
            .push(record);
    }
    for rows in plan.additions.values_mut() {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
    }
    plan.commodity_codes = book.by_code;
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use mandi_core::PriceQuote;
    use rust_decimal::Decimal;

    fn record(day: u32, market: &str, modal: i64, code: Option<u32>) -> PriceRecord {
        PriceRecord {
            key: NaturalKey {
                arrival_date: NaiveDate::from_ymd_opt(2024, 6, day).unwrap(),
                commodity: "Onion".into(),
                state: "Karnataka".into(),
                district: "Kolar".into(),
                market: market.into(),
                variety: "Local".into(),
                grade: None,
            },
            prices: PriceQuote {
                min: Decimal::new(modal - 200, 0),
                max: Decimal::new(modal + 200, 0),
                modal: Decimal::new(modal, 0),
            },
            commodity_code: code,
        }
    }

    fn index_of(records: Vec<PriceRecord>) -> ArchiveIndex {
        ArchiveIndex {
            window: None,
            records: records.into_iter().map(|r| (r.key.clone(), r)).collect(),
        }
    }

    #[test]
    fn new_duplicate_and_collision_are_separated() {
        let index = index_of(vec![record(1, "Kolar", 2000, None), record(1, "Mulbagal", 2100, None)]);
        let plan = plan_merge(
            &index,
            &BTreeMap::new(),
            vec![
                record(1, "Kolar", 2000, None),
                record(1, "Mulbagal", 2500, None),
                record(2, "Kolar", 2050, None),
            ],
        );
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.collisions.len(), 1);
        assert_eq!(plan.collisions[0].against, CollisionSource::Archive);
        assert_eq!(plan.collisions[0].kept.prices.modal, Decimal::new(2100, 0));
        assert_eq!(plan.appended(), 1);
        assert_eq!(plan.touched_years(), vec![2024]);
    }

    #[test]
    fn repeats_inside_a_batch() {
        let plan = plan_merge(
            &ArchiveIndex::default(),
            &BTreeMap::new(),
            vec![
                record(3, "Kolar", 2000, None),
                record(3, "Kolar", 2000, None),
                record(3, "Kolar", 2400, None),
            ],
        );
        assert_eq!(plan.appended(), 1);
        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.collisions.len(), 1);
        assert_eq!(plan.collisions[0].against, CollisionSource::Batch);
        assert_eq!(plan.additions[&2024][0].prices.modal, Decimal::new(2000, 0));
    }

    #[test]
    fn additions_come_out_sorted() {
        let plan = plan_merge(
            &ArchiveIndex::default(),
            &BTreeMap::new(),
            vec![
                record(5, "Kolar", 2000, None),
                record(4, "Mulbagal", 2000, None),
                record(4, "Kolar", 2000, None),
            ],
        );
        let markets: Vec<_> = plan.additions[&2024]
            .iter()
            .map(|r| (r.key.arrival_date.format("%d").to_string(), r.key.market.clone()))
            .collect();
        assert_eq!(
            markets,
            vec![
                ("04".to_string(), "Kolar".to_string()),
                ("04".to_string(), "Mulbagal".to_string()),
                ("05".to_string(), "Kolar".to_string()),
            ]
        );
    }

    #[test]
    fn code_map_is_enforced_both_ways() {
        let known = BTreeMap::from([(23, "Onion".to_string()), (24, "Potato".to_string())]);
        let mut potato_as_23 = record(2, "Kolar", 900, Some(23));
        potato_as_23.key.commodity = "Potato".into();

        let plan = plan_merge(
            &ArchiveIndex::default(),
            &known,
            vec![
                record(1, "Kolar", 2000, Some(23)),
                record(1, "Mulbagal", 2000, Some(99)),
                potato_as_23,
                record(2, "Kolar", 2000, None),
            ],
        );
        assert_eq!(plan.appended(), 2);
        assert_eq!(plan.code_conflicts.len(), 2);
        assert!(matches!(
            plan.code_conflicts[0],
            CodeConflict::CommodityRecoded { known_code: 23, .. }
        ));
        assert!(matches!(
            plan.code_conflicts[1],
            CodeConflict::CodeReassigned { code: 23, .. }
        ));
        assert_eq!(plan.commodity_codes, known);
    }

    #[test]
    fn first_sighting_of_a_code_is_learned() {
        let plan = plan_merge(
            &ArchiveIndex::default(),
            &BTreeMap::new(),
            vec![record(1, "Kolar", 2000, Some(23)), record(1, "Mulbagal", 2000, Some(24))],
        );
        assert_eq!(plan.appended(), 1);
        assert_eq!(plan.code_conflicts.len(), 1);
        assert_eq!(plan.commodity_codes.get(&23).map(String::as_str), Some("Onion"));
    }
}
