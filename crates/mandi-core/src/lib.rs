//! Core domain model for the mandi price archive.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, Days, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "mandi-core";

/// Column order of every persisted partition file.
pub const STORE_COLUMNS: [&str; 11] = [
    "State",
    "District",
    "Market",
    "Commodity",
    "Variety",
    "Grade",
    "Arrival_Date",
    "Min_Price",
    "Max_Price",
    "Modal_Price",
    "Commodity_Code",
];

/// India Standard Time, the calendar the upstream feed dates its rows in.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// Identity of one price quotation.
///
/// Field order is the archive's sort order: derived `Ord` compares arrival
/// date first, then commodity, then the remaining key fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub arrival_date: NaiveDate,
    pub commodity: String,
    pub state: String,
    pub district: String,
    pub market: String,
    pub variety: String,
    pub grade: Option<String>,
}

impl NaturalKey {
    pub fn partition_year(&self) -> i32 {
        self.arrival_date.year()
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} @ {}/{}/{} [{}|{}]",
            self.arrival_date,
            self.commodity,
            self.state,
            self.district,
            self.market,
            self.variety,
            self.grade.as_deref().unwrap_or("-")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    #[serde(with = "rust_decimal::serde::str")]
    pub min: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub max: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub modal: Decimal,
}

impl PriceQuote {
    /// `min <= modal <= max`, the ordering every stored row satisfies.
    pub fn is_ordered(&self) -> bool {
        self.min <= self.modal && self.modal <= self.max
    }

    pub fn is_non_negative(&self) -> bool {
        !self.min.is_sign_negative() && !self.max.is_sign_negative() && !self.modal.is_sign_negative()
    }
}

/// Canonical archived row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRecord {
    pub key: NaturalKey,
    pub prices: PriceQuote,
    pub commodity_code: Option<u32>,
}

impl PriceRecord {
    /// True when the non-key fields match; two records with equal keys and
    /// equal values are the same observation.
    pub fn same_values(&self, other: &PriceRecord) -> bool {
        self.prices == other.prices && self.commodity_code == other.commodity_code
    }

    pub fn arrival_date(&self) -> NaiveDate {
        self.key.arrival_date
    }

    pub fn partition_year(&self) -> i32 {
        self.key.partition_year()
    }
}

/// One upstream row before normalization. Field names are whatever the
/// source used; `origin` locates the row for audit output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub origin: String,
    pub fields: BTreeMap<String, String>,
}

impl RawRecord {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window start {start} is after end {end}")]
    Inverted { start: NaiveDate, end: NaiveDate },
}

/// Inclusive range of arrival dates requested from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, WindowError> {
        if start > end {
            return Err(WindowError::Inverted { start, end });
        }
        Ok(Self { start, end })
    }

    /// Window ending at `end` that reaches `days_back` days into the past.
    pub fn trailing(end: NaiveDate, days_back: u64) -> Self {
        let start = end.checked_sub_days(Days::new(days_back)).unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// Smallest window covering every date yielded, or `None` when empty.
    pub fn spanning(dates: impl IntoIterator<Item = NaiveDate>) -> Option<Self> {
        dates.into_iter().fold(None, |acc, date| match acc {
            None => Some(Self::single_day(date)),
            Some(w) => Some(Self {
                start: w.start.min(date),
                end: w.end.max(date),
            }),
        })
    }

    pub fn years(&self) -> impl Iterator<Item = i32> {
        self.start.year()..=self.end.year()
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Today's calendar date in India.
pub fn india_today() -> NaiveDate {
    match FixedOffset::east_opt(IST_OFFSET_SECS) {
        Some(ist) => Utc::now().with_timezone(&ist).date_naive(),
        None => Utc::now().date_naive(),
    }
}
