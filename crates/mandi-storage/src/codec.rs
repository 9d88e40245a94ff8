//! Row encoding for partition files.

use std::str::FromStr;

use chrono::NaiveDate;
use csv::StringRecord;
use mandi_core::{NaturalKey, PriceQuote, PriceRecord, STORE_COLUMNS};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("expected {expected} fields, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("Arrival_Date {0:?} is not an ISO date")]
    Date(String),
    #[error("{column} {value:?} is not a decimal")]
    Price { column: &'static str, value: String },
    #[error("Commodity_Code {0:?} is not an unsigned integer")]
    Code(String),
}

pub fn header_matches(header: &StringRecord) -> bool {
    header.len() == STORE_COLUMNS.len()
        && header.iter().zip(STORE_COLUMNS).all(|(found, want)| found == want)
}

/// Canonical textual form of a price; `1200.0` and `1200` encode identically.
pub fn format_price(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn encode_record(record: &PriceRecord) -> [String; 11] {
    let key = &record.key;
    [
        key.state.clone(),
        key.district.clone(),
        key.market.clone(),
        key.commodity.clone(),
        key.variety.clone(),
        key.grade.clone().unwrap_or_default(),
        key.arrival_date.format("%Y-%m-%d").to_string(),
        format_price(record.prices.min),
        format_price(record.prices.max),
        format_price(record.prices.modal),
        record
            .commodity_code
            .map(|c| c.to_string())
            .unwrap_or_default(),
    ]
}

pub fn decode_record(row: &StringRecord) -> Result<PriceRecord, CodecError> {
    if row.len() != STORE_COLUMNS.len() {
        return Err(CodecError::FieldCount {
            expected: STORE_COLUMNS.len(),
            found: row.len(),
        });
    }
    let field = |i: usize| row.get(i).unwrap_or_default();

    let arrival_date = NaiveDate::parse_from_str(field(6), "%Y-%m-%d")
        .map_err(|_| CodecError::Date(field(6).to_string()))?;
    let grade = match field(5) {
        "" => None,
        g => Some(g.to_string()),
    };
    let commodity_code = match field(10) {
        "" => None,
        c => Some(c.parse::<u32>().map_err(|_| CodecError::Code(c.to_string()))?),
    };

    Ok(PriceRecord {
        key: NaturalKey {
            arrival_date,
            commodity: field(3).to_string(),
            state: field(0).to_string(),
            district: field(1).to_string(),
            market: field(2).to_string(),
            variety: field(4).to_string(),
            grade,
        },
        prices: PriceQuote {
            min: parse_price("Min_Price", field(7))?,
            max: parse_price("Max_Price", field(8))?,
            modal: parse_price("Modal_Price", field(9))?,
        },
        commodity_code,
    })
}

fn parse_price(column: &'static str, value: &str) -> Result<Decimal, CodecError> {
    Decimal::from_str(value).map_err(|_| CodecError::Price {
        column,
        value: value.to_string(),
    })
}
