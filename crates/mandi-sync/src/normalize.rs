//! Raw upstream rows to canonical [`PriceRecord`]s.
//!
//! Every rule rejects rather than repairs: a row with inverted prices is
//! reported, never reordered or clamped.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDate;
use mandi_core::{NaturalKey, PriceQuote, PriceRecord, RawRecord};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

const DATE_FORMATS: [&str; 3] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d"];

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    #[error("missing required field {field}")]
    MissingField { field: &'static str },
    #[error("unparseable arrival date {value:?}")]
    BadDate { value: String },
    #[error("arrival date {date} is in the future")]
    FutureDate { date: NaiveDate },
    #[error("{field} {value:?} is not a decimal number")]
    BadPrice { field: &'static str, value: String },
    #[error("{field} {value} is negative")]
    NegativePrice { field: &'static str, value: String },
    #[error("prices violate min <= modal <= max (min {min}, modal {modal}, max {max})")]
    PriceOrder {
        min: String,
        modal: String,
        max: String,
    },
    #[error("all prices are zero")]
    ZeroPrices,
    #[error("commodity code {value:?} is not a non-negative integer")]
    BadCommodityCode { value: String },
}

impl RejectReason {
    /// Stable label for aggregate counts.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::MissingField { .. } => "missing_field",
            RejectReason::BadDate { .. } => "bad_date",
            RejectReason::FutureDate { .. } => "future_date",
            RejectReason::BadPrice { .. } => "bad_price",
            RejectReason::NegativePrice { .. } => "negative_price",
            RejectReason::PriceOrder { .. } => "price_order",
            RejectReason::ZeroPrices => "zero_prices",
            RejectReason::BadCommodityCode { .. } => "bad_commodity_code",
        }
    }
}

/// A rejected row and where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub origin: String,
    pub reason: RejectReason,
}

/// Lowercases, decodes the `_x0020_` space escape and drops everything but
/// letters and digits, so `Min_x0020_Price`, `min_price` and `Min Price`
/// all map to `minprice`.
pub fn canonical_field_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .replace("_x0020_", "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Trims, collapses whitespace runs and separates a parenthesis from the
/// word before it: `"Bhindi(Ladies  Finger) "` becomes `"Bhindi (Ladies Finger)"`.
pub fn clean_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for word in value.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }

    let mut spaced = String::with_capacity(out.len() + 4);
    let mut previous: Option<char> = None;
    for c in out.chars() {
        if c == '(' && previous.is_some_and(char::is_alphanumeric) {
            spaced.push(' ');
        }
        spaced.push(c);
        previous = Some(c);
    }
    spaced
}

pub fn parse_arrival_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

fn parse_price(field: &'static str, value: &str) -> Result<Decimal, RejectReason> {
    let price = Decimal::from_str(value.trim()).map_err(|_| RejectReason::BadPrice {
        field,
        value: value.to_string(),
    })?;
    if price.is_sign_negative() && !price.is_zero() {
        return Err(RejectReason::NegativePrice {
            field,
            value: value.to_string(),
        });
    }
    Ok(price.abs().normalize())
}

/// Codes arrive as integers or, from spreadsheet exports, as `78.0`.
fn parse_code(value: &str) -> Result<u32, RejectReason> {
    let bad = || RejectReason::BadCommodityCode {
        value: value.to_string(),
    };
    let value = value.trim();
    if let Ok(code) = value.parse::<u32>() {
        return Ok(code);
    }
    let decimal = Decimal::from_str(value).map_err(|_| bad())?;
    if !decimal.fract().is_zero() {
        return Err(bad());
    }
    decimal.to_u32().ok_or_else(bad)
}

/// Field values of one raw row, keyed by canonical name, cleaned, with
/// blank values dropped.
struct Fields(BTreeMap<String, String>);

impl Fields {
    fn of(raw: &RawRecord) -> Self {
        Self(
            raw.fields
                .iter()
                .map(|(name, value)| (canonical_field_name(name), clean_text(value)))
                .filter(|(_, value)| !value.is_empty())
                .collect(),
        )
    }

    fn optional(&self, canonical: &str) -> Option<&str> {
        self.0.get(canonical).map(String::as_str)
    }

    fn required(&self, canonical: &str, field: &'static str) -> Result<&str, RejectReason> {
        self.optional(canonical)
            .ok_or(RejectReason::MissingField { field })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    today: NaiveDate,
}

impl Normalizer {
    /// `today` bounds arrival dates; later dates are rejected as future.
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<PriceRecord, RejectReason> {
        let fields = Fields::of(raw);

        let state = fields.required("state", "State")?;
        let district = fields.required("district", "District")?;
        let market = fields.required("market", "Market")?;
        let commodity = fields.required("commodity", "Commodity")?;
        let date_text = fields.required("arrivaldate", "Arrival_Date")?;
        let min_text = fields.required("minprice", "Min_Price")?;
        let max_text = fields.required("maxprice", "Max_Price")?;
        let modal_text = fields.required("modalprice", "Modal_Price")?;

        let arrival_date = parse_arrival_date(date_text).ok_or_else(|| RejectReason::BadDate {
            value: date_text.to_string(),
        })?;
        if arrival_date > self.today {
            return Err(RejectReason::FutureDate { date: arrival_date });
        }

        let prices = PriceQuote {
            min: parse_price("Min_Price", min_text)?,
            max: parse_price("Max_Price", max_text)?,
            modal: parse_price("Modal_Price", modal_text)?,
        };
        if prices.min.is_zero() && prices.max.is_zero() && prices.modal.is_zero() {
            return Err(RejectReason::ZeroPrices);
        }
        if !prices.is_ordered() {
            return Err(RejectReason::PriceOrder {
                min: prices.min.to_string(),
                modal: prices.modal.to_string(),
                max: prices.max.to_string(),
            });
        }

        let commodity_code = fields.optional("commoditycode").map(parse_code).transpose()?;

        Ok(PriceRecord {
            key: NaturalKey {
                arrival_date,
                commodity: commodity.to_string(),
                state: state.to_string(),
                district: district.to_string(),
                market: market.to_string(),
                variety: fields.optional("variety").unwrap_or_default().to_string(),
                grade: fields.optional("grade").map(str::to_string),
            },
            prices,
            commodity_code,
        })
    }

    /// Lazily normalizes `raws`; each item is an accepted record or the
    /// rejection that replaced it.
    pub fn normalize_all<'a, I>(
        &'a self,
        raws: I,
    ) -> impl Iterator<Item = Result<PriceRecord, Rejection>> + 'a
    where
        I: IntoIterator<Item = &'a RawRecord>,
        I::IntoIter: 'a,
    {
        raws.into_iter().map(move |raw| {
            self.normalize(raw).map_err(|reason| Rejection {
                origin: raw.origin.clone(),
                reason,
            })
        })
    }
}
