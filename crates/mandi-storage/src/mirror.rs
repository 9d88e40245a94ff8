//! Parquet mirror of a partition, for columnar consumers.
//!
//! The CSV partition stays canonical; the mirror is derived from the
//! already verified CSV and carries prices as `Float64`.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use chrono::NaiveDate;
use mandi_core::PriceRecord;
use parquet::arrow::ArrowWriter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

use crate::archive::MirrorEntry;
use crate::error::StoreError;
use crate::partition::PartitionReader;

const BATCH_ROWS: usize = 65_536;

fn mirror_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        ArrowField::new("State", DataType::Utf8, false),
        ArrowField::new("District", DataType::Utf8, false),
        ArrowField::new("Market", DataType::Utf8, false),
        ArrowField::new("Commodity", DataType::Utf8, false),
        ArrowField::new("Variety", DataType::Utf8, false),
        ArrowField::new("Grade", DataType::Utf8, true),
        ArrowField::new("Arrival_Date", DataType::Date32, false),
        ArrowField::new("Min_Price", DataType::Float64, false),
        ArrowField::new("Max_Price", DataType::Float64, false),
        ArrowField::new("Modal_Price", DataType::Float64, false),
        ArrowField::new("Commodity_Code", DataType::UInt32, true),
    ]))
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or(NaiveDate::MIN);
    i32::try_from((date - epoch).num_days()).unwrap_or(i32::MIN)
}

fn text_column(rows: &[PriceRecord], f: impl Fn(&PriceRecord) -> &str) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn price_column(rows: &[PriceRecord], f: impl Fn(&PriceRecord) -> Decimal) -> ArrayRef {
    Arc::new(Float64Array::from(
        rows.iter()
            .map(|r| f(r).to_f64().unwrap_or(f64::NAN))
            .collect::<Vec<_>>(),
    ))
}

fn build_batch(schema: &SchemaRef, rows: &[PriceRecord]) -> Result<RecordBatch, arrow_schema::ArrowError> {
    let columns: Vec<ArrayRef> = vec![
        text_column(rows, |r| r.key.state.as_str()),
        text_column(rows, |r| r.key.district.as_str()),
        text_column(rows, |r| r.key.market.as_str()),
        text_column(rows, |r| r.key.commodity.as_str()),
        text_column(rows, |r| r.key.variety.as_str()),
        Arc::new(StringArray::from(
            rows.iter().map(|r| r.key.grade.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(Date32Array::from(
            rows.iter()
                .map(|r| days_since_epoch(r.key.arrival_date))
                .collect::<Vec<_>>(),
        )),
        price_column(rows, |r| r.prices.min),
        price_column(rows, |r| r.prices.max),
        price_column(rows, |r| r.prices.modal),
        Arc::new(UInt32Array::from(
            rows.iter().map(|r| r.commodity_code).collect::<Vec<_>>(),
        )),
    ];
    RecordBatch::try_new(schema.clone(), columns)
}

/// Writes `dest` from the partition at `source` in fixed-size row batches.
pub fn write_parquet_mirror(source: &Path, dest: &Path) -> Result<MirrorEntry, StoreError> {
    let mirror_err = |reason: String| StoreError::Mirror {
        path: dest.display().to_string(),
        reason,
    };

    let schema = mirror_schema();
    let file = File::create(dest)
        .map_err(|e| StoreError::io(format!("creating {}", dest.display()), e))?;
    let mut writer = ArrowWriter::try_new(file, schema.clone(), None)
        .map_err(|e| mirror_err(format!("opening parquet writer: {e}")))?;

    let mut reader = PartitionReader::open(source)?;
    let mut chunk = Vec::with_capacity(BATCH_ROWS);
    loop {
        let next = reader.next_record()?;
        let done = next.is_none();
        if let Some(record) = next {
            chunk.push(record);
        }
        if chunk.len() >= BATCH_ROWS || (done && !chunk.is_empty()) {
            let batch = build_batch(&schema, &chunk)
                .map_err(|e| mirror_err(format!("building record batch: {e}")))?;
            writer
                .write(&batch)
                .map_err(|e| mirror_err(format!("writing record batch: {e}")))?;
            chunk.clear();
        }
        if done {
            break;
        }
    }
    writer
        .close()
        .map_err(|e| mirror_err(format!("closing parquet writer: {e}")))?;

    let (bytes, sha256) = digest_file(dest)?;
    Ok(MirrorEntry {
        file: dest.display().to_string(),
        bytes,
        sha256,
    })
}

fn digest_file(path: &Path) -> Result<(u64, String), StoreError> {
    let mut file =
        File::open(path).map_err(|e| StoreError::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| StoreError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}
