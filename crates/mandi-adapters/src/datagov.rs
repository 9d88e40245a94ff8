//! data.gov.in "Variety-wise Daily Market Prices" resource.

use async_trait::async_trait;
use mandi_core::{DateWindow, RawRecord};
use mandi_storage::{redact_url, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, info_span, Instrument};

use crate::{Snapshot, SourceError, UpstreamSource};

pub const DEFAULT_API_URL: &str =
    "https://api.data.gov.in/resource/35985678-0d79-46b4-9ed6-6f13308a1d24";

const SOURCE_ID: &str = "data-gov-in";

#[derive(Debug, Clone)]
pub struct DataGovConfig {
    pub api_url: Url,
    pub api_key: String,
    pub page_size: usize,
    pub max_pages: usize,
}

/// Records of one response page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopePage {
    pub records: Vec<RawRecord>,
    pub total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    total: Option<JsonValue>,
    #[serde(default)]
    records: Option<Vec<Map<String, JsonValue>>>,
}

/// The API serializes counts as numbers or numeric strings depending on
/// the resource.
fn json_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Parses one response body. `origin` prefixes the audit location of each
/// row (`{origin}#{index}`).
pub fn parse_envelope(body: &[u8], origin: &str) -> Result<EnvelopePage, SourceError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|e| SourceError::Envelope {
        url: origin.to_string(),
        reason: e.to_string(),
    })?;

    if envelope
        .status
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("error"))
    {
        return Err(SourceError::Upstream {
            message: envelope
                .message
                .unwrap_or_else(|| "no message".to_string()),
        });
    }

    let rows = envelope.records.ok_or_else(|| SourceError::Envelope {
        url: origin.to_string(),
        reason: "response has no `records` array".to_string(),
    })?;

    let records = rows
        .into_iter()
        .enumerate()
        .map(|(index, row)| RawRecord {
            origin: format!("{origin}#{index}"),
            fields: row
                .iter()
                .filter_map(|(name, value)| json_text(value).map(|v| (name.clone(), v)))
                .collect(),
        })
        .collect();

    Ok(EnvelopePage {
        records,
        total: envelope.total.as_ref().and_then(json_u64),
    })
}

#[derive(Debug, Clone)]
pub struct DataGovSource {
    http: HttpFetcher,
    config: DataGovConfig,
}

impl DataGovSource {
    pub fn new(http: HttpFetcher, config: DataGovConfig) -> Self {
        Self { http, config }
    }

    pub fn page_url(&self, window: Option<&DateWindow>, offset: usize) -> Url {
        let mut url = self.config.api_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("api-key", &self.config.api_key)
                .append_pair("format", "json")
                .append_pair("offset", &offset.to_string())
                .append_pair("limit", &self.config.page_size.to_string());
            if let Some(window) = window {
                query
                    .append_pair(
                        "range[Arrival_Date][gte]",
                        &window.start.format("%Y-%m-%d").to_string(),
                    )
                    .append_pair(
                        "range[Arrival_Date][lte]",
                        &window.end.format("%Y-%m-%d").to_string(),
                    );
            }
        }
        url
    }

    async fn fetch_pages(&self, window: Option<DateWindow>) -> Result<Snapshot, SourceError> {
        let mut snapshot = Snapshot::new(SOURCE_ID, window);
        let mut offset = 0usize;

        loop {
            // Past the page budget only an empty page, confirming the end of
            // a listing with no reported total, is accepted.
            let over_budget = snapshot.pages >= self.config.max_pages;

            let url = self.page_url(window.as_ref(), offset);
            let response = self.http.fetch_bytes(&url).await?;
            let origin = format!("{SOURCE_ID}?offset={offset}");
            let page = parse_envelope(&response.body, &origin).map_err(|err| match err {
                SourceError::Envelope { reason, .. } => SourceError::Envelope {
                    url: redact_url(&url),
                    reason,
                },
                other => other,
            })?;

            let rows = page.records.len();
            if over_budget {
                if rows == 0 {
                    debug!(pages = snapshot.pages, "end of listing confirmed past the page budget");
                    break;
                }
                return Err(SourceError::TooManyPages {
                    max_pages: self.config.max_pages,
                    fetched_rows: snapshot.records.len(),
                });
            }
            snapshot.pages += 1;
            snapshot.upstream_total = page.total.or(snapshot.upstream_total);
            snapshot.records.extend(page.records);
            offset += rows;
            debug!(page = snapshot.pages, rows, offset, attempts = response.attempts, "fetched page");

            let short_page = rows < self.config.page_size;
            let reached_total = snapshot
                .upstream_total
                .is_some_and(|total| offset as u64 >= total);
            if rows == 0 || short_page || reached_total {
                break;
            }
        }

        info!(
            pages = snapshot.pages,
            rows = snapshot.records.len(),
            upstream_total = ?snapshot.upstream_total,
            "upstream snapshot fetched"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl UpstreamSource for DataGovSource {
    fn source_id(&self) -> &str {
        SOURCE_ID
    }

    async fn fetch(&self, window: Option<DateWindow>) -> Result<Snapshot, SourceError> {
        let span = match &window {
            Some(w) => info_span!("upstream_fetch", source = SOURCE_ID, window = %w),
            None => info_span!("upstream_fetch", source = SOURCE_ID, window = "all"),
        };
        self.fetch_pages(window).instrument(span).await
    }
}
