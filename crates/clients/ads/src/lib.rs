//! Ads insights source client.
//!
//! Fetches ad-level insights one day at a time, follows `paging.next` until
//! the page set is exhausted, and sums the per-ad rows into one daily
//! aggregate. 429 and 5xx responses are retried with bounded exponential
//! backoff; a `Retry-After` header, when present, overrides the computed
//! delay.

use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

pub mod backoff;
mod error;

pub use self::error::Error;

/// Per-call timeout for insights requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default ads API base. Deployments point this at their provider's graph
/// endpoint via `ADS_API_BASE_URL`.
pub const DEFAULT_BASE_URL: &str = "https://graph.ads-platform.com/v19.0";

const INSIGHT_FIELDS: &str =
    "ad_id,ad_name,spend,impressions,clicks,purchases,purchase_value,account_currency";
const PAGE_LIMIT: &str = "500";

/// Connection settings for one ad account.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API base URL, e.g. [`DEFAULT_BASE_URL`].
    pub base_url: String,
    /// Ad account id, with or without the `act_` prefix.
    pub ad_account: String,
    /// Access token from the integration secrets.
    pub access_token: String,
}

/// One ad's insight row as the source returned it, kept for the raw landing
/// table.
#[derive(Debug, Clone)]
pub struct AdRow {
    pub ad_id: String,
    pub payload: serde_json::Value,
}

/// Ad-level insights for one day, summed across ads.
#[derive(Debug, Clone)]
pub struct DailyInsights {
    pub date: NaiveDate,
    pub spend: Decimal,
    pub impressions: i64,
    pub clicks: i64,
    pub purchases: i64,
    pub purchase_value: Decimal,
    /// Account currency as reported on the first row, if any.
    pub currency: Option<String>,
    pub ads: Vec<AdRow>,
    /// Requests that produced a response, retries included.
    pub api_calls: u32,
    /// Retries spent across the day's requests.
    pub retries: u32,
}

impl DailyInsights {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            spend: Decimal::ZERO,
            impressions: 0,
            clicks: 0,
            purchases: 0,
            purchase_value: Decimal::ZERO,
            currency: None,
            ads: Vec::new(),
            api_calls: 0,
            retries: 0,
        }
    }
}

/// Ads insights client for one ad account.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    ad_account: String,
    access_token: String,
}

impl Client {
    /// Build a client for one ad account.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(Error::Transport)?;
        let ad_account = config
            .ad_account
            .strip_prefix("act_")
            .unwrap_or(&config.ad_account)
            .to_string();
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ad_account,
            access_token: config.access_token,
        })
    }

    /// Fetch ad-level insights for a single day and sum them.
    ///
    /// The request pins `time_range` to `[date, date]`, `level=ad`, and
    /// restricts to ads whose effective status is ACTIVE or PAUSED.
    pub async fn fetch_daily_insights(&self, date: NaiveDate) -> Result<DailyInsights, Error> {
        let url = format!("{}/act_{}/insights", self.base_url, self.ad_account);
        let time_range = json!({ "since": date, "until": date }).to_string();
        let filtering = json!([{
            "field": "ad.effective_status",
            "operator": "IN",
            "value": ["ACTIVE", "PAUSED"],
        }])
        .to_string();
        let params: Vec<(&str, &str)> = vec![
            ("level", "ad"),
            ("fields", INSIGHT_FIELDS),
            ("time_range", &time_range),
            ("filtering", &filtering),
            ("limit", PAGE_LIMIT),
        ];

        let mut insights = DailyInsights::empty(date);
        let mut next: Option<String> = None;

        loop {
            let (payload, retries) = match &next {
                None => self.get_with_backoff(&url, Some(&params)).await?,
                Some(next_url) => self.get_with_backoff(next_url, None).await?,
            };
            insights.api_calls += 1 + retries;
            insights.retries += retries;

            let page: PageDto = serde_json::from_value(payload.clone())
                .map_err(|err| Error::schema(format!("malformed insights page: {err}"), &payload))?;

            for row_value in page.data {
                let row: InsightRowDto = serde_json::from_value(row_value.clone()).map_err(
                    |err| Error::schema(format!("malformed insight row: {err}"), &row_value),
                )?;
                insights.spend += row.spend.unwrap_or_default();
                insights.impressions += row.impressions.unwrap_or_default();
                insights.clicks += row.clicks.unwrap_or_default();
                insights.purchases += row.purchases.unwrap_or_default();
                insights.purchase_value += row.purchase_value.unwrap_or_default();
                if insights.currency.is_none() {
                    insights.currency = row.account_currency;
                }
                insights.ads.push(AdRow {
                    ad_id: row.ad_id,
                    payload: row_value,
                });
            }

            next = page.paging.and_then(|p| p.next);
            if next.is_none() {
                break;
            }
        }

        Ok(insights)
    }

    /// GET a URL, retrying 429/5xx/transport failures up to
    /// [`backoff::MAX_ATTEMPTS`] times. Returns the JSON payload and how
    /// many retries were spent.
    async fn get_with_backoff(
        &self,
        url: &str,
        query: Option<&[(&str, &str)]>,
    ) -> Result<(serde_json::Value, u32), Error> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let mut request = self.http.get(url).bearer_auth(&self.access_token);
            if let Some(query) = query {
                request = request.query(query);
            }

            let failure = match request.send().await {
                Err(err) => RetryableFailure::Transport(err),
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        let body = response.text().await.unwrap_or_default();
                        return Err(Error::Auth(body));
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        RetryableFailure::RateLimited {
                            retry_after: retry_after(&response),
                        }
                    } else if status.is_server_error() {
                        RetryableFailure::Unavailable(status.as_u16())
                    } else if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(Error::Api {
                            status: status.as_u16(),
                            body,
                        });
                    } else {
                        let payload = response.json().await.map_err(Error::Transport)?;
                        return Ok((payload, attempt - 1));
                    }
                }
            };

            if attempt >= backoff::MAX_ATTEMPTS {
                return Err(failure.into_error(attempt));
            }
            let delay = match &failure {
                RetryableFailure::RateLimited {
                    retry_after: Some(after),
                } => *after,
                _ => backoff::delay(attempt),
            };
            warn!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient ads API failure ({failure}), backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

enum RetryableFailure {
    Transport(reqwest::Error),
    RateLimited { retry_after: Option<Duration> },
    Unavailable(u16),
}

impl RetryableFailure {
    fn into_error(self, attempts: u32) -> Error {
        match self {
            Self::Transport(err) => Error::Transport(err),
            Self::RateLimited { .. } => Error::RateLimited { attempts },
            Self::Unavailable(status) => Error::Unavailable { status },
        }
    }
}

impl std::fmt::Display for RetryableFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::RateLimited { .. } => f.write_str("HTTP 429"),
            Self::Unavailable(status) => write!(f, "HTTP {status}"),
        }
    }
}

#[derive(Deserialize)]
struct PageDto {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    paging: Option<PagingDto>,
}

#[derive(Deserialize)]
struct PagingDto {
    next: Option<String>,
}

#[derive(Deserialize)]
struct InsightRowDto {
    ad_id: String,
    #[serde(default)]
    spend: Option<Decimal>,
    #[serde(default, deserialize_with = "lenient_i64")]
    impressions: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    clicks: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    purchases: Option<i64>,
    #[serde(default)]
    purchase_value: Option<Decimal>,
    #[serde(default)]
    account_currency: Option<String>,
}

/// The source serialises counters as strings; accept both spellings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(value)) => Ok(Some(value)),
        Some(Raw::Str(value)) => value
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid integer: {value:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ad_account_prefix_is_normalised() {
        let with_prefix = Client::new(ClientConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            ad_account: "act_42".to_string(),
            access_token: "t".to_string(),
        })
        .expect("client build failed");
        let without_prefix = Client::new(ClientConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            ad_account: "42".to_string(),
            access_token: "t".to_string(),
        })
        .expect("client build failed");

        assert_eq!(with_prefix.ad_account, "42");
        assert_eq!(without_prefix.ad_account, "42");
    }

    #[test]
    fn lenient_counters_accept_strings_and_numbers() {
        let row: InsightRowDto = serde_json::from_value(serde_json::json!({
            "ad_id": "ad_1",
            "spend": "10.50",
            "impressions": "1200",
            "clicks": 34,
            "purchases": "2",
        }))
        .expect("row should parse");

        assert_eq!(row.spend, Some("10.50".parse().unwrap()));
        assert_eq!(row.impressions, Some(1200));
        assert_eq!(row.clicks, Some(34));
        assert_eq!(row.purchases, Some(2));
        assert_eq!(row.purchase_value, None);
    }
}
