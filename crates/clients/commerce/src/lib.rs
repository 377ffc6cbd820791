//! Commerce GraphQL source client.
//!
//! Fetches orders through the shop's admin GraphQL endpoint, following
//! cursor pagination until exhaustion and surfacing the per-response cost
//! telemetry so the throttle controller can pace page fetches. Transient
//! failures (transport errors, 5xx) are retried a few times locally;
//! everything else maps to a typed error for the dispatcher.

use std::{
    collections::HashSet,
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

mod error;
pub mod throttle;

pub use self::{
    error::Error,
    throttle::{ThrottleStatus, delay_for},
};

/// Per-call timeout for the bulk-style orders query.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const ACCESS_TOKEN_HEADER: &str = "X-Commerce-Access-Token";
const PAGE_SIZE: u32 = 100;
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

const ORDERS_QUERY: &str = r#"
query Orders($query: String, $first: Int!, $after: String) {
  orders(first: $first, query: $query, sortKey: __SORT_KEY__, after: $after) {
    pageInfo {
      hasNextPage
      endCursor
    }
    edges {
      node {
        id
        name
        orderNumber
        createdAt
        updatedAt
        currencyCode
        totalPriceSet { shopMoney { amount } }
        currentTotalPriceSet { shopMoney { amount } }
        totalRefundedSet { shopMoney { amount } }
        displayFinancialStatus
        displayFulfillmentStatus
      }
    }
  }
}
"#;

/// Connection settings for one shop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Shop domain, or a full base URL (tests, proxies).
    pub shop: String,
    /// Offline access token from the integration secrets.
    pub access_token: String,
    /// Admin API version, e.g. `2025-01`.
    pub api_version: String,
    /// Optional IPv4 override for DNS environments without IPv6.
    pub ipv4_override: Option<Ipv4Addr>,
}

/// Which orders to fetch, and in which order the source should return them.
#[derive(Debug, Clone, Copy)]
pub enum OrderFilter {
    /// Orders created at or after the instant; sorted by creation time.
    /// Used by window-fill runs.
    CreatedAtMin(DateTime<Utc>),
    /// Orders updated at or after the instant; sorted by update time.
    /// Used by fresh runs.
    UpdatedAtMin(DateTime<Utc>),
}

impl OrderFilter {
    fn search_query(&self) -> String {
        match self {
            Self::CreatedAtMin(at) => {
                format!("created_at:>='{}'", at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
            Self::UpdatedAtMin(at) => {
                format!("updated_at:>='{}'", at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }

    fn sort_key(&self) -> &'static str {
        match self {
            Self::CreatedAtMin(_) => "CREATED_AT",
            Self::UpdatedAtMin(_) => "UPDATED_AT",
        }
    }
}

/// One order as the source returned it, lightly typed. The untouched node
/// payload rides along for the raw landing table.
#[derive(Debug, Clone)]
pub struct SourceOrder {
    pub id: String,
    pub name: Option<String>,
    pub order_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub currency: Option<String>,
    pub total: Option<Decimal>,
    pub current_total: Option<Decimal>,
    pub total_refunds: Option<Decimal>,
    pub financial_status: Option<String>,
    pub fulfillment_status: Option<String>,
    pub payload: serde_json::Value,
}

/// Result of a paginated orders fetch.
#[derive(Debug, Clone, Default)]
pub struct OrdersFetch {
    /// Orders in source order, de-duplicated by id within the fetch.
    pub orders: Vec<SourceOrder>,
    /// Pages requested, including retries that produced a response.
    pub api_calls: u32,
}

/// Commerce GraphQL client for one shop.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    access_token: String,
}

impl Client {
    /// Build a client for one shop.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let base = if config.shop.starts_with("http://") || config.shop.starts_with("https://") {
            config.shop.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", config.shop.trim_end_matches('/'))
        };

        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(ip) = config.ipv4_override {
            if let Some(host) = host_of(&base) {
                builder = builder.resolve(host, SocketAddr::from((ip, 443)));
            }
        }
        let http = builder.build().map_err(Error::Transport)?;

        Ok(Self {
            http,
            endpoint: format!("{base}/admin/api/{}/graphql.json", config.api_version),
            access_token: config.access_token,
        })
    }

    /// Fetch every order matching the filter, following pagination until the
    /// source reports no further page.
    ///
    /// Pages are de-duplicated by order id within the fetch (a row updated
    /// mid-pagination can slide between pages). A page that claims
    /// `hasNextPage` without an `endCursor` terminates the fetch with a
    /// warning rather than looping.
    pub async fn fetch_orders(&self, filter: &OrderFilter) -> Result<OrdersFetch, Error> {
        let mut fetch = OrdersFetch::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut after: Option<String> = None;

        loop {
            let page = self.fetch_page(filter, after.as_deref()).await?;
            fetch.api_calls += 1;

            for order in page.orders {
                if seen.insert(order.id.clone()) {
                    fetch.orders.push(order);
                }
            }

            if let Some(status) = &page.throttle {
                if let Some(delay) = throttle::delay_for(status) {
                    debug!(delay_ms = delay.as_millis() as u64, "throttling between order pages");
                    tokio::time::sleep(delay).await;
                }
            }

            if !page.has_next_page {
                break;
            }
            match page.end_cursor {
                Some(cursor) => after = Some(cursor),
                None => {
                    warn!("source reported another page without a cursor, stopping pagination");
                    break;
                }
            }
        }

        Ok(fetch)
    }

    async fn fetch_page(
        &self,
        filter: &OrderFilter,
        after: Option<&str>,
    ) -> Result<Page, Error> {
        let query = ORDERS_QUERY.replace("__SORT_KEY__", filter.sort_key());
        let body = json!({
            "query": query,
            "variables": {
                "query": filter.search_query(),
                "first": PAGE_SIZE,
                "after": after,
            },
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.post_page(&body).await {
                Ok(page) => return Ok(page),
                Err(err) if attempt < MAX_ATTEMPTS && is_locally_retryable(&err) => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                    warn!(
                        error = %err,
                        attempt,
                        "transient commerce API failure, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_page(&self, body: &serde_json::Value) -> Result<Page, Error> {
        let response = self
            .http
            .post(&self.endpoint)
            .header(ACCESS_TOKEN_HEADER, &self.access_token)
            .json(body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(body));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::RateLimited(body));
        }
        if status.is_server_error() {
            return Err(Error::Unavailable {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: serde_json::Value = response.json().await.map_err(Error::Transport)?;
        parse_page(&payload)
    }
}

/// Extract the host from a base URL for the resolver override.
fn host_of(base: &str) -> Option<&str> {
    let rest = base.strip_prefix("https://").or_else(|| base.strip_prefix("http://"))?;
    let host = rest.split(['/', ':']).next()?;
    (!host.is_empty()).then_some(host)
}

fn is_locally_retryable(err: &Error) -> bool {
    matches!(err, Error::Transport(_) | Error::Unavailable { .. })
}

struct Page {
    orders: Vec<SourceOrder>,
    has_next_page: bool,
    end_cursor: Option<String>,
    throttle: Option<ThrottleStatus>,
}

fn parse_page(payload: &serde_json::Value) -> Result<Page, Error> {
    let envelope: GraphQlEnvelope = serde_json::from_value(payload.clone())
        .map_err(|err| Error::schema(format!("malformed GraphQL envelope: {err}"), payload))?;

    if !envelope.errors.is_empty() {
        let throttled = envelope.errors.iter().any(|e| {
            e.extensions
                .get("code")
                .and_then(|c| c.as_str())
                .is_some_and(|c| c.eq_ignore_ascii_case("THROTTLED"))
        });
        let messages = envelope
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        if throttled {
            return Err(Error::RateLimited(messages));
        }
        return Err(Error::Api {
            status: 200,
            body: messages,
        });
    }

    let orders_dto = envelope
        .data
        .and_then(|d| d.orders)
        .ok_or_else(|| Error::schema("response carries no orders connection", payload))?;

    let mut orders = Vec::with_capacity(orders_dto.edges.len());
    for edge in orders_dto.edges {
        let node: OrderNodeDto = serde_json::from_value(edge.node.clone())
            .map_err(|err| Error::schema(format!("malformed order node: {err}"), &edge.node))?;
        orders.push(SourceOrder {
            id: node.id,
            name: node.name,
            order_number: node.order_number,
            created_at: node.created_at,
            updated_at: node.updated_at,
            currency: node.currency_code,
            total: amount(node.total_price_set),
            current_total: amount(node.current_total_price_set),
            total_refunds: amount(node.total_refunded_set),
            financial_status: node.display_financial_status,
            fulfillment_status: node.display_fulfillment_status,
            payload: edge.node,
        });
    }

    let throttle = envelope.extensions.and_then(|e| e.cost).and_then(|cost| {
        let throttle_status = cost.throttle_status?;
        Some(ThrottleStatus {
            currently_available: throttle_status.currently_available,
            maximum_available: throttle_status.maximum_available,
            restore_rate: throttle_status.restore_rate,
            requested_query_cost: cost.requested_query_cost?,
        })
    });

    Ok(Page {
        orders,
        has_next_page: orders_dto.page_info.has_next_page,
        end_cursor: orders_dto.page_info.end_cursor,
        throttle,
    })
}

fn amount(set: Option<MoneySetDto>) -> Option<Decimal> {
    set.and_then(|s| s.shop_money).and_then(|m| m.amount)
}

#[derive(Deserialize)]
struct GraphQlEnvelope {
    data: Option<DataDto>,
    #[serde(default)]
    errors: Vec<GraphQlErrorDto>,
    extensions: Option<ExtensionsDto>,
}

#[derive(Deserialize)]
struct GraphQlErrorDto {
    message: String,
    #[serde(default)]
    extensions: serde_json::Value,
}

#[derive(Deserialize)]
struct ExtensionsDto {
    cost: Option<CostDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CostDto {
    requested_query_cost: Option<f64>,
    throttle_status: Option<ThrottleStatusDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThrottleStatusDto {
    currently_available: f64,
    maximum_available: f64,
    restore_rate: f64,
}

#[derive(Deserialize)]
struct DataDto {
    orders: Option<OrdersDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrdersDto {
    page_info: PageInfoDto,
    #[serde(default)]
    edges: Vec<EdgeDto>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfoDto {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
struct EdgeDto {
    node: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderNodeDto {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    order_number: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    currency_code: Option<String>,
    #[serde(default)]
    total_price_set: Option<MoneySetDto>,
    #[serde(default)]
    current_total_price_set: Option<MoneySetDto>,
    #[serde(default)]
    total_refunded_set: Option<MoneySetDto>,
    #[serde(default)]
    display_financial_status: Option<String>,
    #[serde(default)]
    display_fulfillment_status: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoneySetDto {
    shop_money: Option<MoneyDto>,
}

#[derive(Deserialize)]
struct MoneyDto {
    amount: Option<Decimal>,
}
