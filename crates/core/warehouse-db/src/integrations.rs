//! Integration read model.
//!
//! Integrations connect a tenant account to one external source instance
//! (one shop, one ad account). They are created and rotated by the
//! onboarding/OAuth flows; the worker only ever reads them, except for
//! flipping `status` to `error` when a source rejects the credentials.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// The kind of external source an integration connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrationKind {
    Commerce,
    Ads,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commerce => "commerce",
            Self::Ads => "ads",
        }
    }
}

impl std::fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing an [`IntegrationKind`] from its TEXT representation.
#[derive(Debug, thiserror::Error)]
#[error("unknown integration kind: {0}")]
pub struct UnknownIntegrationKindError(String);

impl std::str::FromStr for IntegrationKind {
    type Err = UnknownIntegrationKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commerce" => Ok(Self::Commerce),
            "ads" => Ok(Self::Ads),
            other => Err(UnknownIntegrationKindError(other.to_string())),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for IntegrationKind {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for IntegrationKind {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        Ok(value.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for IntegrationKind {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Health of an integration.
///
/// Rows written by earlier deployments may carry `active` (a legacy spelling
/// of `connected`) or other values; those decode as [`IntegrationStatus::Other`]
/// and are treated as healthy only where the SQL says so explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrationStatus {
    Connected,
    Error,
    Disconnected,
    Other(String),
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for IntegrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntegrationStatus {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connected" => Self::Connected,
            "error" => Self::Error,
            "disconnected" => Self::Disconnected,
            other => Self::Other(other.to_string()),
        })
    }
}

impl sqlx::Type<sqlx::Postgres> for IntegrationStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("TEXT")
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for IntegrationStatus {
    fn decode(
        value: <sqlx::Postgres as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let value: &str = sqlx::Decode::<sqlx::Postgres>::decode(value)?;
        // FromStr::Err is Infallible, unwrap is safe.
        Ok(value.parse().unwrap())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for IntegrationStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <sqlx::Postgres as sqlx::Database>::ArgumentBuffer<'q>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        sqlx::Encode::<sqlx::Postgres>::encode_by_ref(&self.as_str(), buf)
    }
}

/// An integration row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Integration {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: IntegrationKind,
    pub status: IntegrationStatus,
    /// Reference to the external object: the shop domain for commerce, the
    /// ad-account id for ads.
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Get an integration by id.
pub async fn get_by_id<'c, E>(exe: E, id: Uuid) -> Result<Option<Integration>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, account_id, kind, status, external_ref, created_at, updated_at
        FROM integrations
        WHERE id = $1
    "#};
    sqlx::query_as(query).bind(id).fetch_optional(exe).await
}

/// List healthy integrations of a kind.
pub async fn list_active_by_kind<'c, E>(
    exe: E,
    kind: IntegrationKind,
) -> Result<Vec<Integration>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        SELECT id, account_id, kind, status, external_ref, created_at, updated_at
        FROM integrations
        WHERE kind = $1 AND status IN ('connected', 'active')
        ORDER BY created_at ASC
    "#};
    sqlx::query_as(query).bind(kind).fetch_all(exe).await
}

/// Flip an integration to `error`.
///
/// The only integration mutation the worker performs, reserved for fatal
/// auth failures.
pub async fn mark_error<'c, E>(exe: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let query = indoc::indoc! {r#"
        UPDATE integrations
        SET status = 'error', updated_at = (timezone('UTC', now()))
        WHERE id = $1
    "#};
    sqlx::query(query).bind(id).execute(exe).await?;
    Ok(())
}

/// Integration secrets, written by the OAuth flows, read-only here.
pub mod secrets {
    use uuid::Uuid;

    /// Key under which the commerce offline token is stored.
    pub const COMMERCE_OFFLINE_TOKEN: &str = "commerce_offline_token";
    /// Key under which the ads access token is stored.
    pub const ADS_ACCESS_TOKEN: &str = "ads_access_token";

    /// Fetch a secret value for an integration.
    pub async fn get<'c, E>(
        exe: E,
        integration_id: Uuid,
        key: &str,
    ) -> Result<Option<String>, sqlx::Error>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
    {
        let query = indoc::indoc! {r#"
            SELECT value
            FROM integration_secrets
            WHERE integration_id = $1 AND key = $2
        "#};
        sqlx::query_scalar(query)
            .bind(integration_id)
            .bind(key)
            .fetch_optional(exe)
            .await
    }
}
