//! Account read model. Accounts are created by onboarding; the worker only
//! reads the currency to fall back on when a source payload omits its own.

use uuid::Uuid;

/// Get an account's currency code.
pub async fn get_currency<'c, E>(exe: E, id: Uuid) -> Result<Option<String>, sqlx::Error>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar("SELECT currency FROM accounts WHERE id = $1")
        .bind(id)
        .fetch_optional(exe)
        .await
}
