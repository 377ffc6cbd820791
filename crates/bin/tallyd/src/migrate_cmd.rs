//! The `migrate` subcommand: apply warehouse migrations and exit.
//!
//! In production the schema owner runs migrations out of band; this exists
//! for development and test environments.

use tally_config::Config;
use warehouse_db::WarehouseDb;

use crate::Error;

pub async fn run(config: Config) -> Result<(), Error> {
    let db = WarehouseDb::connect_with_retry(&config.database_url, config.db_pool_size)
        .await
        .map_err(Error::Db)?;
    db.run_migrations().await.map_err(Error::Migrate)?;
    tracing::info!("warehouse migrations applied");
    Ok(())
}
