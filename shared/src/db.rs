use anyhow::Result;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::info;

use crate::config::DatabaseArgs;
use crate::store::DbPool;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Applies pending migrations over a blocking connection before the pool opens.
pub fn run_migrations(database_url: &str) -> Result<()> {
    info!("running database migrations");
    let mut conn = PgConnection::establish(database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration error: {}", e))?;
    info!("migrations completed");
    Ok(())
}

pub async fn build_pool(args: &DatabaseArgs) -> Result<DbPool> {
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
    let pool = Pool::builder().max_size(args.pool_size).build(config).await?;
    Ok(pool)
}
