//! Shared storage-backend wiring used by every binary in `src/bin/`
//! (spec §9 Design Note: "storage backend chosen at startup"), so the
//! memory-vs-Postgres decision lives in one place instead of five.

use std::sync::Arc;

use anyhow::Context;

use crate::config::StorageConfig;
use crate::rate_limit::memory::InMemoryRateLimiter;
use crate::rate_limit::RateLimiter;
use crate::store::memory::InMemoryStore;
use crate::store::{MessageStore, PoolStore, WorkspaceStore};

/// The three store traits, all backed by whichever concrete type
/// [`connect`] picked. Bundled together since every backend implements
/// all three on the same underlying handle (a `PgPool` or an
/// `InMemoryStore`).
#[derive(Clone)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub pools: Arc<dyn PoolStore>,
    pub workspaces: Arc<dyn WorkspaceStore>,
}

pub async fn connect(storage: &StorageConfig) -> anyhow::Result<(Stores, Arc<dyn RateLimiter>)> {
    match storage {
        StorageConfig::Memory => {
            let store = Arc::new(InMemoryStore::new());
            let stores = Stores { messages: store.clone(), pools: store.clone(), workspaces: store };
            Ok((stores, Arc::new(InMemoryRateLimiter::new())))
        }
        #[cfg(feature = "postgres-store")]
        StorageConfig::Postgres { database_url, max_connections } => {
            use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
            use sqlx::ConnectOptions;

            use crate::rate_limit::postgres::PostgresRateLimiter;
            use crate::store::postgres::PostgresStore;

            let options: PgConnectOptions = database_url.parse().context("DATABASE_URL must be a valid URL")?;
            let options = options.application_name("relay-gateway");

            let pool = PgPoolOptions::new()
                .max_connections(*max_connections)
                .connect_with(options)
                .await
                .context("failed to connect to Postgres")?;

            #[cfg(feature = "apply-db-migrations")]
            sqlx::migrate!("./migrations").run(&pool).await.context("failed to run migrations")?;

            let store = Arc::new(PostgresStore::new(pool.clone()));
            let stores = Stores { messages: store.clone(), pools: store.clone(), workspaces: store };
            Ok((stores, Arc::new(PostgresRateLimiter::new(pool))))
        }
        #[cfg(not(feature = "postgres-store"))]
        StorageConfig::Postgres { .. } => {
            anyhow::bail!("configured storage backend is postgres, but this build has the postgres-store feature disabled")
        }
    }
}
