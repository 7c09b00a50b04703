use crate::config::AppConfig;
use crate::errors::ServiceError;
use metrics::{counter, gauge, histogram};
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbBackend,
    DbErr, TransactionTrait,
};
use sea_orm_migration::MigratorTrait;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

pub type DbPool = DatabaseConnection;

/// Pool sizing and timeouts taken from [`AppConfig`].
#[derive(Debug, Clone)]
struct PoolSettings {
    max_connections: u32,
    min_connections: u32,
    connect_timeout: Duration,
    idle_timeout: Duration,
    acquire_timeout: Duration,
}

impl PoolSettings {
    fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_connections: cfg.db_max_connections,
            min_connections: cfg.db_min_connections,
            connect_timeout: Duration::from_secs(cfg.db_connect_timeout_secs),
            idle_timeout: Duration::from_secs(cfg.db_idle_timeout_secs),
            acquire_timeout: Duration::from_secs(cfg.db_acquire_timeout_secs),
        }
    }
}

/// An in-memory SQLite database lives inside one connection, so its pool
/// must never hold more than that one.
fn is_sqlite_memory(url: &str) -> bool {
    url.starts_with("sqlite::memory:") || url.contains("mode=memory")
}

async fn connect(url: &str, settings: PoolSettings) -> Result<DbPool, ServiceError> {
    let (max, min) = if is_sqlite_memory(url) {
        (1, 1)
    } else {
        (settings.max_connections, settings.min_connections)
    };

    let mut opt = ConnectOptions::new(url.to_owned());
    opt.max_connections(max)
        .min_connections(min)
        .connect_timeout(settings.connect_timeout)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .sqlx_logging(false);

    gauge!("pix_db.max_connections", max as f64);
    info!(max_connections = max, "Connecting to database");

    let pool = Database::connect(opt).await.map_err(|e| {
        error!(error = %e, "Could not connect to database");
        ServiceError::DatabaseError(e)
    })?;
    info!(backend = ?pool.get_database_backend(), "Database pool ready");
    Ok(pool)
}

/// Pool for `database_url` with the configured sizing.
pub async fn establish_connection_from_app_config(cfg: &AppConfig) -> Result<DbPool, ServiceError> {
    connect(&cfg.database_url, PoolSettings::from_config(cfg)).await
}

/// Begins a transaction and counts it.
pub async fn begin(pool: &DbPool) -> Result<DatabaseTransaction, ServiceError> {
    counter!("pix_db.transaction.started", 1);
    pool.begin().await.map_err(|e| {
        error!(error = %e, "Failed to begin transaction");
        ServiceError::DatabaseError(e)
    })
}

/// Commits a transaction, recording its duration from `started`.
pub async fn commit(txn: DatabaseTransaction, started: Instant) -> Result<(), ServiceError> {
    let result = txn.commit().await;
    histogram!("pix_db.transaction.duration", started.elapsed());
    match result {
        Ok(()) => {
            counter!("pix_db.transaction.committed", 1);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Failed to commit transaction");
            counter!("pix_db.transaction.failed", 1);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

/// Rolls a transaction back after a failed unit of work.
pub async fn rollback(txn: DatabaseTransaction) {
    counter!("pix_db.transaction.rolled_back", 1);
    if let Err(e) = txn.rollback().await {
        error!(error = %e, "Failed to roll back transaction");
    }
}

/// Takes a row lock on `table.id = id` for the rest of the transaction.
///
/// SQLite has no row locks; its writer lock plus the in-process order lock
/// already serialize transitions, so this is a no-op there.
pub async fn lock_row_for_update<C: ConnectionTrait>(
    conn: &C,
    table: &str,
    id: uuid::Uuid,
) -> Result<(), DbErr> {
    if conn.get_database_backend() != DbBackend::Postgres {
        return Ok(());
    }
    let stmt = sea_orm::Statement::from_sql_and_values(
        DbBackend::Postgres,
        format!("SELECT id FROM {} WHERE id = $1 FOR UPDATE", table),
        [id.into()],
    );
    conn.execute(stmt).await.map(|_| ())
}

/// Applies every pending migration of the embedded migrator.
pub async fn run_migrations(pool: &DbPool) -> Result<(), ServiceError> {
    let start = Instant::now();
    match crate::migrator::Migrator::up(pool, None).await {
        Ok(()) => {
            info!(elapsed_ms = start.elapsed().as_millis() as u64, "Migrations applied");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Migrations failed");
            Err(ServiceError::DatabaseError(e))
        }
    }
}

/// Pings the database; used by the health endpoint.
pub async fn check_connection(pool: &DbPool) -> Result<(), ServiceError> {
    let start = Instant::now();
    match pool.ping().await {
        Ok(()) => {
            debug!(elapsed = ?start.elapsed(), "Database ping ok");
            gauge!("pix_db.connection_latency", start.elapsed().as_millis() as f64);
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Database ping failed");
            counter!("pix_db.connection_failures", 1);
            Err(ServiceError::DatabaseError(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "a-test-secret-that-is-long-enough-for-hs256-signing".into(),
            "test".into(),
        )
    }

    #[tokio::test]
    async fn sqlite_memory_pool_migrates_and_pings() {
        let pool = establish_connection_from_app_config(&memory_config())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        assert!(check_connection(&pool).await.is_ok());
    }

    #[tokio::test]
    async fn row_lock_is_noop_on_sqlite() {
        let pool = establish_connection_from_app_config(&memory_config())
            .await
            .unwrap();
        let txn = pool.begin().await.unwrap();
        lock_row_for_update(&txn, "orders", uuid::Uuid::new_v4())
            .await
            .unwrap();
        txn.rollback().await.unwrap();
    }

    #[test]
    fn memory_urls_are_detected() {
        assert!(is_sqlite_memory("sqlite::memory:"));
        assert!(is_sqlite_memory("sqlite://file:pix?mode=memory&cache=shared"));
        assert!(!is_sqlite_memory("sqlite://pix_commerce.db?mode=rwc"));
        assert!(!is_sqlite_memory("postgres://localhost/pix"));
    }
}
