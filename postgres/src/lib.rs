//! `PostgreSQL` stores for netprov.
//!
//! - [`PostgresReservationStore`] implements `ReservationStore`: one row per
//!   `(tenant_id, subscriber_id, protocol)` with optimistic concurrency on a
//!   `version` column.
//! - [`PostgresProfileStore`] implements `ProfileStore` with soft deletes.
//!
//! Both share one pool. Run [`migrate`] once at startup.
//!
//! # Example
//!
//! ```ignore
//! use netprov_postgres::{PostgresProfileStore, PostgresReservationStore};
//!
//! let pool = netprov_postgres::connect("postgres://localhost/netprov", 10).await?;
//! netprov_postgres::migrate(&pool).await?;
//! let reservations = PostgresReservationStore::new(pool.clone());
//! let profiles = PostgresProfileStore::new(pool);
//! ```

mod profiles;
mod reservations;

pub use profiles::PostgresProfileStore;
pub use reservations::PostgresReservationStore;

use netprov_core::error::StoreError;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Backend(format!("Failed to connect: {e}")))
}

/// Create or upgrade the reservation and profile tables.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Backend(format!("Migration failed: {e}")))?;
    tracing::info!("Database migrations applied");
    Ok(())
}

fn backend(e: &sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}
