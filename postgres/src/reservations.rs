//! Reservation table.

use crate::backend;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use netprov_core::adapters::ReservationStore;
use netprov_core::error::StoreError;
use netprov_core::lifecycle::LifecycleState;
use netprov_core::reservation::{AddressReservation, ReservationKey};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};

const COLUMNS: &str = "tenant_id, subscriber_id, protocol, pool_id, address, lifecycle_state, \
     allocated_at, activated_at, suspended_at, revoked_at, updated_at, metadata, version";

const UNIQUE_VIOLATION: &str = "23505";

/// `PostgreSQL`-backed [`ReservationStore`].
///
/// Writes are compare-and-swap on `version`: an insert only succeeds when no
/// row exists, an update only when the stored version matches. A partial
/// unique index keeps an address from being held by two live rows.
#[derive(Clone, Debug)]
pub struct PostgresReservationStore {
    pool: PgPool,
}

impl PostgresReservationStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn stored_version(&self, key: &ReservationKey) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r"
            SELECT version FROM address_reservations
            WHERE tenant_id = $1 AND subscriber_id = $2 AND protocol = $3
            ",
        )
        .bind(&key.tenant_id)
        .bind(&key.subscriber_id)
        .bind(key.protocol.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(&e))?;

        version.map(decode_version).transpose()
    }

    async fn insert(&self, reservation: &AddressReservation) -> Result<Option<i64>, sqlx::Error> {
        let sql = format!(
            r"
            INSERT INTO address_reservations ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (tenant_id, subscriber_id, protocol) DO NOTHING
            RETURNING version
            "
        );
        bind_row(sqlx::query(&sql), reservation, 1)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("version"))
            .transpose()
    }

    async fn update(
        &self,
        reservation: &AddressReservation,
        expected: i64,
    ) -> Result<Option<i64>, sqlx::Error> {
        bind_row(
            sqlx::query(
                r"
                UPDATE address_reservations
                SET pool_id = $4, address = $5, lifecycle_state = $6,
                    allocated_at = $7, activated_at = $8, suspended_at = $9,
                    revoked_at = $10, updated_at = $11, metadata = $12, version = $13
                WHERE tenant_id = $1 AND subscriber_id = $2 AND protocol = $3
                  AND version = $14
                RETURNING version
                ",
            ),
            reservation,
            expected + 1,
        )
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| row.try_get("version"))
        .transpose()
    }
}

/// Bind `$1..$13` in [`COLUMNS`] order.
fn bind_row<'q>(
    query: Query<'q, Postgres, PgArguments>,
    r: &'q AddressReservation,
    version: i64,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(r.tenant_id.as_str())
        .bind(r.subscriber_id.as_str())
        .bind(r.protocol.as_str())
        .bind(r.pool_id.as_deref())
        .bind(r.address.as_deref())
        .bind(r.lifecycle_state.as_str())
        .bind(r.allocated_at)
        .bind(r.activated_at)
        .bind(r.suspended_at)
        .bind(r.revoked_at)
        .bind(r.updated_at)
        .bind(Value::Object(r.metadata.clone()))
        .bind(version)
}

fn decode_version(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version)
        .map_err(|_| StoreError::Serialization(format!("negative version {version}")))
}

fn encode_version(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version)
        .map_err(|_| StoreError::Serialization(format!("version {version} out of range")))
}

fn decode_row(row: &PgRow) -> Result<AddressReservation, StoreError> {
    let column = |e: sqlx::Error| StoreError::Serialization(e.to_string());

    let protocol: String = row.try_get("protocol").map_err(column)?;
    let state: String = row.try_get("lifecycle_state").map_err(column)?;
    let metadata = match row.try_get::<Value, _>("metadata").map_err(column)? {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(StoreError::Serialization(format!(
                "metadata is not an object: {other}"
            )));
        }
    };

    Ok(AddressReservation {
        tenant_id: row.try_get("tenant_id").map_err(column)?,
        subscriber_id: row.try_get("subscriber_id").map_err(column)?,
        protocol: protocol.parse().map_err(StoreError::Serialization)?,
        pool_id: row.try_get("pool_id").map_err(column)?,
        address: row.try_get("address").map_err(column)?,
        lifecycle_state: state
            .parse()
            .map_err(|e: netprov_core::lifecycle::UnknownStateError| {
                StoreError::Serialization(e.to_string())
            })?,
        allocated_at: row.try_get("allocated_at").map_err(column)?,
        activated_at: row.try_get("activated_at").map_err(column)?,
        suspended_at: row.try_get("suspended_at").map_err(column)?,
        revoked_at: row.try_get("revoked_at").map_err(column)?,
        updated_at: row.try_get("updated_at").map_err(column)?,
        metadata,
        version: decode_version(row.try_get("version").map_err(column)?)?,
    })
}

fn write_error(e: &sqlx::Error, reservation: &AddressReservation) -> StoreError {
    let unique_violation = e
        .as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if unique_violation {
        StoreError::Backend(format!(
            "address {} is already held by another reservation",
            reservation.address.as_deref().unwrap_or("-")
        ))
    } else {
        backend(e)
    }
}

impl ReservationStore for PostgresReservationStore {
    fn load<'a>(
        &'a self,
        key: &'a ReservationKey,
    ) -> BoxFuture<'a, Result<Option<AddressReservation>, StoreError>> {
        Box::pin(async move {
            let sql = format!(
                r"
                SELECT {COLUMNS} FROM address_reservations
                WHERE tenant_id = $1 AND subscriber_id = $2 AND protocol = $3
                "
            );
            let row = sqlx::query(&sql)
                .bind(&key.tenant_id)
                .bind(&key.subscriber_id)
                .bind(key.protocol.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| backend(&e))?;

            row.as_ref().map(decode_row).transpose()
        })
    }

    fn save<'a>(
        &'a self,
        reservation: &'a AddressReservation,
        expected_version: Option<u64>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let written = match expected_version {
                None => self.insert(reservation).await,
                Some(expected) => self.update(reservation, encode_version(expected)?).await,
            }
            .map_err(|e| write_error(&e, reservation))?;

            if let Some(version) = written {
                return decode_version(version);
            }

            let key = reservation.key();
            let actual = self.stored_version(&key).await?;
            metrics::counter!("netprov.store.version_conflicts", "protocol" => key.protocol.as_str())
                .increment(1);
            tracing::debug!(%key, ?expected_version, ?actual, "Reservation version conflict");
            Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            })
        })
    }

    fn find_stale<'a>(
        &'a self,
        tenant_id: &'a str,
        states: &'a [LifecycleState],
        updated_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<AddressReservation>, StoreError>> {
        Box::pin(async move {
            let states: Vec<String> = states.iter().map(|s| s.as_str().to_string()).collect();
            let sql = format!(
                r"
                SELECT {COLUMNS} FROM address_reservations
                WHERE tenant_id = $1 AND lifecycle_state = ANY($2) AND updated_at < $3
                ORDER BY updated_at ASC
                "
            );
            let rows = sqlx::query(&sql)
                .bind(tenant_id)
                .bind(states)
                .bind(updated_before)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| backend(&e))?;

            rows.iter().map(decode_row).collect()
        })
    }

    fn purge_revoked<'a>(
        &'a self,
        tenant_id: &'a str,
        revoked_before: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let purged = sqlx::query(
                r"
                DELETE FROM address_reservations
                WHERE tenant_id = $1 AND lifecycle_state = 'REVOKED' AND revoked_at < $2
                ",
            )
            .bind(tenant_id)
            .bind(revoked_before)
            .execute(&self.pool)
            .await
            .map_err(|e| backend(&e))?
            .rows_affected();

            if purged > 0 {
                tracing::info!(tenant_id, purged, "Purged revoked reservations");
            }
            Ok(purged)
        })
    }
}
