//! Subscriber profiles.

use futures::future::BoxFuture;
use netprov_core::adapters::{Profile, ProfileStore};
use netprov_core::error::ProfileError;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

/// `PostgreSQL`-backed [`ProfileStore`] with soft deletes.
#[derive(Clone, Debug)]
pub struct PostgresProfileStore {
    pool: PgPool,
}

impl PostgresProfileStore {
    /// Store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(e: &sqlx::Error) -> ProfileError {
    ProfileError(e.to_string())
}

fn decode_profile(row: &PgRow) -> Result<Profile, ProfileError> {
    let column = |e: sqlx::Error| ProfileError(e.to_string());
    let attributes = match row.try_get::<Value, _>("attributes").map_err(column)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Ok(Profile {
        subscriber_id: row.try_get("subscriber_id").map_err(column)?,
        attributes,
        deleted: row.try_get("deleted").map_err(column)?,
        created_at: row.try_get("created_at").map_err(column)?,
        updated_at: row.try_get("updated_at").map_err(column)?,
    })
}

impl ProfileStore for PostgresProfileStore {
    fn get<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<Option<Profile>, ProfileError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT subscriber_id, attributes, deleted, created_at, updated_at
                FROM subscriber_profiles
                WHERE subscriber_id = $1 AND NOT deleted
                ",
            )
            .bind(subscriber_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage(&e))?;

            row.as_ref().map(decode_profile).transpose()
        })
    }

    fn upsert<'a>(
        &'a self,
        subscriber_id: &'a str,
        fields: Map<String, Value>,
    ) -> BoxFuture<'a, Result<Profile, ProfileError>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                INSERT INTO subscriber_profiles (subscriber_id, attributes)
                VALUES ($1, $2)
                ON CONFLICT (subscriber_id) DO UPDATE
                SET attributes = subscriber_profiles.attributes || EXCLUDED.attributes,
                    deleted = FALSE,
                    updated_at = now()
                RETURNING subscriber_id, attributes, deleted, created_at, updated_at
                ",
            )
            .bind(subscriber_id)
            .bind(Value::Object(fields))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage(&e))?;

            decode_profile(&row)
        })
    }

    fn soft_delete<'a>(&'a self, subscriber_id: &'a str) -> BoxFuture<'a, Result<bool, ProfileError>> {
        Box::pin(async move {
            let affected = sqlx::query(
                r"
                UPDATE subscriber_profiles
                SET deleted = TRUE, updated_at = now()
                WHERE subscriber_id = $1 AND NOT deleted
                ",
            )
            .bind(subscriber_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage(&e))?
            .rows_affected();

            if affected > 0 {
                tracing::info!(subscriber_id, "Profile soft-deleted");
            }
            Ok(affected > 0)
        })
    }
}
