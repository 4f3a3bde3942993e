//! Query execution against PostgreSQL.

use async_trait::async_trait;
use serde_json::Value;
use sqlx_core::row::Row;
use sqlx_postgres::PgPool;

use crate::executor::QueryExecutor;
use crate::{Error, Result};

/// Executes compiled queries on a PostgreSQL pool.
///
/// Each result row is returned as a JSON object keyed by column name.
#[derive(Debug, Clone)]
pub struct PgQueryExecutor {
    pool: PgPool,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run `sql` and return its rows as JSON objects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sql`] if the query fails.
    pub async fn fetch_json(&self, sql: &str) -> Result<Vec<Value>> {
        let wrapped = wrap_as_json(sql);
        tracing::debug!(sql = %wrapped, "Executing compiled query");

        let rows = sqlx_core::query::query(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sql)?;

        Ok(rows
            .iter()
            .map(|row| {
                row.try_get::<Option<Value>, _>(0)
                    .ok()
                    .flatten()
                    .unwrap_or(Value::Null)
            })
            .collect())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute_query(&self, sql: &str) -> anyhow::Result<Vec<Value>> {
        Ok(self.fetch_json(sql).await?)
    }
}

fn wrap_as_json(sql: &str) -> String {
    format!("SELECT to_jsonb(q) FROM (\n{sql}\n) AS q")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_wrapped_as_json_objects() {
        assert_eq!(
            wrap_as_json("SELECT 1 AS id"),
            "SELECT to_jsonb(q) FROM (\nSELECT 1 AS id\n) AS q"
        );
    }
}
