//! PostgreSQL Row Source
//!
//! Streams bulk snapshots out of PostgreSQL through a `deadpool-postgres`
//! pool. Columns are converted to JSON values by their wire type; columns
//! of types without a conversion make the row undecodable, which the load
//! counts against the namespace's error threshold.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio_postgres::types::Type;
use tokio_postgres::Row;
use tracing::{debug, instrument};

use crate::domain::ports::{RowSource, SourceQuery, SourceRow};
use crate::error::{DecodeError, Error, Result};

/// Row source reading from one PostgreSQL database.
pub struct PostgresRowSource {
    name: String,
    pool: deadpool_postgres::Pool,
    queries: AtomicU64,
}

impl PostgresRowSource {
    /// Build the pool. Connectivity is only checked by the first query.
    pub fn new(name: impl Into<String>, connection: &str, pool_size: usize) -> Result<Self> {
        let name = name.into();
        let pg_config: tokio_postgres::Config = connection
            .parse()
            .map_err(|e| Error::Config(format!("invalid connection string for {}: {}", name, e)))?;

        let manager = deadpool_postgres::Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            deadpool_postgres::ManagerConfig {
                recycling_method: deadpool_postgres::RecyclingMethod::Fast,
            },
        );
        let pool = deadpool_postgres::Pool::builder(manager)
            .max_size(pool_size.max(1))
            .build()
            .map_err(|e| Error::Config(format!("failed to build pool for {}: {}", name, e)))?;

        Ok(Self {
            name,
            pool,
            queries: AtomicU64::new(0),
        })
    }

    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> Error {
        Error::SourceUnreachable {
            namespace: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    async fn client(&self) -> Result<deadpool_postgres::Object> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.pool.get().await.map_err(|e| self.unreachable(e))
    }
}

#[async_trait]
impl RowSource for PostgresRowSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, query), fields(source = %self.name, table = %query.table))]
    async fn fetch_rows(&self, query: &SourceQuery) -> Result<BoxStream<'static, Result<SourceRow>>> {
        let sql = select_sql(query);
        debug!(sql = %sql, "Streaming rows");

        let client = self.client().await?;
        let rows = client
            .query_raw(sql.as_str(), Vec::<String>::new())
            .await
            .map_err(|e| self.unreachable(e))?;
        let rows = Box::pin(rows);
        let name = self.name.clone();

        // the pooled client travels with the stream until it is exhausted
        let stream = stream::unfold((client, rows, name), |(client, mut rows, name)| async move {
            let item = match rows.next().await? {
                Ok(row) => convert_row(&row).map_err(Error::Decode),
                Err(e) => Err(Error::SourceUnreachable {
                    namespace: name.clone(),
                    reason: e.to_string(),
                }),
            };
            Some((item, (client, rows, name)))
        });
        Ok(stream.boxed())
    }

    async fn source_version(&self, query: &SourceQuery) -> Result<Option<String>> {
        let Some(sql) = version_sql(query) else {
            return Ok(None);
        };
        let client = self.client().await?;
        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(|e| self.unreachable(e))?;
        row.try_get::<_, Option<String>>(0)
            .map_err(|e| self.unreachable(e))
    }
}

// =============================================================================
// SQL
// =============================================================================

/// Quote a possibly schema-qualified identifier.
pub fn quote_ident(ident: &str) -> String {
    ident
        .split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn where_clause(query: &SourceQuery) -> String {
    match &query.filter {
        Some(filter) if !filter.trim().is_empty() => format!(" WHERE {}", filter),
        _ => String::new(),
    }
}

pub fn select_sql(query: &SourceQuery) -> String {
    let columns = if query.columns.is_empty() {
        "*".to_string()
    } else {
        query
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "SELECT {} FROM {}{}",
        columns,
        quote_ident(&query.table),
        where_clause(query)
    )
}

pub fn version_sql(query: &SourceQuery) -> Option<String> {
    let column = query.version_column.as_ref()?;
    Some(format!(
        "SELECT MAX({})::text FROM {}{}",
        quote_ident(column),
        quote_ident(&query.table),
        where_clause(query)
    ))
}

// =============================================================================
// Conversion
// =============================================================================

fn convert_row(row: &Row) -> std::result::Result<SourceRow, DecodeError> {
    let mut converted = SourceRow::new();
    for (idx, column) in row.columns().iter().enumerate() {
        converted.insert(column.name(), column_value(row, idx, column.type_())?);
    }
    Ok(converted)
}

fn column_value(row: &Row, idx: usize, ty: &Type) -> std::result::Result<Value, DecodeError> {
    let name = row.columns()[idx].name();
    let failed = |e: tokio_postgres::Error| DecodeError::new(format!("column {}: {}", name, e));

    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)
            .map_err(failed)?
            .map(|v| Value::from(f64::from(v)))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::TEXT || *ty == Type::VARCHAR || *ty == Type::BPCHAR || *ty == Type::NAME {
        row.try_get::<_, Option<String>>(idx).map_err(failed)?.map(Value::from)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<Value>>(idx).map_err(failed)?
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)
            .map_err(failed)?
            .map(|v| Value::from(v.to_rfc3339()))
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)
            .map_err(failed)?
            .map(|v| Value::from(v.to_string()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)
            .map_err(failed)?
            .map(|v| Value::from(v.to_string()))
    } else {
        return Err(DecodeError::new(format!(
            "column {} has unsupported type {}",
            name, ty
        )));
    };
    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query() -> SourceQuery {
        SourceQuery {
            table: "public.countries".to_string(),
            columns: vec!["code".to_string(), "name".to_string()],
            filter: None,
            version_column: Some("last_updated".to_string()),
        }
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("countries"), "\"countries\"");
        assert_eq!(quote_ident("public.countries"), "\"public\".\"countries\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_select_sql() {
        assert_eq!(
            select_sql(&query()),
            "SELECT \"code\", \"name\" FROM \"public\".\"countries\""
        );

        let filtered = SourceQuery {
            filter: Some("active".to_string()),
            ..query()
        };
        assert_eq!(
            select_sql(&filtered),
            "SELECT \"code\", \"name\" FROM \"public\".\"countries\" WHERE active"
        );
    }

    #[test]
    fn test_version_sql() {
        assert_eq!(
            version_sql(&query()).unwrap(),
            "SELECT MAX(\"last_updated\")::text FROM \"public\".\"countries\""
        );
        let unversioned = SourceQuery {
            version_column: None,
            ..query()
        };
        assert!(version_sql(&unversioned).is_none());
    }

    #[test]
    fn test_invalid_connection_string() {
        assert!(PostgresRowSource::new("ref", "host=db port=notaport", 2).is_err());
    }
}
