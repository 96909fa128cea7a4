//! Session driver over a request-scoped SQLite connection.
//!
//! Every statement, reads included, runs inside the request transaction.
//! Whether that transaction is committed is decided after the response,
//! unless the handler calls [`SqliteSession::commit`] or
//! [`SqliteSession::rollback`] itself.

use crate::db::params::sqlite_query;
use crate::db::sqlite::SqliteScopedConnection;
use crate::db::types::{RowToJson, decode_column};
use crate::error::{ScopeError, ScopeResult};
use crate::models::{ExecuteResult, QueryParam};
use crate::scope::ConnectionHandle;
use futures_util::TryStreamExt;
use serde_json::{Map, Value as JsonValue};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo};
use tracing::debug;

type JsonRow = Map<String, JsonValue>;

/// Statement API bound to one request's connection.
///
/// Clones share the connection. Statements are serialized through the
/// connection lock.
#[derive(Clone, Debug)]
pub struct SqliteSession {
    connection: ConnectionHandle<SqliteScopedConnection>,
    decode_binary: bool,
}

impl SqliteSession {
    pub fn new(connection: ConnectionHandle<SqliteScopedConnection>) -> Self {
        Self {
            connection,
            decode_binary: false,
        }
    }

    /// Decode BLOB columns as UTF-8 text where possible instead of base64.
    pub fn with_binary_decoding(mut self, decode_binary: bool) -> Self {
        self.decode_binary = decode_binary;
        self
    }

    pub fn connection(&self) -> &ConnectionHandle<SqliteScopedConnection> {
        &self.connection
    }

    /// Whether the request transaction is currently open.
    pub async fn in_transaction(&self) -> ScopeResult<bool> {
        Ok(self.connection.lock().await?.in_transaction())
    }

    /// Run a query and return every row.
    pub async fn select(&self, sql: &str, params: &[QueryParam]) -> ScopeResult<Vec<JsonRow>> {
        let mut conn = self.connection.lock().await?;
        let mut stream = sqlite_query(sql, params).fetch(conn.transaction().await?);
        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            rows.push(row.to_json_map_with_options(self.decode_binary));
        }
        Ok(rows)
    }

    /// Run a query that must return a row. Extra rows are ignored.
    pub async fn select_one(&self, sql: &str, params: &[QueryParam]) -> ScopeResult<JsonRow> {
        self.select_one_or_none(sql, params)
            .await?
            .ok_or_else(not_found)
    }

    pub async fn select_one_or_none(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> ScopeResult<Option<JsonRow>> {
        let mut conn = self.connection.lock().await?;
        let row = sqlite_query(sql, params)
            .fetch_optional(conn.transaction().await?)
            .await?;
        Ok(row.map(|row| row.to_json_map_with_options(self.decode_binary)))
    }

    /// Run a query and return the first column of the first row.
    pub async fn select_value(&self, sql: &str, params: &[QueryParam]) -> ScopeResult<JsonValue> {
        self.select_value_or_none(sql, params)
            .await?
            .ok_or_else(not_found)
    }

    pub async fn select_value_or_none(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> ScopeResult<Option<JsonValue>> {
        let mut conn = self.connection.lock().await?;
        let row = sqlite_query(sql, params)
            .fetch_optional(conn.transaction().await?)
            .await?;
        Ok(row.map(|row| first_value(&row, self.decode_binary)))
    }

    /// Run a write statement and report the affected rows.
    pub async fn insert_update_delete(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> ScopeResult<ExecuteResult> {
        let mut conn = self.connection.lock().await?;
        let result = sqlite_query(sql, params)
            .execute(conn.transaction().await?)
            .await?;
        debug!(rows_affected = result.rows_affected(), "Write statement executed");
        Ok(ExecuteResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_rowid(),
        })
    }

    /// Run a write statement with a `RETURNING` clause.
    pub async fn insert_update_delete_returning(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> ScopeResult<Option<JsonRow>> {
        let mut conn = self.connection.lock().await?;
        // Drain every row so the statement runs to completion.
        let rows = sqlite_query(sql, params)
            .fetch_all(conn.transaction().await?)
            .await?;
        Ok(rows
            .first()
            .map(|row| row.to_json_map_with_options(self.decode_binary)))
    }

    /// Run several `;`-separated statements without parameters.
    ///
    /// The script must not manage transactions itself.
    pub async fn execute_script(&self, script: &str) -> ScopeResult<()> {
        let mut conn = self.connection.lock().await?;
        let tx = conn.transaction().await?;
        sqlx::Executor::execute(tx, sqlx::raw_sql(script)).await?;
        Ok(())
    }

    /// Commit now instead of waiting for the response.
    pub async fn commit(&self) -> ScopeResult<()> {
        self.connection.lock().await?.commit().await
    }

    /// Roll back now instead of waiting for the response.
    pub async fn rollback(&self) -> ScopeResult<()> {
        self.connection.lock().await?.rollback().await
    }
}

fn not_found() -> ScopeError {
    ScopeError::database("No rows returned", None)
}

fn first_value(row: &SqliteRow, decode_binary: bool) -> JsonValue {
    match row.columns().first() {
        Some(col) => decode_column(row, 0, col.type_info().name(), decode_binary),
        None => JsonValue::Null,
    }
}
