/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use tokio::time::Instant;
use tracing::error;

use crate::admission::ConnectionLease;
use crate::db::{Row, Value};
use crate::error::{ForumError, ForumResult};

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub sql: String,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub rows: Vec<Row>,
    /// Rows the statement would match without its limit, when asked for.
    pub total_rows: Option<i64>,
}

/// A statement plus, optionally, the cheap count query that sizes it for pagination.
#[derive(Debug, Clone)]
pub struct Statement<'a> {
    sql: &'a str,
    params: Vec<Value>,
    total: Option<(&'a str, Vec<Value>)>,
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            sql,
            params: Vec::new(),
            total: None,
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn with_total(mut self, count_sql: &'a str, params: Vec<Value>) -> Self {
        self.total = Some((count_sql, params));
        self
    }
}

impl ConnectionLease {
    /// Runs one statement, recording its timing whether or not it succeeds. Never retries.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> ForumResult<Vec<Row>> {
        let started = Instant::now();
        let result = self.conn.query(sql, params).await;
        self.log.push(QueryRecord {
            sql: sql.to_string(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1000.0,
        });
        result.map_err(|e| {
            error!(ip = %self.address(), sql, "query failed: {e:#}");
            ForumError::Query(format!("{e:#}"))
        })
    }

    pub async fn execute(&mut self, stmt: &Statement<'_>) -> ForumResult<RowSet> {
        let rows = self.query(stmt.sql, &stmt.params).await?;
        let total_rows = match &stmt.total {
            Some((count_sql, params)) => Some(
                self.scalar(count_sql, params)
                    .await?
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0),
            ),
            None => None,
        };
        Ok(RowSet { rows, total_rows })
    }

    /// Same parameters for both the statement and its count.
    pub async fn query_counted(&mut self, sql: &str, count_sql: &str, params: &[Value]) -> ForumResult<RowSet> {
        let stmt = Statement {
            sql,
            params: params.to_vec(),
            total: Some((count_sql, params.to_vec())),
        };
        self.execute(&stmt).await
    }

    /// First column of the first row; `None` for no rows or SQL NULL.
    pub async fn scalar(&mut self, sql: &str, params: &[Value]) -> ForumResult<Option<Value>> {
        let rows = self.query(sql, params).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.first().cloned())
            .filter(|v| *v != Value::Null))
    }

    pub async fn single_row(&mut self, sql: &str, params: &[Value]) -> ForumResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    pub fn query_log(&self) -> &[QueryRecord] {
        &self.log
    }

    pub fn total_query_ms(&self) -> f64 {
        self.log.iter().map(|q| q.elapsed_ms).sum()
    }
}
