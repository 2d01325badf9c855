/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Connection-pool seam between the request core and the relational store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use deadpool::managed::QueueMode;
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{info, warn};

use crate::config::ServerConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// SQL-ish truthiness: NULL, 0, false and the empty string are false.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(v) => *v != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty() && s != "0",
            Value::Bool(b) => *b,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        // Parameter types are inferred by the server; adapt where the encoding is lossless.
        match (self, ty) {
            (Value::Null, _) => Ok(IsNull::Yes),
            (Value::Int(v), t) if *t == Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
            (Value::Int(v), t) if *t == Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
            (Value::Int(v), t) if *t == Type::INT8 => v.to_sql(ty, out),
            (Value::Int(v), t) if *t == Type::FLOAT8 => (*v as f64).to_sql(ty, out),
            (Value::Float(v), t) if *t == Type::FLOAT4 => (*v as f32).to_sql(ty, out),
            (Value::Float(v), t) if *t == Type::FLOAT8 => v.to_sql(ty, out),
            (Value::Text(s), t) if is_text(t) => s.as_str().to_sql(ty, out),
            (Value::Bool(b), t) if *t == Type::BOOL => b.to_sql(ty, out),
            (value, ty) => Err(format!("cannot bind {value:?} to a {ty} parameter").into()),
        }
    }

    /// Any column type; `to_sql` refuses the combinations it cannot encode.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_text(ty: &Type) -> bool {
    [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty)
}

/// One result row with its column names, in select order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.push(name, value.into());
        self
    }

    pub fn push(&mut self, name: &str, value: Value) {
        self.columns.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name).map(Value::truthy).unwrap_or(false)
    }

    pub fn first(&self) -> Option<&Value> {
        self.columns.first().map(|(_, v)| v)
    }
}

#[async_trait]
pub trait Connection: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn get(&self) -> Result<Box<dyn Connection>>;
}

pub struct PgPool {
    pool: Pool,
}

impl PgPool {
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let url = cfg
            .db_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("PATNET_DB_URL is required"))?;
        let mut pg = deadpool_postgres::Config::new();
        pg.url = Some(url.to_string());
        pg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(cfg.pg_pool_max_size);
        pool_cfg.queue_mode = QueueMode::Fifo;
        pool_cfg.timeouts = Timeouts {
            wait: cfg.pg_pool_wait_ms.map(Duration::from_millis),
            create: Some(Duration::from_secs(5)),
            recycle: Some(Duration::from_secs(5)),
        };
        pg.pool = Some(pool_cfg);
        let pool = pg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("create postgres pool")?;
        Ok(Self { pool })
    }

    /// Waits for the database to answer `select 1`, backing off between attempts.
    pub async fn wait_ready(&self, retries: usize, backoff_ms: u64) -> Result<()> {
        let retries = retries.max(1);
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=retries {
            match self.ping().await {
                Ok(()) => {
                    info!("postgres ready");
                    return Ok(());
                }
                Err(err) => {
                    last_err = Some(err);
                    let wait_ms = (attempt as u64 * backoff_ms).min(30_000);
                    warn!("postgres not ready (attempt {attempt}/{retries}); retrying in {wait_ms}ms");
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("postgres not ready")))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.get().await?;
        conn.query("select 1", &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionPool for PgPool {
    async fn get(&self) -> Result<Box<dyn Connection>> {
        let client = self.pool.get().await.context("get connection from pool")?;
        Ok(Box::new(PgConnection { client }))
    }
}

struct PgConnection {
    client: deadpool_postgres::Object,
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self
            .client
            .prepare_cached(sql)
            .await
            .with_context(|| format!("prepare: {sql}"))?;
        let refs: Vec<&(dyn ToSql + Sync)> = params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        let rows = self
            .client
            .query(&stmt, &refs)
            .await
            .with_context(|| format!("query: {sql}"))?;
        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row> {
    let mut out = Row::new();
    for (idx, col) in row.columns().iter().enumerate() {
        let ty = col.type_();
        let value = if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
        } else if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into()))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
        } else if is_text(ty) {
            row.try_get::<_, Option<String>>(idx)?.map(Value::Text)
        } else if *ty == Type::DATE {
            row.try_get::<_, Option<chrono::NaiveDate>>(idx)?
                .map(|v| Value::Text(v.to_string()))
        } else if *ty == Type::TIMESTAMP {
            row.try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
                .map(|v| Value::Text(v.to_string()))
        } else if *ty == Type::TIMESTAMPTZ {
            row.try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
                .map(|v| Value::Text(v.to_rfc3339()))
        } else if *ty == Type::JSON || *ty == Type::JSONB {
            row.try_get::<_, Option<serde_json::Value>>(idx)?
                .map(|v| Value::Text(v.to_string()))
        } else {
            anyhow::bail!("column {} has unsupported type {ty}", col.name());
        };
        out.push(col.name(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_truthiness_follows_sql() {
        assert!(!Value::Null.truthy());
        assert!(!Value::Int(0).truthy());
        assert!(Value::Int(2).truthy());
        assert!(!Value::Text(String::new()).truthy());
        assert!(Value::Bool(true).truthy());
    }

    #[test]
    fn row_lookup_by_name_and_position() {
        let row = Row::new().with("c", 7).with("name", "ann");
        assert_eq!(row.first(), Some(&Value::Int(7)));
        assert_eq!(row.get_i64("c"), Some(7));
        assert_eq!(row.get_str("name"), Some("ann"));
        assert_eq!(row.get("missing"), None);
        assert!(!row.get_bool("missing"));
    }

    #[test]
    fn params_bind_only_to_compatible_types() {
        let mut out = BytesMut::new();
        assert!(Value::Int(7).to_sql(&Type::INT4, &mut out).is_ok());
        assert!(Value::Text("x".into()).to_sql(&Type::VARCHAR, &mut out).is_ok());
        assert!(matches!(Value::Null.to_sql(&Type::INT8, &mut out), Ok(IsNull::Yes)));

        assert!(Value::Text("12".into()).to_sql(&Type::INT4, &mut out).is_err());
        assert!(Value::Bool(true).to_sql(&Type::INT8, &mut out).is_err());
        assert!(Value::Int(1).to_sql(&Type::NUMERIC, &mut out).is_err());
        assert!(Value::Int(i64::from(i32::MAX) + 1).to_sql(&Type::INT4, &mut out).is_err());
    }

    #[test]
    fn text_numbers_parse() {
        assert_eq!(Value::Text(" 42".into()).as_i64(), Some(42));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[tokio::test]
    async fn fake_pool_counts_returns() {
        let pool = fake::FakePool::new();
        pool.on("select 1", vec![Row::new().with("x", 1)]);
        {
            let mut conn = pool.get().await.unwrap();
            let rows = conn.query("select 1", &[]).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert!(conn.query("select 2", &[]).await.unwrap().is_empty());
        }
        assert_eq!(pool.checked_out(), 1);
        assert_eq!(pool.returned(), 1);
        assert_eq!(pool.hits("select"), 2);
    }
}
