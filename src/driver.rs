//! Driver contract for the underlying wide-column store
//!
//! The engine never talks to the wire protocol directly. Everything it needs
//! from a driver is captured by the [`Driver`] trait: execute a parameterized
//! CQL statement (optionally prepared), submit a logged batch, and hand back
//! row pages with opaque paging-state tokens. The [`Executor`] wrapper layers
//! the retry policy on top, and [`each_row`] provides async-safe streaming
//! over multi-page result sets.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{Result, SedimentError};

/// A single CQL parameter or column value.
///
/// `Decimal` and `Varint` keep the driver-level encodings the engine actually
/// uses: decimals travel as their string rendering, varints as 64-bit ints.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Null,
    Boolean(bool),
    Int(i32),
    Bigint(i64),
    Varint(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    Text(String),
    Blob(Vec<u8>),
    Uuid(Uuid),
    Timeuuid(Uuid),
    Timestamp(DateTime<Utc>),
    Set(Vec<CqlValue>),
}

impl CqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CqlValue::Null)
    }

    /// The embedded time-UUID, if this value is one
    pub fn as_timeuuid(&self) -> Option<Uuid> {
        match self {
            CqlValue::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            CqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// A parameterized CQL statement ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub cql: String,
    pub params: Vec<CqlValue>,
}

impl Statement {
    pub fn new(cql: impl Into<String>, params: Vec<CqlValue>) -> Self {
        Self {
            cql: cql.into(),
            params,
        }
    }
}

/// Tunable consistency levels exposed through the table API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Consistency {
    All,
    #[default]
    LocalOne,
    LocalQuorum,
}

impl FromStr for Consistency {
    type Err = SedimentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(Consistency::All),
            "localOne" => Ok(Consistency::LocalOne),
            "localQuorum" => Ok(Consistency::LocalQuorum),
            _ => Err(SedimentError::InvalidQuery(format!(
                "Unsupported consistency level: {}",
                s
            ))),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consistency::All => write!(f, "all"),
            Consistency::LocalOne => write!(f, "localOne"),
            Consistency::LocalQuorum => write!(f, "localQuorum"),
        }
    }
}

/// Per-execution options forwarded to the driver
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub consistency: Consistency,
    /// Use a prepared statement
    pub prepare: bool,
    /// Driver page size; rows per fetched page
    pub fetch_size: Option<i32>,
    /// Opaque continuation token from a previous page
    pub paging_state: Option<Vec<u8>>,
}

/// A fetched row: column name to value
pub type Row = BTreeMap<String, CqlValue>;

/// One page of a result set
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<Row>,
    /// Present when more pages remain
    pub paging_state: Option<Vec<u8>>,
}

/// Errors surfaced by the driver
#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Host unavailable: {0}")]
    Unavailable(String),

    #[error("Read timeout: {0}")]
    ReadTimeout(String),

    #[error("Write timeout: {0}")]
    WriteTimeout(String),

    /// The keyspace or column family does not exist
    #[error("Unconfigured table: {0}")]
    UnconfiguredTable(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Unavailable(_)
                | DriverError::ReadTimeout(_)
                | DriverError::WriteTimeout(_)
        )
    }
}

/// The wire-level driver seam.
///
/// Implementations wrap a real cluster client; tests substitute an in-memory
/// fake. The engine only ever holds an `Arc<dyn Driver>`.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Execute one statement and return the first page of results
    async fn execute(
        &self,
        stmt: &Statement,
        opts: &ExecOptions,
    ) -> std::result::Result<ResultPage, DriverError>;

    /// Execute several statements as a single logged batch
    async fn batch(
        &self,
        stmts: &[Statement],
        opts: &ExecOptions,
    ) -> std::result::Result<(), DriverError>;

    /// Tear down and re-establish the connection. Called by the retry policy
    /// after unavailability or a read timeout.
    async fn reset_connection(&self) {}
}

/// Shared executor applying the retry policy on top of a [`Driver`].
///
/// Unavailability and read timeouts reset the connection and retry once;
/// write timeouts retry the original request once; everything else
/// propagates.
#[derive(Clone)]
pub struct Executor {
    driver: Arc<dyn Driver>,
}

impl Executor {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }

    pub async fn execute(&self, stmt: &Statement, opts: &ExecOptions) -> Result<ResultPage> {
        match self.driver.execute(stmt, opts).await {
            Ok(page) => Ok(page),
            Err(e) if e.is_retryable() => {
                self.before_retry(&e).await;
                Ok(self.driver.execute(stmt, opts).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn batch(&self, stmts: &[Statement], opts: &ExecOptions) -> Result<()> {
        match self.driver.batch(stmts, opts).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.before_retry(&e).await;
                Ok(self.driver.batch(stmts, opts).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Execute with exponential-jitter backoff, tolerating concurrent schema
    /// changes. Used for keyspace and column-family creation, which can race
    /// across instances.
    pub async fn execute_with_backoff(
        &self,
        stmt: &Statement,
        opts: &ExecOptions,
        max_attempts: u32,
    ) -> Result<ResultPage> {
        let mut delay_ms: u64 = 100;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.driver.execute(stmt, opts).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < max_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..delay_ms / 2 + 1);
                    tracing::warn!(
                        attempt,
                        delay_ms = delay_ms + jitter,
                        error = %e,
                        "schema statement failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(5_000);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn before_retry(&self, e: &DriverError) {
        match e {
            DriverError::Unavailable(_) | DriverError::ReadTimeout(_) => {
                tracing::debug!(error = %e, "resetting connection before retry");
                self.driver.reset_connection().await;
            }
            _ => tracing::debug!(error = %e, "retrying request"),
        }
    }
}

/// Handler invoked once per streamed row
#[async_trait]
pub trait RowHandler: Send {
    async fn handle(&mut self, row: Row) -> Result<()>;
}

/// Default page size for streamed reads. Deliberately small: background
/// traversals touch few rows in the common case.
pub const STREAM_FETCH_SIZE: i32 = 5;

/// Default bound on per-page fetch retries
pub const STREAM_RETRIES: u32 = 3;

/// Stream every row of a query through `handler`, one page at a time.
///
/// Rows within a page are handled serially; the next page is only fetched
/// once the current one is drained, so earlier pages can be released. Page
/// fetches are retried up to `retries` times, dropping to a fetch size of 1
/// on the final attempt; exhaustion surfaces the last error to the caller.
pub async fn each_row<H: RowHandler>(
    executor: &Executor,
    stmt: &Statement,
    opts: &ExecOptions,
    retries: u32,
    handler: &mut H,
) -> Result<()> {
    let mut page_opts = opts.clone();
    if page_opts.fetch_size.is_none() {
        page_opts.fetch_size = Some(STREAM_FETCH_SIZE);
    }

    loop {
        let page = fetch_page(executor, stmt, &page_opts, retries).await?;
        for row in page.rows {
            handler.handle(row).await?;
        }
        match page.paging_state {
            Some(state) => page_opts.paging_state = Some(state),
            None => return Ok(()),
        }
    }
}

async fn fetch_page(
    executor: &Executor,
    stmt: &Statement,
    opts: &ExecOptions,
    retries: u32,
) -> Result<ResultPage> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut opts = opts.clone();
        if attempt > retries {
            // Last chance: shrink the page to a single row
            opts.fetch_size = Some(1);
        }
        match executor.execute(stmt, &opts).await {
            Ok(page) => return Ok(page),
            Err(e) if attempt <= retries => {
                tracing::warn!(attempt, error = %e, "page fetch failed, retrying");
            }
            Err(e) => return Err(e),
        }
    }
}
