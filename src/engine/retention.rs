//! Revision retention
//!
//! Applies the table's retention policy to the revision stream of one
//! primary key, newest first. Superseded revisions beyond the retained
//! window are re-written with `USING TTL <grace_ttl>` so they expire once
//! the grace period passes. Re-writes replay fetched driver values as-is
//! (no value conversion) and never carry an explicit write timestamp.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cql::{build_put_query, PutPlan};
use crate::driver::{Consistency, ExecOptions, Executor, Row};
use crate::error::Result;
use crate::schema::{SchemaInfo, DATA_CF};
use crate::types::{tid_datetime, RetentionPolicy};

pub(crate) struct RevisionPolicyManager {
    executor: Executor,
    info: Arc<SchemaInfo>,
    keyspace: String,
    domain: String,
    consistency: Consistency,
    policy: RetentionPolicy,
    /// Revisions seen so far, the just-written one included
    seen: u32,
    /// Start of the interval window, fixed by the stream head
    interval_limit_ms: Option<i64>,
}

impl RevisionPolicyManager {
    pub fn new(
        executor: Executor,
        info: Arc<SchemaInfo>,
        keyspace: String,
        domain: String,
        consistency: Consistency,
    ) -> Self {
        let policy = info.schema.revision_retention_policy.clone();
        Self {
            executor,
            info,
            keyspace,
            domain,
            consistency,
            policy,
            seen: 0,
            interval_limit_ms: None,
        }
    }

    /// Process one row. Retention must never fail the write that triggered
    /// it, so errors are logged and swallowed here.
    pub async fn handle(&mut self, row: &Row) {
        if let Err(e) = self.handle_inner(row).await {
            tracing::error!(
                keyspace = %self.keyspace,
                domain = %self.domain,
                error = %e,
                "revision retention update failed"
            );
        }
    }

    async fn handle_inner(&mut self, row: &Row) -> Result<()> {
        match self.policy {
            RetentionPolicy::All => Ok(()),
            RetentionPolicy::Latest { count, grace_ttl } => {
                self.seen += 1;
                if self.seen <= count {
                    return Ok(());
                }
                let current_ttl = row.get("_ttl").and_then(|v| v.as_int());
                if current_ttl.map_or(true, |ttl| ttl > grace_ttl as i32) {
                    self.apply_ttl(row, grace_ttl).await?;
                }
                Ok(())
            }
            RetentionPolicy::Interval {
                interval,
                count,
                grace_ttl,
            } => {
                self.seen += 1;
                let row_ms = row
                    .get(&self.info.tid)
                    .and_then(|v| v.as_timeuuid())
                    .and_then(|tid| tid_datetime(&tid))
                    .map(|dt| dt.timestamp_millis());
                let Some(row_ms) = row_ms else {
                    return Ok(());
                };
                // The newest revision anchors the interval window
                let limit = *self
                    .interval_limit_ms
                    .get_or_insert(row_ms - row_ms.rem_euclid(interval as i64));
                if self.seen <= count {
                    return Ok(());
                }
                // Revisions inside the current window are redundant with the
                // newer one; each older window keeps its representative
                let current_ttl = row.get("_ttl").and_then(|v| v.as_int());
                if row_ms >= limit && current_ttl.is_none() {
                    self.apply_ttl(row, grace_ttl).await?;
                }
                Ok(())
            }
        }
    }

    /// Re-write the row with the grace TTL. Values go back exactly as
    /// fetched; null cells are dropped rather than re-deleted.
    async fn apply_ttl(&self, row: &Row, grace_ttl: u32) -> Result<()> {
        let mut attributes: BTreeMap<_, _> = row
            .iter()
            .filter(|(name, value)| {
                self.info.i_key_map.contains_key(*name) || !value.is_null()
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        attributes.remove("_ttl");

        let plan = PutPlan {
            domain: Some(self.domain.clone()),
            attributes,
            condition: None,
            timestamp: None,
            ttl: Some(grace_ttl),
        };
        let stmt = build_put_query(&self.info, &self.keyspace, DATA_CF, &plan)?;
        tracing::debug!(
            keyspace = %self.keyspace,
            grace_ttl,
            "expiring superseded revision"
        );
        self.executor
            .execute(
                &stmt,
                &ExecOptions {
                    consistency: self.consistency,
                    prepare: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Driver, DriverError, ResultPage, Statement};
    use crate::schema::make_schema_info;
    use crate::types::{tid_at, TableSchema};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDriver {
        statements: Mutex<Vec<Statement>>,
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        async fn execute(
            &self,
            stmt: &Statement,
            _opts: &ExecOptions,
        ) -> std::result::Result<ResultPage, DriverError> {
            self.statements.lock().unwrap().push(stmt.clone());
            Ok(ResultPage::default())
        }

        async fn batch(
            &self,
            stmts: &[Statement],
            _opts: &ExecOptions,
        ) -> std::result::Result<(), DriverError> {
            self.statements.lock().unwrap().extend(stmts.iter().cloned());
            Ok(())
        }
    }

    fn manager(policy: serde_json::Value) -> (Arc<RecordingDriver>, RevisionPolicyManager) {
        let schema: TableSchema = serde_json::from_value(json!({
            "table": "t",
            "attributes": {"key": "string", "tid": "timeuuid", "body": "blob"},
            "index": [
                {"type": "hash", "attribute": "key"},
                {"type": "range", "attribute": "tid", "order": "desc"}
            ],
            "revisionRetentionPolicy": policy
        }))
        .unwrap();
        let info = Arc::new(make_schema_info(&schema, false).unwrap());
        let driver = Arc::new(RecordingDriver::default());
        let manager = RevisionPolicyManager::new(
            Executor::new(driver.clone()),
            info,
            "ks".to_string(),
            "d".to_string(),
            Consistency::LocalOne,
        );
        (driver, manager)
    }

    fn row(tid_offset_secs: i64, ttl: Option<i32>) -> Row {
        // Mid-window, so interval tests have room on both sides of the
        // window boundary
        let at = Utc.with_ymd_and_hms(2020, 6, 1, 12, 30, 0).unwrap()
            + Duration::seconds(tid_offset_secs);
        let mut row = Row::new();
        row.insert("key".to_string(), crate::driver::CqlValue::Text("k".into()));
        row.insert(
            "tid".to_string(),
            crate::driver::CqlValue::Timeuuid(tid_at(at)),
        );
        row.insert(
            "body".to_string(),
            crate::driver::CqlValue::Blob(b"b".to_vec()),
        );
        if let Some(ttl) = ttl {
            row.insert("_ttl".to_string(), crate::driver::CqlValue::Int(ttl));
        }
        row
    }

    #[tokio::test]
    async fn latest_skips_the_newest_count_rows() {
        let (driver, mut manager) =
            manager(json!({"type": "latest", "count": 2, "grace_ttl": 86400}));
        manager.handle(&row(3, None)).await;
        manager.handle(&row(2, None)).await;
        assert!(driver.statements.lock().unwrap().is_empty());

        manager.handle(&row(1, None)).await;
        let statements = driver.statements.lock().unwrap();
        assert_eq!(statements.len(), 1);
        assert!(statements[0].cql.contains("USING TTL ?"));
        assert_eq!(
            statements[0].params[0],
            crate::driver::CqlValue::Int(86400)
        );
    }

    #[tokio::test]
    async fn latest_leaves_rows_already_at_or_below_grace() {
        let (driver, mut manager) =
            manager(json!({"type": "latest", "count": 1, "grace_ttl": 86400}));
        manager.handle(&row(3, None)).await;
        manager.handle(&row(2, Some(600))).await;
        assert!(driver.statements.lock().unwrap().is_empty());

        manager.handle(&row(1, Some(90000))).await;
        assert_eq!(driver.statements.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interval_expires_only_the_current_window() {
        // One-hour windows; the head row anchors the window start
        let (driver, mut manager) = manager(
            json!({"type": "interval", "interval": 3_600_000, "count": 1, "grace_ttl": 86400}),
        );
        manager.handle(&row(0, None)).await;
        // Same window, no TTL: expires
        manager.handle(&row(-60, None)).await;
        assert_eq!(driver.statements.lock().unwrap().len(), 1);
        // Previous window: kept as that window's representative
        manager.handle(&row(-3700, None)).await;
        assert_eq!(driver.statements.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_policy_is_a_no_op() {
        let (driver, mut manager) = manager(json!({"type": "all"}));
        for offset in [3, 2, 1, 0] {
            manager.handle(&row(offset, None)).await;
        }
        assert!(driver.statements.lock().unwrap().is_empty());
    }
}
