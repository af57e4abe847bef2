//! Post-write background updates
//!
//! After every acknowledged write the engine walks the sibling revisions of
//! the written row: up to one newer revision (so the index rebuilder has a
//! comparison baseline) and a bounded window of older ones. Each row runs
//! through the index rebuilder and the retention policy manager. The
//! traversal is fire-and-forget; failures are logged and never change the
//! outcome the writer already saw.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cql::{build_get_query, CqlPredicate, GetPlan};
use crate::driver::{
    each_row, Consistency, CqlValue, DriverError, ExecOptions, Executor, Row, RowHandler,
    STREAM_RETRIES,
};
use crate::engine::index::IndexRebuilder;
use crate::engine::retention::RevisionPolicyManager;
use crate::error::{Result, SedimentError};
use crate::schema::{SchemaInfo, DATA_CF};
use crate::types::Order;

pub(crate) struct BackgroundJob {
    pub executor: Executor,
    pub info: Arc<SchemaInfo>,
    pub keyspace: String,
    pub domain: String,
    pub consistency: Consistency,
    /// Primary key of the written row, without the revision column
    pub key: BTreeMap<String, CqlValue>,
    /// Revision the foreground write produced
    pub tid: Uuid,
    /// CQL LIMIT of the older-revision window
    pub scan_limit: i32,
}

pub(crate) async fn run(job: BackgroundJob) {
    if let Err(e) = run_inner(&job).await {
        tracing::error!(
            keyspace = %job.keyspace,
            domain = %job.domain,
            error = %e,
            "background update failed"
        );
    }
}

async fn run_inner(job: &BackgroundJob) -> Result<()> {
    let mut rebuilder = IndexRebuilder::new(
        job.executor.clone(),
        job.info.clone(),
        job.keyspace.clone(),
        job.domain.clone(),
        job.consistency,
    );
    let mut policy = RevisionPolicyManager::new(
        job.executor.clone(),
        job.info.clone(),
        job.keyspace.clone(),
        job.domain.clone(),
        job.consistency,
    );

    let exec_opts = ExecOptions {
        consistency: job.consistency,
        prepare: true,
        ..Default::default()
    };

    // Newer window: the written row plus at most one newer revision,
    // processed newest-first so the rebuilder sees its baseline first.
    let newer_stmt = build_get_query(
        &job.info,
        &job.keyspace,
        DATA_CF,
        &job.window_plan(CqlPredicate::Ge(CqlValue::Timeuuid(job.tid)), Order::Asc, 2),
    )?;
    let page = job.executor.execute(&newer_stmt, &exec_opts).await?;
    let mut newer: Vec<Row> = page.rows.into_iter().map(decorate_ttl).collect();
    newer.reverse();

    let mut written_row = None;
    for row in newer {
        rebuilder.handle(&row).await;
        if row.get(&job.info.tid).and_then(|v| v.as_timeuuid()) == Some(job.tid) {
            written_row = Some(row);
        }
    }
    if let Some(row) = written_row {
        policy.handle(&row).await;
    }

    // Older window: superseded revisions, streamed in natural (descending)
    // order through both handlers.
    let older_stmt = build_get_query(
        &job.info,
        &job.keyspace,
        DATA_CF,
        &job.window_plan(
            CqlPredicate::Lt(CqlValue::Timeuuid(job.tid)),
            Order::Desc,
            job.scan_limit,
        ),
    )?;
    let mut handler = WindowHandler {
        rebuilder,
        policy,
    };
    match each_row(
        &job.executor,
        &older_stmt,
        &exec_opts,
        STREAM_RETRIES,
        &mut handler,
    )
    .await
    {
        // A first write has no older revisions; a racing drop is also fine
        Err(SedimentError::Driver(DriverError::UnconfiguredTable(_))) => Ok(()),
        other => other,
    }
}

impl BackgroundJob {
    fn window_plan(&self, tid_predicate: CqlPredicate, order: Order, limit: i32) -> GetPlan {
        let mut predicates: BTreeMap<String, CqlPredicate> = self
            .key
            .iter()
            .map(|(k, v)| (k.clone(), CqlPredicate::Eq(v.clone())))
            .collect();
        predicates.insert(self.info.tid.clone(), tid_predicate);
        let mut plan = GetPlan {
            domain: Some(self.domain.clone()),
            predicates,
            // The retention re-write replays whole rows, so every attribute
            // is fetched, with its remaining TTL
            proj: None,
            order: BTreeMap::new(),
            limit: Some(limit),
            distinct: false,
            with_ttl: true,
        };
        plan.order.insert(self.info.tid.clone(), order);
        plan
    }
}

/// Fold the per-column `_ttl_<attr>` projections into a single `_ttl`
fn decorate_ttl(mut row: Row) -> Row {
    let mut max_ttl: Option<i32> = None;
    let ttl_cols: Vec<String> = row
        .keys()
        .filter(|k| k.starts_with("_ttl_"))
        .cloned()
        .collect();
    for col in ttl_cols {
        if let Some(ttl) = row.remove(&col).and_then(|v| v.as_int()) {
            max_ttl = Some(max_ttl.map_or(ttl, |m| m.max(ttl)));
        }
    }
    if let Some(ttl) = max_ttl {
        row.insert("_ttl".to_string(), CqlValue::Int(ttl));
    }
    row
}

struct WindowHandler {
    rebuilder: IndexRebuilder,
    policy: RevisionPolicyManager,
}

#[async_trait]
impl RowHandler for WindowHandler {
    async fn handle(&mut self, row: Row) -> Result<()> {
        let row = decorate_ttl(row);
        self.rebuilder.handle(&row).await;
        self.policy.handle(&row).await;
        Ok(())
    }
}
