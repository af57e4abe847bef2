//! Secondary-index maintenance
//!
//! The rebuilder consumes a revision stream in descending `tid` order and
//! keeps each secondary index convergent with it. Index writes always carry
//! the source row's `tid` as the driver write timestamp, so replays and
//! out-of-order rebuilds settle on the same state: last-writer-wins is by
//! revision, not by wall clock.

use std::collections::BTreeMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::cql::{build_put_query, PutPlan};
use crate::driver::{Consistency, CqlValue, ExecOptions, Executor, Row};
use crate::error::Result;
use crate::schema::{index_cf_name, SchemaInfo, DEL_ATTR, DOMAIN_ATTR};
use crate::types::{tid_micros, IndexElement};

pub(crate) struct IndexRebuilder {
    executor: Executor,
    info: Arc<SchemaInfo>,
    keyspace: String,
    domain: String,
    consistency: Consistency,
    /// Attributes referenced by any secondary index, minus primary keys
    secondary_keys: Vec<String>,
    prev_row: Option<Row>,
}

impl IndexRebuilder {
    pub fn new(
        executor: Executor,
        info: Arc<SchemaInfo>,
        keyspace: String,
        domain: String,
        consistency: Consistency,
    ) -> Self {
        let secondary_keys = info
            .attribute_indexes
            .keys()
            .filter(|attr| !info.i_key_map.contains_key(*attr))
            .cloned()
            .collect();
        Self {
            executor,
            info,
            keyspace,
            domain,
            consistency,
            secondary_keys,
            prev_row: None,
        }
    }

    /// Process one row. Index maintenance must never fail the write that
    /// triggered it, so errors are logged and swallowed here.
    pub async fn handle(&mut self, row: &Row) {
        if let Err(e) = self.handle_inner(row).await {
            tracing::error!(
                keyspace = %self.keyspace,
                domain = %self.domain,
                error = %e,
                "secondary index update failed"
            );
        }
    }

    async fn handle_inner(&mut self, row: &Row) -> Result<()> {
        let (diff, deletion_mark) = self.diff(row);
        if !diff.is_empty() {
            for index in self.touched_indexes(&diff) {
                self.upsert_index_row(&index, row, deletion_mark).await?;
            }
        }
        self.prev_row = Some(row.clone());
        Ok(())
    }

    /// Attributes that changed between this row and the previously handled
    /// (newer) one, restricted to secondary keys, plus the tombstone mark to
    /// apply. A partition change or a missing baseline makes the whole row
    /// the diff.
    fn diff(&self, row: &Row) -> (Vec<String>, Option<Uuid>) {
        let row_tid = self.row_tid(row);
        let tombstone = row
            .get(DEL_ATTR)
            .map_or(false, |v| !v.is_null())
            .then_some(row_tid)
            .flatten();

        let same_partition = match &self.prev_row {
            Some(prev) => self
                .info
                .i_keys
                .iter()
                .filter(|k| **k != self.info.tid)
                .all(|k| row.get(k) == prev.get(k)),
            None => false,
        };

        if !same_partition {
            // Newest row of its partition: refresh every index entry
            return (self.secondary_keys.clone(), tombstone);
        }

        let prev = self.prev_row.as_ref().expect("same partition implies prev");
        let diff: Vec<String> = self
            .secondary_keys
            .iter()
            .filter(|attr| row.get(*attr) != prev.get(*attr))
            .cloned()
            .collect();

        // An older revision whose indexed value was superseded no longer
        // backs a live index entry; mark it with its own tid.
        let mark = if tombstone.is_some() {
            tombstone
        } else if !diff.is_empty() {
            row_tid
        } else {
            None
        };
        (diff, mark)
    }

    fn row_tid(&self, row: &Row) -> Option<Uuid> {
        row.get(&self.info.tid).and_then(|v| v.as_timeuuid())
    }

    fn touched_indexes(&self, diff: &[String]) -> Vec<String> {
        let mut indexes = Vec::new();
        for attr in diff {
            if let Some(names) = self.info.attribute_indexes.get(attr) {
                for name in names {
                    if !indexes.contains(name) {
                        indexes.push(name.clone());
                    }
                }
            }
        }
        indexes
    }

    async fn upsert_index_row(
        &self,
        index: &str,
        row: &Row,
        deletion_mark: Option<Uuid>,
    ) -> Result<()> {
        let idx_info = &self.info.secondary_index_tables[index];

        let mut attributes = BTreeMap::new();
        for attr in idx_info.schema.attributes.keys() {
            if attr == DOMAIN_ATTR {
                continue;
            }
            // Required key attributes fall back to null when the source row
            // never carried them
            attributes.insert(attr.clone(), row.get(attr).cloned().unwrap_or(CqlValue::Null));
        }
        if let Some(mark) = deletion_mark {
            attributes.insert(DEL_ATTR.to_string(), CqlValue::Timeuuid(mark));
        }

        // Nothing to index when the partition key itself is absent
        let hash_unset = idx_info.schema.index.iter().any(|e| match e {
            IndexElement::Hash { attribute } if attribute != DOMAIN_ATTR => attributes
                .get(attribute)
                .map_or(true, |v| v.is_null()),
            _ => false,
        });
        if hash_unset {
            tracing::debug!(index, "skipping index row without a hash key value");
            return Ok(());
        }

        let timestamp = self.row_tid(row).and_then(|tid| tid_micros(&tid));
        let plan = PutPlan {
            domain: Some(self.domain.clone()),
            attributes,
            condition: None,
            timestamp,
            ttl: None,
        };
        let stmt = build_put_query(idx_info, &self.keyspace, &index_cf_name(index), &plan)?;
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
