//! Storage engine
//!
//! Maps the logical, multi-tenant table API onto keyspaces and column
//! families of the wide-column store: request normalization, schema
//! caching, table lifecycle, reads with paging, revisioned writes, and the
//! fire-and-forget background maintenance that follows each write.

mod background;
mod index;
mod migration;
mod retention;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{EngineConfig, StorageGroup};
use crate::conv;
use crate::cql::{
    build_create_keyspace, build_create_table, build_delete_query, build_drop_keyspace,
    build_get_query, build_put_query, parse_predicate, replication_options, CqlPredicate,
    GetPlan, PutPlan, PutPlanCondition,
};
use crate::driver::{
    Consistency, CqlValue, Driver, DriverError, ExecOptions, Executor, Row, Statement,
};
use crate::error::{Result, SedimentError};
use crate::schema::{
    index_cf_name, make_schema_info_versioned, validate_and_normalize, SchemaInfo, StoredSchema,
    BACKEND_VERSION, DATA_CF, DEL_ATTR, META_CF, META_INFO,
};
use crate::types::{
    new_tid, parse_tid, tid_micros, DeleteRequest, GetRequest, GetResult, PutCondition,
    PutRequest, SchemaRecord, TableSchema,
};

/// Attempts for keyspace and column-family creation, which can race with
/// concurrent schema changes across instances
const SCHEMA_DDL_ATTEMPTS: u32 = 100;

/// The revisioned table storage engine
pub struct Engine {
    executor: Executor,
    config: EngineConfig,
    groups: Vec<Arc<StorageGroup>>,
    /// keyspace -> derived schema, invalidated on migration
    schema_cache: DashMap<String, Arc<SchemaInfo>>,
    /// (domain, table) -> keyspace name
    keyspace_cache: DashMap<String, String>,
    /// domain -> resolved storage group
    group_cache: DashMap<String, Arc<StorageGroup>>,
    /// keyspaces whose replication matches the running config
    replication_updated: DashMap<String, bool>,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct InternalRequest {
    domain: String,
    keyspace: String,
    consistency: Consistency,
    ttl: Option<u32>,
    info: Option<Arc<SchemaInfo>>,
}

impl Engine {
    pub fn new(driver: Arc<dyn Driver>, config: EngineConfig) -> Result<Self> {
        let groups = config
            .storage_groups
            .iter()
            .map(|g| StorageGroup::compile(g).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            executor: Executor::new(driver),
            config,
            groups,
            schema_cache: DashMap::new(),
            keyspace_cache: DashMap::new(),
            group_cache: DashMap::new(),
            replication_updated: DashMap::new(),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    // -----------------------------------------------------------------
    // Table lifecycle
    // -----------------------------------------------------------------

    /// Create a table, or migrate it when it already exists with a
    /// different schema. Re-creating with an identical schema is a no-op.
    pub async fn create_table(&self, domain: &str, schema: TableSchema) -> Result<()> {
        let schema = validate_and_normalize(schema)?;
        let keyspace = self.keyspace_for(domain, &schema.table)?;
        let consistency = self.config.default_consistency;
        let proposed =
            make_schema_info_versioned(&schema, false, BACKEND_VERSION, self.config.version)?;

        if let Some(current) = self.ensure_schema(&keyspace).await? {
            if current.hash == proposed.hash {
                tracing::debug!(%keyspace, "table exists with an identical schema");
                return Ok(());
            }
            let ctx = migration::MigrationContext {
                executor: &self.executor,
                config: &self.config,
                keyspace: &keyspace,
                consistency,
                replication_updated: &self.replication_updated,
            };
            migration::migrate_schema(&ctx, &current, &proposed).await?;
            self.persist_schema(&keyspace, &schema, consistency).await?;
            self.schema_cache.remove(&keyspace);
            tracing::info!(%keyspace, version = schema.version, "schema migrated");
            return Ok(());
        }

        let durability = schema
            .options
            .as_ref()
            .map(|o| o.durability)
            .unwrap_or_default();
        let replication = replication_options(&self.config, durability);
        let opts = ExecOptions {
            consistency,
            ..Default::default()
        };
        self.executor
            .execute_with_backoff(
                &build_create_keyspace(&keyspace, &replication),
                &opts,
                SCHEMA_DDL_ATTEMPTS,
            )
            .await?;
        self.executor
            .execute_with_backoff(
                &build_create_table(&META_INFO, &keyspace, META_CF),
                &opts,
                SCHEMA_DDL_ATTEMPTS,
            )
            .await?;
        self.executor
            .execute_with_backoff(
                &build_create_table(&proposed, &keyspace, DATA_CF),
                &opts,
                SCHEMA_DDL_ATTEMPTS,
            )
            .await?;
        for (name, idx_info) in &proposed.secondary_index_tables {
            self.executor
                .execute_with_backoff(
                    &build_create_table(idx_info, &keyspace, &index_cf_name(name)),
                    &opts,
                    SCHEMA_DDL_ATTEMPTS,
                )
                .await?;
        }
        self.persist_schema(&keyspace, &schema, consistency).await?;
        self.schema_cache.insert(keyspace.clone(), Arc::new(proposed));
        tracing::info!(%keyspace, table = %schema.table, "table created");
        Ok(())
    }

    /// Drop a table and everything stored under its keyspace
    pub async fn drop_table(&self, domain: &str, table: &str) -> Result<()> {
        let keyspace = self.keyspace_for(domain, table)?;
        let opts = ExecOptions {
            consistency: self.config.default_consistency,
            ..Default::default()
        };
        self.executor
            .execute(&build_drop_keyspace(&keyspace), &opts)
            .await?;
        self.schema_cache.remove(&keyspace);
        self.replication_updated.remove(&keyspace);
        tracing::info!(%keyspace, table, "table dropped");
        Ok(())
    }

    /// Fetch the stored logical schema and its update timestamp
    pub async fn get_table_schema(&self, domain: &str, table: &str) -> Result<SchemaRecord> {
        let keyspace = self.keyspace_for(domain, table)?;
        match self.fetch_stored_schema(&keyspace).await? {
            Some((tid, stored)) => Ok(SchemaRecord {
                tid: tid.to_string(),
                schema: stored.schema,
            }),
            None => Err(SedimentError::NotFound(format!(
                "Table {}.{} not found",
                domain, table
            ))),
        }
    }

    /// Drop a cached schema; the next request re-reads it from `meta`
    pub fn invalidate(&self, keyspace: &str) {
        self.schema_cache.remove(keyspace);
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    /// Read rows. Tombstoned revisions are filtered out; when the page
    /// fills up, `next` carries the continuation token.
    pub async fn get(&self, domain: &str, query: GetRequest) -> Result<GetResult> {
        let req = self
            .make_internal_request(domain, &query.table, query.consistency, None)
            .await?;
        let info = req.info.clone().ok_or_else(|| {
            SedimentError::NotFound(format!("Table {}.{} not found", domain, query.table))
        })?;

        let (target, cf): (&SchemaInfo, String) = match &query.index {
            Some(index) => (
                info.secondary_index_tables.get(index).ok_or_else(|| {
                    SedimentError::InvalidQuery(format!("Unknown secondary index: {}", index))
                })?,
                index_cf_name(index),
            ),
            None => (info.as_ref(), DATA_CF.to_string()),
        };

        let mut predicates = BTreeMap::new();
        for (attr, value) in &query.attributes {
            let ty = target.attribute_type(attr).ok_or_else(|| {
                SedimentError::InvalidQuery(format!(
                    "Only key attributes may be constrained; {} is not one of the key attributes",
                    attr
                ))
            })?;
            predicates.insert(attr.clone(), parse_predicate(attr, ty, value)?);
        }

        // Explicit projections still need the tombstone marker fetched so
        // deleted revisions can be filtered below
        let proj = query.proj.as_ref().map(|p| {
            let mut columns = p.columns();
            if !query.distinct && !columns.iter().any(|c| c == DEL_ATTR) {
                columns.push(DEL_ATTR.to_string());
            }
            columns
        });
        let plan = GetPlan {
            domain: Some(req.domain.clone()),
            predicates,
            proj,
            order: query.order.clone(),
            limit: None,
            distinct: query.distinct,
            with_ttl: query.with_ttl,
        };
        let stmt = build_get_query(target, &req.keyspace, &cf, &plan)?;

        let paging_state = match &query.next {
            Some(token) => Some(STANDARD.decode(token).map_err(|_| {
                SedimentError::InvalidQuery("Invalid continuation token".to_string())
            })?),
            None => None,
        };
        let page = self
            .executor
            .execute(
                &stmt,
                &ExecOptions {
                    consistency: req.consistency,
                    prepare: true,
                    fetch_size: query.limit,
                    paging_state,
                },
            )
            .await?;

        let mut items = Vec::with_capacity(page.rows.len());
        for row in page.rows {
            if row.get(DEL_ATTR).map_or(false, |v| !v.is_null()) {
                continue;
            }
            items.push(convert_row(target, row, query.with_ttl));
        }
        Ok(GetResult {
            items,
            next: page.paging_state.map(|state| STANDARD.encode(state)),
        })
    }

    // -----------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------

    /// Write one revision. The revision column is generated when absent,
    /// secondary-index rows ride in the same batch, and background
    /// maintenance starts after the acknowledgement.
    pub async fn put(&self, domain: &str, query: PutRequest) -> Result<()> {
        self.write_row(
            domain,
            &query.table,
            query.attributes,
            query.condition,
            query.timestamp,
            query.consistency,
            false,
        )
        .await
    }

    /// Logically delete the addressed revision by writing a tombstone.
    /// Readers filter it; the background updater propagates it to the
    /// secondary indexes.
    pub async fn delete(&self, domain: &str, query: DeleteRequest) -> Result<()> {
        self.write_row(
            domain,
            &query.table,
            query.attributes,
            None,
            None,
            query.consistency,
            true,
        )
        .await
    }

    /// Physically remove all revisions matched by a primary-key predicate.
    /// Maintenance only; regular deletes are tombstone writes.
    pub async fn purge(&self, domain: &str, query: DeleteRequest) -> Result<()> {
        let req = self
            .make_internal_request(domain, &query.table, query.consistency, None)
            .await?;
        let info = req.info.clone().ok_or_else(|| {
            SedimentError::NotFound(format!("Table {}.{} not found", domain, query.table))
        })?;

        let mut predicates = BTreeMap::new();
        for (attr, value) in &query.attributes {
            let ty = info.attribute_type(attr).ok_or_else(|| {
                SedimentError::InvalidQuery(format!(
                    "Only key attributes may be constrained; {} is not one of the key attributes",
                    attr
                ))
            })?;
            predicates.insert(attr.clone(), parse_predicate(attr, ty, value)?);
        }
        let stmt = build_delete_query(
            &info,
            &req.keyspace,
            DATA_CF,
            Some(&req.domain),
            &predicates,
        )?;
        tracing::info!(keyspace = %req.keyspace, "purging revisions");
        self.executor
            .execute(
                &stmt,
                &ExecOptions {
                    consistency: req.consistency,
                    prepare: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_row(
        &self,
        domain: &str,
        table: &str,
        mut attributes: BTreeMap<String, Value>,
        condition: Option<PutCondition>,
        timestamp_ms: Option<i64>,
        consistency: Option<Consistency>,
        tombstone: bool,
    ) -> Result<()> {
        let ttl = match attributes.remove("_ttl") {
            None => None,
            Some(v) => Some(v.as_u64().and_then(|t| u32::try_from(t).ok()).ok_or_else(
                || SedimentError::InvalidQuery("_ttl must be a positive integer".to_string()),
            )?),
        };
        let req = self
            .make_internal_request(domain, table, consistency, ttl)
            .await?;
        let info = req.info.clone().ok_or_else(|| {
            SedimentError::NotFound(format!("Table {}.{} not found", domain, table))
        })?;

        let tid = match attributes.remove(&info.tid) {
            Some(Value::String(s)) => parse_tid(&s)?,
            Some(Value::Null) | None => new_tid(),
            Some(other) => {
                return Err(SedimentError::InvalidQuery(format!(
                    "Invalid {} value: {}",
                    info.tid, other
                )))
            }
        };
        let timestamp = timestamp_ms
            .map(|ms| ms * 1000)
            .or_else(|| tid_micros(&tid));

        let mut encoded = BTreeMap::new();
        for (name, value) in &attributes {
            if name.starts_with('_') {
                return Err(SedimentError::InvalidQuery(format!(
                    "Unknown attribute {}",
                    name
                )));
            }
            let ty = info.attribute_type(name).ok_or_else(|| {
                SedimentError::InvalidQuery(format!("Unknown attribute {}", name))
            })?;
            encoded.insert(name.clone(), conv::write_value(ty, value)?);
        }
        encoded.insert(info.tid.clone(), CqlValue::Timeuuid(tid));
        if tombstone {
            encoded.insert(DEL_ATTR.to_string(), CqlValue::Timeuuid(new_tid()));
        }

        let put_condition = match condition {
            None => None,
            Some(PutCondition::Token(token)) if token == "not exists" => {
                Some(PutPlanCondition::NotExists)
            }
            Some(PutCondition::Token(token)) => {
                return Err(SedimentError::InvalidQuery(format!(
                    "Unsupported if condition: {}",
                    token
                )))
            }
            Some(PutCondition::If(predicates)) => {
                let mut parsed = BTreeMap::new();
                for (attr, value) in &predicates {
                    let ty = info.attribute_type(attr).ok_or_else(|| {
                        SedimentError::InvalidQuery(format!("Unknown attribute {}", attr))
                    })?;
                    parsed.insert(attr.clone(), parse_predicate(attr, ty, value)?);
                }
                Some(PutPlanCondition::If(parsed))
            }
        };

        let mut statements = Vec::new();
        for (name, idx_info) in &info.secondary_index_tables {
            if let Some(stmt) = self.index_put_statement(
                &req, &info, idx_info, name, &encoded, timestamp,
            )? {
                statements.push(stmt);
            }
        }
        let data_plan = PutPlan {
            domain: Some(req.domain.clone()),
            attributes: encoded.clone(),
            condition: put_condition,
            timestamp,
            ttl: req.ttl,
        };
        statements.push(build_put_query(&info, &req.keyspace, DATA_CF, &data_plan)?);

        let opts = ExecOptions {
            consistency: req.consistency,
            prepare: true,
            ..Default::default()
        };
        if statements.len() == 1 {
            self.executor.execute(&statements[0], &opts).await?;
        } else {
            tracing::debug!(
                keyspace = %req.keyspace,
                statements = statements.len(),
                "submitting write as a logged batch"
            );
            self.executor.batch(&statements, &opts).await?;
        }

        self.spawn_background_updates(&req, &info, &encoded, tid);
        Ok(())
    }

    /// The foreground upsert into one secondary index, restricted to the
    /// attributes that index carries. Skipped entirely when the write does
    /// not touch the index's partition key.
    fn index_put_statement(
        &self,
        req: &InternalRequest,
        info: &SchemaInfo,
        idx_info: &SchemaInfo,
        index: &str,
        encoded: &BTreeMap<String, CqlValue>,
        timestamp: Option<i64>,
    ) -> Result<Option<Statement>> {
        use crate::schema::DOMAIN_ATTR;
        use crate::types::IndexElement;

        let mut attributes = BTreeMap::new();
        for attr in idx_info.schema.attributes.keys() {
            if attr == DOMAIN_ATTR {
                continue;
            }
            match encoded.get(attr) {
                Some(value) => {
                    attributes.insert(attr.clone(), value.clone());
                }
                None if idx_info.i_key_map.contains_key(attr) => {
                    attributes.insert(attr.clone(), CqlValue::Null);
                }
                None => {}
            }
        }
        let hash_unset = idx_info.schema.index.iter().any(|e| match e {
            IndexElement::Hash { attribute } if attribute != DOMAIN_ATTR => attributes
                .get(attribute)
                .map_or(true, |v| v.is_null()),
            _ => false,
        });
        if hash_unset {
            return Ok(None);
        }
        let plan = PutPlan {
            domain: Some(req.domain.clone()),
            attributes,
            condition: None,
            timestamp,
            ttl: req.ttl,
        };
        build_put_query(idx_info, &req.keyspace, &index_cf_name(index), &plan).map(Some)
    }

    fn spawn_background_updates(
        &self,
        req: &InternalRequest,
        info: &Arc<SchemaInfo>,
        encoded: &BTreeMap<String, CqlValue>,
        tid: Uuid,
    ) {
        use crate::schema::DOMAIN_ATTR;

        if info.secondary_index_tables.is_empty()
            && !info.schema.revision_retention_policy.is_active()
        {
            return;
        }
        let key: BTreeMap<String, CqlValue> = info
            .i_keys
            .iter()
            .filter(|k| *k != &info.tid && *k != DOMAIN_ATTR)
            .filter_map(|k| encoded.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let job = background::BackgroundJob {
            executor: self.executor.clone(),
            info: info.clone(),
            keyspace: req.keyspace.clone(),
            domain: req.domain.clone(),
            consistency: req.consistency,
            key,
            tid,
            scan_limit: self.config.revision_scan_limit,
        };
        let handle = tokio::spawn(background::run(job));
        self.background_tasks
            .lock()
            .expect("background task list poisoned")
            .push(handle);
    }

    /// Wait for all in-flight background updates. Useful for maintenance
    /// scripts and tests; normal operation never blocks on this.
    pub async fn quiesce(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self
                .background_tasks
                .lock()
                .expect("background task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    // -----------------------------------------------------------------
    // Normalization and schema access
    // -----------------------------------------------------------------

    async fn make_internal_request(
        &self,
        domain: &str,
        table: &str,
        consistency: Option<Consistency>,
        ttl: Option<u32>,
    ) -> Result<InternalRequest> {
        let keyspace = self.keyspace_for(domain, table)?;
        let info = self.ensure_schema(&keyspace).await?;
        Ok(InternalRequest {
            domain: domain.to_string(),
            keyspace,
            consistency: consistency.unwrap_or(self.config.default_consistency),
            ttl,
            info,
        })
    }

    fn keyspace_for(&self, domain: &str, table: &str) -> Result<String> {
        let cache_key = serde_json::to_string(&(domain, table))?;
        if let Some(keyspace) = self.keyspace_cache.get(&cache_key) {
            return Ok(keyspace.clone());
        }
        let group = self.resolve_group(domain)?;
        let keyspace = crate::ident::keyspace_name(&group.name, table);
        self.keyspace_cache.insert(cache_key, keyspace.clone());
        Ok(keyspace)
    }

    fn resolve_group(&self, domain: &str) -> Result<Arc<StorageGroup>> {
        if let Some(group) = self.group_cache.get(domain) {
            return Ok(group.clone());
        }
        let group = self
            .groups
            .iter()
            .find(|g| g.matches(domain))
            .cloned()
            .ok_or_else(|| {
                SedimentError::Validation(format!(
                    "No storage group configured for domain {}",
                    domain
                ))
            })?;
        self.group_cache.insert(domain.to_string(), group.clone());
        Ok(group)
    }

    /// Populate the schema cache for a keyspace, fetching from `meta` on a
    /// miss. `None` means the table does not exist yet.
    async fn ensure_schema(&self, keyspace: &str) -> Result<Option<Arc<SchemaInfo>>> {
        if let Some(info) = self.schema_cache.get(keyspace) {
            return Ok(Some(info.clone()));
        }
        match self.fetch_stored_schema(keyspace).await? {
            Some((_, stored)) => {
                let info = Arc::new(make_schema_info_versioned(
                    &stored.schema,
                    false,
                    stored.backend_version,
                    stored.config_version,
                )?);
                self.schema_cache.insert(keyspace.to_string(), info.clone());
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    /// Read the schema row from `meta`. A missing keyspace or column
    /// family means the table is new; other driver errors propagate.
    async fn fetch_stored_schema(
        &self,
        keyspace: &str,
    ) -> Result<Option<(Uuid, StoredSchema)>> {
        let mut predicates = BTreeMap::new();
        predicates.insert(
            "key".to_string(),
            CqlPredicate::Eq(CqlValue::Text("schema".to_string())),
        );
        let plan = GetPlan {
            domain: None,
            predicates,
            proj: None,
            order: BTreeMap::new(),
            limit: Some(1),
            distinct: false,
            with_ttl: false,
        };
        let stmt = build_get_query(&META_INFO, keyspace, META_CF, &plan)?;
        let page = match self
            .executor
            .execute(
                &stmt,
                &ExecOptions {
                    consistency: self.config.default_consistency,
                    prepare: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(page) => page,
            Err(SedimentError::Driver(DriverError::UnconfiguredTable(_))) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(row) = page.rows.into_iter().next() else {
            return Ok(None);
        };
        let tid = row
            .get("tid")
            .and_then(|v| v.as_timeuuid())
            .ok_or_else(|| SedimentError::Internal("Schema row without tid".to_string()))?;
        let value = match row.get("value") {
            Some(CqlValue::Text(s)) => s.clone(),
            _ => {
                return Err(SedimentError::Internal(
                    "Schema row without value".to_string(),
                ))
            }
        };
        let stored: StoredSchema = serde_json::from_str(&value)?;
        Ok(Some((tid, stored)))
    }

    async fn persist_schema(
        &self,
        keyspace: &str,
        schema: &TableSchema,
        consistency: Consistency,
    ) -> Result<()> {
        let stored = StoredSchema {
            schema: schema.clone(),
            backend_version: BACKEND_VERSION,
            config_version: self.config.version,
        };
        let mut attributes = BTreeMap::new();
        attributes.insert("key".to_string(), CqlValue::Text("schema".to_string()));
        attributes.insert("tid".to_string(), CqlValue::Timeuuid(new_tid()));
        attributes.insert(
            "value".to_string(),
            CqlValue::Text(serde_json::to_string(&stored)?),
        );
        let plan = PutPlan {
            domain: None,
            attributes,
            condition: None,
            timestamp: None,
            ttl: None,
        };
        let stmt = build_put_query(&META_INFO, keyspace, META_CF, &plan)?;
        self.executor
            .execute(
                &stmt,
                &ExecOptions {
                    consistency,
                    prepare: true,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

/// Convert a fetched row to its API shape: hidden columns are stripped,
/// values pass through their read conversions, and the TTL decoration is
/// folded into a single `_ttl`.
fn convert_row(info: &SchemaInfo, row: Row, with_ttl: bool) -> BTreeMap<String, Value> {
    let mut ttl_max: Option<i32> = None;
    let mut item = BTreeMap::new();
    for (column, value) in row {
        if let Some(ttl) = column
            .strip_prefix("_ttl_")
            .and_then(|_| value.as_int())
        {
            ttl_max = Some(ttl_max.map_or(ttl, |m| m.max(ttl)));
            continue;
        }
        if column.starts_with('_') {
            continue;
        }
        let converted = match info.attribute_type(&column) {
            Some(ty) => conv::read_value(ty, value),
            None => Value::Null,
        };
        item.insert(column, converted);
    }
    if with_ttl {
        if let Some(ttl) = ttl_max {
            item.insert("_ttl".to_string(), Value::from(ttl));
        }
    }
    item
}
