//! Schema migration
//!
//! Migrations run in two phases: every migrator validates the transition
//! first (any failure aborts the whole migration before a single statement
//! runs), then the migrators that reported work apply it, in a fixed order:
//! backend, replication config, table, options, attributes, index.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::EngineConfig;
use crate::cql::{
    build_alter_keyspace, build_alter_table_add, build_alter_table_drop,
    build_alter_table_options, build_drop_legacy_domain_index, replication_options,
};
use crate::driver::{Consistency, ExecOptions, Executor};
use crate::error::{Result, SedimentError};
use crate::schema::{SchemaInfo, DATA_CF};
use crate::types::{Durability, IndexElement, TableOptions};

pub(crate) struct MigrationContext<'a> {
    pub executor: &'a Executor,
    pub config: &'a EngineConfig,
    pub keyspace: &'a str,
    pub consistency: Consistency,
    /// Keyspaces whose replication already matches the current config
    pub replication_updated: &'a DashMap<String, bool>,
}

impl MigrationContext<'_> {
    async fn execute(&self, stmt: &crate::driver::Statement) -> Result<()> {
        self.executor
            .execute(
                stmt,
                &ExecOptions {
                    consistency: self.consistency,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
trait Migrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the transition; `Ok(true)` means this migrator has work to do
    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool>;

    async fn migrate(
        &self,
        ctx: &MigrationContext<'_>,
        current: &SchemaInfo,
        proposed: &SchemaInfo,
    ) -> Result<()>;
}

/// Validate and apply a schema transition.
///
/// Any change to options, attributes, index structure or secondary indexes
/// must come with a strictly increased schema version.
pub(crate) async fn migrate_schema(
    ctx: &MigrationContext<'_>,
    current: &SchemaInfo,
    proposed: &SchemaInfo,
) -> Result<()> {
    let schema_changed = current.schema.options != proposed.schema.options
        || current.schema.attributes != proposed.schema.attributes
        || current.schema.index != proposed.schema.index
        || current.schema.secondary_indexes != proposed.schema.secondary_indexes;
    if schema_changed && proposed.schema.version <= current.schema.version {
        return Err(SedimentError::BadRequest(format!(
            "Schema change, but no version increment: the new version must be higher than {}",
            current.schema.version
        )));
    }

    let migrators: [&dyn Migrator; 6] = [
        &BackendMigrator,
        &ConfigMigrator,
        &TableMigrator,
        &OptionsMigrator,
        &AttributesMigrator,
        &IndexMigrator,
    ];

    let mut pending = Vec::new();
    for migrator in migrators {
        if migrator.validate(current, proposed)? {
            pending.push(migrator);
        }
    }
    for migrator in pending {
        tracing::info!(
            keyspace = %ctx.keyspace,
            migrator = migrator.name(),
            "applying schema migration step"
        );
        migrator.migrate(ctx, current, proposed).await?;
    }
    Ok(())
}

/// Physical-layout upgrades between backend versions
struct BackendMigrator;

#[async_trait]
impl Migrator for BackendMigrator {
    fn name(&self) -> &'static str {
        "backend"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        if proposed.backend_version < current.backend_version {
            return Err(SedimentError::BadRequest(format!(
                "Backend version downgrade from {} to {} is not supported",
                current.backend_version, proposed.backend_version
            )));
        }
        Ok(proposed.backend_version > current.backend_version)
    }

    async fn migrate(
        &self,
        ctx: &MigrationContext<'_>,
        current: &SchemaInfo,
        _proposed: &SchemaInfo,
    ) -> Result<()> {
        if current.backend_version < 2 {
            // v2 dropped the legacy native index on the tenant column
            ctx.execute(&build_drop_legacy_domain_index(ctx.keyspace))
                .await?;
        }
        Ok(())
    }
}

/// Replication placement updates when the replication config version moves
struct ConfigMigrator;

#[async_trait]
impl Migrator for ConfigMigrator {
    fn name(&self) -> &'static str {
        "config"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        if proposed.config_version < current.config_version {
            return Err(SedimentError::BadRequest(format!(
                "Replication config downgrade from {} to {} is not supported",
                current.config_version, proposed.config_version
            )));
        }
        Ok(proposed.config_version > current.config_version)
    }

    async fn migrate(
        &self,
        ctx: &MigrationContext<'_>,
        _current: &SchemaInfo,
        proposed: &SchemaInfo,
    ) -> Result<()> {
        if ctx.replication_updated.contains_key(ctx.keyspace) {
            return Ok(());
        }
        let durability = proposed
            .schema
            .options
            .as_ref()
            .map(|o| o.durability)
            .unwrap_or(Durability::Standard);
        let replication = replication_options(ctx.config, durability);
        ctx.execute(&build_alter_keyspace(ctx.keyspace, &replication))
            .await?;
        ctx.replication_updated
            .insert(ctx.keyspace.to_string(), true);
        Ok(())
    }
}

/// Table identity; renames are unsupported
struct TableMigrator;

#[async_trait]
impl Migrator for TableMigrator {
    fn name(&self) -> &'static str {
        "table"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        if current.schema.table != proposed.schema.table {
            return Err(SedimentError::BadRequest(format!(
                "Table renames are not supported: {} -> {}",
                current.schema.table, proposed.schema.table
            )));
        }
        Ok(false)
    }

    async fn migrate(
        &self,
        _ctx: &MigrationContext<'_>,
        _current: &SchemaInfo,
        _proposed: &SchemaInfo,
    ) -> Result<()> {
        Ok(())
    }
}

struct OptionsMigrator;

#[async_trait]
impl Migrator for OptionsMigrator {
    fn name(&self) -> &'static str {
        "options"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        Ok(current.schema.options != proposed.schema.options)
    }

    async fn migrate(
        &self,
        ctx: &MigrationContext<'_>,
        _current: &SchemaInfo,
        proposed: &SchemaInfo,
    ) -> Result<()> {
        let options = proposed.schema.options.clone().unwrap_or(TableOptions::default());
        if let Some(stmt) = build_alter_table_options(ctx.keyspace, DATA_CF, &options) {
            ctx.execute(&stmt).await?;
        }
        Ok(())
    }
}

struct AttributesMigrator;

impl AttributesMigrator {
    fn added<'a>(current: &SchemaInfo, proposed: &'a SchemaInfo) -> Vec<&'a String> {
        proposed
            .schema
            .attributes
            .keys()
            .filter(|a| !current.schema.attributes.contains_key(*a))
            .collect()
    }

    fn dropped<'a>(current: &'a SchemaInfo, proposed: &SchemaInfo) -> Vec<&'a String> {
        current
            .schema
            .attributes
            .keys()
            .filter(|a| !proposed.schema.attributes.contains_key(*a))
            .collect()
    }
}

#[async_trait]
impl Migrator for AttributesMigrator {
    fn name(&self) -> &'static str {
        "attributes"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        for attr in Self::dropped(current, proposed) {
            if current.i_key_map.contains_key(attr) {
                return Err(SedimentError::BadRequest(format!(
                    "Cannot drop key attribute {}",
                    attr
                )));
            }
            if current.attribute_indexes.contains_key(attr) {
                return Err(SedimentError::BadRequest(format!(
                    "Attribute {} is referenced by a secondary index and cannot be dropped",
                    attr
                )));
            }
        }
        Ok(!Self::added(current, proposed).is_empty()
            || !Self::dropped(current, proposed).is_empty())
    }

    async fn migrate(
        &self,
        ctx: &MigrationContext<'_>,
        current: &SchemaInfo,
        proposed: &SchemaInfo,
    ) -> Result<()> {
        for attr in Self::added(current, proposed) {
            let ty = &proposed.schema.attributes[attr];
            let is_static = proposed.static_key_map.contains_key(attr);
            ctx.execute(&build_alter_table_add(
                ctx.keyspace,
                DATA_CF,
                attr,
                ty,
                is_static,
            ))
            .await?;
        }
        for attr in Self::dropped(current, proposed) {
            ctx.execute(&build_alter_table_drop(ctx.keyspace, DATA_CF, attr))
                .await?;
        }
        Ok(())
    }
}

/// Index structure: only static elements may come or go. The hash/range
/// skeleton is frozen at creation and secondary indexes cannot be changed
/// online.
struct IndexMigrator;

impl IndexMigrator {
    fn key_elements(info: &SchemaInfo) -> Vec<&IndexElement> {
        info.schema.index.iter().filter(|e| e.is_key()).collect()
    }
}

#[async_trait]
impl Migrator for IndexMigrator {
    fn name(&self) -> &'static str {
        "index"
    }

    fn validate(&self, current: &SchemaInfo, proposed: &SchemaInfo) -> Result<bool> {
        if current.schema.secondary_indexes != proposed.schema.secondary_indexes {
            return Err(SedimentError::BadRequest(
                "Secondary index changes are not supported".to_string(),
            ));
        }
        if Self::key_elements(current) != Self::key_elements(proposed) {
            return Err(SedimentError::BadRequest(
                "The primary key structure cannot be changed".to_string(),
            ));
        }
        for attr in proposed.static_key_map.keys() {
            if !current.static_key_map.contains_key(attr)
                && current.schema.attributes.contains_key(attr)
            {
                return Err(SedimentError::BadRequest(format!(
                    "Cannot change the index on existing column {}",
                    attr
                )));
            }
        }
        for attr in current.static_key_map.keys() {
            if !proposed.static_key_map.contains_key(attr)
                && proposed.schema.attributes.contains_key(attr)
            {
                return Err(SedimentError::BadRequest(format!(
                    "Cannot demote static column {}",
                    attr
                )));
            }
        }
        Ok(current.static_key_map != proposed.static_key_map)
    }

    async fn migrate(
        &self,
        _ctx: &MigrationContext<'_>,
        _current: &SchemaInfo,
        _proposed: &SchemaInfo,
    ) -> Result<()> {
        // Column DDL for new static attributes is the attributes migrator's
        // job; nothing is left to do here
        Ok(())
    }
}
