//! DDL builders: keyspaces, column families, and schema alterations

use crate::config::EngineConfig;
use crate::driver::Statement;
use crate::ident;
use crate::schema::{SchemaInfo, DATA_CF};
use crate::types::{AttributeType, Durability, IndexElement, TableOptions};

/// Replication options for a keyspace.
///
/// Standard durability spreads three replicas over every configured
/// datacenter; low durability is single-replica simple placement for
/// scratch and test data.
pub fn replication_options(config: &EngineConfig, durability: Durability) -> String {
    match durability {
        Durability::Low => "{'class': 'SimpleStrategy', 'replication_factor': 1}".to_string(),
        Durability::Standard => {
            let mut parts = vec!["'class': 'NetworkTopologyStrategy'".to_string()];
            for dc in &config.datacenters {
                parts.push(format!("'{}': 3", dc));
            }
            format!("{{{}}}", parts.join(", "))
        }
    }
}

pub fn build_create_keyspace(keyspace: &str, replication: &str) -> Statement {
    Statement::new(
        format!(
            "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {}",
            ident::quote(keyspace),
            replication
        ),
        Vec::new(),
    )
}

pub fn build_drop_keyspace(keyspace: &str) -> Statement {
    Statement::new(
        format!("DROP KEYSPACE IF EXISTS {}", ident::quote(keyspace)),
        Vec::new(),
    )
}

pub fn build_alter_keyspace(keyspace: &str, replication: &str) -> Statement {
    Statement::new(
        format!(
            "ALTER KEYSPACE {} WITH replication = {}",
            ident::quote(keyspace),
            replication
        ),
        Vec::new(),
    )
}

/// `WITH` parts generated from validated table options
pub fn table_options_cql(options: &TableOptions) -> Vec<String> {
    let mut parts = Vec::new();
    if let Some(compression) = options.compression.first() {
        let mut opts = vec![format!(
            "'sstable_compression': '{}'",
            compression.algorithm.sstable_compression()
        )];
        if let Some(block_size) = compression.block_size {
            opts.push(format!("'chunk_length_kb': {}", block_size));
        }
        parts.push(format!("compression = {{{}}}", opts.join(", ")));
    }
    if let Some(ttl) = options.default_time_to_live {
        parts.push(format!("default_time_to_live = {}", ttl));
    }
    parts
}

/// Create one column family from its derived schema-info
pub fn build_create_table(info: &SchemaInfo, keyspace: &str, cf: &str) -> Statement {
    let mut columns = Vec::new();
    for (name, ty) in &info.schema.attributes {
        let mut column = format!("{} {}", ident::quote(name), ty.cql_type());
        if info.static_key_map.contains_key(name) {
            column.push_str(" static");
        }
        columns.push(column);
    }

    let mut hash_keys = Vec::new();
    let mut range_keys = Vec::new();
    for element in &info.schema.index {
        match element {
            IndexElement::Hash { attribute } => hash_keys.push(ident::quote(attribute)),
            IndexElement::Range { attribute, .. } => range_keys.push(ident::quote(attribute)),
            _ => {}
        }
    }
    let mut primary_key = format!("({})", hash_keys.join(", "));
    if !range_keys.is_empty() {
        primary_key = format!("{}, {}", primary_key, range_keys.join(", "));
    }
    columns.push(format!("PRIMARY KEY ({})", primary_key));

    let mut with_parts = Vec::new();
    let clustering: Vec<String> = info
        .schema
        .index
        .iter()
        .filter_map(|e| match e {
            IndexElement::Range { attribute, order } => {
                Some(format!("{} {}", ident::quote(attribute), order.cql()))
            }
            _ => None,
        })
        .collect();
    if !clustering.is_empty() {
        with_parts.push(format!("CLUSTERING ORDER BY ({})", clustering.join(", ")));
    }
    if let Some(options) = &info.schema.options {
        with_parts.extend(table_options_cql(options));
    }

    let mut cql = format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        ident::quote(keyspace),
        ident::quote(cf),
        columns.join(", ")
    );
    if !with_parts.is_empty() {
        cql.push_str(&format!(" WITH {}", with_parts.join(" AND ")));
    }
    Statement::new(cql, Vec::new())
}

pub fn build_alter_table_add(
    keyspace: &str,
    cf: &str,
    attribute: &str,
    ty: &AttributeType,
    is_static: bool,
) -> Statement {
    Statement::new(
        format!(
            "ALTER TABLE {}.{} ADD {} {}{}",
            ident::quote(keyspace),
            ident::quote(cf),
            ident::quote(attribute),
            ty.cql_type(),
            if is_static { " static" } else { "" }
        ),
        Vec::new(),
    )
}

pub fn build_alter_table_drop(keyspace: &str, cf: &str, attribute: &str) -> Statement {
    Statement::new(
        format!(
            "ALTER TABLE {}.{} DROP {}",
            ident::quote(keyspace),
            ident::quote(cf),
            ident::quote(attribute)
        ),
        Vec::new(),
    )
}

/// `ALTER TABLE ... WITH <options>`; `None` when the options carry nothing
pub fn build_alter_table_options(
    keyspace: &str,
    cf: &str,
    options: &TableOptions,
) -> Option<Statement> {
    let parts = table_options_cql(options);
    if parts.is_empty() {
        return None;
    }
    Some(Statement::new(
        format!(
            "ALTER TABLE {}.{} WITH {}",
            ident::quote(keyspace),
            ident::quote(cf),
            parts.join(" AND ")
        ),
        Vec::new(),
    ))
}

/// Early layouts kept a native secondary index on `_domain`; it is dropped
/// when migrating them forward.
pub fn build_drop_legacy_domain_index(keyspace: &str) -> Statement {
    Statement::new(
        format!(
            "DROP INDEX IF EXISTS {}.{}",
            ident::quote(keyspace),
            ident::quote(&format!("{}__domain_idx", DATA_CF))
        ),
        Vec::new(),
    )
}
