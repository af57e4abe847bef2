//! Schema validation and derivation
//!
//! A user-supplied [`TableSchema`] is validated and then expanded into a
//! [`SchemaInfo`]: the internal form with the hidden `_domain` tenant key,
//! the `_del` tombstone marker, the revision column (`tid`), per-attribute
//! key maps, and one derived table per secondary index. The info also
//! carries a stable hash used to detect schema drift cheaply.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SedimentError};
use crate::types::{
    AttributeType, IndexElement, Order, RetentionPolicy, TableSchema, COMPRESSION_BLOCK_SIZES,
    MIN_GRACE_TTL,
};

/// Version of the physical layout this build writes
pub const BACKEND_VERSION: u32 = 2;

/// Hidden attribute holding the tenant domain
pub const DOMAIN_ATTR: &str = "_domain";

/// Hidden attribute marking a row as deleted
pub const DEL_ATTR: &str = "_del";

/// Hidden revision column used when the schema does not supply one
pub const TID_ATTR: &str = "_tid";

/// Column family holding table rows
pub const DATA_CF: &str = "data";

/// Column family holding per-table metadata (notably the schema row)
pub const META_CF: &str = "meta";

/// Column family name of a secondary index
pub fn index_cf_name(index: &str) -> String {
    format!("idx_{}_ever", index)
}

/// Internal, derived form of a table schema
#[derive(Debug, Clone, Serialize)]
pub struct SchemaInfo {
    /// The augmented schema: user attributes plus `_domain`, `_del` and,
    /// when injected, `_tid`
    pub schema: TableSchema,
    /// Name of the revision (MVCC clock) column
    pub tid: String,
    /// Partition and clustering attribute names, in key order
    #[serde(rename = "iKeys")]
    pub i_keys: Vec<String>,
    #[serde(rename = "iKeyMap")]
    pub i_key_map: BTreeMap<String, IndexElement>,
    #[serde(rename = "staticKeyMap")]
    pub static_key_map: BTreeMap<String, IndexElement>,
    /// Attribute name to the secondary indexes referencing it
    #[serde(rename = "attributeIndexes")]
    pub attribute_indexes: BTreeMap<String, Vec<String>>,
    /// Derived schema of each secondary-index column family
    #[serde(rename = "secondaryIndexTables")]
    pub secondary_index_tables: BTreeMap<String, SchemaInfo>,
    /// Stable drift-detection hash; excludes `_backend_version`
    pub hash: String,
    #[serde(rename = "_backend_version")]
    pub backend_version: u32,
    #[serde(rename = "_config_version")]
    pub config_version: u32,
}

impl SchemaInfo {
    /// Attribute type lookup on the augmented schema
    pub fn attribute_type(&self, attr: &str) -> Option<&AttributeType> {
        self.schema.attributes.get(attr)
    }

    /// Attributes declared by the augmented schema but not part of the key
    pub fn non_key_attributes(&self) -> impl Iterator<Item = (&String, &AttributeType)> {
        self.schema
            .attributes
            .iter()
            .filter(|(name, _)| !self.i_key_map.contains_key(*name))
    }
}

/// The JSON payload persisted in the `meta` column family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSchema {
    pub schema: TableSchema,
    #[serde(rename = "_backend_version")]
    pub backend_version: u32,
    #[serde(rename = "_config_version")]
    pub config_version: u32,
}

/// Validate a user schema and fill normalization defaults.
///
/// Fails when the primary index has no hash component, an indexed attribute
/// is undeclared, an attribute name collides with the hidden `_` namespace,
/// the retention policy is malformed, or the options are invalid.
pub fn validate_and_normalize(schema: TableSchema) -> Result<TableSchema> {
    if schema.table.is_empty() {
        return Err(SedimentError::Validation("Empty table name".to_string()));
    }
    for name in schema.attributes.keys() {
        if name.starts_with('_') {
            return Err(SedimentError::Validation(format!(
                "Attribute names starting with '_' are reserved: {}",
                name
            )));
        }
    }
    validate_index(&schema, &schema.index, true)?;
    for (name, elements) in &schema.secondary_indexes {
        if name.is_empty() {
            return Err(SedimentError::Validation(
                "Empty secondary index name".to_string(),
            ));
        }
        validate_index(&schema, elements, false)?;
    }
    validate_retention_policy(&schema.revision_retention_policy)?;
    if let Some(options) = &schema.options {
        for compression in &options.compression {
            if let Some(block_size) = compression.block_size {
                if !COMPRESSION_BLOCK_SIZES.contains(&block_size) {
                    return Err(SedimentError::Validation(format!(
                        "Invalid compression block size: {}",
                        block_size
                    )));
                }
            }
        }
    }
    Ok(schema)
}

fn validate_index(schema: &TableSchema, elements: &[IndexElement], primary: bool) -> Result<()> {
    let mut hash_seen = false;
    for element in elements {
        let attr = element.attribute();
        if !schema.attributes.contains_key(attr) {
            return Err(SedimentError::Validation(format!(
                "Index attribute not declared: {}",
                attr
            )));
        }
        match element {
            IndexElement::Hash { .. } => hash_seen = true,
            IndexElement::Proj { .. } if primary => {
                return Err(SedimentError::Validation(format!(
                    "proj elements are only valid in secondary indexes: {}",
                    attr
                )));
            }
            _ => {}
        }
    }
    if primary && !hash_seen {
        return Err(SedimentError::Validation(
            "Primary index needs at least one hash attribute".to_string(),
        ));
    }
    Ok(())
}

fn validate_retention_policy(policy: &RetentionPolicy) -> Result<()> {
    match policy {
        RetentionPolicy::All => Ok(()),
        RetentionPolicy::Latest { count, grace_ttl } => {
            if *count < 1 {
                return Err(SedimentError::Validation(
                    "Retention policy 'latest' needs count >= 1".to_string(),
                ));
            }
            if *grace_ttl < MIN_GRACE_TTL {
                return Err(SedimentError::Validation(format!(
                    "Retention grace_ttl must be at least {} seconds",
                    MIN_GRACE_TTL
                )));
            }
            Ok(())
        }
        RetentionPolicy::Interval {
            interval,
            count,
            grace_ttl,
        } => {
            if *interval == 0 || *count < 1 {
                return Err(SedimentError::Validation(
                    "Retention policy 'interval' needs interval > 0 and count >= 1".to_string(),
                ));
            }
            if *grace_ttl < MIN_GRACE_TTL {
                return Err(SedimentError::Validation(format!(
                    "Retention grace_ttl must be at least {} seconds",
                    MIN_GRACE_TTL
                )));
            }
            Ok(())
        }
    }
}

/// Derive the internal schema-info from a validated schema.
///
/// Non-meta tables get `_domain` prepended to the primary index and to every
/// secondary index, so one physical table serves many tenants. The revision
/// column is the schema's trailing descending `timeuuid` range key when it
/// has one; otherwise a hidden `_tid` range key is appended.
pub fn make_schema_info(schema: &TableSchema, is_meta: bool) -> Result<SchemaInfo> {
    make_schema_info_versioned(schema, is_meta, BACKEND_VERSION, 0)
}

/// As [`make_schema_info`], with explicit implementation versions. The
/// versions participate in the hash (`_backend_version` excepted), so the
/// engine fixes them before comparing infos.
pub fn make_schema_info_versioned(
    schema: &TableSchema,
    is_meta: bool,
    backend_version: u32,
    config_version: u32,
) -> Result<SchemaInfo> {
    let mut augmented = schema.clone();

    if !is_meta {
        augmented
            .attributes
            .insert(DOMAIN_ATTR.to_string(), AttributeType::String);
        augmented.index.insert(
            0,
            IndexElement::Hash {
                attribute: DOMAIN_ATTR.to_string(),
            },
        );
        for elements in augmented.secondary_indexes.values_mut() {
            elements.insert(
                0,
                IndexElement::Hash {
                    attribute: DOMAIN_ATTR.to_string(),
                },
            );
        }
    }

    augmented
        .attributes
        .insert(DEL_ATTR.to_string(), AttributeType::Timeuuid);

    let last_range = augmented.index.iter().rev().find_map(|e| match e {
        IndexElement::Range { attribute, order } => Some((attribute.clone(), *order)),
        _ => None,
    });
    let tid = match last_range {
        Some((attribute, Order::Desc))
            if augmented.attributes.get(&attribute) == Some(&AttributeType::Timeuuid) =>
        {
            attribute
        }
        _ => {
            augmented
                .attributes
                .insert(TID_ATTR.to_string(), AttributeType::Timeuuid);
            augmented.index.push(IndexElement::Range {
                attribute: TID_ATTR.to_string(),
                order: Order::Desc,
            });
            TID_ATTR.to_string()
        }
    };

    let (i_keys, i_key_map, static_key_map) = key_maps(&augmented.index)?;

    let mut attribute_indexes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, elements) in &augmented.secondary_indexes {
        for element in elements {
            let attr = element.attribute().to_string();
            let indexes = attribute_indexes.entry(attr).or_default();
            if !indexes.contains(name) {
                indexes.push(name.clone());
            }
        }
    }

    let mut info = SchemaInfo {
        schema: augmented,
        tid,
        i_keys,
        i_key_map,
        static_key_map,
        attribute_indexes,
        secondary_index_tables: BTreeMap::new(),
        hash: String::new(),
        backend_version,
        config_version,
    };

    let index_names: Vec<String> = info.schema.secondary_indexes.keys().cloned().collect();
    for name in index_names {
        let derived = make_index_info(&info, &name)?;
        info.secondary_index_tables.insert(name, derived);
    }

    info.hash = schema_hash(&info)?;
    Ok(info)
}

/// Derive the schema-info of one secondary-index column family.
///
/// The index keeps its own key structure; primary-key attributes of the
/// main table it does not already carry are promoted to descending range
/// keys, and the main table's revision column and `_del` ride along as
/// plain columns.
fn make_index_info(main: &SchemaInfo, index: &str) -> Result<SchemaInfo> {
    let elements = main.schema.secondary_indexes[index].clone();
    let mut attributes = BTreeMap::new();
    let mut index_elements = Vec::new();

    for element in &elements {
        let attr = element.attribute();
        let ty = main.attribute_type(attr).ok_or_else(|| {
            SedimentError::Validation(format!("Index attribute not declared: {}", attr))
        })?;
        attributes.insert(attr.to_string(), ty.clone());
        index_elements.push(element.clone());
    }

    for key in &main.i_keys {
        if *key == main.tid || attributes.contains_key(key) {
            continue;
        }
        let ty = main
            .attribute_type(key)
            .expect("primary key attribute is declared")
            .clone();
        attributes.insert(key.clone(), ty);
        index_elements.push(IndexElement::Range {
            attribute: key.clone(),
            order: Order::Desc,
        });
    }

    attributes.insert(main.tid.clone(), AttributeType::Timeuuid);
    attributes.insert(DEL_ATTR.to_string(), AttributeType::Timeuuid);

    let schema = TableSchema {
        table: index_cf_name(index),
        version: main.schema.version,
        attributes,
        index: index_elements,
        secondary_indexes: BTreeMap::new(),
        options: None,
        revision_retention_policy: RetentionPolicy::All,
    };

    let (i_keys, i_key_map, static_key_map) = key_maps(&schema.index)?;
    let mut info = SchemaInfo {
        schema,
        tid: main.tid.clone(),
        i_keys,
        i_key_map,
        static_key_map,
        attribute_indexes: BTreeMap::new(),
        secondary_index_tables: BTreeMap::new(),
        hash: String::new(),
        backend_version: main.backend_version,
        config_version: main.config_version,
    };
    info.hash = schema_hash(&info)?;
    Ok(info)
}

fn key_maps(
    elements: &[IndexElement],
) -> Result<(
    Vec<String>,
    BTreeMap<String, IndexElement>,
    BTreeMap<String, IndexElement>,
)> {
    let mut i_keys = Vec::new();
    let mut i_key_map = BTreeMap::new();
    let mut static_key_map = BTreeMap::new();
    for element in elements {
        let attr = element.attribute().to_string();
        match element {
            IndexElement::Hash { .. } | IndexElement::Range { .. } => {
                if i_key_map.insert(attr.clone(), element.clone()).is_some() {
                    return Err(SedimentError::Validation(format!(
                        "Duplicate index attribute: {}",
                        attr
                    )));
                }
                i_keys.push(attr);
            }
            IndexElement::Static { .. } => {
                static_key_map.insert(attr, element.clone());
            }
            IndexElement::Proj { .. } => {}
        }
    }
    Ok((i_keys, i_key_map, static_key_map))
}

/// Stable, key-sorted serialization of a schema-info with the backend
/// version removed. Logically identical schemas hash identically no matter
/// how their JSON was ordered.
pub fn schema_hash(info: &SchemaInfo) -> Result<String> {
    let mut value = serde_json::to_value(info)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("hash");
        map.remove("_backend_version");
    }
    Ok(value.to_string())
}

/// Schema-info of the `meta` column family: one row per key, clustered by
/// update time descending, with the schema row at `key = 'schema'`.
pub static META_INFO: Lazy<SchemaInfo> = Lazy::new(|| {
    let mut attributes = BTreeMap::new();
    attributes.insert("key".to_string(), AttributeType::String);
    attributes.insert("tid".to_string(), AttributeType::Timeuuid);
    attributes.insert("value".to_string(), AttributeType::Json);
    let schema = TableSchema {
        table: META_CF.to_string(),
        version: 1,
        attributes,
        index: vec![
            IndexElement::Hash {
                attribute: "key".to_string(),
            },
            IndexElement::Range {
                attribute: "tid".to_string(),
                order: Order::Desc,
            },
        ],
        secondary_indexes: BTreeMap::new(),
        options: None,
        revision_retention_policy: RetentionPolicy::All,
    };
    make_schema_info(&schema, true).expect("meta schema is valid")
});
