//! Core types for Sediment
//!
//! The logical, user-facing table model: attribute types, index elements,
//! retention policies, and the request/response shapes consumed by the
//! engine. The derived (internal) schema lives in [`crate::schema`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::{Context, Timestamp, Uuid};

use crate::driver::Consistency;
use crate::error::{Result, SedimentError};

/// The closed set of attribute types a table may declare.
///
/// Every scalar type also exists in a `set<T>` form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeType {
    Blob,
    String,
    Int,
    Varint,
    Long,
    Decimal,
    Double,
    Float,
    Boolean,
    Timestamp,
    Timeuuid,
    Uuid,
    Json,
    Set(Box<AttributeType>),
}

impl AttributeType {
    /// Whether values of this type are collections
    pub fn is_collection(&self) -> bool {
        matches!(self, AttributeType::Set(_))
    }

    /// The CQL column type for this attribute
    pub fn cql_type(&self) -> String {
        match self {
            AttributeType::Blob => "blob".to_string(),
            AttributeType::String => "text".to_string(),
            AttributeType::Int => "int".to_string(),
            AttributeType::Varint => "varint".to_string(),
            AttributeType::Long => "bigint".to_string(),
            AttributeType::Decimal => "decimal".to_string(),
            AttributeType::Double => "double".to_string(),
            AttributeType::Float => "float".to_string(),
            AttributeType::Boolean => "boolean".to_string(),
            AttributeType::Timestamp => "timestamp".to_string(),
            AttributeType::Timeuuid => "timeuuid".to_string(),
            AttributeType::Uuid => "uuid".to_string(),
            AttributeType::Json => "text".to_string(),
            AttributeType::Set(inner) => format!("set<{}>", inner.cql_type()),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeType::Blob => write!(f, "blob"),
            AttributeType::String => write!(f, "string"),
            AttributeType::Int => write!(f, "int"),
            AttributeType::Varint => write!(f, "varint"),
            AttributeType::Long => write!(f, "long"),
            AttributeType::Decimal => write!(f, "decimal"),
            AttributeType::Double => write!(f, "double"),
            AttributeType::Float => write!(f, "float"),
            AttributeType::Boolean => write!(f, "boolean"),
            AttributeType::Timestamp => write!(f, "timestamp"),
            AttributeType::Timeuuid => write!(f, "timeuuid"),
            AttributeType::Uuid => write!(f, "uuid"),
            AttributeType::Json => write!(f, "json"),
            AttributeType::Set(inner) => write!(f, "set<{}>", inner),
        }
    }
}

impl FromStr for AttributeType {
    type Err = SedimentError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(inner) = s.strip_prefix("set<").and_then(|r| r.strip_suffix('>')) {
            let elem = inner.parse::<AttributeType>()?;
            if elem.is_collection() {
                return Err(SedimentError::Validation(format!(
                    "Nested collection type not supported: {}",
                    s
                )));
            }
            return Ok(AttributeType::Set(Box::new(elem)));
        }
        match s {
            "blob" => Ok(AttributeType::Blob),
            "string" => Ok(AttributeType::String),
            "int" => Ok(AttributeType::Int),
            "varint" => Ok(AttributeType::Varint),
            "long" => Ok(AttributeType::Long),
            "decimal" => Ok(AttributeType::Decimal),
            "double" => Ok(AttributeType::Double),
            "float" => Ok(AttributeType::Float),
            "boolean" => Ok(AttributeType::Boolean),
            "timestamp" => Ok(AttributeType::Timestamp),
            "timeuuid" => Ok(AttributeType::Timeuuid),
            "uuid" => Ok(AttributeType::Uuid),
            "json" => Ok(AttributeType::Json),
            _ => Err(SedimentError::Validation(format!(
                "Unknown attribute type: {}",
                s
            ))),
        }
    }
}

impl Serialize for AttributeType {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AttributeType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = std::string::String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// Sort direction of a range (clustering) key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    Asc,
    #[default]
    Desc,
}

impl Order {
    pub fn reversed(self) -> Order {
        match self {
            Order::Asc => Order::Desc,
            Order::Desc => Order::Asc,
        }
    }

    pub fn cql(self) -> &'static str {
        match self {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        }
    }
}

/// One element of a primary or secondary index definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IndexElement {
    /// Partition key component
    Hash { attribute: String },
    /// Clustering key component. A missing order defaults to descending.
    Range {
        attribute: String,
        #[serde(default)]
        order: Order,
    },
    /// Column shared across all rows of a partition
    Static { attribute: String },
    /// Materialized (projected) column of a secondary index
    Proj { attribute: String },
}

impl IndexElement {
    pub fn attribute(&self) -> &str {
        match self {
            IndexElement::Hash { attribute }
            | IndexElement::Range { attribute, .. }
            | IndexElement::Static { attribute }
            | IndexElement::Proj { attribute } => attribute,
        }
    }

    /// Whether this element contributes to the primary key
    pub fn is_key(&self) -> bool {
        matches!(self, IndexElement::Hash { .. } | IndexElement::Range { .. })
    }
}

/// Grace periods below this are rejected: they would race the background
/// updater itself.
pub const MIN_GRACE_TTL: u32 = 10;

/// Per-table revision retention policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep every revision forever
    #[default]
    All,
    /// Keep the newest `count` revisions; older ones expire `grace_ttl`
    /// seconds after being superseded
    Latest { count: u32, grace_ttl: u32 },
    /// Keep the newest `count` revisions plus one revision per `interval`
    /// milliseconds of history
    Interval {
        interval: u64,
        count: u32,
        grace_ttl: u32,
    },
}

impl RetentionPolicy {
    /// Whether this policy ever expires anything
    pub fn is_active(&self) -> bool {
        !matches!(self, RetentionPolicy::All)
    }
}

/// Write durability of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    Low,
    #[default]
    Standard,
}

/// Compression algorithms the store accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Lz4,
    Deflate,
    Snappy,
}

impl CompressionAlgorithm {
    pub fn sstable_compression(&self) -> &'static str {
        match self {
            CompressionAlgorithm::Lz4 => "LZ4Compressor",
            CompressionAlgorithm::Deflate => "DeflateCompressor",
            CompressionAlgorithm::Snappy => "SnappyCompressor",
        }
    }
}

/// One compression choice; the first valid entry wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionOption {
    pub algorithm: CompressionAlgorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
}

/// Valid compression block sizes in KB
pub const COMPRESSION_BLOCK_SIZES: [u32; 5] = [64, 128, 256, 512, 1024];

/// Table-level options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TableOptions {
    #[serde(default)]
    pub durability: Durability,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compression: Vec<CompressionOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_time_to_live: Option<u32>,
}

/// A logical table schema as supplied by the user and persisted in `meta`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    /// User-facing schema version; must strictly increase on any change
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub attributes: BTreeMap<String, AttributeType>,
    pub index: Vec<IndexElement>,
    #[serde(
        default,
        rename = "secondaryIndexes",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub secondary_indexes: BTreeMap<String, Vec<IndexElement>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<TableOptions>,
    #[serde(default, rename = "revisionRetentionPolicy")]
    pub revision_retention_policy: RetentionPolicy,
}

fn default_schema_version() -> u32 {
    1
}

/// Attribute projection of a read: one column or several
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Projection {
    One(String),
    Many(Vec<String>),
}

impl Projection {
    pub fn columns(&self) -> Vec<String> {
        match self {
            Projection::One(c) => vec![c.clone()],
            Projection::Many(cs) => cs.clone(),
        }
    }
}

/// A read request against a logical table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetRequest {
    pub table: String,
    /// Predicates: attribute to bare value (equality) or operator object
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proj: Option<Projection>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub order: BTreeMap<String, Order>,
    /// Driver page size, not a CQL LIMIT
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i32>,
    /// Continuation token from a previous response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Read from this secondary index instead of the data table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<Consistency>,
    #[serde(default)]
    pub distinct: bool,
    /// Decorate each item with its remaining `_ttl`
    #[serde(default, rename = "withTTL")]
    pub with_ttl: bool,
}

/// The conditional part of a write: `"not exists"` or an attribute predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PutCondition {
    Token(String),
    If(BTreeMap<String, Value>),
}

/// A write request against a logical table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutRequest {
    pub table: String,
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<PutCondition>,
    /// Write timestamp in milliseconds; derived from the TID when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<Consistency>,
}

/// A logical delete request (tombstones the addressed revision)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub table: String,
    pub attributes: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consistency: Option<Consistency>,
}

/// Result of a read: converted items plus an optional continuation token
#[derive(Debug, Clone, Default, Serialize)]
pub struct GetResult {
    pub items: Vec<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// The stored schema of a table along with its update timestamp
#[derive(Debug, Clone, Serialize)]
pub struct SchemaRecord {
    /// Time-UUID of the `meta` row holding the schema
    pub tid: String,
    pub schema: TableSchema,
}

// ---------------------------------------------------------------------------
// MVCC clock
// ---------------------------------------------------------------------------

static NODE_ID: Lazy<[u8; 6]> = Lazy::new(|| {
    let mut node = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut node);
    // Multicast bit marks this as a non-hardware node id
    node[0] |= 0x01;
    node
});

static CLOCK_CONTEXT: Lazy<Context> =
    Lazy::new(|| Context::new(rand::thread_rng().next_u32() as u16));

/// Generate a fresh time-UUID for the current instant
pub fn new_tid() -> Uuid {
    let now = Utc::now();
    tid_at(now)
}

/// Generate a time-UUID for a specific instant
pub fn tid_at(at: DateTime<Utc>) -> Uuid {
    let ts = Timestamp::from_unix(
        &*CLOCK_CONTEXT,
        at.timestamp() as u64,
        at.timestamp_subsec_nanos(),
    );
    Uuid::new_v1(ts, &NODE_ID)
}

/// Parse a time-UUID from its string form
pub fn parse_tid(s: &str) -> Result<Uuid> {
    let u = Uuid::parse_str(s)
        .map_err(|e| SedimentError::InvalidQuery(format!("Invalid timeuuid {}: {}", s, e)))?;
    if u.get_version_num() != 1 {
        return Err(SedimentError::InvalidQuery(format!(
            "Not a time-based UUID: {}",
            s
        )));
    }
    Ok(u)
}

/// Microseconds since the Unix epoch embedded in a time-UUID
pub fn tid_micros(tid: &Uuid) -> Option<i64> {
    let (secs, nanos) = tid.get_timestamp()?.to_unix();
    Some(secs as i64 * 1_000_000 + (nanos / 1_000) as i64)
}

/// The wall-clock instant embedded in a time-UUID
pub fn tid_datetime(tid: &Uuid) -> Option<DateTime<Utc>> {
    let (secs, nanos) = tid.get_timestamp()?.to_unix();
    Utc.timestamp_opt(secs as i64, nanos).single()
}
