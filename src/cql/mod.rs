//! CQL statement builders
//!
//! Pure functions from schema-info plus a typed plan to a parameterized
//! [`Statement`](crate::driver::Statement). Builders never touch the driver
//! and never convert values; plans carry pre-encoded [`CqlValue`]s so the
//! background updater can replay fetched rows untouched.

mod condition;
mod ddl;
mod select;
mod write;

pub use condition::{build_condition, parse_predicate, CqlPredicate};
pub use ddl::{
    build_alter_keyspace, build_alter_table_add, build_alter_table_drop,
    build_alter_table_options, build_create_keyspace, build_create_table,
    build_drop_keyspace, build_drop_legacy_domain_index, replication_options, table_options_cql,
};
pub use select::{build_get_query, GetPlan};
pub use write::{build_delete_query, build_put_query, PutPlan, PutPlanCondition};
