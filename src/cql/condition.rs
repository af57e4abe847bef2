//! Predicate compilation
//!
//! Turns attribute predicates into an `AND`-joined CQL fragment plus its
//! parameters in binding order.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::conv;
use crate::driver::CqlValue;
use crate::error::{Result, SedimentError};
use crate::ident;
use crate::types::AttributeType;

/// A compiled predicate over one attribute
#[derive(Debug, Clone, PartialEq)]
pub enum CqlPredicate {
    Eq(CqlValue),
    Lt(CqlValue),
    Gt(CqlValue),
    Le(CqlValue),
    Ge(CqlValue),
    Between(CqlValue, CqlValue),
}

/// JSON operator form of a predicate: `{"le": v}`, `{"between": [lo, hi]}`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PredicateOp {
    Eq(Value),
    Lt(Value),
    Gt(Value),
    Le(Value),
    Ge(Value),
    Between([Value; 2]),
}

/// Parse one request predicate: a bare value means equality, an object must
/// be a known operator. Operands are type-converted for binding.
pub fn parse_predicate(attr: &str, ty: &AttributeType, value: &Value) -> Result<CqlPredicate> {
    if let Value::Object(_) = value {
        let op: PredicateOp = serde_json::from_value(value.clone()).map_err(|_| {
            SedimentError::InvalidQuery(format!("Unknown operator in predicate on {}", attr))
        })?;
        match op {
            PredicateOp::Eq(v) => Ok(CqlPredicate::Eq(conv::write_value(ty, &v)?)),
            PredicateOp::Lt(v) => Ok(CqlPredicate::Lt(conv::write_value(ty, &v)?)),
            PredicateOp::Gt(v) => Ok(CqlPredicate::Gt(conv::write_value(ty, &v)?)),
            PredicateOp::Le(v) => Ok(CqlPredicate::Le(conv::write_value(ty, &v)?)),
            PredicateOp::Ge(v) => Ok(CqlPredicate::Ge(conv::write_value(ty, &v)?)),
            PredicateOp::Between([lo, hi]) => Ok(CqlPredicate::Between(
                conv::write_value(ty, &lo)?,
                conv::write_value(ty, &hi)?,
            )),
        }
    } else {
        Ok(CqlPredicate::Eq(conv::write_value(ty, value)?))
    }
}

/// Compile predicates into an `AND`-joined fragment and its parameters
pub fn build_condition(
    predicates: &BTreeMap<String, CqlPredicate>,
) -> (String, Vec<CqlValue>) {
    let mut fragments = Vec::with_capacity(predicates.len());
    let mut params = Vec::with_capacity(predicates.len());
    for (attr, predicate) in predicates {
        let column = ident::quote(attr);
        match predicate {
            CqlPredicate::Eq(v) => {
                fragments.push(format!("{} = ?", column));
                params.push(v.clone());
            }
            CqlPredicate::Lt(v) => {
                fragments.push(format!("{} < ?", column));
                params.push(v.clone());
            }
            CqlPredicate::Gt(v) => {
                fragments.push(format!("{} > ?", column));
                params.push(v.clone());
            }
            CqlPredicate::Le(v) => {
                fragments.push(format!("{} <= ?", column));
                params.push(v.clone());
            }
            CqlPredicate::Ge(v) => {
                fragments.push(format!("{} >= ?", column));
                params.push(v.clone());
            }
            CqlPredicate::Between(lo, hi) => {
                fragments.push(format!("{} >= ? AND {} <= ?", column, column));
                params.push(lo.clone());
                params.push(hi.clone());
            }
        }
    }
    (fragments.join(" AND "), params)
}
