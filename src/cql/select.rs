//! SELECT builder

use std::collections::BTreeMap;

use crate::cql::condition::{build_condition, CqlPredicate};
use crate::driver::{CqlValue, Statement};
use crate::error::{Result, SedimentError};
use crate::ident;
use crate::schema::{SchemaInfo, DOMAIN_ATTR, META_CF};
use crate::types::{IndexElement, Order};

/// A fully resolved read: predicates encoded, target column family chosen
#[derive(Debug, Clone, Default)]
pub struct GetPlan {
    /// Tenant domain; `None` only for `meta` reads
    pub domain: Option<String>,
    pub predicates: BTreeMap<String, CqlPredicate>,
    /// Projected attributes; all declared attributes when absent
    pub proj: Option<Vec<String>>,
    pub order: BTreeMap<String, Order>,
    /// CQL `LIMIT`; page sizing is handled by the driver's fetch size
    pub limit: Option<i32>,
    pub distinct: bool,
    pub with_ttl: bool,
}

/// Build a SELECT against one column family of a table's keyspace
pub fn build_get_query(
    info: &SchemaInfo,
    keyspace: &str,
    cf: &str,
    plan: &GetPlan,
) -> Result<Statement> {
    let proj_attrs: Vec<String> = match &plan.proj {
        Some(attrs) => {
            for attr in attrs {
                if !info.schema.attributes.contains_key(attr) {
                    return Err(SedimentError::InvalidQuery(format!(
                        "Projected attribute not declared: {}",
                        attr
                    )));
                }
            }
            attrs.clone()
        }
        None => info.schema.attributes.keys().cloned().collect(),
    };

    let mut proj: Vec<String> = proj_attrs.iter().map(|a| ident::quote(a)).collect();
    if plan.with_ttl {
        for attr in &proj_attrs {
            let ty = info
                .attribute_type(attr)
                .expect("projected attribute is declared");
            if info.i_key_map.contains_key(attr) || ty.is_collection() {
                continue;
            }
            proj.push(format!(
                "TTL({}) AS {}",
                ident::quote(attr),
                ident::quote(&format!("_ttl_{}", attr))
            ));
        }
    }

    let mut predicates = plan.predicates.clone();
    if cf != META_CF {
        let domain = plan.domain.as_ref().ok_or_else(|| {
            SedimentError::Internal("Data reads require a domain".to_string())
        })?;
        predicates.insert(
            DOMAIN_ATTR.to_string(),
            CqlPredicate::Eq(CqlValue::Text(domain.clone())),
        );
    }
    for attr in predicates.keys() {
        if !info.i_key_map.contains_key(attr) {
            return Err(SedimentError::InvalidQuery(format!(
                "Only key attributes may be constrained; {} is not one of the key attributes",
                attr
            )));
        }
    }
    let (condition, params) = build_condition(&predicates);

    let order_clause = build_order(info, &plan.order)?;

    let mut cql = format!(
        "SELECT {}{} FROM {}.{}",
        if plan.distinct { "DISTINCT " } else { "" },
        proj.join(", "),
        ident::quote(keyspace),
        ident::quote(cf)
    );
    if !condition.is_empty() {
        cql.push_str(" WHERE ");
        cql.push_str(&condition);
    }
    if let Some(order) = order_clause {
        cql.push_str(" ORDER BY ");
        cql.push_str(&order);
    }
    if let Some(limit) = plan.limit {
        cql.push_str(&format!(" LIMIT {}", limit));
    }

    Ok(Statement::new(cql, params))
}

/// Validate requested orderings and emit a unified direction across all
/// range keys. The store only supports reversing the natural clustering
/// order as a whole; mixed reversals are rejected.
fn build_order(info: &SchemaInfo, order: &BTreeMap<String, Order>) -> Result<Option<String>> {
    if order.is_empty() {
        return Ok(None);
    }

    let mut reversed: Option<bool> = None;
    for (attr, requested) in order {
        let element = info.i_key_map.get(attr).ok_or_else(|| {
            SedimentError::InvalidQuery(format!("Cannot order by non-range attribute: {}", attr))
        })?;
        let natural = match element {
            IndexElement::Range { order, .. } => *order,
            _ => {
                return Err(SedimentError::InvalidQuery(format!(
                    "Cannot order by non-range attribute: {}",
                    attr
                )))
            }
        };
        let this_reversed = *requested != natural;
        match reversed {
            None => reversed = Some(this_reversed),
            Some(prev) if prev != this_reversed => {
                return Err(SedimentError::InvalidQuery(
                    "Inconsistent sort order: all range keys must be reversed together"
                        .to_string(),
                ));
            }
            _ => {}
        }
    }
    let reversed = reversed.unwrap_or(false);

    let mut terms = Vec::new();
    for element in &info.schema.index {
        if let IndexElement::Range { attribute, order } = element {
            let dir = if reversed { order.reversed() } else { *order };
            terms.push(format!("{} {}", ident::quote(attribute), dir.cql()));
        }
    }
    Ok(Some(terms.join(", ")))
}
