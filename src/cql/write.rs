//! PUT and DELETE builders
//!
//! A put becomes an `UPDATE` exactly when some non-key, non-static
//! attribute is non-null; otherwise it is emitted as an idempotent
//! `INSERT`, so a row consisting only of its primary key still lands.

use std::collections::BTreeMap;

use crate::cql::condition::{build_condition, CqlPredicate};
use crate::driver::{CqlValue, Statement};
use crate::error::{Result, SedimentError};
use crate::ident;
use crate::schema::{SchemaInfo, DOMAIN_ATTR, META_CF};

/// Conditional part of a put
#[derive(Debug, Clone, PartialEq)]
pub enum PutPlanCondition {
    /// `IF NOT EXISTS` on the insert form
    NotExists,
    /// `IF <condition>` on the update form
    If(BTreeMap<String, CqlPredicate>),
}

/// A fully resolved write: attribute values encoded for binding
#[derive(Debug, Clone, Default)]
pub struct PutPlan {
    /// Tenant domain; `None` only for `meta` writes
    pub domain: Option<String>,
    pub attributes: BTreeMap<String, CqlValue>,
    pub condition: Option<PutPlanCondition>,
    /// Write timestamp in microseconds; dropped when a condition is present
    pub timestamp: Option<i64>,
    /// Column TTL in seconds
    pub ttl: Option<u32>,
}

/// Build an INSERT or UPDATE against one column family
pub fn build_put_query(
    info: &SchemaInfo,
    keyspace: &str,
    cf: &str,
    plan: &PutPlan,
) -> Result<Statement> {
    let mut attributes = plan.attributes.clone();
    if cf != META_CF {
        let domain = plan.domain.as_ref().ok_or_else(|| {
            SedimentError::Internal("Data writes require a domain".to_string())
        })?;
        attributes.insert(DOMAIN_ATTR.to_string(), CqlValue::Text(domain.clone()));
    }
    attributes.retain(|name, _| !name.starts_with("_ttl"));

    for name in attributes.keys() {
        if !info.schema.attributes.contains_key(name) {
            return Err(SedimentError::InvalidQuery(format!(
                "Unknown attribute {}",
                name
            )));
        }
    }
    for key in &info.i_keys {
        if !attributes.contains_key(key) {
            return Err(SedimentError::InvalidQuery(format!(
                "Missing primary key attribute {}",
                key
            )));
        }
    }

    let has_updates = attributes.iter().any(|(name, value)| {
        !info.i_key_map.contains_key(name)
            && !info.static_key_map.contains_key(name)
            && !value.is_null()
    });

    // A condition pins the statement form; otherwise non-key updates decide
    let as_update = match &plan.condition {
        Some(PutPlanCondition::NotExists) => false,
        Some(PutPlanCondition::If(_)) => true,
        None => has_updates,
    };

    let timestamp = if plan.condition.is_some() {
        None
    } else {
        plan.timestamp
    };
    let mut using = Vec::new();
    let mut using_params = Vec::new();
    if let Some(ts) = timestamp {
        using.push("TIMESTAMP ?");
        using_params.push(CqlValue::Bigint(ts));
    }
    if let Some(ttl) = plan.ttl {
        using.push("TTL ?");
        using_params.push(CqlValue::Int(ttl as i32));
    }
    let using_clause = if using.is_empty() {
        String::new()
    } else {
        format!("USING {}", using.join(" AND "))
    };

    let table = format!("{}.{}", ident::quote(keyspace), ident::quote(cf));

    if as_update {
        let set: Vec<(&String, &CqlValue)> = attributes
            .iter()
            .filter(|(name, _)| !info.i_key_map.contains_key(*name))
            .collect();
        if set.is_empty() {
            return Err(SedimentError::InvalidQuery(
                "Conditional update without any attributes to set".to_string(),
            ));
        }
        let mut cql = format!("UPDATE {}", table);
        if !using_clause.is_empty() {
            cql.push(' ');
            cql.push_str(&using_clause);
        }
        let assignments: Vec<String> = set
            .iter()
            .map(|(name, _)| format!("{} = ?", ident::quote(name)))
            .collect();
        cql.push_str(&format!(" SET {}", assignments.join(", ")));

        let mut params = using_params;
        params.extend(set.iter().map(|(_, v)| (*v).clone()));

        let key_terms: Vec<String> = info
            .i_keys
            .iter()
            .map(|k| format!("{} = ?", ident::quote(k)))
            .collect();
        cql.push_str(&format!(" WHERE {}", key_terms.join(" AND ")));
        params.extend(info.i_keys.iter().map(|k| attributes[k].clone()));

        if let Some(PutPlanCondition::If(predicates)) = &plan.condition {
            let (fragment, cond_params) = build_condition(predicates);
            cql.push_str(&format!(" IF {}", fragment));
            params.extend(cond_params);
        }

        Ok(Statement::new(cql, params))
    } else {
        let columns: Vec<String> = attributes.keys().map(|k| ident::quote(k)).collect();
        let markers = vec!["?"; columns.len()].join(", ");
        let mut cql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            markers
        );
        if matches!(plan.condition, Some(PutPlanCondition::NotExists)) {
            cql.push_str(" IF NOT EXISTS");
        }
        if !using_clause.is_empty() {
            cql.push(' ');
            cql.push_str(&using_clause);
        }
        let mut params: Vec<CqlValue> = attributes.values().cloned().collect();
        params.extend(using_params);
        Ok(Statement::new(cql, params))
    }
}

/// Build a physical DELETE by primary-key predicate. Used by maintenance
/// only; the public delete path writes tombstones instead.
pub fn build_delete_query(
    info: &SchemaInfo,
    keyspace: &str,
    cf: &str,
    domain: Option<&str>,
    predicates: &BTreeMap<String, CqlPredicate>,
) -> Result<Statement> {
    if cf == META_CF {
        return Err(SedimentError::InvalidQuery(
            "Deleting from meta is not supported".to_string(),
        ));
    }
    let mut predicates = predicates.clone();
    if let Some(domain) = domain {
        predicates.insert(
            DOMAIN_ATTR.to_string(),
            CqlPredicate::Eq(CqlValue::Text(domain.to_string())),
        );
    }
    if predicates.is_empty() {
        return Err(SedimentError::InvalidQuery(
            "Delete needs a primary-key predicate".to_string(),
        ));
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
    let cql = format!(
        "DELETE FROM {}.{} WHERE {}",
        ident::quote(keyspace),
        ident::quote(cf),
        condition
    );
    Ok(Statement::new(cql, params))
}
