//! In-memory fake cluster for engine tests
//!
//! Implements the [`Driver`] contract by interpreting the CQL the engine
//! generates: keyspace/table DDL, INSERT/UPDATE with `USING TIMESTAMP`/`TTL`
//! and conditions, DELETE, and SELECT with projections, `TTL()` columns,
//! ordering, LIMIT and paging. Cells are last-writer-wins by timestamp with
//! value comparison breaking ties, statics are shared per partition, and
//! expired cells disappear from reads.

// Shared by several test binaries; not every binary touches every helper
#![allow(dead_code)]

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use sediment::driver::{
    CqlValue, Driver, DriverError, ExecOptions, ResultPage, Row, Statement,
};
use sediment::types::tid_micros;

type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Clone)]
struct Cell {
    value: CqlValue,
    timestamp: i64,
    ttl: Option<i32>,
}

impl Cell {
    fn expired(&self, now_us: i64) -> bool {
        match self.ttl {
            Some(ttl) => now_us >= self.timestamp + ttl as i64 * 1_000_000,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct Partition {
    statics: BTreeMap<String, Cell>,
    rows: Vec<StoredRow>,
}

#[derive(Debug)]
struct StoredRow {
    clustering: Vec<CqlValue>,
    marker: Option<Cell>,
    cells: BTreeMap<String, Cell>,
}

#[derive(Debug, Default)]
struct Table {
    statics: Vec<String>,
    partition_keys: Vec<String>,
    clustering_keys: Vec<(String, bool)>, // (name, descending)
    columns: Vec<String>,
    partitions: BTreeMap<Vec<u8>, (Vec<CqlValue>, Partition)>,
}

#[derive(Default)]
pub struct FakeCluster {
    keyspaces: Mutex<BTreeMap<String, BTreeMap<String, Table>>>,
    statements: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every statement executed so far, in order
    pub fn statement_log(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.lock().unwrap().len()
    }

    fn apply(&self, stmt: &Statement, opts: &ExecOptions) -> DriverResult<ResultPage> {
        self.statements.lock().unwrap().push(stmt.cql.clone());
        let cql = stmt.cql.as_str();
        let mut params = stmt.params.clone().into_iter();

        if let Some(rest) = cql.strip_prefix("CREATE KEYSPACE IF NOT EXISTS ") {
            let name = unquote(rest.split(" WITH ").next().unwrap());
            self.keyspaces
                .lock()
                .unwrap()
                .entry(name)
                .or_default();
            return Ok(ResultPage::default());
        }
        if let Some(rest) = cql.strip_prefix("DROP KEYSPACE IF EXISTS ") {
            self.keyspaces.lock().unwrap().remove(&unquote(rest));
            return Ok(ResultPage::default());
        }
        if cql.starts_with("ALTER KEYSPACE ") || cql.starts_with("DROP INDEX IF EXISTS ") {
            return Ok(ResultPage::default());
        }
        if let Some(rest) = cql.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
            return self.create_table(rest);
        }
        if let Some(rest) = cql.strip_prefix("ALTER TABLE ") {
            return self.alter_table(rest);
        }
        if let Some(rest) = cql.strip_prefix("INSERT INTO ") {
            return self.insert(rest, &mut params);
        }
        if let Some(rest) = cql.strip_prefix("UPDATE ") {
            return self.update(rest, &mut params);
        }
        if let Some(rest) = cql.strip_prefix("DELETE FROM ") {
            return self.delete(rest, &mut params);
        }
        if cql.starts_with("SELECT ") {
            return self.select(cql, &mut params, opts);
        }
        Err(DriverError::Other(format!("unsupported cql: {}", cql)))
    }

    fn create_table(&self, rest: &str) -> DriverResult<ResultPage> {
        let open = rest.find(" (").ok_or_else(|| bad(rest))?;
        let (keyspace, cf) = table_ref(&rest[..open])?;
        let body_end = match_paren(rest, open + 1).ok_or_else(|| bad(rest))?;
        let body = &rest[open + 2..body_end];

        let mut table = Table::default();
        for part in split_top_level(body) {
            let part = part.trim();
            if let Some(keys) = part.strip_prefix("PRIMARY KEY (") {
                let keys = &keys[..keys.len() - 1];
                let (hash, ranges) = if let Some(stripped) = keys.strip_prefix('(') {
                    let close = stripped.find(')').ok_or_else(|| bad(rest))?;
                    (&stripped[..close], stripped[close + 1..].trim_start_matches(", "))
                } else {
                    let mut it = keys.splitn(2, ", ");
                    (it.next().unwrap(), it.next().unwrap_or(""))
                };
                table.partition_keys = hash.split(", ").map(unquote).collect();
                if !ranges.is_empty() {
                    for r in ranges.split(", ") {
                        table.clustering_keys.push((unquote(r), true));
                    }
                }
            } else {
                let mut words = part.split(' ');
                let name = unquote(words.next().ok_or_else(|| bad(rest))?);
                let is_static = part.ends_with(" static");
                if is_static {
                    table.statics.push(name.clone());
                }
                table.columns.push(name);
            }
        }
        // CLUSTERING ORDER BY fixes the declared directions
        if let Some(idx) = rest.find("CLUSTERING ORDER BY (") {
            let start = idx + "CLUSTERING ORDER BY (".len();
            let end = rest[start..].find(')').ok_or_else(|| bad(rest))? + start;
            table.clustering_keys.clear();
            for term in rest[start..end].split(", ") {
                let mut it = term.rsplitn(2, ' ');
                let dir = it.next().unwrap();
                let col = unquote(it.next().unwrap());
                table.clustering_keys.push((col, dir == "DESC"));
            }
        }

        let mut keyspaces = self.keyspaces.lock().unwrap();
        let ks = keyspaces
            .get_mut(&keyspace)
            .ok_or(DriverError::UnconfiguredTable(keyspace.clone()))?;
        ks.entry(cf).or_insert(table);
        Ok(ResultPage::default())
    }

    fn alter_table(&self, rest: &str) -> DriverResult<ResultPage> {
        let mut keyspaces = self.keyspaces.lock().unwrap();
        if let Some(idx) = rest.find(" ADD ") {
            let (keyspace, cf) = table_ref(&rest[..idx])?;
            let table = lookup_mut(&mut keyspaces, &keyspace, &cf)?;
            let spec = &rest[idx + 5..];
            let name = unquote(spec.split(' ').next().unwrap());
            if spec.ends_with(" static") {
                table.statics.push(name.clone());
            }
            table.columns.push(name);
        } else if let Some(idx) = rest.find(" DROP ") {
            let (keyspace, cf) = table_ref(&rest[..idx])?;
            let table = lookup_mut(&mut keyspaces, &keyspace, &cf)?;
            let name = unquote(rest[idx + 6..].trim());
            table.columns.retain(|c| c != &name);
            for (_, partition) in table.partitions.values_mut() {
                partition.statics.remove(&name);
                for row in &mut partition.rows {
                    row.cells.remove(&name);
                }
            }
        }
        // WITH options have no observable effect here
        Ok(ResultPage::default())
    }

    fn insert(
        &self,
        rest: &str,
        params: &mut impl Iterator<Item = CqlValue>,
    ) -> DriverResult<ResultPage> {
        let open = rest.find(" (").ok_or_else(|| bad(rest))?;
        let (keyspace, cf) = table_ref(&rest[..open])?;
        let close = match_paren(rest, open + 1).ok_or_else(|| bad(rest))?;
        let columns: Vec<String> = rest[open + 2..close].split(", ").map(unquote).collect();
        let tail = &rest[close + 1..];
        let if_not_exists = tail.contains("IF NOT EXISTS");

        let values: Vec<CqlValue> = columns.iter().map(|_| params.next().unwrap()).collect();
        let (timestamp, ttl) = using_params(tail, params);

        let mut keyspaces = self.keyspaces.lock().unwrap();
        let table = lookup_mut(&mut keyspaces, &keyspace, &cf)?;
        let assignments: BTreeMap<String, CqlValue> =
            columns.into_iter().zip(values).collect();
        table.upsert(&assignments, timestamp, ttl, if_not_exists, true);
        Ok(ResultPage::default())
    }

    fn update(
        &self,
        rest: &str,
        params: &mut impl Iterator<Item = CqlValue>,
    ) -> DriverResult<ResultPage> {
        let set_idx = rest.find(" SET ").ok_or_else(|| bad(rest))?;
        let head = &rest[..set_idx];
        let (table_part, using_part) = match head.find(" USING ") {
            Some(idx) => (&head[..idx], &head[idx..]),
            None => (head, ""),
        };
        let (keyspace, cf) = table_ref(table_part)?;
        let (timestamp, ttl) = using_params(using_part, params);

        let where_idx = rest.find(" WHERE ").ok_or_else(|| bad(rest))?;
        let set_part = &rest[set_idx + 5..where_idx];
        let mut assignments = BTreeMap::new();
        for term in set_part.split(", ") {
            let col = unquote(term.strip_suffix(" = ?").ok_or_else(|| bad(rest))?);
            assignments.insert(col, params.next().unwrap());
        }

        let tail = &rest[where_idx + 7..];
        let (where_part, if_part) = match tail.find(" IF ") {
            Some(idx) => (&tail[..idx], Some(&tail[idx + 4..])),
            None => (tail, None),
        };
        let conditions = parse_conditions(where_part, params)?;
        for (col, _, value) in &conditions {
            assignments.insert(col.clone(), value.clone());
        }
        let if_conditions = match if_part {
            Some(part) => Some(parse_conditions(part, params)?),
            None => None,
        };

        let mut keyspaces = self.keyspaces.lock().unwrap();
        let table = lookup_mut(&mut keyspaces, &keyspace, &cf)?;
        if let Some(if_conditions) = if_conditions {
            if !table.row_matches(&assignments, &if_conditions) {
                return Ok(ResultPage::default());
            }
        }
        table.upsert(&assignments, timestamp, ttl, false, false);
        Ok(ResultPage::default())
    }

    fn delete(
        &self,
        rest: &str,
        params: &mut impl Iterator<Item = CqlValue>,
    ) -> DriverResult<ResultPage> {
        let where_idx = rest.find(" WHERE ").ok_or_else(|| bad(rest))?;
        let (keyspace, cf) = table_ref(&rest[..where_idx])?;
        let conditions = parse_conditions(&rest[where_idx + 7..], params)?;
        let mut keyspaces = self.keyspaces.lock().unwrap();
        let table = lookup_mut(&mut keyspaces, &keyspace, &cf)?;
        table.remove_matching(&conditions);
        Ok(ResultPage::default())
    }

    fn select(
        &self,
        cql: &str,
        params: &mut impl Iterator<Item = CqlValue>,
        opts: &ExecOptions,
    ) -> DriverResult<ResultPage> {
        let rest = cql.strip_prefix("SELECT ").unwrap();
        let (distinct, rest) = match rest.strip_prefix("DISTINCT ") {
            Some(r) => (true, r),
            None => (false, rest),
        };
        let from_idx = rest.find(" FROM ").ok_or_else(|| bad(cql))?;
        let projections: Vec<Projection> = rest[..from_idx]
            .split(", ")
            .map(parse_projection)
            .collect();
        let mut tail = &rest[from_idx + 6..];

        let mut limit = None;
        if let Some(idx) = tail.find(" LIMIT ") {
            limit = Some(tail[idx + 7..].trim().parse::<usize>().map_err(|_| bad(cql))?);
            tail = &tail[..idx];
        }
        let mut order = Vec::new();
        if let Some(idx) = tail.find(" ORDER BY ") {
            for term in tail[idx + 10..].split(", ") {
                let mut it = term.rsplitn(2, ' ');
                let dir = it.next().unwrap();
                order.push((unquote(it.next().unwrap()), dir == "DESC"));
            }
            tail = &tail[..idx];
        }
        let (table_part, conditions) = match tail.find(" WHERE ") {
            Some(idx) => {
                let conds = parse_conditions(&tail[idx + 7..], params)?;
                (&tail[..idx], conds)
            }
            None => (tail, Vec::new()),
        };
        let (keyspace, cf) = table_ref(table_part)?;

        let keyspaces = self.keyspaces.lock().unwrap();
        let table = keyspaces
            .get(&keyspace)
            .and_then(|ks| ks.get(&cf))
            .ok_or_else(|| DriverError::UnconfiguredTable(format!("{}.{}", keyspace, cf)))?;

        let now_us = now_micros();
        let mut rows = table.scan(&conditions, &order, now_us, &projections);
        if distinct {
            let mut seen = Vec::new();
            rows.retain(|row| {
                let key = format!("{:?}", row);
                if seen.contains(&key) {
                    false
                } else {
                    seen.push(key);
                    true
                }
            });
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }

        // Paging: the state is a big-endian offset into the result set
        let offset = match &opts.paging_state {
            Some(state) => u64::from_be_bytes(state.as_slice().try_into().unwrap()) as usize,
            None => 0,
        };
        let page_size = opts.fetch_size.map(|f| f as usize).unwrap_or(usize::MAX);
        let end = offset.saturating_add(page_size).min(rows.len());
        let page: Vec<Row> = rows[offset.min(rows.len())..end].to_vec();
        let paging_state = if end < rows.len() {
            Some((end as u64).to_be_bytes().to_vec())
        } else {
            None
        };
        Ok(ResultPage {
            rows: page,
            paging_state,
        })
    }
}

#[async_trait]
impl Driver for FakeCluster {
    async fn execute(&self, stmt: &Statement, opts: &ExecOptions) -> DriverResult<ResultPage> {
        self.apply(stmt, opts)
    }

    async fn batch(&self, stmts: &[Statement], opts: &ExecOptions) -> DriverResult<()> {
        for stmt in stmts {
            self.apply(stmt, opts)?;
        }
        Ok(())
    }
}

impl Table {
    fn partition_of(&self, values: &BTreeMap<String, CqlValue>) -> Vec<CqlValue> {
        self.partition_keys
            .iter()
            .map(|k| values.get(k).cloned().unwrap_or(CqlValue::Null))
            .collect()
    }

    fn clustering_of(&self, values: &BTreeMap<String, CqlValue>) -> Vec<CqlValue> {
        self.clustering_keys
            .iter()
            .map(|(k, _)| values.get(k).cloned().unwrap_or(CqlValue::Null))
            .collect()
    }

    fn upsert(
        &mut self,
        assignments: &BTreeMap<String, CqlValue>,
        timestamp: Option<i64>,
        ttl: Option<i32>,
        if_not_exists: bool,
        with_marker: bool,
    ) {
        let timestamp = timestamp.unwrap_or_else(now_micros);
        let partition_key = self.partition_of(assignments);
        let clustering = self.clustering_of(assignments);
        let pk_bytes = format!("{:?}", partition_key).into_bytes();
        let statics = self.statics.clone();
        let partition_keys = self.partition_keys.clone();
        let clustering_names: Vec<String> =
            self.clustering_keys.iter().map(|(k, _)| k.clone()).collect();

        let (_, partition) = self
            .partitions
            .entry(pk_bytes)
            .or_insert_with(|| (partition_key, Partition::default()));

        let existing = partition
            .rows
            .iter()
            .position(|r| r.clustering == clustering);
        if if_not_exists && existing.is_some() {
            return;
        }
        let row = match existing {
            Some(idx) => &mut partition.rows[idx],
            None => {
                partition.rows.push(StoredRow {
                    clustering,
                    marker: None,
                    cells: BTreeMap::new(),
                });
                partition.rows.last_mut().unwrap()
            }
        };
        if with_marker {
            row.marker = Some(Cell {
                value: CqlValue::Null,
                timestamp,
                ttl,
            });
        }
        for (col, value) in assignments {
            if partition_keys.contains(col) || clustering_names.contains(col) {
                continue;
            }
            let cell = Cell {
                value: value.clone(),
                timestamp,
                ttl,
            };
            let target = if statics.contains(col) {
                partition.statics.entry(col.clone())
            } else {
                row.cells.entry(col.clone())
            };
            match target {
                std::collections::btree_map::Entry::Vacant(e) => {
                    e.insert(cell);
                }
                std::collections::btree_map::Entry::Occupied(mut e) => {
                    let old = e.get();
                    let wins = cell.timestamp > old.timestamp
                        || (cell.timestamp == old.timestamp
                            && cmp_values(&cell.value, &old.value) == Ordering::Greater);
                    if wins {
                        e.insert(cell);
                    }
                }
            }
        }
    }

    fn row_matches(
        &self,
        key_values: &BTreeMap<String, CqlValue>,
        conditions: &[(String, String, CqlValue)],
    ) -> bool {
        let now_us = now_micros();
        let partition_key = self.partition_of(key_values);
        let clustering = self.clustering_of(key_values);
        for (stored_key, partition) in self.partitions.values() {
            if *stored_key != partition_key {
                continue;
            }
            for row in &partition.rows {
                if row.clustering != clustering {
                    continue;
                }
                return conditions.iter().all(|(col, op, operand)| {
                    let value = self.resolve(stored_key, partition, row, col, now_us);
                    matches_op(&value, op, operand)
                });
            }
        }
        false
    }

    fn remove_matching(&mut self, conditions: &[(String, String, CqlValue)]) {
        let now_us = now_micros();
        let partition_keys = self.partition_keys.clone();
        let clustering_names: Vec<String> =
            self.clustering_keys.iter().map(|(k, _)| k.clone()).collect();
        for (stored_key, partition) in self.partitions.values_mut() {
            let statics = partition.statics.clone();
            partition.rows.retain(|row| {
                !conditions.iter().all(|(col, op, operand)| {
                    let value = resolve_row(
                        &partition_keys,
                        &clustering_names,
                        &statics,
                        stored_key,
                        row,
                        col,
                        now_us,
                    );
                    matches_op(&value, op, operand)
                })
            });
        }
    }

    fn resolve(
        &self,
        partition_key: &[CqlValue],
        partition: &Partition,
        row: &StoredRow,
        col: &str,
        now_us: i64,
    ) -> CqlValue {
        let clustering_names: Vec<String> =
            self.clustering_keys.iter().map(|(k, _)| k.clone()).collect();
        resolve_row(
            &self.partition_keys,
            &clustering_names,
            &partition.statics,
            partition_key,
            row,
            col,
            now_us,
        )
    }

    fn scan(
        &self,
        conditions: &[(String, String, CqlValue)],
        order: &[(String, bool)],
        now_us: i64,
        projections: &[Projection],
    ) -> Vec<Row> {
        let mut matched: Vec<(&[CqlValue], &Partition, &StoredRow)> = Vec::new();
        for (partition_key, partition) in self.partitions.values() {
            for row in &partition.rows {
                let live = row.marker.as_ref().map_or(false, |m| !m.expired(now_us))
                    || row.cells.values().any(|c| !c.expired(now_us));
                if !live {
                    continue;
                }
                let ok = conditions.iter().all(|(col, op, operand)| {
                    let value = self.resolve(partition_key, partition, row, col, now_us);
                    matches_op(&value, op, operand)
                });
                if ok {
                    matched.push((partition_key, partition, row));
                }
            }
        }

        // Sort within partitions by the requested or declared clustering order
        let directions: Vec<(String, bool)> = if order.is_empty() {
            self.clustering_keys.clone()
        } else {
            // Requested order lists every range column in sequence
            order.to_vec()
        };
        let clustering_names: Vec<String> =
            self.clustering_keys.iter().map(|(k, _)| k.clone()).collect();
        matched.sort_by(|a, b| {
            let pk = a.0.iter().zip(b.0.iter()).find_map(|(x, y)| {
                let ord = cmp_values(x, y);
                (ord != Ordering::Equal).then_some(ord)
            });
            if let Some(ord) = pk {
                return ord;
            }
            for (col, desc) in &directions {
                let idx = clustering_names.iter().position(|c| c == col);
                let Some(idx) = idx else { continue };
                let ord = cmp_values(&a.2.clustering[idx], &b.2.clustering[idx]);
                let ord = if *desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        matched
            .into_iter()
            .map(|(partition_key, partition, row)| {
                let mut out = Row::new();
                for projection in projections {
                    match projection {
                        Projection::Column(col) => {
                            out.insert(
                                col.clone(),
                                self.resolve(partition_key, partition, row, col, now_us),
                            );
                        }
                        Projection::Ttl { column, alias } => {
                            let cell = if self.statics.contains(column) {
                                partition.statics.get(column)
                            } else {
                                row.cells.get(column)
                            };
                            let remaining = cell.and_then(|c| {
                                c.ttl.map(|ttl| {
                                    let elapsed = (now_us - c.timestamp) / 1_000_000;
                                    CqlValue::Int((ttl as i64 - elapsed).max(0) as i32)
                                })
                            });
                            out.insert(alias.clone(), remaining.unwrap_or(CqlValue::Null));
                        }
                    }
                }
                out
            })
            .collect()
    }
}

fn resolve_row(
    partition_keys: &[String],
    clustering_names: &[String],
    statics: &BTreeMap<String, Cell>,
    partition_key: &[CqlValue],
    row: &StoredRow,
    col: &str,
    now_us: i64,
) -> CqlValue {
    if let Some(idx) = partition_keys.iter().position(|k| k == col) {
        return partition_key[idx].clone();
    }
    if let Some(idx) = clustering_names.iter().position(|k| k == col) {
        return row.clustering[idx].clone();
    }
    let cell = statics.get(col).or_else(|| row.cells.get(col));
    match cell {
        Some(c) if !c.expired(now_us) => c.value.clone(),
        _ => CqlValue::Null,
    }
}

enum Projection {
    Column(String),
    Ttl { column: String, alias: String },
}

fn parse_projection(term: &str) -> Projection {
    if let Some(rest) = term.strip_prefix("TTL(") {
        let close = rest.find(')').unwrap();
        let column = unquote(&rest[..close]);
        let alias = unquote(rest[close + 1..].trim_start_matches(" AS "));
        Projection::Ttl { column, alias }
    } else {
        Projection::Column(unquote(term))
    }
}

fn parse_conditions(
    part: &str,
    params: &mut impl Iterator<Item = CqlValue>,
) -> DriverResult<Vec<(String, String, CqlValue)>> {
    let mut conditions = Vec::new();
    for fragment in part.split(" AND ") {
        let fragment = fragment.trim();
        let (col_part, op) = if let Some(c) = fragment.strip_suffix(" >= ?") {
            (c, ">=")
        } else if let Some(c) = fragment.strip_suffix(" <= ?") {
            (c, "<=")
        } else if let Some(c) = fragment.strip_suffix(" > ?") {
            (c, ">")
        } else if let Some(c) = fragment.strip_suffix(" < ?") {
            (c, "<")
        } else if let Some(c) = fragment.strip_suffix(" = ?") {
            (c, "=")
        } else {
            return Err(bad(fragment));
        };
        let value = params
            .next()
            .ok_or_else(|| DriverError::Other("parameter underflow".to_string()))?;
        conditions.push((unquote(col_part), op.to_string(), value));
    }
    Ok(conditions)
}

fn using_params(
    tail: &str,
    params: &mut impl Iterator<Item = CqlValue>,
) -> (Option<i64>, Option<i32>) {
    let mut timestamp = None;
    let mut ttl = None;
    if tail.contains("TIMESTAMP ?") {
        if let Some(CqlValue::Bigint(us)) = params.next() {
            timestamp = Some(us);
        }
    }
    if tail.contains("TTL ?") {
        if let Some(CqlValue::Int(t)) = params.next() {
            ttl = Some(t);
        }
    }
    (timestamp, ttl)
}

fn matches_op(value: &CqlValue, op: &str, operand: &CqlValue) -> bool {
    let ord = cmp_values(value, operand);
    match op {
        "=" => ord == Ordering::Equal,
        "<" => !value.is_null() && ord == Ordering::Less,
        ">" => !value.is_null() && ord == Ordering::Greater,
        "<=" => !value.is_null() && ord != Ordering::Greater,
        ">=" => !value.is_null() && ord != Ordering::Less,
        _ => false,
    }
}

fn cmp_values(a: &CqlValue, b: &CqlValue) -> Ordering {
    use CqlValue::*;
    match (a, b) {
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Boolean(x), Boolean(y)) => x.cmp(y),
        (Int(x), Int(y)) => x.cmp(y),
        (Bigint(x), Bigint(y)) => x.cmp(y),
        (Varint(x), Varint(y)) => x.cmp(y),
        (Float(x), Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Double(x), Double(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Decimal(x), Decimal(y)) => x.cmp(y),
        (Text(x), Text(y)) => x.cmp(y),
        (Blob(x), Blob(y)) => x.cmp(y),
        (Uuid(x), Uuid(y)) => x.as_bytes().cmp(y.as_bytes()),
        (Timeuuid(x), Timeuuid(y)) => tid_micros(x)
            .cmp(&tid_micros(y))
            .then_with(|| x.as_bytes().cmp(y.as_bytes())),
        (Timestamp(x), Timestamp(y)) => x.cmp(y),
        (Set(x), Set(y)) => x.len().cmp(&y.len()),
        _ => Ordering::Equal,
    }
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn table_ref(part: &str) -> DriverResult<(String, String)> {
    let mut it = part.trim().split("\".\"");
    let keyspace = it.next().ok_or_else(|| bad(part))?.trim_start_matches('"');
    let cf = it.next().ok_or_else(|| bad(part))?.trim_end_matches('"');
    Ok((keyspace.to_string(), cf.to_string()))
}

fn lookup_mut<'a>(
    keyspaces: &'a mut std::sync::MutexGuard<'_, BTreeMap<String, BTreeMap<String, Table>>>,
    keyspace: &str,
    cf: &str,
) -> DriverResult<&'a mut Table> {
    keyspaces
        .get_mut(keyspace)
        .and_then(|ks| ks.get_mut(cf))
        .ok_or_else(|| DriverError::UnconfiguredTable(format!("{}.{}", keyspace, cf)))
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('"').replace("\"\"", "\"")
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' | '<' => depth += 1,
            ')' | '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

fn match_paren(s: &str, open: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    debug_assert_eq!(bytes[open], b'(');
    let mut depth = 0usize;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn bad(part: &str) -> DriverError {
    DriverError::Other(format!("cannot parse: {}", part))
}
