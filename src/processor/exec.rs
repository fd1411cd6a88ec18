use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::binder::expression::{AggFunc, BoundExpr};
use crate::binder::query_graph::{QueryGraph, QueryRel};
use crate::binder::{
    BoundProjection, BoundQuery, BoundQueryPart, BoundReading, BoundUpdating, Scope, VarKind,
};
use crate::catalog::schema::{RelDirection, REL_DIRECTIONS};
use crate::catalog::CatalogContent;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::planner::join_order::{plan_pattern, PlannerStats};
use crate::planner::LogicalOp;
use crate::processor::operators::{
    column_index, column_map, drain, ChunkSource, Extend, Filter, HashJoin, NodeScan,
    PhysicalOperator, PropRead, Row, VarLenExtend,
};
use crate::storage::hash_index::IndexKey;
use crate::storage::storage_manager::StorageManager;
use crate::transaction::Transaction;
use crate::types::{InternalId, TableId};

pub struct ExecContext<'a> {
    pub storage: &'a StorageManager,
    pub catalog: Arc<CatalogContent>,
    pub tx: Transaction,
}

/// Materialized rows flowing between clauses and query parts.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Chunk {
    /// The unit chunk: one empty row, the seed of every pipeline.
    pub fn unit() -> Self {
        Self {
            columns: Vec::new(),
            rows: vec![Vec::new()],
        }
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

pub fn execute_query(ctx: &ExecContext, query: &BoundQuery) -> DbResult<Chunk> {
    let mut carried = Chunk::unit();
    for part in &query.parts {
        carried = execute_part(ctx, part, carried)?;
    }
    Ok(carried)
}

fn execute_part(ctx: &ExecContext, part: &BoundQueryPart, carried: Chunk) -> DbResult<Chunk> {
    let mut chunk = carried;
    for reading in &part.readings {
        match reading {
            BoundReading::Match {
                optional,
                graphs,
                predicate,
            } => {
                chunk = execute_match(ctx, part, chunk, graphs, predicate.as_ref(), *optional)?;
            }
            BoundReading::Unwind { expr, var } => {
                chunk = execute_unwind(ctx, part, chunk, expr, var)?;
            }
        }
    }
    for updating in &part.updatings {
        chunk = apply_updating(ctx, part, chunk, updating)?;
    }
    match &part.projection {
        Some(projection) => apply_projection(ctx, part, chunk, projection),
        None => Ok(Chunk::default()),
    }
}

// pattern matching

fn execute_match(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    carried: Chunk,
    graphs: &[QueryGraph],
    predicate: Option<&BoundExpr>,
    optional: bool,
) -> DbResult<Chunk> {
    // each connected component plans and runs independently
    let mut pattern = Chunk::unit();
    for graph in graphs {
        let stats = PlannerStats {
            nodes: nodes_stats_snapshot(ctx),
            rels: rels_stats_snapshot(ctx),
        };
        let logical = plan_pattern(&ctx.catalog, &stats, graph)?;
        debug!("pattern plan: {}", logical.describe(graph));
        let op = build_physical(ctx, part, graph, &logical)?;
        let (columns, rows) = drain(op)?;
        pattern = join_chunks(pattern, Chunk { columns, rows })?;
    }
    // clause predicate runs against the pattern rows joined with the
    // carried rows (it may reference both)
    if optional {
        let joined = join_chunks_keeping(carried.clone(), pattern, predicate, ctx, part)?;
        Ok(joined)
    } else {
        let mut joined = join_chunks(carried, pattern)?;
        if let Some(predicate) = predicate {
            joined = filter_chunk(ctx, part, joined, predicate)?;
        }
        Ok(joined)
    }
}

/// Inner join of two chunks on their shared columns (cross product
/// when nothing is shared).
fn join_chunks(left: Chunk, right: Chunk) -> DbResult<Chunk> {
    let shared: Vec<String> = left
        .columns
        .iter()
        .filter(|c| right.has_column(c))
        .cloned()
        .collect();
    let mut columns = left.columns.clone();
    let right_extra: Vec<usize> = right
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| !left.columns.contains(c))
        .map(|(i, _)| i)
        .collect();
    for idx in &right_extra {
        columns.push(right.columns[*idx].clone());
    }
    let mut rows = Vec::new();
    if shared.is_empty() {
        for l in &left.rows {
            for r in &right.rows {
                let mut row = l.clone();
                for idx in &right_extra {
                    row.push(r[*idx].clone());
                }
                rows.push(row);
            }
        }
    } else {
        let left_key_idx: Vec<usize> = shared
            .iter()
            .map(|c| column_index(&left.columns, c))
            .collect::<DbResult<_>>()?;
        let right_key_idx: Vec<usize> = shared
            .iter()
            .map(|c| column_index(&right.columns, c))
            .collect::<DbResult<_>>()?;
        let mut table: HashMap<String, Vec<&Row>> = HashMap::new();
        for r in &right.rows {
            table
                .entry(row_key(r, &right_key_idx))
                .or_default()
                .push(r);
        }
        for l in &left.rows {
            if let Some(matches) = table.get(&row_key(l, &left_key_idx)) {
                for r in matches {
                    let mut row = l.clone();
                    for idx in &right_extra {
                        row.push(r[*idx].clone());
                    }
                    rows.push(row);
                }
            }
        }
    }
    Ok(Chunk { columns, rows })
}

/// Left-outer variant used by OPTIONAL MATCH: carried rows without a
/// pattern match survive with nulls; the predicate (if any) is part
/// of the match side.
fn join_chunks_keeping(
    carried: Chunk,
    pattern: Chunk,
    predicate: Option<&BoundExpr>,
    ctx: &ExecContext,
    part: &BoundQueryPart,
) -> DbResult<Chunk> {
    let filtered = {
        let joined = join_chunks(carried.clone(), pattern.clone())?;
        match predicate {
            Some(predicate) => filter_chunk(ctx, part, joined, predicate)?,
            None => joined,
        }
    };
    let carried_width = carried.columns.len();
    let mut out = filtered.clone();
    // a carried row with no surviving joined row reappears null-padded
    let surviving: HashSet<String> = filtered
        .rows
        .iter()
        .map(|r| format!("{:?}", &r[..carried_width]))
        .collect();
    for row in &carried.rows {
        if !surviving.contains(&format!("{:?}", &row[..])) {
            let mut padded = row.clone();
            padded.resize(out.columns.len(), Value::Null);
            out.rows.push(padded);
        }
    }
    Ok(out)
}

fn row_key(row: &Row, idx: &[usize]) -> String {
    let mut key = String::new();
    for i in idx {
        key.push_str(&format!("{:?};", row[*i]));
    }
    key
}

fn execute_unwind(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    chunk: Chunk,
    expr: &BoundExpr,
    var: &str,
) -> DbResult<Chunk> {
    let chunk = materialize_prop_columns(ctx, part, chunk, &[expr.clone()])?;
    let columns_map = column_map(&chunk.columns);
    let mut columns = chunk.columns.clone();
    columns.push(var.to_string());
    let mut rows = Vec::new();
    for row in &chunk.rows {
        let value = expr.evaluate(row, &columns_map)?;
        let items = match value {
            Value::VarList(items) | Value::FixedList(items) => items,
            Value::Null => continue,
            other => vec![other],
        };
        for item in items {
            let mut out = row.clone();
            out.push(item);
            rows.push(out);
        }
    }
    Ok(Chunk { columns, rows })
}

// physical mapping

fn single_table_for_node(graph: &QueryGraph, node_pos: usize) -> DbResult<TableId> {
    let node = graph.node(node_pos);
    if node.table_ids.len() != 1 {
        return Err(DbError::binder(format!(
            "cannot resolve a single node table for variable {}; add a label",
            node.unique_name
        )));
    }
    Ok(node.table_ids[0])
}

fn single_table_for_rel(rel: &QueryRel) -> DbResult<TableId> {
    if rel.table_ids.len() != 1 {
        return Err(DbError::binder(format!(
            "cannot resolve a single rel table for variable {}; add a label",
            rel.unique_name
        )));
    }
    Ok(rel.table_ids[0])
}

fn nodes_stats_snapshot(
    ctx: &ExecContext,
) -> Arc<crate::catalog::statistics::StatsContent<crate::catalog::statistics::NodeTableStats>> {
    if ctx.tx.is_write() {
        // the write transaction observes its own pending updates
        let mut content = crate::catalog::statistics::StatsContent::default();
        for table_id in ctx.catalog.node_table_ids() {
            content.per_table.insert(
                table_id,
                ctx.storage.nodes_statistics.table_stats_for_write_tx(table_id),
            );
        }
        Arc::new(content)
    } else {
        ctx.storage.nodes_statistics.snapshot()
    }
}

fn rels_stats_snapshot(
    ctx: &ExecContext,
) -> Arc<crate::catalog::statistics::StatsContent<crate::catalog::statistics::RelTableStats>> {
    if ctx.tx.is_write() {
        let mut content = crate::catalog::statistics::StatsContent::default();
        for table_id in ctx.catalog.rel_table_ids() {
            content.per_table.insert(
                table_id,
                ctx.storage.rels_statistics.table_stats_for_write_tx(table_id),
            );
        }
        Arc::new(content)
    } else {
        ctx.storage.rels_statistics.snapshot()
    }
}

fn build_physical(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    graph: &QueryGraph,
    logical: &LogicalOp,
) -> DbResult<Box<dyn PhysicalOperator>> {
    match logical {
        LogicalOp::ScanNode { node_pos } => {
            let table_id = single_table_for_node(graph, *node_pos)?;
            let stats = nodes_stats_snapshot(ctx);
            let table_stats = stats.per_table.get(&table_id).cloned().unwrap_or_default();
            Ok(Box::new(NodeScan::new(
                graph.node(*node_pos).unique_name.clone(),
                table_id,
                table_stats.next_offset,
                table_stats.deleted.iter().copied().collect::<BTreeSet<_>>(),
            )))
        }
        LogicalOp::Extend {
            child,
            rel_pos,
            dir,
            from_node_pos,
            to_node_pos,
            closes_cycle,
        } => {
            let child_op = build_physical(ctx, part, graph, child)?;
            let rel = graph.rel(*rel_pos);
            let rel_table_id = single_table_for_rel(rel)?;
            let rel_schema = ctx.catalog.rel_table_schema(rel_table_id)?;
            let rel_table = ctx.storage.rel_table(&ctx.catalog, rel_table_id)?;
            let nbr_table_id = match dir {
                RelDirection::Fwd => rel_schema.dst_table_id,
                RelDirection::Bwd => rel_schema.src_table_id,
            };
            let from_column = graph.node(*from_node_pos).unique_name.clone();
            let to_column = graph.node(*to_node_pos).unique_name.clone();
            if let Some((lo, hi)) = rel.range {
                if part
                    .rel_prop_reads
                    .iter()
                    .any(|(var, _, _)| *var == rel.unique_name)
                {
                    return Err(DbError::binder(
                        "properties of variable-length rels are not supported",
                    ));
                }
                if *closes_cycle {
                    return Err(DbError::binder(
                        "variable-length rels cannot close a cycle",
                    ));
                }
                return Ok(Box::new(VarLenExtend::new(
                    child_op,
                    to_column,
                    rel_table,
                    *dir,
                    &from_column,
                    nbr_table_id,
                    lo,
                    hi,
                )?));
            }
            // every rel property this part evaluates for this rel var
            let mut rel_prop_columns = Vec::new();
            for (var, prop_name, column) in &part.rel_prop_reads {
                if *var != rel.unique_name {
                    continue;
                }
                let property = rel_schema.property_by_name(prop_name).ok_or_else(|| {
                    DbError::binder(format!(
                        "{} does not have property {}",
                        rel_schema.name, prop_name
                    ))
                })?;
                rel_prop_columns.push((property.id, column.clone()));
            }
            Ok(Box::new(Extend::new(
                child_op,
                if *closes_cycle {
                    None
                } else {
                    Some(to_column.clone())
                },
                rel_prop_columns,
                rel_table,
                *dir,
                &from_column,
                nbr_table_id,
                closes_cycle.then(|| to_column).as_deref(),
            )?))
        }
        LogicalOp::HashJoin {
            left,
            right,
            join_node_positions,
        } => {
            let left_op = build_physical(ctx, part, graph, left)?;
            let right_op = build_physical(ctx, part, graph, right)?;
            let key_columns: Vec<String> = join_node_positions
                .iter()
                .map(|p| graph.node(*p).unique_name.clone())
                .collect();
            Ok(Box::new(HashJoin::new(left_op, right_op, &key_columns)?))
        }
    }
}

// property materialization and filtering

/// Append any `var.key` node-property columns the expressions need
/// and the chunk does not have yet.
fn materialize_prop_columns(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    chunk: Chunk,
    exprs: &[BoundExpr],
) -> DbResult<Chunk> {
    let mut referenced = Vec::new();
    for expr in exprs {
        expr.referenced_columns(&mut referenced);
    }
    referenced.sort();
    referenced.dedup();

    let mut op: Box<dyn PhysicalOperator> =
        Box::new(ChunkSource::new(chunk.columns.clone(), chunk.rows));
    for column in referenced {
        if chunk.columns.contains(&column) || op.columns().contains(&column) {
            continue;
        }
        let read = part
            .node_prop_reads
            .iter()
            .find(|(_, _, c)| *c == column);
        let (var, prop_name, _) = match read {
            Some(read) => read,
            None => continue,
        };
        let table_ids = match part.scope.get(var) {
            Some(VarKind::Node { table_ids }) => table_ids.clone(),
            _ => continue,
        };
        if !op.columns().iter().any(|c| c == var) {
            continue; // variable not produced by this pipeline
        }
        let mut tables = HashMap::new();
        for table_id in table_ids {
            let schema = ctx.catalog.node_table_schema(table_id)?;
            if let Some(property) = schema.property_by_name(prop_name) {
                tables.insert(
                    table_id,
                    (
                        ctx.storage.node_table(&ctx.catalog, table_id)?,
                        property.id,
                    ),
                );
            }
        }
        op = Box::new(PropRead::new(op, var, column.clone(), tables)?);
    }
    let (columns, rows) = drain(op)?;
    Ok(Chunk { columns, rows })
}

fn filter_chunk(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    chunk: Chunk,
    predicate: &BoundExpr,
) -> DbResult<Chunk> {
    let chunk = materialize_prop_columns(ctx, part, chunk, std::slice::from_ref(predicate))?;
    let source = ChunkSource::new(chunk.columns.clone(), chunk.rows);
    let filter = Filter::new(Box::new(source), predicate.clone());
    let (columns, rows) = drain(Box::new(filter))?;
    Ok(Chunk { columns, rows })
}

// updating clauses

fn apply_updating(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    chunk: Chunk,
    updating: &BoundUpdating,
) -> DbResult<Chunk> {
    if ctx.tx.is_read_only() {
        return Err(DbError::Transaction(
            "cannot execute an updating query in a read-only transaction".to_string(),
        ));
    }
    match updating {
        BoundUpdating::CreateNode {
            var,
            table_id,
            props,
        } => {
            let exprs: Vec<BoundExpr> = props.iter().map(|(_, _, e)| e.clone()).collect();
            let chunk = materialize_prop_columns(ctx, part, chunk, &exprs)?;
            let columns_map = column_map(&chunk.columns);
            let table = ctx.storage.node_table(&ctx.catalog, *table_id)?;
            let schema = ctx.catalog.node_table_schema(*table_id)?;
            let mut columns = chunk.columns.clone();
            columns.push(var.clone());
            let mut rows = Vec::new();
            for row in &chunk.rows {
                let offset = ctx.storage.nodes_statistics.with_write_version(|c| {
                    Ok(c.per_table.entry(*table_id).or_default().add_node())
                })?;
                for (prop_id, ty, expr) in props {
                    let value = expr.evaluate(row, &columns_map)?.cast_to(ty)?;
                    if schema.primary_key().id == *prop_id {
                        // refuse keys that collide with the bulk-built index
                        let key = match &value {
                            Value::Int64(v) => Some(IndexKey::Int(*v)),
                            Value::String(s) => Some(IndexKey::Str(s.as_str())),
                            _ => None,
                        };
                        if let Some(key) = key {
                            if table.pk_lookup(&ctx.tx, &key)?.is_some() {
                                return Err(DbError::copy(format!(
                                    "found duplicated primary key value {}, which violates the uniqueness constraint of the primary key column",
                                    key.to_display()
                                )));
                            }
                        }
                    }
                    table.set_value(offset, *prop_id, &value)?;
                }
                let mut out = row.clone();
                out.push(Value::InternalId(InternalId::new(*table_id, offset)));
                rows.push(out);
            }
            Ok(Chunk { columns, rows })
        }
        BoundUpdating::SetProps { items } => {
            let exprs: Vec<BoundExpr> = items.iter().map(|(_, _, e)| e.clone()).collect();
            let chunk = materialize_prop_columns(ctx, part, chunk, &exprs)?;
            let columns_map = column_map(&chunk.columns);
            for row in &chunk.rows {
                for (var, prop_name, expr) in items {
                    let idx = column_index(&chunk.columns, var)?;
                    let id = match &row[idx] {
                        Value::InternalId(id) => *id,
                        Value::Null => continue,
                        other => {
                            return Err(DbError::binder(format!(
                                "cannot SET a property on {}",
                                other
                            )))
                        }
                    };
                    let schema = ctx.catalog.node_table_schema(id.table_id)?;
                    let property = schema.property_by_name(prop_name).ok_or_else(|| {
                        DbError::binder(format!(
                            "{} does not have property {}",
                            schema.name, prop_name
                        ))
                    })?;
                    let value = expr
                        .evaluate(row, &columns_map)?
                        .cast_to(&property.logical_type)?;
                    let table = ctx.storage.node_table(&ctx.catalog, id.table_id)?;
                    table.set_value(id.offset, property.id, &value)?;
                }
            }
            Ok(chunk)
        }
        BoundUpdating::DeleteNode { detach, vars } => {
            for row in &chunk.rows {
                for var in vars {
                    let idx = column_index(&chunk.columns, var)?;
                    let id = match &row[idx] {
                        Value::InternalId(id) => *id,
                        Value::Null => continue,
                        other => {
                            return Err(DbError::binder(format!("cannot DELETE {}", other)))
                        }
                    };
                    let mut has_rels = false;
                    for rel_schema in ctx.catalog.rel_tables_touching(id.table_id) {
                        let rel_table =
                            ctx.storage.rel_table(&ctx.catalog, rel_schema.table_id)?;
                        for dir in REL_DIRECTIONS {
                            if rel_schema.bound_table_id(dir) == id.table_id
                                && rel_table.list_size(dir, id.offset)? > 0
                            {
                                has_rels = true;
                            }
                        }
                    }
                    if has_rels {
                        if *detach {
                            return Err(DbError::binder(
                                "DETACH DELETE of nodes with rels is not supported",
                            ));
                        }
                        return Err(DbError::binder(
                            "cannot delete a node that still has rels attached",
                        ));
                    }
                    ctx.storage.nodes_statistics.with_write_version(|c| {
                        c.per_table
                            .entry(id.table_id)
                            .or_default()
                            .delete_node(id.offset);
                        Ok(())
                    })?;
                }
            }
            Ok(chunk)
        }
    }
}

// projection

fn apply_projection(
    ctx: &ExecContext,
    part: &BoundQueryPart,
    chunk: Chunk,
    projection: &BoundProjection,
) -> DbResult<Chunk> {
    let mut needed: Vec<BoundExpr> = projection.items.iter().map(|(e, _)| e.clone()).collect();
    needed.extend(projection.order_by.iter().map(|(e, _)| e.clone()));
    let chunk = materialize_prop_columns(ctx, part, chunk, &needed)?;
    let columns_map = column_map(&chunk.columns);

    let out_columns: Vec<String> = projection.items.iter().map(|(_, n)| n.clone()).collect();
    let mut out_rows: Vec<Row>;
    let mut order_keys: Vec<Vec<Value>> = Vec::new();
    let order_on_output = projection.has_aggregate || projection.distinct;

    if projection.has_aggregate {
        out_rows = aggregate_rows(projection, &chunk, &columns_map)?;
    } else {
        // order keys may reference either the input columns or the
        // projected names, so they evaluate against both
        let mut combined_map = columns_map.clone();
        for (i, name) in out_columns.iter().enumerate() {
            combined_map.insert(name.clone(), chunk.columns.len() + i);
        }
        out_rows = Vec::with_capacity(chunk.rows.len());
        for row in &chunk.rows {
            let mut out = Vec::with_capacity(projection.items.len());
            for (expr, _) in &projection.items {
                out.push(expr.evaluate(row, &columns_map)?);
            }
            if !order_on_output && !projection.order_by.is_empty() {
                let mut combined = row.clone();
                combined.extend(out.iter().cloned());
                let mut key = Vec::with_capacity(projection.order_by.len());
                for (expr, _) in &projection.order_by {
                    key.push(expr.evaluate(&combined, &combined_map)?);
                }
                order_keys.push(key);
            }
            out_rows.push(out);
        }
    }

    if projection.distinct {
        let mut seen = HashSet::new();
        out_rows.retain(|row| seen.insert(format!("{:?}", row)));
    }

    if !projection.order_by.is_empty() {
        if order_on_output {
            let out_map = column_map(&out_columns);
            let mut keyed: Vec<(Vec<Value>, Row)> = Vec::with_capacity(out_rows.len());
            for row in out_rows {
                let mut key = Vec::with_capacity(projection.order_by.len());
                for (expr, _) in &projection.order_by {
                    key.push(expr.evaluate(&row, &out_map)?);
                }
                keyed.push((key, row));
            }
            sort_keyed(&mut keyed, projection);
            out_rows = keyed.into_iter().map(|(_, r)| r).collect();
        } else {
            let mut keyed: Vec<(Vec<Value>, Row)> =
                order_keys.into_iter().zip(out_rows).collect();
            sort_keyed(&mut keyed, projection);
            out_rows = keyed.into_iter().map(|(_, r)| r).collect();
        }
    }

    let skip = projection.skip.unwrap_or(0) as usize;
    if skip > 0 {
        out_rows = out_rows.into_iter().skip(skip).collect();
    }
    if let Some(limit) = projection.limit {
        out_rows.truncate(limit as usize);
    }

    // WITH ... WHERE filters the projected rows
    if let Some(where_clause) = &projection.where_clause {
        let out_map = column_map(&out_columns);
        let mut kept = Vec::with_capacity(out_rows.len());
        for row in out_rows {
            if where_clause.evaluate(&row, &out_map)? == Value::Bool(true) {
                kept.push(row);
            }
        }
        out_rows = kept;
    }

    Ok(Chunk {
        columns: out_columns,
        rows: out_rows,
    })
}

fn sort_keyed(keyed: &mut [(Vec<Value>, Row)], projection: &BoundProjection) {
    keyed.sort_by(|(a, _), (b, _)| {
        for (i, (_, asc)) in projection.order_by.iter().enumerate() {
            let ord = a[i].compare(&b[i]);
            let ord = if *asc { ord } else { ord.reverse() };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

struct AggState {
    count: u64,
    sum_i: i64,
    sum_f: f64,
    saw_float: bool,
    min: Option<Value>,
    max: Option<Value>,
    distinct_seen: HashSet<String>,
}

impl AggState {
    fn new() -> Self {
        Self {
            count: 0,
            sum_i: 0,
            sum_f: 0.0,
            saw_float: false,
            min: None,
            max: None,
            distinct_seen: HashSet::new(),
        }
    }

    fn accumulate(&mut self, value: &Value, distinct: bool) {
        if value.is_null() {
            return;
        }
        if distinct && !self.distinct_seen.insert(format!("{:?}", value)) {
            return;
        }
        self.count += 1;
        match value.as_i64() {
            Some(v) => self.sum_i += v,
            None => {
                if let Some(v) = value.as_f64() {
                    self.sum_f += v;
                    self.saw_float = true;
                }
            }
        }
        if self
            .min
            .as_ref()
            .map_or(true, |m| value.compare(m) == std::cmp::Ordering::Less)
        {
            self.min = Some(value.clone());
        }
        if self
            .max
            .as_ref()
            .map_or(true, |m| value.compare(m) == std::cmp::Ordering::Greater)
        {
            self.max = Some(value.clone());
        }
    }

    fn finish(&self, func: AggFunc) -> Value {
        match func {
            AggFunc::CountStar | AggFunc::Count => Value::Int64(self.count as i64),
            AggFunc::Min => self.min.clone().unwrap_or(Value::Null),
            AggFunc::Max => self.max.clone().unwrap_or(Value::Null),
            AggFunc::Sum => {
                if self.count == 0 {
                    Value::Null
                } else if self.saw_float {
                    Value::Double(self.sum_f + self.sum_i as f64)
                } else {
                    Value::Int64(self.sum_i)
                }
            }
            AggFunc::Avg => {
                if self.count == 0 {
                    Value::Null
                } else {
                    Value::Double((self.sum_f + self.sum_i as f64) / self.count as f64)
                }
            }
        }
    }
}

/// Hash aggregation grouped by the non-aggregate projection items.
fn aggregate_rows(
    projection: &BoundProjection,
    chunk: &Chunk,
    columns_map: &HashMap<String, usize>,
) -> DbResult<Vec<Row>> {
    let group_idx: Vec<usize> = projection
        .items
        .iter()
        .enumerate()
        .filter(|(_, (e, _))| !e.has_aggregate())
        .map(|(i, _)| i)
        .collect();

    // group key -> (group values, one AggState per aggregate item)
    let mut groups: HashMap<String, (Vec<Value>, Vec<AggState>)> = HashMap::new();
    let mut group_order: Vec<String> = Vec::new();
    let num_aggs = projection.items.len() - group_idx.len();
    for row in &chunk.rows {
        let mut group_values = Vec::with_capacity(group_idx.len());
        for idx in &group_idx {
            group_values.push(projection.items[*idx].0.evaluate(row, columns_map)?);
        }
        let key = format!("{:?}", group_values);
        if !groups.contains_key(&key) {
            let mut states = Vec::with_capacity(num_aggs);
            states.resize_with(num_aggs, AggState::new);
            groups.insert(key.clone(), (group_values, states));
            group_order.push(key.clone());
        }
        let (_, states) = groups.get_mut(&key).unwrap();
        let mut agg_i = 0;
        for (item_idx, (expr, _)) in projection.items.iter().enumerate() {
            if group_idx.contains(&item_idx) {
                continue;
            }
            match expr {
                BoundExpr::Aggregate {
                    func,
                    arg,
                    distinct,
                } => {
                    match (func, arg) {
                        (AggFunc::CountStar, _) | (_, None) => {
                            states[agg_i].accumulate(&Value::Bool(true), false);
                        }
                        (_, Some(arg)) => {
                            let value = arg.evaluate(row, columns_map)?;
                            states[agg_i].accumulate(&value, *distinct);
                        }
                    }
                }
                other => {
                    return Err(DbError::binder(format!(
                        "cannot mix {:?} with aggregates without grouping",
                        other
                    )))
                }
            }
            agg_i += 1;
        }
    }
    // an aggregate-only projection over zero rows still yields one row
    if groups.is_empty() && group_idx.is_empty() {
        let mut states = Vec::with_capacity(num_aggs);
        states.resize_with(num_aggs, AggState::new);
        groups.insert(String::new(), (Vec::new(), states));
        group_order.push(String::new());
    }

    let mut out = Vec::with_capacity(groups.len());
    for key in group_order {
        let (group_values, states) = &groups[&key];
        let mut row = Vec::with_capacity(projection.items.len());
        let mut group_i = 0;
        let mut agg_i = 0;
        for (item_idx, (expr, _)) in projection.items.iter().enumerate() {
            if group_idx.contains(&item_idx) {
                row.push(group_values[group_i].clone());
                group_i += 1;
            } else if let BoundExpr::Aggregate { func, .. } = expr {
                row.push(states[agg_i].finish(*func));
                agg_i += 1;
            }
        }
        out.push(row);
    }
    Ok(out)
}

// scope helper re-exported for database-level RETURN * handling
pub fn scope_of(part: &BoundQueryPart) -> &Scope {
    &part.scope
}
