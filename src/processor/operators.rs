use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::binder::expression::BoundExpr;
use crate::catalog::schema::RelDirection;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::node_table::NodeTable;
use crate::storage::rel_table::{Neighbor, RelTable};
use crate::types::{InternalId, NodeOffset, PropertyId, TableId};

pub type Row = Vec<Value>;

/// Pull-based physical operator: `next` returns one output row at a
/// time until exhausted.
pub trait PhysicalOperator {
    fn columns(&self) -> &[String];
    fn next(&mut self) -> DbResult<Option<Row>>;
}

pub fn column_index(columns: &[String], name: &str) -> DbResult<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| DbError::binder(format!("column {} is not available", name)))
}

pub fn column_map(columns: &[String]) -> HashMap<String, usize> {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect()
}

fn as_internal_id(value: &Value) -> Option<InternalId> {
    match value {
        Value::InternalId(id) => Some(*id),
        _ => None,
    }
}

/// Sequential scan over the live offsets of a node table.
pub struct NodeScan {
    columns: Vec<String>,
    table_id: TableId,
    next_offset: NodeOffset,
    end_offset: NodeOffset,
    deleted: BTreeSet<NodeOffset>,
}

impl NodeScan {
    pub fn new(
        column: String,
        table_id: TableId,
        end_offset: NodeOffset,
        deleted: BTreeSet<NodeOffset>,
    ) -> Self {
        Self {
            columns: vec![column],
            table_id,
            next_offset: 0,
            end_offset,
            deleted,
        }
    }
}

impl PhysicalOperator for NodeScan {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        while self.next_offset < self.end_offset {
            let offset = self.next_offset;
            self.next_offset += 1;
            if self.deleted.contains(&offset) {
                continue;
            }
            return Ok(Some(vec![Value::InternalId(InternalId::new(
                self.table_id,
                offset,
            ))]));
        }
        Ok(None)
    }
}

/// One-hop adjacency traversal. Emits the neighbour id (unless the
/// extend closes a cycle, where it intersects with the bound column)
/// plus the requested rel properties read from the matching list
/// position.
pub struct Extend {
    child: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    rel_table: Arc<RelTable>,
    dir: RelDirection,
    in_idx: usize,
    nbr_table_id: TableId,
    rel_props: Vec<PropertyId>,
    closes_cycle_idx: Option<usize>,
    pending: Option<(Row, Vec<Neighbor>, usize)>,
}

impl Extend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        child: Box<dyn PhysicalOperator>,
        out_nbr_column: Option<String>,
        rel_prop_columns: Vec<(PropertyId, String)>,
        rel_table: Arc<RelTable>,
        dir: RelDirection,
        in_column: &str,
        nbr_table_id: TableId,
        closes_cycle_column: Option<&str>,
    ) -> DbResult<Self> {
        let in_idx = column_index(child.columns(), in_column)?;
        let closes_cycle_idx = match closes_cycle_column {
            Some(column) => Some(column_index(child.columns(), column)?),
            None => None,
        };
        let mut columns = child.columns().to_vec();
        if let Some(out) = out_nbr_column {
            columns.push(out);
        }
        let mut rel_props = Vec::new();
        for (prop_id, column) in rel_prop_columns {
            columns.push(column);
            rel_props.push(prop_id);
        }
        Ok(Self {
            child,
            columns,
            rel_table,
            dir,
            in_idx,
            nbr_table_id,
            rel_props,
            closes_cycle_idx,
            pending: None,
        })
    }
}

impl PhysicalOperator for Extend {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        loop {
            if let Some((row, neighbors, cursor)) = &mut self.pending {
                if *cursor < neighbors.len() {
                    let nbr = neighbors[*cursor];
                    *cursor += 1;
                    let src = as_internal_id(&row[self.in_idx]).expect("bound id");
                    let nbr_id = InternalId::new(self.nbr_table_id, nbr.nbr_offset);
                    if let Some(idx) = self.closes_cycle_idx {
                        match as_internal_id(&row[idx]) {
                            Some(existing) if existing == nbr_id => {}
                            _ => continue,
                        }
                    }
                    let mut out = row.clone();
                    if self.closes_cycle_idx.is_none() {
                        out.push(Value::InternalId(nbr_id));
                    }
                    for prop_id in &self.rel_props {
                        out.push(self.rel_table.rel_property(
                            self.dir,
                            *prop_id,
                            src.offset,
                            nbr.pos,
                        )?);
                    }
                    return Ok(Some(out));
                }
                self.pending = None;
            }
            match self.child.next()? {
                None => return Ok(None),
                Some(row) => {
                    let src = match as_internal_id(&row[self.in_idx]) {
                        Some(id) => id,
                        None => continue, // unmatched optional row
                    };
                    let neighbors = self.rel_table.neighbors(self.dir, src.offset)?;
                    self.pending = Some((row, neighbors, 0));
                }
            }
        }
    }
}

/// Variable-length traversal `*lo..hi`: one output row per path whose
/// length falls in the range; an edge is never reused within a path.
pub struct VarLenExtend {
    child: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    rel_table: Arc<RelTable>,
    dir: RelDirection,
    in_idx: usize,
    nbr_table_id: TableId,
    lo: u64,
    hi: u64,
    buffered: Vec<Row>,
}

impl VarLenExtend {
    pub fn new(
        child: Box<dyn PhysicalOperator>,
        out_nbr_column: String,
        rel_table: Arc<RelTable>,
        dir: RelDirection,
        in_column: &str,
        nbr_table_id: TableId,
        lo: u64,
        hi: u64,
    ) -> DbResult<Self> {
        let in_idx = column_index(child.columns(), in_column)?;
        let mut columns = child.columns().to_vec();
        columns.push(out_nbr_column);
        Ok(Self {
            child,
            columns,
            rel_table,
            dir,
            in_idx,
            nbr_table_id,
            lo,
            hi,
            buffered: Vec::new(),
        })
    }

    fn walk(
        &self,
        offset: NodeOffset,
        depth: u64,
        used_edges: &mut Vec<(NodeOffset, u64)>,
        out: &mut Vec<NodeOffset>,
    ) -> DbResult<()> {
        if depth >= self.lo {
            out.push(offset);
        }
        if depth >= self.hi {
            return Ok(());
        }
        for nbr in self.rel_table.neighbors(self.dir, offset)? {
            let edge = (offset, nbr.pos.unwrap_or(0));
            if used_edges.contains(&edge) {
                continue;
            }
            used_edges.push(edge);
            self.walk(nbr.nbr_offset, depth + 1, used_edges, out)?;
            used_edges.pop();
        }
        Ok(())
    }
}

impl PhysicalOperator for VarLenExtend {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        loop {
            if let Some(row) = self.buffered.pop() {
                return Ok(Some(row));
            }
            match self.child.next()? {
                None => return Ok(None),
                Some(row) => {
                    let src = match as_internal_id(&row[self.in_idx]) {
                        Some(id) => id,
                        None => continue,
                    };
                    let mut reached = Vec::new();
                    let mut used_edges = Vec::new();
                    self.walk(src.offset, 0, &mut used_edges, &mut reached)?;
                    for offset in reached.into_iter().rev() {
                        let mut out = row.clone();
                        out.push(Value::InternalId(InternalId::new(
                            self.nbr_table_id,
                            offset,
                        )));
                        self.buffered.push(out);
                    }
                }
            }
        }
    }
}

/// In-memory hash join on internal-id key columns. The build side is
/// materialized on first pull; probe rows stream through.
pub struct HashJoin {
    build: Box<dyn PhysicalOperator>,
    probe: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    build_key_idx: Vec<usize>,
    probe_key_idx: Vec<usize>,
    /// build columns to append (key columns are dropped)
    build_payload_idx: Vec<usize>,
    table: Option<HashMap<Vec<InternalId>, Vec<Row>>>,
    pending: Vec<Row>,
}

impl HashJoin {
    pub fn new(
        build: Box<dyn PhysicalOperator>,
        probe: Box<dyn PhysicalOperator>,
        key_columns: &[String],
    ) -> DbResult<Self> {
        let build_key_idx: Vec<usize> = key_columns
            .iter()
            .map(|c| column_index(build.columns(), c))
            .collect::<DbResult<_>>()?;
        let probe_key_idx: Vec<usize> = key_columns
            .iter()
            .map(|c| column_index(probe.columns(), c))
            .collect::<DbResult<_>>()?;
        let mut columns = probe.columns().to_vec();
        let mut build_payload_idx = Vec::new();
        for (i, column) in build.columns().iter().enumerate() {
            if !build_key_idx.contains(&i) && !columns.contains(column) {
                columns.push(column.clone());
                build_payload_idx.push(i);
            }
        }
        Ok(Self {
            build,
            probe,
            columns,
            build_key_idx,
            probe_key_idx,
            build_payload_idx,
            table: None,
            pending: Vec::new(),
        })
    }

    fn key_of(row: &Row, idx: &[usize]) -> Option<Vec<InternalId>> {
        idx.iter().map(|i| as_internal_id(&row[*i])).collect()
    }
}

impl PhysicalOperator for HashJoin {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        if self.table.is_none() {
            let mut table: HashMap<Vec<InternalId>, Vec<Row>> = HashMap::new();
            while let Some(row) = self.build.next()? {
                if let Some(key) = Self::key_of(&row, &self.build_key_idx) {
                    table.entry(key).or_default().push(row);
                }
            }
            self.table = Some(table);
        }
        loop {
            if let Some(row) = self.pending.pop() {
                return Ok(Some(row));
            }
            match self.probe.next()? {
                None => return Ok(None),
                Some(probe_row) => {
                    let key = match Self::key_of(&probe_row, &self.probe_key_idx) {
                        Some(key) => key,
                        None => continue,
                    };
                    if let Some(matches) = self.table.as_ref().unwrap().get(&key) {
                        for build_row in matches {
                            let mut out = probe_row.clone();
                            for idx in &self.build_payload_idx {
                                out.push(build_row[*idx].clone());
                            }
                            self.pending.push(out);
                        }
                    }
                }
            }
        }
    }
}

/// Materialize one node property column from the id column of a node
/// variable; the table is resolved per row from the internal id.
pub struct PropRead {
    child: Box<dyn PhysicalOperator>,
    columns: Vec<String>,
    in_idx: usize,
    /// table id -> (table, property id)
    tables: HashMap<TableId, (Arc<NodeTable>, PropertyId)>,
}

impl PropRead {
    pub fn new(
        child: Box<dyn PhysicalOperator>,
        in_column: &str,
        out_column: String,
        tables: HashMap<TableId, (Arc<NodeTable>, PropertyId)>,
    ) -> DbResult<Self> {
        let in_idx = column_index(child.columns(), in_column)?;
        let mut columns = child.columns().to_vec();
        columns.push(out_column);
        Ok(Self {
            child,
            columns,
            in_idx,
            tables,
        })
    }
}

impl PhysicalOperator for PropRead {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        match self.child.next()? {
            None => Ok(None),
            Some(mut row) => {
                let value = match as_internal_id(&row[self.in_idx]) {
                    None => Value::Null,
                    Some(id) => match self.tables.get(&id.table_id) {
                        None => Value::Null,
                        Some((table, prop_id)) => table.read_value(id.offset, *prop_id)?,
                    },
                };
                row.push(value);
                Ok(Some(row))
            }
        }
    }
}

pub struct Filter {
    child: Box<dyn PhysicalOperator>,
    predicate: BoundExpr,
    column_map: HashMap<String, usize>,
}

impl Filter {
    pub fn new(child: Box<dyn PhysicalOperator>, predicate: BoundExpr) -> Self {
        let column_map = column_map(child.columns());
        Self {
            child,
            predicate,
            column_map,
        }
    }
}

impl PhysicalOperator for Filter {
    fn columns(&self) -> &[String] {
        self.child.columns()
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        while let Some(row) = self.child.next()? {
            if self.predicate.evaluate(&row, &self.column_map)? == Value::Bool(true) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

/// Replay of a materialized chunk; also the source of the carried
/// rows of a query part.
pub struct ChunkSource {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl ChunkSource {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl PhysicalOperator for ChunkSource {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn next(&mut self) -> DbResult<Option<Row>> {
        Ok(self.rows.next())
    }
}

pub fn drain(mut op: Box<dyn PhysicalOperator>) -> DbResult<(Vec<String>, Vec<Row>)> {
    let columns = op.columns().to_vec();
    let mut rows = Vec::new();
    while let Some(row) = op.next()? {
        rows.push(row);
    }
    Ok((columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_scan_skips_deleted() {
        let mut deleted = BTreeSet::new();
        deleted.insert(1);
        let mut scan = NodeScan::new("a".to_string(), 0, 4, deleted);
        let mut offsets = Vec::new();
        while let Some(row) = scan.next().unwrap() {
            offsets.push(as_internal_id(&row[0]).unwrap().offset);
        }
        assert_eq!(offsets, vec![0, 2, 3]);
    }

    #[test]
    fn filter_keeps_true_rows() {
        let source = ChunkSource::new(
            vec!["x".to_string()],
            vec![vec![Value::Int64(1)], vec![Value::Int64(5)]],
        );
        let predicate = BoundExpr::Binary {
            op: crate::parser::ast::BinOp::Gt,
            left: Box::new(BoundExpr::Column("x".to_string())),
            right: Box::new(BoundExpr::Literal(Value::Int64(2))),
        };
        let mut filter = Filter::new(Box::new(source), predicate);
        assert_eq!(filter.next().unwrap(), Some(vec![Value::Int64(5)]));
        assert_eq!(filter.next().unwrap(), None);
    }

    #[test]
    fn hash_join_on_ids() {
        let id = |o| Value::InternalId(InternalId::new(0, o));
        let build = ChunkSource::new(
            vec!["a".to_string(), "x".to_string()],
            vec![
                vec![id(1), Value::Int64(10)],
                vec![id(2), Value::Int64(20)],
            ],
        );
        let probe = ChunkSource::new(
            vec!["a".to_string(), "y".to_string()],
            vec![
                vec![id(2), Value::Int64(200)],
                vec![id(3), Value::Int64(300)],
            ],
        );
        let mut join = HashJoin::new(
            Box::new(build),
            Box::new(probe),
            &["a".to_string()],
        )
        .unwrap();
        assert_eq!(join.columns(), &["a", "y", "x"]);
        let row = join.next().unwrap().unwrap();
        assert_eq!(row, vec![id(2), Value::Int64(200), Value::Int64(20)]);
        assert_eq!(join.next().unwrap(), None);
    }
}
