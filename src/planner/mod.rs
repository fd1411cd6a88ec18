pub mod join_order;

use crate::catalog::schema::RelDirection;

/// Logical pattern-matching plan over one `QueryGraph`. Filters,
/// projections and the update/output operators sit above this core in
/// the part pipeline; the join-order search only shapes the
/// scan/extend/join tree.
#[derive(Debug, Clone)]
pub enum LogicalOp {
    ScanNode {
        node_pos: usize,
    },
    Extend {
        child: Box<LogicalOp>,
        rel_pos: usize,
        /// direction of traversal: `Fwd` walks src -> dst
        dir: RelDirection,
        from_node_pos: usize,
        to_node_pos: usize,
        /// the target node was already bound by the child plan; the
        /// extend intersects instead of producing it
        closes_cycle: bool,
    },
    HashJoin {
        left: Box<LogicalOp>,
        right: Box<LogicalOp>,
        join_node_positions: Vec<usize>,
    },
}

impl LogicalOp {
    /// One-line plan rendering for EXPLAIN output.
    pub fn describe(&self, graph: &crate::binder::query_graph::QueryGraph) -> String {
        match self {
            LogicalOp::ScanNode { node_pos } => {
                format!("SCAN({})", graph.node(*node_pos).unique_name)
            }
            LogicalOp::Extend {
                child,
                rel_pos,
                dir,
                to_node_pos,
                ..
            } => format!(
                "EXTEND({}, {}, {})->{}",
                graph.rel(*rel_pos).unique_name,
                dir,
                graph.node(*to_node_pos).unique_name,
                child.describe(graph)
            ),
            LogicalOp::HashJoin {
                left,
                right,
                join_node_positions,
            } => format!(
                "HASH_JOIN([{}], {}, {})",
                join_node_positions
                    .iter()
                    .map(|p| graph.node(*p).unique_name.clone())
                    .collect::<Vec<_>>()
                    .join(","),
                left.describe(graph),
                right.describe(graph)
            ),
        }
    }
}
