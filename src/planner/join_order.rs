use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::binder::query_graph::{QueryGraph, SubqueryGraph};
use crate::catalog::schema::RelDirection;
use crate::catalog::statistics::{NodeTableStats, RelTableStats, StatsContent};
use crate::catalog::CatalogContent;
use crate::error::{DbError, DbResult};
use crate::planner::LogicalOp;

/// Catalog statistics the cost model reads: per-table tuple counts.
pub struct PlannerStats {
    pub nodes: Arc<StatsContent<NodeTableStats>>,
    pub rels: Arc<StatsContent<RelTableStats>>,
}

impl PlannerStats {
    fn node_count(&self, catalog: &CatalogContent, node_pos: usize, graph: &QueryGraph) -> f64 {
        let mut total = 0u64;
        for table_id in &graph.node(node_pos).table_ids {
            total += self
                .nodes
                .per_table
                .get(table_id)
                .map_or(0, |s| s.num_tuples());
        }
        let _ = catalog;
        total.max(1) as f64
    }

    fn avg_degree(&self, catalog: &CatalogContent, rel_pos: usize, graph: &QueryGraph) -> f64 {
        let rel = graph.rel(rel_pos);
        let mut num_rels = 0u64;
        let mut num_bound = 0u64;
        for table_id in &rel.table_ids {
            num_rels += self.rels.per_table.get(table_id).map_or(0, |s| s.num_rels);
            if let Ok(schema) = catalog.rel_table_schema(*table_id) {
                num_bound += self
                    .nodes
                    .per_table
                    .get(&schema.src_table_id)
                    .map_or(0, |s| s.num_tuples());
            }
        }
        (num_rels as f64 / num_bound.max(1) as f64).max(0.1)
    }
}

#[derive(Clone)]
struct PlanCandidate {
    op: LogicalOp,
    cost: f64,
    card: f64,
}

/// Cost-based join-order search over subgraph bitsets: seed every
/// single-node subgraph with a scan, then repeatedly grow
/// planned subgraphs by extends and pairwise hash joins, keeping the
/// cheapest plan per subgraph, until the full graph is planned.
pub fn plan_pattern(
    catalog: &CatalogContent,
    stats: &PlannerStats,
    graph: &QueryGraph,
) -> DbResult<LogicalOp> {
    if graph.num_nodes() == 0 {
        return Err(DbError::binder("cannot plan an empty pattern"));
    }
    let mut plans: HashMap<SubqueryGraph, PlanCandidate> = HashMap::new();
    for node_pos in 0..graph.num_nodes() {
        let mut sub = SubqueryGraph::empty();
        sub.add_node(node_pos);
        let card = stats.node_count(catalog, node_pos, graph);
        plans.insert(
            sub,
            PlanCandidate {
                op: LogicalOp::ScanNode { node_pos },
                cost: card,
                card,
            },
        );
    }

    let full = graph.full_subgraph();
    loop {
        let mut changed = false;
        // extends
        let current: Vec<(SubqueryGraph, PlanCandidate)> =
            plans.iter().map(|(s, p)| (*s, p.clone())).collect();
        for (sub, plan) in &current {
            for rel_pos in sub.rel_nbr_positions(graph) {
                let rel = graph.rel(rel_pos);
                let src = graph.node_pos(&rel.src_node_name).unwrap();
                let dst = graph.node_pos(&rel.dst_node_name).unwrap();
                let candidates: &[(usize, usize, RelDirection)] = &[
                    (src, dst, RelDirection::Fwd),
                    (dst, src, RelDirection::Bwd),
                ];
                for &(from, to, dir) in candidates {
                    if !sub.has_node(from) {
                        continue;
                    }
                    let closes_cycle = sub.has_node(to);
                    let mut new_sub = *sub;
                    new_sub.add_rel(rel_pos);
                    new_sub.add_node(to);
                    let degree = extend_degree(catalog, stats, rel_pos, graph);
                    let card = if closes_cycle {
                        (plan.card * degree * 0.1).max(1.0)
                    } else {
                        (plan.card * degree).max(1.0)
                    };
                    let cost = plan.cost + card;
                    let candidate = PlanCandidate {
                        op: LogicalOp::Extend {
                            child: Box::new(plan.op.clone()),
                            rel_pos,
                            dir,
                            from_node_pos: from,
                            to_node_pos: to,
                            closes_cycle,
                        },
                        cost,
                        card,
                    };
                    if insert_if_cheaper(&mut plans, new_sub, candidate) {
                        changed = true;
                    }
                }
            }
        }
        // pairwise hash joins of overlapping planned subgraphs
        let current: Vec<(SubqueryGraph, PlanCandidate)> =
            plans.iter().map(|(s, p)| (*s, p.clone())).collect();
        for (i, (left_sub, left)) in current.iter().enumerate() {
            for (right_sub, right) in current.iter().skip(i + 1) {
                if left_sub.rel_selector & right_sub.rel_selector != 0 {
                    continue;
                }
                let shared = left_sub.node_selector & right_sub.node_selector;
                if shared == 0 {
                    continue;
                }
                let join_node_positions: Vec<usize> =
                    (0..graph.num_nodes()).filter(|p| shared & (1 << p) != 0).collect();
                let new_sub = SubqueryGraph {
                    node_selector: left_sub.node_selector | right_sub.node_selector,
                    rel_selector: left_sub.rel_selector | right_sub.rel_selector,
                };
                if plans.contains_key(&new_sub)
                    && plans[&new_sub].cost <= left.cost + right.cost
                {
                    continue;
                }
                let mut shared_card = 1.0;
                for pos in &join_node_positions {
                    shared_card *= stats.node_count(catalog, *pos, graph);
                }
                let card = (left.card * right.card / shared_card.max(1.0)).max(1.0);
                // build on the smaller side
                let (build, probe) = if left.card <= right.card {
                    (left, right)
                } else {
                    (right, left)
                };
                let candidate = PlanCandidate {
                    op: LogicalOp::HashJoin {
                        left: Box::new(build.op.clone()),
                        right: Box::new(probe.op.clone()),
                        join_node_positions,
                    },
                    cost: left.cost + right.cost + card,
                    card,
                };
                if insert_if_cheaper(&mut plans, new_sub, candidate) {
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    match plans.remove(&full) {
        Some(plan) => {
            debug!("picked plan with estimated cost {:.1}", plan.cost);
            Ok(plan.op)
        }
        None => Err(DbError::binder(
            "could not produce a join order for the pattern",
        )),
    }
}

fn extend_degree(
    catalog: &CatalogContent,
    stats: &PlannerStats,
    rel_pos: usize,
    graph: &QueryGraph,
) -> f64 {
    let degree = stats.avg_degree(catalog, rel_pos, graph);
    match graph.rel(rel_pos).range {
        None => degree,
        Some((lo, hi)) => {
            // rough: sum of degree^k over the hop range
            let mut total = 0.0;
            for k in lo..=hi {
                total += degree.powi(k.min(16) as i32);
            }
            total.max(0.1)
        }
    }
}

fn insert_if_cheaper(
    plans: &mut HashMap<SubqueryGraph, PlanCandidate>,
    sub: SubqueryGraph,
    candidate: PlanCandidate,
) -> bool {
    match plans.get(&sub) {
        Some(existing) if existing.cost <= candidate.cost => false,
        _ => {
            plans.insert(sub, candidate);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::query_graph::{QueryNode, QueryRel};
    use crate::catalog::statistics::StatsContent;

    fn graph_two_hop() -> QueryGraph {
        let mut graph = QueryGraph::new();
        for name in ["a", "b", "c"] {
            graph.add_node(QueryNode {
                unique_name: name.to_string(),
                table_ids: vec![0],
            });
        }
        graph.add_rel(QueryRel {
            unique_name: "r1".to_string(),
            table_ids: vec![1],
            src_node_name: "a".to_string(),
            dst_node_name: "b".to_string(),
            range: None,
        });
        graph.add_rel(QueryRel {
            unique_name: "r2".to_string(),
            table_ids: vec![1],
            src_node_name: "b".to_string(),
            dst_node_name: "c".to_string(),
            range: None,
        });
        graph
    }

    fn stats() -> PlannerStats {
        let mut nodes = StatsContent::default();
        nodes.per_table.insert(
            0,
            NodeTableStats {
                next_offset: 100,
                deleted: Default::default(),
            },
        );
        let mut rels = StatsContent::default();
        rels.per_table.insert(
            1,
            RelTableStats {
                num_rels: 300,
                next_rel_id: 300,
            },
        );
        PlannerStats {
            nodes: Arc::new(nodes),
            rels: Arc::new(rels),
        }
    }

    fn catalog_with_rel() -> CatalogContent {
        let mut content = CatalogContent::default();
        let person = content
            .add_node_table_schema(
                "Person",
                vec![crate::catalog::schema::Property {
                    id: 0,
                    name: "id".to_string(),
                    logical_type: crate::common::logical_type::LogicalType::Int64,
                }],
                0,
            )
            .unwrap();
        content
            .add_rel_table_schema(
                "Knows",
                vec![],
                person,
                person,
                crate::catalog::schema::RelMultiplicity::ManyMany,
            )
            .unwrap();
        content
    }

    #[test]
    fn plans_cover_the_full_graph() {
        let graph = graph_two_hop();
        let plan = plan_pattern(&catalog_with_rel(), &stats(), &graph).unwrap();
        // the plan mentions both rels exactly once
        let description = plan.describe(&graph);
        assert_eq!(description.matches("r1").count(), 1, "{}", description);
        assert_eq!(description.matches("r2").count(), 1, "{}", description);
    }

    #[test]
    fn single_node_is_a_scan() {
        let mut graph = QueryGraph::new();
        graph.add_node(QueryNode {
            unique_name: "a".to_string(),
            table_ids: vec![0],
        });
        let plan = plan_pattern(&catalog_with_rel(), &stats(), &graph).unwrap();
        assert!(matches!(plan, LogicalOp::ScanNode { node_pos: 0 }));
    }

    #[test]
    fn cycle_closes_with_an_intersecting_extend() {
        let mut graph = graph_two_hop();
        graph.add_rel(QueryRel {
            unique_name: "r3".to_string(),
            table_ids: vec![1],
            src_node_name: "c".to_string(),
            dst_node_name: "a".to_string(),
            range: None,
        });
        let plan = plan_pattern(&catalog_with_rel(), &stats(), &graph).unwrap();
        let description = plan.describe(&graph);
        assert!(description.contains("r3"), "{}", description);
    }
}
