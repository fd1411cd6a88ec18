use std::collections::{HashMap, HashSet};

use crate::types::TableId;

/// Upper bound on pattern variables; selectors are single-word
/// bitsets.
pub const MAX_NUM_QUERY_VARIABLES: usize = 64;

/// A node variable of a pattern: unique name plus candidate tables.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryNode {
    pub unique_name: String,
    pub table_ids: Vec<TableId>,
}

/// A rel variable with its endpoints (by unique node name), candidate
/// tables and optional variable-length range.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRel {
    pub unique_name: String,
    pub table_ids: Vec<TableId>,
    pub src_node_name: String,
    pub dst_node_name: String,
    pub range: Option<(u64, u64)>,
}

/// Variables of one connected pattern component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryGraph {
    nodes: Vec<QueryNode>,
    rels: Vec<QueryRel>,
    node_name_to_pos: HashMap<String, usize>,
    rel_name_to_pos: HashMap<String, usize>,
}

impl QueryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_rels(&self) -> usize {
        self.rels.len()
    }

    pub fn nodes(&self) -> &[QueryNode] {
        &self.nodes
    }

    pub fn rels(&self) -> &[QueryRel] {
        &self.rels
    }

    pub fn node(&self, pos: usize) -> &QueryNode {
        &self.nodes[pos]
    }

    pub fn rel(&self, pos: usize) -> &QueryRel {
        &self.rels[pos]
    }

    pub fn node_mut(&mut self, pos: usize) -> &mut QueryNode {
        &mut self.nodes[pos]
    }

    pub fn rel_mut(&mut self, pos: usize) -> &mut QueryRel {
        &mut self.rels[pos]
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.node_name_to_pos.contains_key(name)
    }

    pub fn contains_rel(&self, name: &str) -> bool {
        self.rel_name_to_pos.contains_key(name)
    }

    pub fn node_pos(&self, name: &str) -> Option<usize> {
        self.node_name_to_pos.get(name).copied()
    }

    pub fn rel_pos(&self, name: &str) -> Option<usize> {
        self.rel_name_to_pos.get(name).copied()
    }

    /// A node may appear in several pattern parts; only the first
    /// occurrence is kept.
    pub fn add_node(&mut self, node: QueryNode) {
        if self.contains_node(&node.unique_name) {
            return;
        }
        assert!(self.nodes.len() < MAX_NUM_QUERY_VARIABLES);
        self.node_name_to_pos
            .insert(node.unique_name.clone(), self.nodes.len());
        self.nodes.push(node);
    }

    pub fn add_rel(&mut self, rel: QueryRel) {
        assert!(!self.contains_rel(&rel.unique_name));
        assert!(self.rels.len() < MAX_NUM_QUERY_VARIABLES);
        self.rel_name_to_pos
            .insert(rel.unique_name.clone(), self.rels.len());
        self.rels.push(rel);
    }

    /// Union by unique name; idempotent.
    pub fn merge(&mut self, other: &QueryGraph) {
        for node in &other.nodes {
            self.add_node(node.clone());
        }
        for rel in &other.rels {
            if !self.contains_rel(&rel.unique_name) {
                self.add_rel(rel.clone());
            }
        }
    }

    /// Two graphs connect when they share a node name.
    pub fn is_connected(&self, other: &QueryGraph) -> bool {
        self.nodes
            .iter()
            .any(|n| other.contains_node(&n.unique_name))
    }

    /// Whether every variable a projection depends on resolves here.
    pub fn can_project_variables(&self, variables: &[String]) -> bool {
        variables
            .iter()
            .all(|v| self.contains_node(v) || self.contains_rel(v))
    }

    pub fn full_subgraph(&self) -> SubqueryGraph {
        let mut sub = SubqueryGraph::empty();
        for pos in 0..self.nodes.len() {
            sub.add_node(pos);
        }
        for pos in 0..self.rels.len() {
            sub.add_rel(pos);
        }
        sub
    }
}

/// Connected-component partition of the pattern variables; adding a
/// graph merges it into every component it touches.
#[derive(Debug, Default)]
pub struct QueryGraphCollection {
    pub graphs: Vec<QueryGraph>,
}

impl QueryGraphCollection {
    pub fn add_and_merge_if_connected(&mut self, graph: QueryGraph) {
        let mut merged_into: Option<usize> = None;
        let mut i = 0;
        while i < self.graphs.len() {
            if self.graphs[i].is_connected(&graph) {
                match merged_into {
                    None => {
                        self.graphs[i].merge(&graph);
                        merged_into = Some(i);
                        i += 1;
                    }
                    Some(first) => {
                        // the new graph bridges two components
                        let absorbed = self.graphs.remove(i);
                        self.graphs[first].merge(&absorbed);
                    }
                }
            } else {
                i += 1;
            }
        }
        if merged_into.is_none() {
            self.graphs.push(graph);
        }
    }
}

/// Bitset-selected subset of a `QueryGraph`, the planner's enumeration
/// unit. Invariant: every selected rel has at least one selected
/// endpoint node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubqueryGraph {
    pub node_selector: u64,
    pub rel_selector: u64,
}

impl std::hash::Hash for SubqueryGraph {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // hash the primary side: rels when any are selected
        if self.rel_selector != 0 {
            self.rel_selector.hash(state);
        } else {
            self.node_selector.hash(state);
        }
    }
}

impl SubqueryGraph {
    pub fn empty() -> Self {
        Self {
            node_selector: 0,
            rel_selector: 0,
        }
    }

    pub fn add_node(&mut self, pos: usize) {
        self.node_selector |= 1 << pos;
    }

    pub fn add_rel(&mut self, pos: usize) {
        self.rel_selector |= 1 << pos;
    }

    pub fn has_node(&self, pos: usize) -> bool {
        self.node_selector & (1 << pos) != 0
    }

    pub fn has_rel(&self, pos: usize) -> bool {
        self.rel_selector & (1 << pos) != 0
    }

    pub fn num_selected(&self) -> u32 {
        self.node_selector.count_ones() + self.rel_selector.count_ones()
    }

    pub fn num_selected_nodes(&self) -> u32 {
        self.node_selector.count_ones()
    }

    pub fn num_selected_rels(&self) -> u32 {
        self.rel_selector.count_ones()
    }

    pub fn is_subset_of(&self, other: &SubqueryGraph) -> bool {
        self.node_selector & other.node_selector == self.node_selector
            && self.rel_selector & other.rel_selector == self.rel_selector
    }

    pub fn contains_all_variables(&self, graph: &QueryGraph, variables: &[String]) -> bool {
        for var in variables {
            if let Some(pos) = graph.node_pos(var) {
                if !self.has_node(pos) {
                    return false;
                }
            }
            if let Some(pos) = graph.rel_pos(var) {
                if !self.has_rel(pos) {
                    return false;
                }
            }
        }
        true
    }

    /// Unselected nodes that are an endpoint of a selected rel.
    pub fn node_nbr_positions(&self, graph: &QueryGraph) -> HashSet<usize> {
        let mut result = HashSet::new();
        for rel_pos in 0..graph.num_rels() {
            if !self.has_rel(rel_pos) {
                continue;
            }
            let rel = graph.rel(rel_pos);
            for endpoint in [&rel.src_node_name, &rel.dst_node_name] {
                let node_pos = graph.node_pos(endpoint).expect("endpoint is in the graph");
                if !self.has_node(node_pos) {
                    result.insert(node_pos);
                }
            }
        }
        result
    }

    /// Unselected rels with at least one selected endpoint.
    pub fn rel_nbr_positions(&self, graph: &QueryGraph) -> HashSet<usize> {
        let mut result = HashSet::new();
        for rel_pos in 0..graph.num_rels() {
            if self.has_rel(rel_pos) {
                continue;
            }
            let rel = graph.rel(rel_pos);
            let src = graph.node_pos(&rel.src_node_name).expect("src in graph");
            let dst = graph.node_pos(&rel.dst_node_name).expect("dst in graph");
            if self.has_node(src) || self.has_node(dst) {
                result.insert(rel_pos);
            }
        }
        result
    }

    /// All size-1 extensions.
    pub fn base_nbr_subgraphs(&self, graph: &QueryGraph) -> HashSet<SubqueryGraph> {
        let mut result = HashSet::new();
        for node_pos in self.node_nbr_positions(graph) {
            let mut nbr = *self;
            nbr.add_node(node_pos);
            result.insert(nbr);
        }
        for rel_pos in self.rel_nbr_positions(graph) {
            let mut nbr = *self;
            nbr.add_rel(rel_pos);
            result.insert(nbr);
        }
        result
    }

    fn next_nbr_subgraphs(&self, graph: &QueryGraph, prev: &SubqueryGraph) -> HashSet<SubqueryGraph> {
        let mut result = HashSet::new();
        for node_pos in prev.node_nbr_positions(graph) {
            if self.has_node(node_pos) {
                continue;
            }
            let mut nbr = *prev;
            nbr.add_node(node_pos);
            result.insert(nbr);
        }
        for rel_pos in prev.rel_nbr_positions(graph) {
            if self.has_rel(rel_pos) {
                continue;
            }
            let mut nbr = *prev;
            nbr.add_rel(rel_pos);
            result.insert(nbr);
        }
        result
    }

    /// Iterate size-1 expansions `size` times over the rolling
    /// frontier.
    pub fn nbr_subgraphs(&self, graph: &QueryGraph, size: u32) -> HashSet<SubqueryGraph> {
        let mut result = self.base_nbr_subgraphs(graph);
        for _ in 1..size {
            let mut next = HashSet::new();
            for prev in &result {
                for nbr in self.next_nbr_subgraphs(graph, prev) {
                    next.insert(nbr);
                }
            }
            result = next;
        }
        result
    }

    /// Node positions where this subgraph and `nbr` connect, i.e. the
    /// join keys between the two.
    pub fn connected_node_positions(&self, nbr: &SubqueryGraph, graph: &QueryGraph) -> Vec<usize> {
        let mut result = Vec::new();
        for node_pos in self.node_nbr_positions(graph) {
            if nbr.has_node(node_pos) {
                result.push(node_pos);
            }
        }
        for node_pos in nbr.node_nbr_positions(graph) {
            if self.has_node(node_pos) {
                result.push(node_pos);
            }
        }
        result.sort_unstable();
        result.dedup();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> QueryNode {
        QueryNode {
            unique_name: name.to_string(),
            table_ids: vec![0],
        }
    }

    fn rel(name: &str, src: &str, dst: &str) -> QueryRel {
        QueryRel {
            unique_name: name.to_string(),
            table_ids: vec![0],
            src_node_name: src.to_string(),
            dst_node_name: dst.to_string(),
            range: None,
        }
    }

    /// `(a)-[r1]->(b)-[r2]->(c)`
    fn two_hop() -> QueryGraph {
        let mut graph = QueryGraph::new();
        graph.add_node(node("a"));
        graph.add_node(node("b"));
        graph.add_node(node("c"));
        graph.add_rel(rel("r1", "a", "b"));
        graph.add_rel(rel("r2", "b", "c"));
        graph
    }

    #[test]
    fn merge_is_idempotent() {
        let mut g1 = two_hop();
        let g2 = two_hop();
        g1.merge(&g2);
        assert_eq!(g1.num_nodes(), 3);
        assert_eq!(g1.num_rels(), 2);
    }

    #[test]
    fn collection_merges_connected_graphs() {
        let mut collection = QueryGraphCollection::default();
        let mut g1 = QueryGraph::new();
        g1.add_node(node("a"));
        g1.add_node(node("b"));
        g1.add_rel(rel("r1", "a", "b"));
        let mut g2 = QueryGraph::new();
        g2.add_node(node("c"));
        g2.add_node(node("d"));
        g2.add_rel(rel("r2", "c", "d"));
        collection.add_and_merge_if_connected(g1);
        collection.add_and_merge_if_connected(g2);
        assert_eq!(collection.graphs.len(), 2);
        // a bridge merges the two components
        let mut g3 = QueryGraph::new();
        g3.add_node(node("b"));
        g3.add_node(node("c"));
        g3.add_rel(rel("r3", "b", "c"));
        collection.add_and_merge_if_connected(g3);
        assert_eq!(collection.graphs.len(), 1);
        assert_eq!(collection.graphs[0].num_nodes(), 4);
        assert_eq!(collection.graphs[0].num_rels(), 3);
    }

    #[test]
    fn scenario_two_hop_enumeration() {
        // from {a}, the only reachable size-3 subgraph is
        // {a, r1, b}; size-5 is the full graph
        let graph = two_hop();
        let mut start = SubqueryGraph::empty();
        start.add_node(graph.node_pos("a").unwrap());

        let size3: Vec<SubqueryGraph> = start
            .nbr_subgraphs(&graph, 2)
            .into_iter()
            .filter(|s| s.num_selected() == 3)
            .collect();
        assert_eq!(size3.len(), 1);
        let mut expected = SubqueryGraph::empty();
        expected.add_node(graph.node_pos("a").unwrap());
        expected.add_node(graph.node_pos("b").unwrap());
        expected.add_rel(graph.rel_pos("r1").unwrap());
        assert_eq!(size3[0], expected);

        let size5: Vec<SubqueryGraph> = start
            .nbr_subgraphs(&graph, 4)
            .into_iter()
            .filter(|s| s.num_selected() == 5)
            .collect();
        assert_eq!(size5.len(), 1);
        assert_eq!(size5[0], graph.full_subgraph());
    }

    #[test]
    fn nbr_subgraphs_grow_by_exactly_k() {
        let graph = two_hop();
        let mut start = SubqueryGraph::empty();
        start.add_node(0);
        for k in 1..=4u32 {
            for nbr in start.nbr_subgraphs(&graph, k) {
                assert_eq!(nbr.num_selected(), 1 + k);
                // connected to the start by at least one rel
                assert!(nbr.rel_selector != 0);
                assert!(start.is_subset_of(&nbr));
            }
        }
    }

    /// Expanding from every single-node seed enumerates exactly the
    /// connected subsets whose every selected rel has a selected
    /// endpoint, and each is reachable from a predecessor one smaller.
    #[test]
    fn exhaustive_enumeration_matches_brute_force() {
        let graph = two_hop();
        let num_vars = graph.num_nodes() + graph.num_rels();

        // brute force: every (nodes, rels) selection that is valid
        // (each rel endpoint rule) and connected as one component
        let mut expected = HashSet::new();
        for node_bits in 0u64..(1 << graph.num_nodes()) {
            for rel_bits in 0u64..(1 << graph.num_rels()) {
                let sub = SubqueryGraph {
                    node_selector: node_bits,
                    rel_selector: rel_bits,
                };
                if sub.num_selected() == 0 {
                    continue;
                }
                if brute_force_is_valid_connected(&graph, &sub) {
                    expected.insert(sub);
                }
            }
        }

        // enumerated: every single-node seed plus its expansions
        let mut enumerated = HashSet::new();
        for node_pos in 0..graph.num_nodes() {
            let mut seed = SubqueryGraph::empty();
            seed.add_node(node_pos);
            enumerated.insert(seed);
            for k in 1..num_vars as u32 {
                for sub in seed.nbr_subgraphs(&graph, k) {
                    enumerated.insert(sub);
                }
            }
        }

        assert_eq!(enumerated, expected);
    }

    fn brute_force_is_valid_connected(graph: &QueryGraph, sub: &SubqueryGraph) -> bool {
        // single node is trivially connected
        if sub.rel_selector == 0 {
            return sub.num_selected_nodes() == 1;
        }
        // union-find over selected variables through selected rels
        // and their endpoints; a rel always connects to its selected
        // endpoints, and an unselected endpoint does not join parts
        let mut parent: Vec<usize> = (0..graph.num_nodes() + graph.num_rels()).collect();
        fn find(parent: &mut Vec<usize>, x: usize) -> usize {
            if parent[x] != x {
                let root = find(parent, parent[x]);
                parent[x] = root;
            }
            parent[x]
        }
        let mut selected: Vec<usize> = Vec::new();
        for pos in 0..graph.num_nodes() {
            if sub.has_node(pos) {
                selected.push(pos);
            }
        }
        for rel_pos in 0..graph.num_rels() {
            if !sub.has_rel(rel_pos) {
                continue;
            }
            selected.push(graph.num_nodes() + rel_pos);
            let rel = graph.rel(rel_pos);
            let src = graph.node_pos(&rel.src_node_name).unwrap();
            let dst = graph.node_pos(&rel.dst_node_name).unwrap();
            let mut has_selected_endpoint = false;
            for endpoint in [src, dst] {
                if sub.has_node(endpoint) {
                    has_selected_endpoint = true;
                    let a = find(&mut parent, graph.num_nodes() + rel_pos);
                    let b = find(&mut parent, endpoint);
                    parent[a] = b;
                }
            }
            if !has_selected_endpoint {
                return false;
            }
        }
        let root = find(&mut parent, selected[0]);
        selected
            .into_iter()
            .all(|v| find(&mut parent, v) == root)
    }
}
