pub mod expression;
pub mod query_graph;

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::schema::{RelMultiplicity, TableSchema};
use crate::catalog::CatalogContent;
use crate::common::copy_desc::{CopyDescription, FileType};
use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::parser::ast::{self, Expr, Literal, RelQuantifier, Statement};
use crate::types::{PropertyId, TableId};

use expression::{AggFunc, BoundExpr};
use query_graph::{QueryGraph, QueryGraphCollection, QueryNode, QueryRel};

#[derive(Debug, Clone, PartialEq)]
pub enum VarKind {
    Node { table_ids: Vec<TableId> },
    Rel { table_ids: Vec<TableId> },
    Value,
}

/// Binding scope: insertion-ordered variable set of the current query
/// part.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: Vec<(String, VarKind)>,
}

impl Scope {
    pub fn get(&self, name: &str) -> Option<&VarKind> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, k)| k)
    }

    pub fn insert(&mut self, name: String, kind: VarKind) {
        if let Some(existing) = self.vars.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = kind;
        } else {
            self.vars.push((name, kind));
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, VarKind)> {
        self.vars.iter()
    }
}

#[derive(Debug, Clone)]
pub enum BoundReading {
    Match {
        optional: bool,
        graphs: Vec<QueryGraph>,
        predicate: Option<BoundExpr>,
    },
    Unwind {
        expr: BoundExpr,
        var: String,
    },
}

#[derive(Debug, Clone)]
pub enum BoundUpdating {
    CreateNode {
        var: String,
        table_id: TableId,
        /// `(property id, type, value)`
        props: Vec<(PropertyId, LogicalType, BoundExpr)>,
    },
    SetProps {
        /// `(node var, property name, value)`
        items: Vec<(String, String, BoundExpr)>,
    },
    DeleteNode {
        detach: bool,
        vars: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct BoundProjection {
    pub distinct: bool,
    pub items: Vec<(BoundExpr, String)>,
    pub order_by: Vec<(BoundExpr, bool)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub has_aggregate: bool,
    /// `WITH ... WHERE`, evaluated over the projected columns
    pub where_clause: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundQueryPart {
    pub readings: Vec<BoundReading>,
    pub updatings: Vec<BoundUpdating>,
    pub projection: Option<BoundProjection>,
    pub is_return: bool,
    /// variables visible while executing this part
    pub scope: Scope,
    /// `(rel var, property name, column name)` the extend operators
    /// must emit
    pub rel_prop_reads: Vec<(String, String, String)>,
    /// `(node var, property name, column name)` materialized from
    /// node columns before expression evaluation
    pub node_prop_reads: Vec<(String, String, String)>,
}

#[derive(Debug, Clone)]
pub struct BoundQuery {
    pub parts: Vec<BoundQueryPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    Begin { read_only: bool },
    Commit { skip_checkpoint: bool },
    Rollback { skip_checkpoint: bool },
}

#[derive(Debug, Clone)]
pub enum BoundAlter {
    AddProperty {
        name: String,
        logical_type: LogicalType,
    },
    DropProperty {
        name: String,
    },
    RenameProperty {
        old: String,
        new: String,
    },
    RenameTable {
        new: String,
    },
}

#[derive(Debug, Clone)]
pub enum BoundStatement {
    Query(BoundQuery),
    CreateNodeTable {
        name: String,
        properties: Vec<(String, LogicalType)>,
        primary_key_idx: usize,
    },
    CreateRelTable {
        name: String,
        src_table_id: TableId,
        dst_table_id: TableId,
        properties: Vec<(String, LogicalType)>,
        multiplicity: RelMultiplicity,
    },
    DropTable {
        table_id: TableId,
    },
    AlterTable {
        table_id: TableId,
        action: BoundAlter,
    },
    CopyFrom {
        table_id: TableId,
        desc: CopyDescription,
    },
    CopyTo {
        query: BoundQuery,
        path: String,
    },
    CommentOn {
        table_id: TableId,
        comment: String,
    },
    Transaction(TxAction),
    Explain {
        inner: Box<BoundStatement>,
        profile: bool,
    },
}

/// AST to typed algebra over the catalog.
pub struct Binder {
    catalog: Arc<CatalogContent>,
    anon_counter: u32,
}

impl Binder {
    pub fn new(catalog: Arc<CatalogContent>) -> Self {
        Self {
            catalog,
            anon_counter: 0,
        }
    }

    fn fresh_anon(&mut self) -> String {
        let name = format!("_anon{}", self.anon_counter);
        self.anon_counter += 1;
        name
    }

    pub fn bind(&mut self, statement: &Statement) -> DbResult<BoundStatement> {
        match statement {
            Statement::Query(query) => Ok(BoundStatement::Query(self.bind_query(query)?)),
            Statement::CreateNodeTable {
                name,
                properties,
                primary_key,
                ..
            } => self.bind_create_node_table(name, properties, primary_key),
            Statement::CreateRelTable {
                name,
                src,
                dst,
                properties,
                multiplicity,
                ..
            } => self.bind_create_rel_table(name, src, dst, properties, multiplicity.as_deref()),
            Statement::CreateRelTableGroup { .. } => {
                Err(DbError::binder("CREATE REL TABLE GROUP is not supported"))
            }
            Statement::CreateRdfGraph { .. } => {
                Err(DbError::binder("CREATE RDF GRAPH is not supported"))
            }
            Statement::CreateMacro { .. } => Err(DbError::binder("CREATE MACRO is not supported")),
            Statement::DropTable { name, .. } => {
                let table_id = self.catalog.table_id_by_name(name)?;
                if let TableSchema::Node(_) = self.catalog.table_schema(table_id)? {
                    let touching = self.catalog.rel_tables_touching(table_id);
                    if let Some(rel) = touching.first() {
                        return Err(DbError::binder(format!(
                            "cannot drop table {} because rel table {} depends on it",
                            name, rel.name
                        )));
                    }
                }
                Ok(BoundStatement::DropTable { table_id })
            }
            Statement::AlterTable { table, action, .. } => {
                let table_id = self.catalog.table_id_by_name(table)?;
                let action = match action {
                    ast::AlterAction::AddProperty { name, type_name } => BoundAlter::AddProperty {
                        name: name.clone(),
                        logical_type: LogicalType::parse(type_name)?,
                    },
                    ast::AlterAction::DropProperty { name } => BoundAlter::DropProperty {
                        name: name.clone(),
                    },
                    ast::AlterAction::RenameProperty { old, new } => BoundAlter::RenameProperty {
                        old: old.clone(),
                        new: new.clone(),
                    },
                    ast::AlterAction::RenameTable { new } => {
                        BoundAlter::RenameTable { new: new.clone() }
                    }
                };
                Ok(BoundStatement::AlterTable { table_id, action })
            }
            Statement::CopyFrom {
                table,
                paths,
                options,
                by_column,
                ..
            } => self.bind_copy_from(table, paths, options, *by_column),
            Statement::CopyTo { query, path, .. } => Ok(BoundStatement::CopyTo {
                query: self.bind_query(query)?,
                path: path.clone(),
            }),
            Statement::StandaloneCall { option, .. } => Err(DbError::binder(format!(
                "unknown database option: {}",
                option
            ))),
            Statement::CommentOn { table, comment, .. } => Ok(BoundStatement::CommentOn {
                table_id: self.catalog.table_id_by_name(table)?,
                comment: comment.clone(),
            }),
            Statement::BeginTransaction { read_only, .. } => Ok(BoundStatement::Transaction(
                TxAction::Begin {
                    read_only: *read_only,
                },
            )),
            Statement::Commit {
                skip_checkpoint, ..
            } => Ok(BoundStatement::Transaction(TxAction::Commit {
                skip_checkpoint: *skip_checkpoint,
            })),
            Statement::Rollback {
                skip_checkpoint, ..
            } => Ok(BoundStatement::Transaction(TxAction::Rollback {
                skip_checkpoint: *skip_checkpoint,
            })),
            Statement::Explain { inner, profile, .. } => Ok(BoundStatement::Explain {
                inner: Box::new(self.bind(inner)?),
                profile: *profile,
            }),
        }
    }

    // DDL

    fn bind_create_node_table(
        &self,
        name: &str,
        properties: &[(String, String)],
        primary_key: &str,
    ) -> DbResult<BoundStatement> {
        if self.catalog.name_to_id.contains_key(name) {
            return Err(DbError::binder(format!("{} already exists in catalog", name)));
        }
        let mut bound = Vec::new();
        for (prop_name, type_name) in properties {
            if crate::catalog::schema::is_reserved_property_name(prop_name) {
                return Err(DbError::binder(format!(
                    "{} is a reserved property name",
                    prop_name
                )));
            }
            bound.push((prop_name.clone(), LogicalType::parse(type_name)?));
        }
        let primary_key_idx = bound
            .iter()
            .position(|(n, _)| n == primary_key)
            .ok_or_else(|| {
                DbError::binder(format!(
                    "primary key {} is not a property of table {}",
                    primary_key, name
                ))
            })?;
        match bound[primary_key_idx].1 {
            LogicalType::Int64 | LogicalType::String | LogicalType::Serial => {}
            ref other => {
                return Err(DbError::binder(format!(
                    "data type {} is not supported as a primary key",
                    other
                )))
            }
        }
        Ok(BoundStatement::CreateNodeTable {
            name: name.to_string(),
            properties: bound,
            primary_key_idx,
        })
    }

    fn bind_create_rel_table(
        &self,
        name: &str,
        src: &str,
        dst: &str,
        properties: &[(String, String)],
        multiplicity: Option<&str>,
    ) -> DbResult<BoundStatement> {
        if self.catalog.name_to_id.contains_key(name) {
            return Err(DbError::binder(format!("{} already exists in catalog", name)));
        }
        let src_table_id = self.catalog.table_id_by_name(src)?;
        let dst_table_id = self.catalog.table_id_by_name(dst)?;
        // both endpoints must be node tables
        self.catalog.node_table_schema(src_table_id)?;
        self.catalog.node_table_schema(dst_table_id)?;
        let mut bound = Vec::new();
        for (prop_name, type_name) in properties {
            if crate::catalog::schema::is_reserved_property_name(prop_name) {
                return Err(DbError::binder(format!(
                    "{} is a reserved property name",
                    prop_name
                )));
            }
            bound.push((prop_name.clone(), LogicalType::parse(type_name)?));
        }
        let multiplicity = match multiplicity {
            Some(m) => RelMultiplicity::parse(m)?,
            None => RelMultiplicity::ManyMany,
        };
        Ok(BoundStatement::CreateRelTable {
            name: name.to_string(),
            src_table_id,
            dst_table_id,
            properties: bound,
            multiplicity,
        })
    }

    fn bind_copy_from(
        &self,
        table: &str,
        paths: &[String],
        options: &[(String, String)],
        by_column: bool,
    ) -> DbResult<BoundStatement> {
        let table_id = self.catalog.table_id_by_name(table)?;
        let options: HashMap<String, String> = options.iter().cloned().collect();
        let mut desc = CopyDescription::new(paths.to_vec(), &options)?;
        if by_column || desc.file_type == FileType::Npy {
            let schema = self.catalog.node_table_schema(table_id)?;
            let data_properties: Vec<PropertyId> = schema
                .properties
                .iter()
                .filter(|p| !matches!(p.logical_type, LogicalType::Serial))
                .map(|p| p.id)
                .collect();
            if data_properties.len() != paths.len() {
                return Err(DbError::copy(format!(
                    "table {} has {} properties to copy but {} files were given",
                    table,
                    data_properties.len(),
                    paths.len()
                )));
            }
            desc.property_to_npy = Some(
                data_properties
                    .into_iter()
                    .zip(paths.iter().cloned())
                    .collect(),
            );
        }
        Ok(BoundStatement::CopyFrom { table_id, desc })
    }

    // queries

    pub fn bind_query(&mut self, query: &ast::Query) -> DbResult<BoundQuery> {
        let mut parts = Vec::new();
        let mut scope = Scope::default();
        for part in &query.parts {
            let bound = self.bind_query_part(part, scope)?;
            scope = bound.next_scope()?;
            parts.push(bound);
        }
        Ok(BoundQuery { parts })
    }

    fn bind_query_part(&mut self, part: &ast::QueryPart, scope: Scope) -> DbResult<BoundQueryPart> {
        let mut scope = scope;
        let mut readings = Vec::new();
        let mut all_exprs: Vec<BoundExpr> = Vec::new();
        for reading in &part.readings {
            match reading {
                ast::ReadingClause::Match {
                    optional,
                    patterns,
                    where_clause,
                    ..
                } => {
                    let (graphs, mut inline_predicates) =
                        self.bind_patterns(patterns, &mut scope)?;
                    let mut predicate = None;
                    if let Some(where_expr) = where_clause {
                        inline_predicates.push(self.bind_expr(where_expr, &scope)?);
                    }
                    for conjunct in inline_predicates {
                        all_exprs.push(conjunct.clone());
                        predicate = Some(match predicate {
                            None => conjunct,
                            Some(prev) => BoundExpr::Binary {
                                op: ast::BinOp::And,
                                left: Box::new(prev),
                                right: Box::new(conjunct),
                            },
                        });
                    }
                    readings.push(BoundReading::Match {
                        optional: *optional,
                        graphs,
                        predicate,
                    });
                }
                ast::ReadingClause::Unwind { expr, var, .. } => {
                    let bound = self.bind_expr(expr, &scope)?;
                    all_exprs.push(bound.clone());
                    scope.insert(var.clone(), VarKind::Value);
                    readings.push(BoundReading::Unwind {
                        expr: bound,
                        var: var.clone(),
                    });
                }
                ast::ReadingClause::LoadFrom { .. } => {
                    return Err(DbError::binder("LOAD FROM is not supported"));
                }
                ast::ReadingClause::InQueryCall { function, .. } => {
                    return Err(DbError::binder(format!(
                        "table function {} is not supported",
                        function
                    )));
                }
            }
        }

        let mut updatings = Vec::new();
        for updating in &part.updatings {
            updatings.push(self.bind_updating(updating, &mut scope, &mut all_exprs)?);
        }

        let projection = match &part.projection {
            Some(body) => Some(self.bind_projection(body, &scope, &mut all_exprs)?),
            None => None,
        };

        let (node_prop_reads, rel_prop_reads) = self.collect_prop_reads(&scope, &all_exprs)?;
        Ok(BoundQueryPart {
            readings,
            updatings,
            projection,
            is_return: part.is_return,
            scope,
            rel_prop_reads,
            node_prop_reads,
        })
    }

    /// Every `var.key` column the part evaluates, validated against
    /// the candidate tables and split into node and rel reads.
    fn collect_prop_reads(
        &self,
        scope: &Scope,
        exprs: &[BoundExpr],
    ) -> DbResult<(Vec<(String, String, String)>, Vec<(String, String, String)>)> {
        let mut referenced = Vec::new();
        for expr in exprs {
            expr.referenced_columns(&mut referenced);
        }
        referenced.sort();
        referenced.dedup();
        let mut node_reads = Vec::new();
        let mut rel_reads = Vec::new();
        for column in referenced {
            let (var, key) = match column.split_once('.') {
                Some(split) => split,
                None => continue,
            };
            match scope.get(var) {
                Some(VarKind::Node { table_ids }) => {
                    for table_id in table_ids {
                        let schema = self.catalog.node_table_schema(*table_id)?;
                        if schema.property_by_name(key).is_none() {
                            return Err(DbError::binder(format!(
                                "{} does not have property {}",
                                schema.name, key
                            )));
                        }
                    }
                    node_reads.push((var.to_string(), key.to_string(), column.clone()));
                }
                Some(VarKind::Rel { table_ids }) => {
                    for table_id in table_ids {
                        let schema = self.catalog.rel_table_schema(*table_id)?;
                        if schema.property_by_name(key).is_none() {
                            return Err(DbError::binder(format!(
                                "{} does not have property {}",
                                schema.name, key
                            )));
                        }
                    }
                    rel_reads.push((var.to_string(), key.to_string(), column.clone()));
                }
                Some(VarKind::Value) => {
                    return Err(DbError::binder(format!(
                        "{} is not a node or rel; cannot read property {}",
                        var, key
                    )));
                }
                None => {
                    // a plain column produced by an earlier WITH whose
                    // name happens to contain a dot
                    continue;
                }
            }
        }
        Ok((node_reads, rel_reads))
    }

    fn bind_patterns(
        &mut self,
        patterns: &[ast::PatternPart],
        scope: &mut Scope,
    ) -> DbResult<(Vec<QueryGraph>, Vec<BoundExpr>)> {
        let mut collection = QueryGraphCollection::default();
        let mut predicates = Vec::new();
        for pattern in patterns {
            let graph = self.bind_pattern_part(pattern, scope, &mut predicates)?;
            collection.add_and_merge_if_connected(graph);
        }
        let mut graphs = collection.graphs;
        for graph in &mut graphs {
            resolve_table_candidates(&self.catalog, graph)?;
            // propagate the resolution back into the scope
            for node in graph.nodes() {
                scope.insert(
                    node.unique_name.clone(),
                    VarKind::Node {
                        table_ids: node.table_ids.clone(),
                    },
                );
            }
            for rel in graph.rels() {
                scope.insert(
                    rel.unique_name.clone(),
                    VarKind::Rel {
                        table_ids: rel.table_ids.clone(),
                    },
                );
            }
        }
        Ok((graphs, predicates))
    }

    fn bind_pattern_part(
        &mut self,
        pattern: &ast::PatternPart,
        scope: &mut Scope,
        predicates: &mut Vec<BoundExpr>,
    ) -> DbResult<QueryGraph> {
        let mut graph = QueryGraph::new();
        let mut prev =
            self.bind_node_pattern(&pattern.first, &mut graph, scope, predicates)?;
        for (rel, node) in &pattern.chain {
            let next = self.bind_node_pattern(node, &mut graph, scope, predicates)?;
            self.bind_rel_pattern(rel, &prev, &next, &mut graph, scope, predicates)?;
            prev = next;
        }
        Ok(graph)
    }

    fn bind_node_pattern(
        &mut self,
        node: &ast::NodePattern,
        graph: &mut QueryGraph,
        scope: &mut Scope,
        predicates: &mut Vec<BoundExpr>,
    ) -> DbResult<String> {
        let name = node.var.clone().unwrap_or_else(|| self.fresh_anon());
        if node.labels.len() > 1 {
            return Err(DbError::binder(format!(
                "node {} has multiple labels; at most one is supported",
                name
            )));
        }
        let table_ids = match node.labels.first() {
            Some(label) => {
                let table_id = self.catalog.table_id_by_name(label)?;
                self.catalog.node_table_schema(table_id)?;
                vec![table_id]
            }
            None => match scope.get(&name) {
                Some(VarKind::Node { table_ids }) => table_ids.clone(),
                Some(_) => {
                    return Err(DbError::binder(format!(
                        "{} is already bound to a non-node value",
                        name
                    )))
                }
                None => self.catalog.node_table_ids(),
            },
        };
        if table_ids.is_empty() {
            return Err(DbError::binder(format!(
                "cannot bind a node table for variable {}",
                name
            )));
        }
        graph.add_node(QueryNode {
            unique_name: name.clone(),
            table_ids: table_ids.clone(),
        });
        scope.insert(name.clone(), VarKind::Node { table_ids });
        for (key, value) in &node.props {
            let bound_value = self.bind_expr(value, scope)?;
            predicates.push(BoundExpr::Binary {
                op: ast::BinOp::Eq,
                left: Box::new(BoundExpr::Column(format!("{}.{}", name, key))),
                right: Box::new(bound_value),
            });
        }
        Ok(name)
    }

    fn bind_rel_pattern(
        &mut self,
        rel: &ast::RelPattern,
        prev_node: &str,
        next_node: &str,
        graph: &mut QueryGraph,
        scope: &mut Scope,
        predicates: &mut Vec<BoundExpr>,
    ) -> DbResult<()> {
        if rel.quantifier != RelQuantifier::None {
            return Err(DbError::binder(
                "SHORTEST path queries are not supported",
            ));
        }
        let name = rel.var.clone().unwrap_or_else(|| self.fresh_anon());
        if graph.contains_rel(&name) || matches!(scope.get(&name), Some(VarKind::Rel { .. })) {
            return Err(DbError::binder(format!(
                "rel variable {} is bound more than once; rels cannot repeat in a pattern",
                name
            )));
        }
        let (src, dst) = match rel.direction {
            ast::ArrowDirection::Right => (prev_node.to_string(), next_node.to_string()),
            ast::ArrowDirection::Left => (next_node.to_string(), prev_node.to_string()),
            ast::ArrowDirection::Undirected => {
                return Err(DbError::binder(
                    "undirected relationships are not supported",
                ))
            }
        };
        let table_ids = if rel.labels.is_empty() {
            self.catalog.rel_table_ids()
        } else {
            let mut ids = Vec::new();
            for label in &rel.labels {
                let table_id = self.catalog.table_id_by_name(label)?;
                self.catalog.rel_table_schema(table_id)?;
                ids.push(table_id);
            }
            ids
        };
        if table_ids.is_empty() {
            return Err(DbError::binder(format!(
                "cannot bind a rel table for variable {}",
                name
            )));
        }
        if let Some((lo, hi)) = rel.range {
            if lo == 0 || hi < lo {
                return Err(DbError::binder(format!(
                    "invalid variable-length bounds {}..{}",
                    lo, hi
                )));
            }
            if !rel.props.is_empty() {
                return Err(DbError::binder(
                    "property filters on variable-length rels are not supported",
                ));
            }
        }
        graph.add_rel(QueryRel {
            unique_name: name.clone(),
            table_ids: table_ids.clone(),
            src_node_name: src,
            dst_node_name: dst,
            range: rel.range,
        });
        scope.insert(name.clone(), VarKind::Rel { table_ids });
        for (key, value) in &rel.props {
            let bound_value = self.bind_expr(value, scope)?;
            predicates.push(BoundExpr::Binary {
                op: ast::BinOp::Eq,
                left: Box::new(BoundExpr::Column(format!("{}.{}", name, key))),
                right: Box::new(bound_value),
            });
        }
        Ok(())
    }

    fn bind_updating(
        &mut self,
        updating: &ast::UpdatingClause,
        scope: &mut Scope,
        all_exprs: &mut Vec<BoundExpr>,
    ) -> DbResult<BoundUpdating> {
        match updating {
            ast::UpdatingClause::Create { patterns, .. } => {
                // a single node pattern per CREATE in this build
                if patterns.len() != 1 || !patterns[0].chain.is_empty() {
                    return Err(DbError::binder(
                        "CREATE supports a single node pattern; creating rels is not supported",
                    ));
                }
                let node = &patterns[0].first;
                let label = node.labels.first().ok_or_else(|| {
                    DbError::binder("CREATE requires a node label")
                })?;
                let table_id = self.catalog.table_id_by_name(label)?;
                let schema = self.catalog.node_table_schema(table_id)?.clone();
                let var = node.var.clone().unwrap_or_else(|| self.fresh_anon());
                let mut props = Vec::new();
                for (key, value) in &node.props {
                    let property = schema.property_by_name(key).ok_or_else(|| {
                        DbError::binder(format!(
                            "{} does not have property {}",
                            schema.name, key
                        ))
                    })?;
                    let bound = self.bind_expr(value, scope)?;
                    all_exprs.push(bound.clone());
                    props.push((property.id, property.logical_type.clone(), bound));
                }
                scope.insert(
                    var.clone(),
                    VarKind::Node {
                        table_ids: vec![table_id],
                    },
                );
                Ok(BoundUpdating::CreateNode {
                    var,
                    table_id,
                    props,
                })
            }
            ast::UpdatingClause::Merge { .. } => {
                Err(DbError::binder("MERGE is not supported"))
            }
            ast::UpdatingClause::Set { items, .. } => {
                let mut bound_items = Vec::new();
                for (target, value) in items {
                    let (var, key) = match target {
                        Expr::Property { var, key, .. } => (var.clone(), key.clone()),
                        _ => {
                            return Err(DbError::binder(
                                "SET expects property assignments like a.x = 1",
                            ))
                        }
                    };
                    match scope.get(&var) {
                        Some(VarKind::Node { table_ids }) => {
                            for table_id in table_ids {
                                let schema = self.catalog.node_table_schema(*table_id)?;
                                if schema.property_by_name(&key).is_none() {
                                    return Err(DbError::binder(format!(
                                        "{} does not have property {}",
                                        schema.name, key
                                    )));
                                }
                            }
                        }
                        Some(_) => {
                            return Err(DbError::binder(
                                "SET on rel properties is not supported",
                            ))
                        }
                        None => {
                            return Err(DbError::binder(format!(
                                "variable {} is not in scope",
                                var
                            )))
                        }
                    }
                    let bound = self.bind_expr(value, scope)?;
                    all_exprs.push(bound.clone());
                    bound_items.push((var, key, bound));
                }
                Ok(BoundUpdating::SetProps { items: bound_items })
            }
            ast::UpdatingClause::Delete { detach, exprs, .. } => {
                let mut vars = Vec::new();
                for expr in exprs {
                    match expr {
                        Expr::Variable(name, _) => match scope.get(name) {
                            Some(VarKind::Node { .. }) => vars.push(name.clone()),
                            Some(_) => {
                                return Err(DbError::binder(
                                    "DELETE of rels is not supported",
                                ))
                            }
                            None => {
                                return Err(DbError::binder(format!(
                                    "variable {} is not in scope",
                                    name
                                )))
                            }
                        },
                        _ => {
                            return Err(DbError::binder(
                                "DELETE expects node variables",
                            ))
                        }
                    }
                }
                Ok(BoundUpdating::DeleteNode {
                    detach: *detach,
                    vars,
                })
            }
        }
    }

    fn bind_projection(
        &mut self,
        body: &ast::ProjectionBody,
        scope: &Scope,
        all_exprs: &mut Vec<BoundExpr>,
    ) -> DbResult<BoundProjection> {
        let mut items = Vec::new();
        if body.star {
            for (name, kind) in scope.iter() {
                if name.starts_with("_anon") {
                    continue;
                }
                let expr = match kind {
                    VarKind::Rel { .. } => BoundExpr::Column(format!("{}._id", name)),
                    _ => BoundExpr::Column(name.clone()),
                };
                items.push((expr, name.clone()));
            }
            if items.is_empty() {
                return Err(DbError::binder("RETURN * with an empty scope"));
            }
        }
        for (expr, alias) in &body.items {
            let bound = self.bind_expr(expr, scope)?;
            let name = alias.clone().unwrap_or_else(|| display_expr(expr));
            items.push((bound, name));
        }
        for (bound, _) in &items {
            all_exprs.push(bound.clone());
        }
        let has_aggregate = items.iter().any(|(e, _)| e.has_aggregate());

        let mut order_by = Vec::new();
        for (expr, asc) in &body.order_by {
            // ORDER BY may address output columns by alias or text,
            // or (without aggregation) any input-scope expression
            let name = display_expr(expr);
            let bound = if items.iter().any(|(_, n)| *n == name) {
                BoundExpr::Column(name)
            } else if has_aggregate {
                return Err(DbError::binder(format!(
                    "ORDER BY {} must appear in the aggregated projection",
                    name
                )));
            } else {
                self.bind_expr(expr, scope)?
            };
            all_exprs.push(bound.clone());
            order_by.push((bound, *asc));
        }
        let skip = body.skip.as_ref().map(literal_u64).transpose()?;
        let limit = body.limit.as_ref().map(literal_u64).transpose()?;
        // WITH ... WHERE binds against the projected columns
        let where_clause = match &body.where_clause {
            Some(expr) => {
                let mut out_scope = Scope::default();
                for (bound, name) in &items {
                    let kind = match bound {
                        BoundExpr::Column(column) => {
                            scope.get(column).cloned().unwrap_or(VarKind::Value)
                        }
                        _ => VarKind::Value,
                    };
                    out_scope.insert(name.clone(), kind);
                }
                Some(self.bind_expr(expr, &out_scope)?)
            }
            None => None,
        };
        Ok(BoundProjection {
            distinct: body.distinct,
            items,
            order_by,
            skip,
            limit,
            has_aggregate,
            where_clause,
        })
    }

    pub fn bind_expr(&mut self, expr: &Expr, scope: &Scope) -> DbResult<BoundExpr> {
        match expr {
            Expr::Literal(lit, _) => Ok(BoundExpr::Literal(bind_literal(lit))),
            Expr::Variable(name, pos) => match scope.get(name) {
                Some(VarKind::Rel { .. }) => {
                    Ok(BoundExpr::Column(format!("{}._id", name)))
                }
                Some(_) => Ok(BoundExpr::Column(name.clone())),
                None => Err(DbError::parser(
                    format!("variable {} is not in scope", name),
                    pos.line,
                    pos.column,
                )),
            },
            Expr::Property { var, key, pos } => {
                if scope.get(var).is_none() {
                    return Err(DbError::parser(
                        format!("variable {} is not in scope", var),
                        pos.line,
                        pos.column,
                    ));
                }
                Ok(BoundExpr::Column(format!("{}.{}", var, key)))
            }
            Expr::Binary {
                op, left, right, ..
            } => Ok(BoundExpr::Binary {
                op: *op,
                left: Box::new(self.bind_expr(left, scope)?),
                right: Box::new(self.bind_expr(right, scope)?),
            }),
            Expr::Unary { op, expr, .. } => Ok(BoundExpr::Unary {
                op: *op,
                expr: Box::new(self.bind_expr(expr, scope)?),
            }),
            Expr::CountStar(_) => Ok(BoundExpr::Aggregate {
                func: AggFunc::CountStar,
                arg: None,
                distinct: false,
            }),
            Expr::FunctionCall {
                name,
                distinct,
                args,
                pos,
            } => {
                if name == "id" {
                    if args.len() != 1 {
                        return Err(DbError::parser(
                            "id() expects one argument",
                            pos.line,
                            pos.column,
                        ));
                    }
                    return self.bind_expr(&args[0], scope);
                }
                if let Some(func) = AggFunc::parse(name) {
                    if args.len() != 1 {
                        return Err(DbError::parser(
                            format!("{} expects one argument", name),
                            pos.line,
                            pos.column,
                        ));
                    }
                    return Ok(BoundExpr::Aggregate {
                        func,
                        arg: Some(Box::new(self.bind_expr(&args[0], scope)?)),
                        distinct: *distinct,
                    });
                }
                let mut bound_args = Vec::with_capacity(args.len());
                for arg in args {
                    bound_args.push(self.bind_expr(arg, scope)?);
                }
                Ok(BoundExpr::ScalarFn {
                    name: name.clone(),
                    args: bound_args,
                })
            }
            Expr::List(items, _) => {
                let mut bound = Vec::with_capacity(items.len());
                for item in items {
                    bound.push(self.bind_expr(item, scope)?);
                }
                Ok(BoundExpr::List(bound))
            }
            Expr::Parameter(name, pos) => Err(DbError::parser(
                format!("parameter ${} is not supported", name),
                pos.line,
                pos.column,
            )),
        }
    }
}

impl BoundQueryPart {
    /// Scope visible to the next part: the projected columns, keeping
    /// node/rel kinds for plain variable projections.
    fn next_scope(&self) -> DbResult<Scope> {
        let mut next = Scope::default();
        match &self.projection {
            Some(projection) => {
                for (expr, name) in &projection.items {
                    let kind = match expr {
                        BoundExpr::Column(column) => {
                            self.scope.get(column).cloned().unwrap_or(VarKind::Value)
                        }
                        _ => VarKind::Value,
                    };
                    next.insert(name.clone(), kind);
                }
            }
            None => {
                // terminal updating part
            }
        }
        Ok(next)
    }
}

fn bind_literal(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(v) => Value::Int64(*v),
        Literal::Double(v) => Value::Double(*v),
        Literal::String(s) => Value::String(s.clone()),
        Literal::Interval(iv) => Value::Interval(*iv),
    }
}

fn literal_u64(expr: &Expr) -> DbResult<u64> {
    match expr {
        Expr::Literal(Literal::Int(n), _) if *n >= 0 => Ok(*n as u64),
        _ => Err(DbError::binder("SKIP and LIMIT expect a non-negative integer")),
    }
}

/// Default output column name of a projection item: the expression
/// text, reconstructed.
pub fn display_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(Literal::Null, _) => "NULL".to_string(),
        Expr::Literal(Literal::Bool(b), _) => b.to_string(),
        Expr::Literal(Literal::Int(v), _) => v.to_string(),
        Expr::Literal(Literal::Double(v), _) => v.to_string(),
        Expr::Literal(Literal::String(s), _) => format!("'{}'", s),
        Expr::Literal(Literal::Interval(_), _) => "interval".to_string(),
        Expr::Variable(name, _) => name.clone(),
        Expr::Property { var, key, .. } => format!("{}.{}", var, key),
        Expr::Binary { op, left, right, .. } => format!(
            "{} {} {}",
            display_expr(left),
            display_bin_op(*op),
            display_expr(right)
        ),
        Expr::Unary {
            op: ast::UnaryOp::Not,
            expr,
            ..
        } => format!("NOT {}", display_expr(expr)),
        Expr::Unary { expr, .. } => format!("-{}", display_expr(expr)),
        Expr::FunctionCall { name, args, .. } => format!(
            "{}({})",
            name,
            args.iter().map(display_expr).collect::<Vec<_>>().join(", ")
        ),
        Expr::CountStar(_) => "COUNT(*)".to_string(),
        Expr::List(items, _) => format!(
            "[{}]",
            items.iter().map(display_expr).collect::<Vec<_>>().join(", ")
        ),
        Expr::Parameter(name, _) => format!("${}", name),
    }
}

fn display_bin_op(op: ast::BinOp) -> &'static str {
    use ast::BinOp::*;
    match op {
        Add => "+",
        Sub => "-",
        Mul => "*",
        Div => "/",
        Mod => "%",
        Eq => "=",
        Neq => "<>",
        Lt => "<",
        Le => "<=",
        Gt => ">",
        Ge => ">=",
        And => "AND",
        Or => "OR",
        Xor => "XOR",
    }
}

/// Constraint propagation between node and rel candidates: a rel can
/// only keep tables whose endpoints intersect the endpoint nodes'
/// candidates, and a node can only keep tables some incident rel can
/// bind against.
fn resolve_table_candidates(catalog: &CatalogContent, graph: &mut QueryGraph) -> DbResult<()> {
    for _ in 0..2 {
        for rel_pos in 0..graph.num_rels() {
            let rel = graph.rel(rel_pos).clone();
            let src_candidates = graph
                .node(graph.node_pos(&rel.src_node_name).unwrap())
                .table_ids
                .clone();
            let dst_candidates = graph
                .node(graph.node_pos(&rel.dst_node_name).unwrap())
                .table_ids
                .clone();
            let kept: Vec<TableId> = rel
                .table_ids
                .iter()
                .copied()
                .filter(|id| {
                    let schema = match catalog.rel_table_schema(*id) {
                        Ok(s) => s,
                        Err(_) => return false,
                    };
                    src_candidates.contains(&schema.src_table_id)
                        && dst_candidates.contains(&schema.dst_table_id)
                })
                .collect();
            if kept.is_empty() {
                return Err(DbError::binder(format!(
                    "cannot bind a rel table for variable {} between its endpoints",
                    rel.unique_name
                )));
            }
            graph.rel_mut(rel_pos).table_ids = kept.clone();

            // narrow the endpoint candidates to what the kept rel
            // tables connect
            let src_allowed: Vec<TableId> = kept
                .iter()
                .map(|id| catalog.rel_table_schema(*id).unwrap().src_table_id)
                .collect();
            let dst_allowed: Vec<TableId> = kept
                .iter()
                .map(|id| catalog.rel_table_schema(*id).unwrap().dst_table_id)
                .collect();
            narrow_node(graph, &rel.src_node_name, &src_allowed)?;
            narrow_node(graph, &rel.dst_node_name, &dst_allowed)?;
        }
    }
    Ok(())
}

fn narrow_node(graph: &mut QueryGraph, name: &str, allowed: &[TableId]) -> DbResult<()> {
    let pos = graph.node_pos(name).unwrap();
    let node = graph.node_mut(pos);
    let kept: Vec<TableId> = node
        .table_ids
        .iter()
        .copied()
        .filter(|id| allowed.contains(id))
        .collect();
    if kept.is_empty() {
        return Err(DbError::binder(format!(
            "cannot bind a node table for variable {}",
            name
        )));
    }
    node.table_ids = kept;
    Ok(())
}
