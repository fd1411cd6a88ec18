use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::catalog::schema::{
    Property, RelDirection, RelTableSchema, REL_DIRECTIONS,
};
use crate::catalog::CatalogContent;
use crate::common::copy_desc::{CopyDescription, FileType};
use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::copier::node_copier::schedule_blocks;
use crate::copier::record_batch::RecordBatch;
use crate::copier::{
    count_blocks, sort_overflow_of_column_range, sort_overflow_of_lists_range,
};
use crate::error::{DbError, DbResult};
use crate::scheduler::TaskScheduler;
use crate::storage::hash_index::IndexKey;
use crate::storage::in_mem_column::{InMemColumn, InMemColumnChunk};
use crate::storage::in_mem_lists::{
    calculate_list_headers_task, calculate_lists_metadata_task, InMemLists, ListHeadersBuilder,
};
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::node_table::NodeTable;
use crate::storage::page::PageByteCursor;
use crate::storage::storage_manager::StorageManager;
use crate::storage::storage_utils::{self, DbFileType};
use crate::storage::wal::Wal;
use crate::transaction::Transaction;
use crate::types::{NodeOffset, PropertyId, RelId, TableId};

fn dir_idx(dir: RelDirection) -> usize {
    match dir {
        RelDirection::Fwd => 0,
        RelDirection::Bwd => 1,
    }
}

/// How endpoint keys of one bound table resolve to node offsets.
enum PkResolver {
    /// SERIAL primary key: the key is the offset.
    Serial,
    Index(Arc<NodeTable>),
}

/// Per-direction builder set: a column pair when the direction is
/// single-multiplicity, an adjacency list plus property lists
/// otherwise.
struct DirectionBuilders {
    single: bool,
    num_nodes: u64,
    list_sizes: Vec<AtomicU64>,
    adj_column: Option<(InMemColumn, InMemColumnChunk)>,
    adj_lists: Option<InMemLists>,
    headers: Option<Arc<ListHeadersBuilder>>,
    /// keyed by property id; chunks for single directions
    prop_columns: HashMap<PropertyId, (InMemColumn, InMemColumnChunk)>,
    prop_lists: HashMap<PropertyId, InMemLists>,
}

struct RelCopyState {
    schema: RelTableSchema,
    desc: CopyDescription,
    table_names: [String; 2],
    pk_types: [LogicalType; 2],
    resolvers: [PkResolver; 2],
    directions: [DirectionBuilders; 2],
    unordered_ovf: HashMap<PropertyId, InMemOverflowFile>,
    start_rel_id: RelId,
    dummy_tx: Transaction,
    abort: Arc<AtomicBool>,
}

impl RelCopyState {
    fn resolve_endpoints(
        &self,
        batch: &RecordBatch,
        row: usize,
    ) -> DbResult<[NodeOffset; 2]> {
        let mut offsets = [0u64; 2];
        for dir in REL_DIRECTIONS {
            let d = dir_idx(dir);
            let cell = batch.cell(row, d)?.ok_or_else(|| {
                DbError::copy("rel endpoint keys cannot be NULL")
            })?;
            let offset = match (&self.resolvers[d], &self.pk_types[d]) {
                (PkResolver::Serial, _) => {
                    let key: u64 = cell.trim().parse().map_err(|_| {
                        DbError::copy(format!("cannot parse {:?} as a serial key", cell))
                    })?;
                    if key >= self.directions[d].num_nodes {
                        return Err(self.dangling(cell));
                    }
                    key
                }
                (PkResolver::Index(table), LogicalType::Int64) => {
                    let key: i64 = cell.trim().parse().map_err(|_| {
                        DbError::copy(format!("cannot parse {:?} as INT64", cell))
                    })?;
                    table
                        .pk_lookup(&self.dummy_tx, &IndexKey::Int(key))?
                        .ok_or_else(|| self.dangling(cell))?
                }
                (PkResolver::Index(table), LogicalType::String) => table
                    .pk_lookup(&self.dummy_tx, &IndexKey::Str(cell))?
                    .ok_or_else(|| self.dangling(cell))?,
                (PkResolver::Index(_), other) => {
                    return Err(DbError::copy(format!(
                        "unsupported data type {} for index lookup",
                        other
                    )))
                }
            };
            offsets[d] = offset;
        }
        Ok(offsets)
    }

    fn dangling(&self, key: &str) -> DbError {
        DbError::copy(format!("cannot find key {} in the pk index", key))
    }

    fn multiplicity_violation(&self, dir: RelDirection, offset: NodeOffset) -> DbError {
        DbError::copy(format!(
            "rel table {} is a {} table, but node (offset: {}, table: {}) has more than one neighbour in the {} direction",
            self.schema.name,
            self.schema.multiplicity,
            offset,
            self.table_names[dir_idx(dir)],
            dir
        ))
    }

    /// Parse one user-property cell and produce its slot bytes; the
    /// payload of overflow-bearing types goes to the property's
    /// unordered file through the caller's cursor.
    fn encode_cell(
        &self,
        property: &Property,
        cell: &str,
        cursor: &mut PageByteCursor,
    ) -> DbResult<Vec<u8>> {
        let value = Value::parse(cell, &property.logical_type, &self.desc)?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        match self.unordered_ovf.get(&property.id) {
            Some(ovf) => ovf.encode_value_to_slot(&value, &property.logical_type, cursor),
            None => crate::storage::slot_format::encode_fixed_value(
                &value,
                &property.logical_type,
            ),
        }
    }
}

pub fn copy_rel_table(
    db_dir: &Path,
    scheduler: &TaskScheduler,
    catalog: &CatalogContent,
    storage: &StorageManager,
    wal: &Wal,
    table_id: TableId,
    desc: &CopyDescription,
) -> DbResult<u64> {
    let schema = catalog.rel_table_schema(table_id)?.clone();
    info!(
        "copying {} file to rel table {}",
        desc.file_type.name(),
        schema.name
    );
    if desc.file_type == FileType::Npy {
        return Err(DbError::copy("NPY copy is only supported for node tables"));
    }
    if storage.rels_statistics.table_stats_for_write_tx(table_id).num_rels != 0 {
        return Err(DbError::copy(format!(
            "table {} is not empty; COPY can only load into an empty table",
            schema.name
        )));
    }

    let (file_infos, num_rows) = count_blocks(desc)?;
    let start_rel_id = storage.rels_statistics.reserve_rel_ids(table_id, num_rows)?;
    let state = Arc::new(init_state(
        db_dir, catalog, storage, &schema, desc, start_rel_id, scheduler,
    )?);

    // pass 1: adj columns + list-size counting
    info!("populating adj columns and counting rels for {}", schema.name);
    schedule_blocks(scheduler, desc, &file_infos, |block_idx, start_offset, batch| {
        let state = state.clone();
        let block_start_rel_id = state.start_rel_id + start_offset;
        move || populate_adj_columns_and_count_task(&state, block_idx, block_start_rel_id, batch)
    })?;

    if state.directions.iter().any(|d| !d.single) {
        init_adj_list_headers(scheduler, &state)?;
        init_lists_metadata(scheduler, &state)?;
        // pass 2: fill adjacency and property lists
        info!("populating adj and property lists for {}", schema.name);
        schedule_blocks(scheduler, desc, &file_infos, |block_idx, start_offset, batch| {
            let state = state.clone();
            let block_start_rel_id = state.start_rel_id + start_offset;
            move || populate_lists_task(&state, block_idx, block_start_rel_id, batch)
        })?;
    }

    sort_and_copy_overflow_values(scheduler, &state)?;
    save_to_file(&state)?;

    storage.rels_statistics.with_write_version(|content| {
        content.per_table.entry(table_id).or_default().num_rels += num_rows;
        Ok(())
    })?;
    wal.log_copy_rel(table_id)?;
    info!("done copying rel table {} ({} rels)", schema.name, num_rows);
    Ok(num_rows)
}

fn init_state(
    db_dir: &Path,
    catalog: &CatalogContent,
    storage: &StorageManager,
    schema: &RelTableSchema,
    desc: &CopyDescription,
    start_rel_id: RelId,
    scheduler: &TaskScheduler,
) -> DbResult<RelCopyState> {
    let mut table_names = Vec::with_capacity(2);
    let mut pk_types = Vec::with_capacity(2);
    let mut resolvers = Vec::with_capacity(2);
    let mut directions = Vec::with_capacity(2);
    for dir in REL_DIRECTIONS {
        let bound_table_id = schema.bound_table_id(dir);
        let bound_schema = catalog.node_table_schema(bound_table_id)?;
        let num_nodes = storage
            .nodes_statistics
            .max_node_offset_for_write_tx(bound_table_id)
            .map_or(0, |m| m + 1);
        let pk_type = bound_schema.primary_key().logical_type.clone();
        let resolver = match pk_type {
            LogicalType::Serial => PkResolver::Serial,
            _ => {
                let table = storage.node_table(catalog, bound_table_id)?;
                if !table.has_pk_index() {
                    return Err(DbError::copy(format!(
                        "node table {} must be copied before rel table {}",
                        bound_schema.name, schema.name
                    )));
                }
                PkResolver::Index(table)
            }
        };
        table_names.push(bound_schema.name.clone());
        pk_types.push(pk_type);
        resolvers.push(resolver);
        directions.push(init_direction_builders(db_dir, schema, dir, num_nodes));
    }

    let mut unordered_ovf = HashMap::new();
    for property in &schema.properties {
        if property.logical_type.has_overflow() {
            unordered_ovf.insert(property.id, InMemOverflowFile::new());
        }
    }

    let mut table_names_it = table_names.into_iter();
    let mut pk_types_it = pk_types.into_iter();
    let mut resolvers_it = resolvers.into_iter();
    let mut directions_it = directions.into_iter();
    Ok(RelCopyState {
        schema: schema.clone(),
        desc: desc.clone(),
        table_names: [table_names_it.next().unwrap(), table_names_it.next().unwrap()],
        pk_types: [pk_types_it.next().unwrap(), pk_types_it.next().unwrap()],
        resolvers: [resolvers_it.next().unwrap(), resolvers_it.next().unwrap()],
        directions: [directions_it.next().unwrap(), directions_it.next().unwrap()],
        unordered_ovf,
        start_rel_id,
        dummy_tx: Transaction::new_read_only(0),
        abort: scheduler.error_watcher(),
    })
}

fn init_direction_builders(
    db_dir: &Path,
    schema: &RelTableSchema,
    dir: RelDirection,
    num_nodes: u64,
) -> DirectionBuilders {
    let single = schema.is_single_in_direction(dir);
    let mut list_sizes = Vec::with_capacity(num_nodes as usize);
    list_sizes.resize_with(num_nodes as usize, || AtomicU64::new(0));
    let mut builders = DirectionBuilders {
        single,
        num_nodes,
        list_sizes,
        adj_column: None,
        adj_lists: None,
        headers: None,
        prop_columns: HashMap::new(),
        prop_lists: HashMap::new(),
    };
    if single {
        let adj_path =
            storage_utils::adj_column_path(db_dir, schema.table_id, dir, DbFileType::Original);
        let column = InMemColumn::new(adj_path, None, LogicalType::InternalId);
        let chunk = column.make_chunk(0, num_nodes, true);
        builders.adj_column = Some((column, chunk));
        for property in &schema.properties {
            let path = storage_utils::rel_property_column_path(
                db_dir,
                schema.table_id,
                dir,
                property.id,
                DbFileType::Original,
            );
            let ovf = property
                .logical_type
                .has_overflow()
                .then(|| storage_utils::overflow_path(&path));
            let column = InMemColumn::new(path, ovf, property.logical_type.clone());
            let chunk = column.make_chunk(0, num_nodes, true);
            builders.prop_columns.insert(property.id, (column, chunk));
        }
    } else {
        let adj_path =
            storage_utils::adj_lists_path(db_dir, schema.table_id, dir, DbFileType::Original);
        let (adj_lists, headers) = InMemLists::new_adj(adj_path, num_nodes);
        for property in &schema.properties {
            let path = storage_utils::rel_property_lists_path(
                db_dir,
                schema.table_id,
                dir,
                property.id,
                DbFileType::Original,
            );
            let ovf = property
                .logical_type
                .has_overflow()
                .then(|| storage_utils::overflow_path(&path));
            builders.prop_lists.insert(
                property.id,
                InMemLists::new(
                    path,
                    ovf,
                    property.logical_type.clone(),
                    num_nodes,
                    headers.clone(),
                    true,
                ),
            );
        }
        builders.adj_lists = Some(adj_lists);
        builders.headers = Some(headers);
    }
    builders
}

/// Pass-1 task: resolve endpoints, fill single-multiplicity adjacency
/// columns, count list sizes for the other directions, and write
/// column-encoded properties plus the rel id.
fn populate_adj_columns_and_count_task(
    state: &RelCopyState,
    block_idx: usize,
    block_start_rel_id: RelId,
    batch: RecordBatch,
) -> DbResult<()> {
    debug!("start: rel pass-1 block {}", block_idx);
    let mut cursors: HashMap<PropertyId, PageByteCursor> = HashMap::new();
    let mut rel_id = block_start_rel_id;
    for row in 0..batch.num_rows() {
        if state.abort.load(Ordering::SeqCst) {
            return Err(DbError::Interrupt);
        }
        let offsets = state.resolve_endpoints(&batch, row)?;
        for dir in REL_DIRECTIONS {
            let d = dir_idx(dir);
            let builders = &state.directions[d];
            let bound = offsets[d];
            let nbr = offsets[1 - d];
            if builders.single {
                let (_, chunk) = builders.adj_column.as_ref().unwrap();
                if !chunk.is_null(bound) {
                    return Err(state.multiplicity_violation(dir, bound));
                }
                chunk.set_value(&nbr.to_le_bytes(), bound);
            } else {
                builders.list_sizes[bound as usize].fetch_add(1, Ordering::Relaxed);
            }
        }
        // user properties and the rel id go into the column-encoded
        // directions now; list directions wait for pass 2
        for (col_pos, property) in state.schema.user_properties().iter().enumerate() {
            if let Some(cell) = batch.cell(row, 2 + col_pos)? {
                let cursor = cursors.entry(property.id).or_default();
                let slot = state.encode_cell(property, cell, cursor)?;
                if slot.is_empty() {
                    continue;
                }
                put_slot_into_columns(state, property.id, &offsets, &slot);
            }
        }
        put_slot_into_columns(
            state,
            RelTableSchema::INTERNAL_REL_ID_PROPERTY_ID,
            &offsets,
            &(rel_id as i64).to_le_bytes(),
        );
        rel_id += 1;
    }
    debug!("end: rel pass-1 block {}", block_idx);
    Ok(())
}

fn put_slot_into_columns(
    state: &RelCopyState,
    property_id: PropertyId,
    offsets: &[NodeOffset; 2],
    slot: &[u8],
) {
    for dir in REL_DIRECTIONS {
        let d = dir_idx(dir);
        let builders = &state.directions[d];
        if !builders.single {
            continue;
        }
        let (_, chunk) = &builders.prop_columns[&property_id];
        chunk.set_value(slot, offsets[d]);
    }
}

/// One headers task per list direction.
fn init_adj_list_headers(scheduler: &TaskScheduler, state: &Arc<RelCopyState>) -> DbResult<()> {
    debug!("initializing adj list headers for rel {}", state.schema.name);
    for d in 0..2 {
        if state.directions[d].single {
            continue;
        }
        let state = state.clone();
        scheduler.schedule_task(move || {
            let builders = &state.directions[d];
            calculate_list_headers_task(
                builders.num_nodes,
                &builders.list_sizes,
                builders.headers.as_ref().unwrap(),
            );
            Ok(())
        });
    }
    scheduler.wait_all_tasks_to_complete_or_error()
}

/// Metadata + page allocation for the adjacency lists and every
/// property list.
fn init_lists_metadata(scheduler: &TaskScheduler, state: &Arc<RelCopyState>) -> DbResult<()> {
    debug!("initializing lists metadata for rel {}", state.schema.name);
    for d in 0..2 {
        if state.directions[d].single {
            continue;
        }
        {
            let state = state.clone();
            scheduler.schedule_task(move || {
                let builders = &state.directions[d];
                calculate_lists_metadata_task(
                    builders.num_nodes,
                    &builders.list_sizes,
                    builders.adj_lists.as_ref().unwrap(),
                );
                Ok(())
            });
        }
        for property in state.schema.properties.iter() {
            let state = state.clone();
            let property_id = property.id;
            scheduler.schedule_task(move || {
                let builders = &state.directions[d];
                calculate_lists_metadata_task(
                    builders.num_nodes,
                    &builders.list_sizes,
                    &builders.prop_lists[&property_id],
                );
                Ok(())
            });
        }
    }
    scheduler.wait_all_tasks_to_complete_or_error()
}

/// Pass-2 task: place every rel in its final list slot by atomically
/// draining the per-node counters from `size` down to zero.
fn populate_lists_task(
    state: &RelCopyState,
    block_idx: usize,
    block_start_rel_id: RelId,
    batch: RecordBatch,
) -> DbResult<()> {
    debug!("start: rel pass-2 block {}", block_idx);
    let mut cursors: HashMap<PropertyId, PageByteCursor> = HashMap::new();
    let mut rel_id = block_start_rel_id;
    for row in 0..batch.num_rows() {
        if state.abort.load(Ordering::SeqCst) {
            return Err(DbError::Interrupt);
        }
        let offsets = state.resolve_endpoints(&batch, row)?;
        let mut reverse_pos = [0u64; 2];
        for dir in REL_DIRECTIONS {
            let d = dir_idx(dir);
            let builders = &state.directions[d];
            if builders.single {
                continue;
            }
            let bound = offsets[d];
            let nbr = offsets[1 - d];
            let prev = builders.list_sizes[bound as usize].fetch_sub(1, Ordering::Relaxed);
            let pos = prev - 1;
            reverse_pos[d] = pos;
            builders
                .adj_lists
                .as_ref()
                .unwrap()
                .set_element(bound, pos, &nbr.to_le_bytes());
        }
        for (col_pos, property) in state.schema.user_properties().iter().enumerate() {
            if let Some(cell) = batch.cell(row, 2 + col_pos)? {
                let cursor = cursors.entry(property.id).or_default();
                let slot = state.encode_cell(property, cell, cursor)?;
                if slot.is_empty() {
                    continue;
                }
                put_slot_into_lists(state, property.id, &offsets, &reverse_pos, &slot);
            }
        }
        put_slot_into_lists(
            state,
            RelTableSchema::INTERNAL_REL_ID_PROPERTY_ID,
            &offsets,
            &reverse_pos,
            &(rel_id as i64).to_le_bytes(),
        );
        rel_id += 1;
    }
    debug!("end: rel pass-2 block {}", block_idx);
    Ok(())
}

fn put_slot_into_lists(
    state: &RelCopyState,
    property_id: PropertyId,
    offsets: &[NodeOffset; 2],
    reverse_pos: &[u64; 2],
    slot: &[u8],
) {
    for dir in REL_DIRECTIONS {
        let d = dir_idx(dir);
        let builders = &state.directions[d];
        if builders.single {
            continue;
        }
        builders.prop_lists[&property_id].set_element(offsets[d], reverse_pos[d], slot);
    }
}

/// Overflow-sort phase: one task per overflow property per
/// direction; each task walks owner offsets in ascending order.
fn sort_and_copy_overflow_values(
    scheduler: &TaskScheduler,
    state: &Arc<RelCopyState>,
) -> DbResult<()> {
    for d in 0..2 {
        for property in state.schema.properties.iter() {
            if !property.logical_type.has_overflow() {
                continue;
            }
            let state = state.clone();
            let property_id = property.id;
            let ty = property.logical_type.clone();
            scheduler.schedule_task(move || {
                let builders = &state.directions[d];
                let unordered = &state.unordered_ovf[&property_id];
                let mut cursor = PageByteCursor::default();
                if builders.single {
                    let (column, chunk) = &builders.prop_columns[&property_id];
                    let ordered = column
                        .ordered_overflow()
                        .expect("overflow property without ordered overflow file");
                    sort_overflow_of_column_range(
                        chunk,
                        &ty,
                        0,
                        builders.num_nodes,
                        unordered,
                        ordered,
                        &mut cursor,
                    )
                } else {
                    sort_overflow_of_lists_range(
                        &builders.prop_lists[&property_id],
                        0,
                        builders.num_nodes,
                        unordered,
                        &mut cursor,
                    )
                }
            });
        }
    }
    scheduler.wait_all_tasks_to_complete_or_error()
}

fn save_to_file(state: &RelCopyState) -> DbResult<()> {
    debug!("writing columns and lists to disk for rel {}", state.schema.name);
    for builders in &state.directions {
        if let Some((column, chunk)) = &builders.adj_column {
            column.save_to_file(chunk)?;
        }
        for (column, chunk) in builders.prop_columns.values() {
            column.save_to_file(chunk)?;
        }
        if let Some(adj_lists) = &builders.adj_lists {
            adj_lists.save_to_file()?;
        }
        for lists in builders.prop_lists.values() {
            lists.save_to_file()?;
        }
    }
    debug!("done writing columns and lists for rel {}", state.schema.name);
    Ok(())
}
