use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::catalog::schema::{is_reserved_property_name, NodeTableSchema, Property};
use crate::catalog::CatalogContent;
use crate::common::copy_desc::{CopyDescription, FileType};
use crate::common::logical_type::LogicalType;
use crate::common::value::Value;
use crate::copier::npy::NpyReader;
use crate::copier::record_batch::RecordBatch;
use crate::copier::{
    count_blocks, make_source, sort_overflow_of_column_range, FileBlockInfo,
    MINIMUM_NUM_COPIER_TASKS_TO_SCHEDULE_MORE, NUM_COPIER_TASKS_TO_SCHEDULE_PER_BATCH,
    NUM_ROWS_PER_BLOCK_FOR_NPY,
};
use crate::error::{DbError, DbResult};
use crate::scheduler::TaskScheduler;
use crate::storage::hash_index::{HashIndexBuilder, IndexKey};
use crate::storage::in_mem_column::{InMemColumn, InMemColumnChunk};
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::page::PageByteCursor;
use crate::storage::storage_manager::StorageManager;
use crate::storage::storage_utils::{self, DbFileType};
use crate::storage::wal::Wal;
use crate::types::{NodeOffset, PropertyId, TableId};

/// Shared, immutable-after-init state of one node copy. Tasks address
/// disjoint row ranges of the chunks, so no locking is needed beyond
/// the overflow files' page allocation.
struct NodeCopyState {
    schema: NodeTableSchema,
    desc: CopyDescription,
    columns: Vec<InMemColumn>,
    chunks: Vec<InMemColumnChunk>,
    unordered_ovf: HashMap<PropertyId, InMemOverflowFile>,
    pk_builder: Option<HashIndexBuilder>,
    /// schema property index of each input-file column, in file order
    file_columns: Vec<usize>,
    abort: Arc<AtomicBool>,
}

impl NodeCopyState {
    fn duplicate_pk_error(key: &IndexKey) -> DbError {
        DbError::copy(format!(
            "found duplicated primary key value {}, which violates the uniqueness constraint of the primary key column",
            key.to_display()
        ))
    }
}

pub fn copy_node_table(
    db_dir: &Path,
    scheduler: &TaskScheduler,
    catalog: &CatalogContent,
    storage: &StorageManager,
    wal: &Wal,
    table_id: TableId,
    desc: &CopyDescription,
) -> DbResult<u64> {
    let schema = catalog.node_table_schema(table_id)?.clone();
    info!(
        "copying {} file to table {}",
        desc.file_type.name(),
        schema.name
    );
    let existing = storage.nodes_statistics.table_stats_for_write_tx(table_id);
    if existing.num_tuples() != 0 {
        return Err(DbError::copy(format!(
            "table {} is not empty; COPY can only load into an empty table",
            schema.name
        )));
    }
    let num_rows = match desc.file_type {
        FileType::Npy => copy_from_npy(db_dir, scheduler, &schema, desc)?,
        _ => copy_from_record_batches(db_dir, scheduler, &schema, desc)?,
    };
    storage.nodes_statistics.with_write_version(|content| {
        content.per_table.entry(table_id).or_default().next_offset = num_rows;
        Ok(())
    })?;
    wal.log_copy_node(table_id)?;
    info!("done copying file to table {} ({} rows)", schema.name, num_rows);
    Ok(num_rows)
}

fn init_columns(
    db_dir: &Path,
    schema: &NodeTableSchema,
    num_rows: u64,
) -> (Vec<InMemColumn>, Vec<InMemColumnChunk>, HashMap<PropertyId, InMemOverflowFile>) {
    let mut columns = Vec::new();
    let mut chunks = Vec::new();
    let mut unordered = HashMap::new();
    for property in &schema.properties {
        let col_path = storage_utils::node_column_path(
            db_dir,
            schema.table_id,
            property.id,
            DbFileType::Original,
        );
        let ovf_path = property.logical_type.has_overflow().then(|| {
            storage_utils::node_column_overflow_path(
                db_dir,
                schema.table_id,
                property.id,
                DbFileType::Original,
            )
        });
        let column = InMemColumn::new(col_path, ovf_path, property.logical_type.clone());
        let chunk = column.make_chunk(0, num_rows, true);
        if property.logical_type.has_overflow() {
            unordered.insert(property.id, InMemOverflowFile::new());
        }
        columns.push(column);
        chunks.push(chunk);
    }
    (columns, chunks, unordered)
}

fn make_pk_builder(db_dir: &Path, schema: &NodeTableSchema, num_rows: u64) -> DbResult<Option<HashIndexBuilder>> {
    let pk = schema.primary_key();
    let builder = match pk.logical_type {
        LogicalType::Serial => None,
        LogicalType::Int64 => Some(HashIndexBuilder::new(
            storage_utils::pk_index_path(db_dir, schema.table_id, DbFileType::Original),
            false,
        )),
        LogicalType::String => Some(HashIndexBuilder::new(
            storage_utils::pk_index_path(db_dir, schema.table_id, DbFileType::Original),
            true,
        )),
        ref other => {
            return Err(DbError::copy(format!(
                "data type {} is not supported as a primary key",
                other
            )))
        }
    };
    if let Some(builder) = &builder {
        builder.bulk_reserve(num_rows);
    }
    Ok(builder)
}

/// Schema property indices of the input file's columns, in file order:
/// every property except SERIAL ones and reserved names.
fn file_column_layout(properties: &[Property]) -> Vec<usize> {
    properties
        .iter()
        .enumerate()
        .filter(|(_, p)| {
            !is_reserved_property_name(&p.name)
                && !matches!(p.logical_type, LogicalType::Serial)
        })
        .map(|(i, _)| i)
        .collect()
}

fn copy_from_record_batches(
    db_dir: &Path,
    scheduler: &TaskScheduler,
    schema: &NodeTableSchema,
    desc: &CopyDescription,
) -> DbResult<u64> {
    let (file_infos, num_rows) = count_blocks(desc)?;
    let (columns, chunks, unordered_ovf) = init_columns(db_dir, schema, num_rows);
    let state = Arc::new(NodeCopyState {
        schema: schema.clone(),
        desc: desc.clone(),
        columns,
        chunks,
        unordered_ovf,
        pk_builder: make_pk_builder(db_dir, schema, num_rows)?,
        file_columns: file_column_layout(&schema.properties),
        abort: scheduler.error_watcher(),
    });

    schedule_blocks(scheduler, desc, &file_infos, |block_idx, start_offset, batch| {
        let state = state.clone();
        move || populate_node_block_task(&state, block_idx, start_offset, batch)
    })?;

    sort_overflow(scheduler, &state, num_rows)?;
    save_to_file(&state)?;
    Ok(num_rows)
}

/// Stream every file block by block, scheduling one task per block
/// with the loader's back-pressure window.
pub(crate) fn schedule_blocks<F, J>(
    scheduler: &TaskScheduler,
    desc: &CopyDescription,
    file_infos: &HashMap<String, FileBlockInfo>,
    mut make_task: F,
) -> DbResult<()>
where
    F: FnMut(usize, u64, RecordBatch) -> J,
    J: FnOnce() -> DbResult<()> + Send + 'static,
{
    for file_path in &desc.file_paths {
        let info = &file_infos[file_path];
        let mut source = make_source(file_path, desc)?;
        let mut start_offset = info.start_offset;
        let mut block_idx = 0usize;
        'outer: loop {
            for _ in 0..NUM_COPIER_TASKS_TO_SCHEDULE_PER_BATCH {
                let batch = match source.next_batch()? {
                    Some(batch) => batch,
                    None => break 'outer,
                };
                let rows = batch.num_rows() as u64;
                debug!("scheduling block {} of {}", block_idx, file_path);
                scheduler.schedule_task(make_task(block_idx, start_offset, batch));
                start_offset += rows;
                block_idx += 1;
            }
            scheduler.wait_until_enough_tasks_finish(MINIMUM_NUM_COPIER_TASKS_TO_SCHEDULE_MORE);
        }
        scheduler.wait_all_tasks_to_complete_or_error()?;
    }
    scheduler.wait_all_tasks_to_complete_or_error()
}

fn populate_node_block_task(
    state: &NodeCopyState,
    block_idx: usize,
    start_offset: u64,
    batch: RecordBatch,
) -> DbResult<()> {
    debug!("start: node block {} at offset {}", block_idx, start_offset);
    let mut cursors: HashMap<PropertyId, PageByteCursor> = HashMap::new();
    for row in 0..batch.num_rows() {
        if state.abort.load(Ordering::SeqCst) {
            return Err(DbError::Interrupt);
        }
        let offset = start_offset + row as u64;
        for (col_pos, &prop_idx) in state.file_columns.iter().enumerate() {
            let property = &state.schema.properties[prop_idx];
            let cell = match batch.cell(row, col_pos)? {
                Some(cell) => cell,
                None => continue, // NULL: the slot stays null
            };
            let value = Value::parse(cell, &property.logical_type, &state.desc)?;
            if value.is_null() {
                continue;
            }
            let slot = match state.unordered_ovf.get(&property.id) {
                Some(ovf) => {
                    let cursor = cursors.entry(property.id).or_default();
                    ovf.encode_value_to_slot(&value, &property.logical_type, cursor)?
                }
                None => crate::storage::slot_format::encode_fixed_value(
                    &value,
                    &property.logical_type,
                )?,
            };
            state.chunks[prop_idx].set_value(&slot, offset);
        }
        // SERIAL properties are assigned, never read from the file
        for (prop_idx, property) in state.schema.properties.iter().enumerate() {
            if matches!(property.logical_type, LogicalType::Serial) {
                state.chunks[prop_idx].set_value(&(offset as i64).to_le_bytes(), offset);
            }
        }
    }
    populate_pk_index_for_block(state, start_offset, &batch)?;
    debug!("end: node block {} at offset {}", block_idx, start_offset);
    Ok(())
}

/// Index the block's primary keys once its column slots are written.
fn populate_pk_index_for_block(
    state: &NodeCopyState,
    start_offset: NodeOffset,
    batch: &RecordBatch,
) -> DbResult<()> {
    let builder = match &state.pk_builder {
        Some(builder) => builder,
        None => return Ok(()),
    };
    let pk_idx = state.schema.primary_key_idx;
    let pk_col_pos = state
        .file_columns
        .iter()
        .position(|&i| i == pk_idx)
        .ok_or_else(|| DbError::copy("primary key column is missing from the input file"))?;
    for row in 0..batch.num_rows() {
        let offset = start_offset + row as u64;
        let cell = batch.cell(row, pk_col_pos)?.ok_or_else(|| {
            DbError::copy("primary key values cannot be NULL")
        })?;
        let key = match state.schema.primary_key().logical_type {
            LogicalType::Int64 => IndexKey::Int(cell.trim().parse().map_err(|_| {
                DbError::copy(format!("cannot parse {:?} as INT64", cell))
            })?),
            LogicalType::String => IndexKey::Str(cell),
            ref other => {
                return Err(DbError::copy(format!(
                    "data type {} is not supported as a primary key",
                    other
                )))
            }
        };
        if !builder.append(key.clone(), offset) {
            return Err(NodeCopyState::duplicate_pk_error(&key));
        }
    }
    Ok(())
}

/// One sort task per overflow-bearing property; the walk
/// itself is in ascending owner-offset order.
fn sort_overflow(scheduler: &TaskScheduler, state: &Arc<NodeCopyState>, num_rows: u64) -> DbResult<()> {
    for (prop_idx, property) in state.schema.properties.iter().enumerate() {
        if !property.logical_type.has_overflow() {
            continue;
        }
        let state = state.clone();
        let ty = property.logical_type.clone();
        let prop_id = property.id;
        scheduler.schedule_task(move || {
            let unordered = &state.unordered_ovf[&prop_id];
            let ordered = state.columns[prop_idx]
                .ordered_overflow()
                .expect("overflow property without ordered overflow file");
            let mut cursor = PageByteCursor::default();
            sort_overflow_of_column_range(
                &state.chunks[prop_idx],
                &ty,
                0,
                num_rows,
                unordered,
                ordered,
                &mut cursor,
            )
        });
    }
    scheduler.wait_all_tasks_to_complete_or_error()
}

fn save_to_file(state: &NodeCopyState) -> DbResult<()> {
    debug!("writing columns to disk for table {}", state.schema.name);
    for (column, chunk) in state.columns.iter().zip(state.chunks.iter()) {
        column.save_to_file(chunk)?;
    }
    if let Some(builder) = &state.pk_builder {
        builder.flush()?;
    }
    Ok(())
}

// NPY path: values are copied byte-wise from the files' buffers; the
// primary key must be INT64.

fn copy_from_npy(
    db_dir: &Path,
    scheduler: &TaskScheduler,
    schema: &NodeTableSchema,
    desc: &CopyDescription,
) -> DbResult<u64> {
    let mapping = desc.property_to_npy.as_ref().ok_or_else(|| {
        DbError::copy("NPY copy requires the BY COLUMN form with one file per property")
    })?;
    let mut readers: HashMap<PropertyId, Arc<NpyReader>> = HashMap::new();
    for property in &schema.properties {
        if matches!(property.logical_type, LogicalType::Serial) {
            continue;
        }
        let path = mapping.get(&property.id).ok_or_else(|| {
            DbError::copy(format!("no npy file given for property {}", property.name))
        })?;
        readers.insert(property.id, Arc::new(NpyReader::open(path)?));
    }
    let num_rows = readers
        .values()
        .next()
        .map(|r| r.num_rows())
        .unwrap_or(0);
    for property in &schema.properties {
        let reader = match readers.get(&property.id) {
            Some(reader) => reader,
            None => continue,
        };
        if reader.num_rows() == 0 {
            return Err(DbError::copy(format!(
                "number of rows in npy file {} is 0",
                reader.file_name()
            )));
        }
        if reader.num_rows() != num_rows {
            return Err(DbError::copy(
                "number of rows in npy files is not equal to each other",
            ));
        }
        reader.validate_against(&property.logical_type, &schema.name)?;
    }
    let pk = schema.primary_key();
    if pk.logical_type != LogicalType::Int64 {
        return Err(DbError::copy(format!(
            "data type {} for the ID index is not currently supported when copying from npy files",
            pk.logical_type
        )));
    }

    let (columns, chunks, _) = init_columns(db_dir, schema, num_rows);
    let state = Arc::new(NodeCopyState {
        schema: schema.clone(),
        desc: desc.clone(),
        columns,
        chunks,
        unordered_ovf: HashMap::new(),
        pk_builder: make_pk_builder(db_dir, schema, num_rows)?,
        file_columns: Vec::new(),
        abort: scheduler.error_watcher(),
    });

    for (prop_idx, property) in schema.properties.iter().enumerate() {
        let reader = match readers.get(&property.id) {
            Some(reader) => reader.clone(),
            None => continue,
        };
        let is_pk = prop_idx == schema.primary_key_idx;
        let mut start = 0u64;
        while start < num_rows {
            let rows_in_block = std::cmp::min(NUM_ROWS_PER_BLOCK_FOR_NPY, num_rows - start);
            let state = state.clone();
            let reader = reader.clone();
            scheduler.schedule_task(move || {
                if state.abort.load(Ordering::SeqCst) {
                    return Err(DbError::Interrupt);
                }
                for row in start..start + rows_in_block {
                    state.chunks[prop_idx].set_value(reader.row_bytes(row), row);
                }
                if is_pk {
                    let builder = state.pk_builder.as_ref().expect("INT64 pk has a builder");
                    for row in start..start + rows_in_block {
                        let key = i64::from_le_bytes(
                            reader.row_bytes(row)[..8].try_into().unwrap(),
                        );
                        if !builder.append(IndexKey::Int(key), row) {
                            return Err(NodeCopyState::duplicate_pk_error(&IndexKey::Int(key)));
                        }
                    }
                }
                Ok(())
            });
            start += rows_in_block;
        }
        scheduler.wait_until_enough_tasks_finish(MINIMUM_NUM_COPIER_TASKS_TO_SCHEDULE_MORE);
    }
    scheduler.wait_all_tasks_to_complete_or_error()?;

    // SERIAL properties still need their assigned values
    for (prop_idx, property) in schema.properties.iter().enumerate() {
        if matches!(property.logical_type, LogicalType::Serial) {
            for row in 0..num_rows {
                state.chunks[prop_idx].set_value(&(row as i64).to_le_bytes(), row);
            }
        }
    }
    save_to_file(&state)?;
    Ok(num_rows)
}
