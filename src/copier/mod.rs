pub mod node_copier;
pub mod npy;
pub mod record_batch;
pub mod rel_copier;

use std::collections::HashMap;

use crate::common::copy_desc::{CopyDescription, FileType};
use crate::common::logical_type::LogicalType;
use crate::error::{DbError, DbResult};
use crate::storage::in_mem_column::InMemColumnChunk;
use crate::storage::in_mem_lists::InMemLists;
use crate::storage::in_mem_overflow::InMemOverflowFile;
use crate::storage::page::PageByteCursor;
use crate::storage::slot_format::{ListDescriptor, StrDescriptor};
use crate::types::NodeOffset;

use record_batch::{CsvBatchSource, ParquetBatchSource, RecordBatchSource};

/// Rows per scheduled block for row-oriented sources.
pub const ROWS_PER_BLOCK: u64 = 2048;
/// Rows per block when copying NPY files byte-wise.
pub const NUM_ROWS_PER_BLOCK_FOR_NPY: u64 = 2048;
/// Copy tasks handed to the scheduler before the producer checks back.
pub const NUM_COPIER_TASKS_TO_SCHEDULE_PER_BATCH: usize = 100;
/// The producer resumes once outstanding tasks drop below this.
pub const MINIMUM_NUM_COPIER_TASKS_TO_SCHEDULE_MORE: u64 = 50;

/// Block layout of one input file, computed by the count phase
/// and identical across the populate passes.
#[derive(Debug, Clone, Default)]
pub struct FileBlockInfo {
    pub start_offset: u64,
    pub num_blocks: usize,
    pub num_lines_per_block: Vec<u64>,
}

pub fn make_source(
    file_path: &str,
    desc: &CopyDescription,
) -> DbResult<Box<dyn RecordBatchSource>> {
    match desc.file_type {
        FileType::Csv => Ok(Box::new(CsvBatchSource::open(file_path, &desc.csv_config)?)),
        FileType::Parquet => Ok(Box::new(ParquetBatchSource::open(file_path)?)),
        FileType::Npy => Err(DbError::copy(
            "NPY files are copied by column, not through a record batch source",
        )),
    }
}

/// Stream every file once, recording block sizes and the grand total.
pub fn count_blocks(desc: &CopyDescription) -> DbResult<(HashMap<String, FileBlockInfo>, u64)> {
    let mut infos = HashMap::new();
    let mut num_rows = 0u64;
    for file_path in &desc.file_paths {
        let mut source = make_source(file_path, desc)?;
        let start_offset = num_rows;
        let mut num_lines_per_block = Vec::new();
        while let Some(batch) = source.next_batch()? {
            num_lines_per_block.push(batch.num_rows() as u64);
            num_rows += batch.num_rows() as u64;
        }
        infos.insert(
            file_path.clone(),
            FileBlockInfo {
                start_offset,
                num_blocks: num_lines_per_block.len(),
                num_lines_per_block,
            },
        );
    }
    Ok((infos, num_rows))
}

/// Overflow-sort pass for a column chunk: walk owner
/// offsets in ascending order, re-copy each payload from the unordered
/// file into the ordered one and rewrite the descriptor in place.
pub fn sort_overflow_of_column_range(
    chunk: &InMemColumnChunk,
    logical_type: &LogicalType,
    start: NodeOffset,
    end: NodeOffset,
    unordered: &InMemOverflowFile,
    ordered: &InMemOverflowFile,
    cursor: &mut PageByteCursor,
) -> DbResult<()> {
    for offset in start..end {
        if chunk.is_null(offset) {
            continue;
        }
        let slot = chunk.get_value(offset);
        match logical_type {
            LogicalType::String => {
                let descr = StrDescriptor::from_bytes(&slot);
                let rewritten = ordered.copy_string_from_file(unordered, &descr, cursor)?;
                chunk.set_value(&rewritten.to_bytes(), offset);
            }
            LogicalType::VarList(child) => {
                let descr = ListDescriptor::from_bytes(&slot);
                let rewritten = ordered.copy_list_from_file(unordered, &descr, child, cursor)?;
                chunk.set_value(&rewritten.to_bytes(), offset);
            }
            other => {
                return Err(DbError::copy(format!(
                    "data type {} has no overflow values to sort",
                    other
                )))
            }
        }
    }
    Ok(())
}

/// Overflow-sort pass for property lists: same walk, but every list
/// position of each owner offset.
pub fn sort_overflow_of_lists_range(
    lists: &InMemLists,
    start: NodeOffset,
    end: NodeOffset,
    unordered: &InMemOverflowFile,
    cursor: &mut PageByteCursor,
) -> DbResult<()> {
    let ordered = lists
        .ordered_overflow()
        .ok_or_else(|| DbError::copy("property lists have no overflow file"))?;
    for offset in start..end {
        let size = lists.list_size(offset);
        for pos in 0..size {
            if lists.is_element_null(offset, pos) {
                continue;
            }
            let slot = lists.read_element(offset, pos);
            match &lists.logical_type {
                LogicalType::String => {
                    let descr = StrDescriptor::from_bytes(&slot);
                    let rewritten = ordered.copy_string_from_file(unordered, &descr, cursor)?;
                    lists.set_element(offset, pos, &rewritten.to_bytes());
                }
                LogicalType::VarList(child) => {
                    let descr = ListDescriptor::from_bytes(&slot);
                    let rewritten =
                        ordered.copy_list_from_file(unordered, &descr, child, cursor)?;
                    lists.set_element(offset, pos, &rewritten.to_bytes());
                }
                other => {
                    return Err(DbError::copy(format!(
                        "data type {} has no overflow values to sort",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}
