use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::schema::{RelDirection, RelTableSchema, REL_DIRECTIONS};
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::disk_column::DiskColumn;
use crate::storage::disk_lists::DiskLists;
use crate::storage::storage_utils::{self, DbFileType};
use crate::types::{NodeOffset, PropertyId, TableId};

/// Physical encoding of one direction: a compact column when the
/// direction is single-multiplicity, CSR lists otherwise, and nothing
/// at all before the first copy.
enum AdjStorage {
    Column(DiskColumn),
    Lists(DiskLists),
    Empty,
}

enum PropStorage {
    Column(DiskColumn),
    Lists(DiskLists),
    Empty,
}

struct DirectionStorage {
    adj: AdjStorage,
    props: HashMap<PropertyId, PropStorage>,
}

/// One neighbour produced by an adjacency read. `pos` is the CSR list
/// position, used to read rel properties out of the matching list
/// slot; column-encoded directions have no position.
#[derive(Debug, Clone, Copy)]
pub struct Neighbor {
    pub nbr_offset: NodeOffset,
    pub pos: Option<u64>,
}

pub struct RelTable {
    pub table_id: TableId,
    directions: [DirectionStorage; 2],
}

fn dir_idx(dir: RelDirection) -> usize {
    match dir {
        RelDirection::Fwd => 0,
        RelDirection::Bwd => 1,
    }
}

impl RelTable {
    pub fn open(pool: Arc<BufferPool>, db_dir: &Path, schema: &RelTableSchema) -> DbResult<Self> {
        let mut directions = Vec::with_capacity(2);
        for dir in REL_DIRECTIONS {
            let single = schema.is_single_in_direction(dir);
            let adj = if single {
                let path = storage_utils::adj_column_path(
                    db_dir,
                    schema.table_id,
                    dir,
                    DbFileType::Original,
                );
                if path.exists() && std::fs::metadata(&path)?.len() > 0 {
                    AdjStorage::Column(DiskColumn::open(
                        pool.clone(),
                        &path,
                        None,
                        crate::common::logical_type::LogicalType::InternalId,
                    )?)
                } else {
                    AdjStorage::Empty
                }
            } else {
                let path = storage_utils::adj_lists_path(
                    db_dir,
                    schema.table_id,
                    dir,
                    DbFileType::Original,
                );
                if storage_utils::headers_path(&path).exists() {
                    AdjStorage::Lists(DiskLists::open(
                        pool.clone(),
                        &path,
                        None,
                        crate::common::logical_type::LogicalType::InternalId,
                        false,
                    )?)
                } else {
                    AdjStorage::Empty
                }
            };
            let mut props = HashMap::new();
            for property in &schema.properties {
                let storage = if single {
                    let path = storage_utils::rel_property_column_path(
                        db_dir,
                        schema.table_id,
                        dir,
                        property.id,
                        DbFileType::Original,
                    );
                    if path.exists() && std::fs::metadata(&path)?.len() > 0 {
                        let ovf = property
                            .logical_type
                            .has_overflow()
                            .then(|| storage_utils::overflow_path(&path));
                        PropStorage::Column(DiskColumn::open(
                            pool.clone(),
                            &path,
                            ovf,
                            property.logical_type.clone(),
                        )?)
                    } else {
                        PropStorage::Empty
                    }
                } else {
                    let path = storage_utils::rel_property_lists_path(
                        db_dir,
                        schema.table_id,
                        dir,
                        property.id,
                        DbFileType::Original,
                    );
                    if storage_utils::headers_path(&path).exists() {
                        let ovf = property
                            .logical_type
                            .has_overflow()
                            .then(|| storage_utils::overflow_path(&path));
                        PropStorage::Lists(DiskLists::open(
                            pool.clone(),
                            &path,
                            ovf,
                            property.logical_type.clone(),
                            true,
                        )?)
                    } else {
                        PropStorage::Empty
                    }
                };
                props.insert(property.id, storage);
            }
            directions.push(DirectionStorage { adj, props });
        }
        let mut it = directions.into_iter();
        Ok(Self {
            table_id: schema.table_id,
            directions: [it.next().unwrap(), it.next().unwrap()],
        })
    }

    /// All neighbours of `offset` in `dir`.
    pub fn neighbors(&self, dir: RelDirection, offset: NodeOffset) -> DbResult<Vec<Neighbor>> {
        match &self.directions[dir_idx(dir)].adj {
            AdjStorage::Empty => Ok(Vec::new()),
            AdjStorage::Column(col) => Ok(col
                .read_slot(offset)?
                .map(|slot| Neighbor {
                    nbr_offset: u64::from_le_bytes(slot[..8].try_into().unwrap()),
                    pos: None,
                })
                .into_iter()
                .collect()),
            AdjStorage::Lists(lists) => {
                let nbrs = lists.read_adj_list(offset)?;
                Ok(nbrs
                    .into_iter()
                    .enumerate()
                    .map(|(pos, nbr_offset)| Neighbor {
                        nbr_offset,
                        pos: Some(pos as u64),
                    })
                    .collect())
            }
        }
    }

    /// Rel property value of the edge read as `(src offset, pos)`.
    pub fn rel_property(
        &self,
        dir: RelDirection,
        property_id: PropertyId,
        src_offset: NodeOffset,
        pos: Option<u64>,
    ) -> DbResult<Value> {
        match self.directions[dir_idx(dir)].props.get(&property_id) {
            None => Err(DbError::catalog(format!(
                "rel table {} has no property {}",
                self.table_id, property_id
            ))),
            Some(PropStorage::Empty) => Ok(Value::Null),
            Some(PropStorage::Column(col)) => col.read_value(src_offset),
            Some(PropStorage::Lists(lists)) => {
                let pos = pos.ok_or_else(|| {
                    DbError::corruption("list-encoded rel property read without a position")
                })?;
                lists.read_value(src_offset, pos)
            }
        }
    }

    pub fn list_size(&self, dir: RelDirection, offset: NodeOffset) -> DbResult<u64> {
        match &self.directions[dir_idx(dir)].adj {
            AdjStorage::Empty => Ok(0),
            AdjStorage::Column(col) => Ok(if col.read_slot(offset)?.is_some() { 1 } else { 0 }),
            AdjStorage::Lists(lists) => Ok(lists.list_size(offset)),
        }
    }
}
