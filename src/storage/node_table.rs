use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::catalog::schema::NodeTableSchema;
use crate::common::value::Value;
use crate::error::{DbError, DbResult};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::disk_column::DiskColumn;
use crate::storage::hash_index::{HashIndex, IndexKey};
use crate::storage::storage_utils::{self, DbFileType};
use crate::transaction::Transaction;
use crate::types::{NodeOffset, PropertyId, TableId};

/// Read/update surface of one node table: a disk column per property
/// plus the primary-key index once a copy has materialized it.
pub struct NodeTable {
    pub table_id: TableId,
    columns: HashMap<PropertyId, DiskColumn>,
    pk_index: Option<HashIndex>,
}

impl NodeTable {
    pub fn open(
        pool: Arc<BufferPool>,
        db_dir: &Path,
        schema: &NodeTableSchema,
    ) -> DbResult<Self> {
        let mut columns = HashMap::new();
        for property in &schema.properties {
            let col_path = storage_utils::node_column_path(
                db_dir,
                schema.table_id,
                property.id,
                DbFileType::Original,
            );
            let ovf_path = if property.logical_type.has_overflow() {
                Some(storage_utils::node_column_overflow_path(
                    db_dir,
                    schema.table_id,
                    property.id,
                    DbFileType::Original,
                ))
            } else {
                None
            };
            columns.insert(
                property.id,
                DiskColumn::open(pool.clone(), &col_path, ovf_path, property.logical_type.clone())?,
            );
        }
        let pk_path = storage_utils::pk_index_path(db_dir, schema.table_id, DbFileType::Original);
        let pk_index = if pk_path.exists() && std::fs::metadata(&pk_path)?.len() > 0 {
            Some(HashIndex::open(pool, &pk_path)?)
        } else {
            None
        };
        Ok(Self {
            table_id: schema.table_id,
            columns,
            pk_index,
        })
    }

    fn column(&self, property_id: PropertyId) -> DbResult<&DiskColumn> {
        self.columns.get(&property_id).ok_or_else(|| {
            DbError::catalog(format!(
                "node table {} has no column for property {}",
                self.table_id, property_id
            ))
        })
    }

    pub fn read_value(&self, offset: NodeOffset, property_id: PropertyId) -> DbResult<Value> {
        self.column(property_id)?.read_value(offset)
    }

    pub fn set_value(
        &self,
        offset: NodeOffset,
        property_id: PropertyId,
        value: &Value,
    ) -> DbResult<()> {
        self.column(property_id)?.set_value(offset, value)
    }

    /// Primary-key lookup; `None` both for a missing key and for a
    /// table that was never bulk loaded.
    pub fn pk_lookup(&self, tx: &Transaction, key: &IndexKey) -> DbResult<Option<NodeOffset>> {
        match &self.pk_index {
            Some(index) => index.lookup(tx, key),
            None => Ok(None),
        }
    }

    pub fn has_pk_index(&self) -> bool {
        self.pk_index.is_some()
    }
}
