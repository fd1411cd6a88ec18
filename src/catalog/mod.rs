pub mod schema;
pub mod statistics;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::common::logical_type::LogicalType;
use crate::error::{DbError, DbResult};
use crate::storage::file_utils::{self, BinReader, BinWriter};
use crate::storage::storage_utils::{self, DbFileType};
use crate::types::{HandyRwLock, TableId};

use schema::{
    NodeTableSchema, Property, RelMultiplicity, RelTableSchema, TableSchema,
    INTERNAL_REL_ID_PROPERTY_NAME,
};

/// Immutable view of the catalog taken at the start of a query and
/// held for its lifetime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogContent {
    pub tables: HashMap<TableId, TableSchema>,
    pub name_to_id: HashMap<String, TableId>,
    next_table_id: TableId,
}

impl CatalogContent {
    pub fn table_id_by_name(&self, name: &str) -> DbResult<TableId> {
        self.name_to_id
            .get(name)
            .copied()
            .ok_or_else(|| DbError::binder(format!("table {} does not exist", name)))
    }

    pub fn table_schema(&self, table_id: TableId) -> DbResult<&TableSchema> {
        self.tables
            .get(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))
    }

    pub fn node_table_schema(&self, table_id: TableId) -> DbResult<&NodeTableSchema> {
        match self.table_schema(table_id)? {
            TableSchema::Node(s) => Ok(s),
            TableSchema::Rel(s) => Err(DbError::binder(format!(
                "{} is a rel table, expected a node table",
                s.name
            ))),
        }
    }

    pub fn rel_table_schema(&self, table_id: TableId) -> DbResult<&RelTableSchema> {
        match self.table_schema(table_id)? {
            TableSchema::Rel(s) => Ok(s),
            TableSchema::Node(s) => Err(DbError::binder(format!(
                "{} is a node table, expected a rel table",
                s.name
            ))),
        }
    }

    pub fn node_table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self
            .tables
            .values()
            .filter(|t| t.is_node_table())
            .map(|t| t.table_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn rel_table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self
            .tables
            .values()
            .filter(|t| !t.is_node_table())
            .map(|t| t.table_id())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Rel tables whose src or dst is `node_table`.
    pub fn rel_tables_touching(&self, node_table: TableId) -> Vec<&RelTableSchema> {
        self.tables
            .values()
            .filter_map(|t| match t {
                TableSchema::Rel(r)
                    if r.src_table_id == node_table || r.dst_table_id == node_table =>
                {
                    Some(r)
                }
                _ => None,
            })
            .collect()
    }

    fn check_name_free(&self, name: &str) -> DbResult<()> {
        if self.name_to_id.contains_key(name) {
            return Err(DbError::catalog(format!("{} already exists in catalog", name)));
        }
        Ok(())
    }

    pub fn add_node_table_schema(
        &mut self,
        name: &str,
        mut properties: Vec<Property>,
        primary_key_idx: usize,
    ) -> DbResult<TableId> {
        self.check_name_free(name)?;
        let table_id = self.next_table_id;
        self.next_table_id += 1;
        for (i, p) in properties.iter_mut().enumerate() {
            p.id = i as u32;
        }
        self.tables.insert(
            table_id,
            TableSchema::Node(NodeTableSchema {
                table_id,
                name: name.to_string(),
                comment: String::new(),
                properties,
                primary_key_idx,
            }),
        );
        self.name_to_id.insert(name.to_string(), table_id);
        Ok(table_id)
    }

    pub fn add_rel_table_schema(
        &mut self,
        name: &str,
        user_properties: Vec<Property>,
        src_table_id: TableId,
        dst_table_id: TableId,
        multiplicity: RelMultiplicity,
    ) -> DbResult<TableId> {
        self.check_name_free(name)?;
        let table_id = self.next_table_id;
        self.next_table_id += 1;
        let mut properties = Vec::with_capacity(user_properties.len() + 1);
        properties.push(Property {
            id: RelTableSchema::INTERNAL_REL_ID_PROPERTY_ID,
            name: INTERNAL_REL_ID_PROPERTY_NAME.to_string(),
            logical_type: LogicalType::Serial,
        });
        properties.extend(user_properties);
        for (i, p) in properties.iter_mut().enumerate() {
            p.id = i as u32;
        }
        self.tables.insert(
            table_id,
            TableSchema::Rel(RelTableSchema {
                table_id,
                name: name.to_string(),
                comment: String::new(),
                properties,
                src_table_id,
                dst_table_id,
                multiplicity,
            }),
        );
        self.name_to_id.insert(name.to_string(), table_id);
        Ok(table_id)
    }

    pub fn drop_table_schema(&mut self, table_id: TableId) -> DbResult<()> {
        let schema = self
            .tables
            .remove(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        self.name_to_id.remove(schema.name());
        Ok(())
    }

    pub fn add_property(
        &mut self,
        table_id: TableId,
        name: &str,
        logical_type: LogicalType,
    ) -> DbResult<()> {
        let schema = self
            .tables
            .get_mut(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        if schema.properties().iter().any(|p| p.name == name) {
            return Err(DbError::catalog(format!(
                "property {} already exists in table {}",
                name,
                schema.name()
            )));
        }
        let next_id = schema.properties().iter().map(|p| p.id).max().map_or(0, |m| m + 1);
        schema.properties_mut().push(Property {
            id: next_id,
            name: name.to_string(),
            logical_type,
        });
        Ok(())
    }

    pub fn drop_property(&mut self, table_id: TableId, name: &str) -> DbResult<()> {
        let schema = self
            .tables
            .get_mut(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        if let TableSchema::Node(node) = &*schema {
            if node.primary_key().name == name {
                return Err(DbError::catalog(format!(
                    "cannot drop the primary key of table {}",
                    node.name
                )));
            }
        }
        let before = schema.properties().len();
        let keep: Vec<Property> = schema
            .properties()
            .iter()
            .filter(|p| p.name != name)
            .cloned()
            .collect();
        if keep.len() == before {
            return Err(DbError::catalog(format!(
                "property {} does not exist in table {}",
                name,
                schema.name()
            )));
        }
        if let TableSchema::Node(node) = schema {
            let pk_name = node.primary_key().name.clone();
            node.properties.retain(|p| p.name != name);
            node.primary_key_idx = node
                .properties
                .iter()
                .position(|p| p.name == pk_name)
                .unwrap();
        } else {
            *schema.properties_mut() = keep;
        }
        Ok(())
    }

    pub fn rename_property(
        &mut self,
        table_id: TableId,
        old_name: &str,
        new_name: &str,
    ) -> DbResult<()> {
        let schema = self
            .tables
            .get_mut(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        if schema.properties().iter().any(|p| p.name == new_name) {
            return Err(DbError::catalog(format!(
                "property {} already exists in table {}",
                new_name,
                schema.name()
            )));
        }
        let prop = schema
            .properties_mut()
            .iter_mut()
            .find(|p| p.name == old_name)
            .ok_or_else(|| {
                DbError::catalog(format!("property {} does not exist", old_name))
            })?;
        prop.name = new_name.to_string();
        Ok(())
    }

    pub fn rename_table(&mut self, table_id: TableId, new_name: &str) -> DbResult<()> {
        self.check_name_free(new_name)?;
        let schema = self
            .tables
            .get_mut(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        let old = schema.name().to_string();
        match schema {
            TableSchema::Node(s) => s.name = new_name.to_string(),
            TableSchema::Rel(s) => s.name = new_name.to_string(),
        }
        self.name_to_id.remove(&old);
        self.name_to_id.insert(new_name.to_string(), table_id);
        Ok(())
    }

    pub fn set_table_comment(&mut self, table_id: TableId, comment: &str) -> DbResult<()> {
        let schema = self
            .tables
            .get_mut(&table_id)
            .ok_or_else(|| DbError::catalog(format!("no table with id {}", table_id)))?;
        schema.set_comment(comment.to_string());
        Ok(())
    }

    pub fn save(&self, path: &Path) -> DbResult<()> {
        let mut w = BinWriter::new();
        w.write(&self.next_table_id);
        let mut ids: Vec<TableId> = self.tables.keys().copied().collect();
        ids.sort_unstable();
        w.write(&(ids.len() as u32));
        for id in ids {
            w.write(&self.tables[&id]);
        }
        file_utils::overwrite_file(path, &w.into_bytes())
    }

    pub fn load(path: &Path) -> DbResult<Self> {
        let bytes = file_utils::read_file_to_bytes(path)?;
        let mut r = BinReader::new(&bytes);
        let next_table_id: TableId = r.read()?;
        let count: u32 = r.read()?;
        let mut content = CatalogContent {
            next_table_id,
            ..Default::default()
        };
        for _ in 0..count {
            let schema: TableSchema = r.read()?;
            content
                .name_to_id
                .insert(schema.name().to_string(), schema.table_id());
            content.tables.insert(schema.table_id(), schema);
        }
        Ok(content)
    }
}

/// Copy-on-write catalog: readers share an `Arc` snapshot,
/// the single write transaction mutates a clone that is swapped in at
/// checkpoint under the quiescence barrier.
pub struct Catalog {
    read_version: RwLock<Arc<CatalogContent>>,
    write_version: Mutex<Option<CatalogContent>>,
}

impl Catalog {
    pub fn open(db_dir: &Path) -> DbResult<Self> {
        let path = storage_utils::catalog_path(db_dir, DbFileType::Original);
        let content = if path.exists() {
            CatalogContent::load(&path)?
        } else {
            CatalogContent::default()
        };
        Ok(Self {
            read_version: RwLock::new(Arc::new(content)),
            write_version: Mutex::new(None),
        })
    }

    pub fn save_initial_catalog(db_dir: &Path) -> DbResult<()> {
        CatalogContent::default().save(&storage_utils::catalog_path(db_dir, DbFileType::Original))
    }

    pub fn snapshot(&self) -> Arc<CatalogContent> {
        self.read_version.rl().clone()
    }

    pub fn has_updates(&self) -> bool {
        self.write_version.lock().unwrap().is_some()
    }

    /// Run `f` against the write version, creating it from the read
    /// version on first use.
    pub fn with_write_version<R>(
        &self,
        f: impl FnOnce(&mut CatalogContent) -> DbResult<R>,
    ) -> DbResult<R> {
        let mut guard = self.write_version.lock().unwrap();
        if guard.is_none() {
            *guard = Some((**self.read_version.rl()).clone());
        }
        f(guard.as_mut().unwrap())
    }

    /// The version a transaction should bind against: the pending
    /// write version for the write transaction, the snapshot otherwise.
    pub fn version_for_write_tx(&self) -> Arc<CatalogContent> {
        let guard = self.write_version.lock().unwrap();
        match &*guard {
            Some(content) => Arc::new(content.clone()),
            None => self.snapshot(),
        }
    }

    /// Commit prep: persist the write version as the shadow file.
    pub fn write_catalog_for_wal_record(&self, db_dir: &Path) -> DbResult<()> {
        let guard = self.write_version.lock().unwrap();
        if let Some(content) = &*guard {
            content.save(&storage_utils::catalog_path(db_dir, DbFileType::WalVersion))?;
        }
        Ok(())
    }

    /// Checkpoint: the write version becomes the read version.
    pub fn checkpoint_in_memory(&self) {
        let mut guard = self.write_version.lock().unwrap();
        if let Some(content) = guard.take() {
            debug!("catalog checkpoint: {} tables", content.tables.len());
            *self.read_version.wl() = Arc::new(content);
        }
    }

    pub fn rollback_in_memory(&self) {
        *self.write_version.lock().unwrap() = None;
    }

    /// Recovery: reread the promoted primary file.
    pub fn reload(&self, db_dir: &Path) -> DbResult<()> {
        let path = storage_utils::catalog_path(db_dir, DbFileType::Original);
        let content = if path.exists() {
            CatalogContent::load(&path)?
        } else {
            CatalogContent::default()
        };
        *self.read_version.wl() = Arc::new(content);
        *self.write_version.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_props() -> Vec<Property> {
        vec![
            Property {
                id: 0,
                name: "id".to_string(),
                logical_type: LogicalType::Int64,
            },
            Property {
                id: 1,
                name: "name".to_string(),
                logical_type: LogicalType::String,
            },
        ]
    }

    #[test]
    fn create_and_lookup_tables() {
        let mut content = CatalogContent::default();
        let person = content
            .add_node_table_schema("Person", person_props(), 0)
            .unwrap();
        let knows = content
            .add_rel_table_schema("Knows", vec![], person, person, RelMultiplicity::ManyMany)
            .unwrap();
        assert_eq!(content.table_id_by_name("Person").unwrap(), person);
        assert_eq!(content.table_id_by_name("Knows").unwrap(), knows);
        assert!(content.node_table_schema(person).is_ok());
        assert!(content.rel_table_schema(knows).is_ok());
        // the rel table carries the internal rel-id property
        assert_eq!(
            content.rel_table_schema(knows).unwrap().properties[0].name,
            INTERNAL_REL_ID_PROPERTY_NAME
        );
    }

    #[test]
    fn duplicate_table_is_rejected() {
        let mut content = CatalogContent::default();
        content
            .add_node_table_schema("Person", person_props(), 0)
            .unwrap();
        assert!(content
            .add_node_table_schema("Person", person_props(), 0)
            .is_err());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.kz");
        let mut content = CatalogContent::default();
        let person = content
            .add_node_table_schema("Person", person_props(), 0)
            .unwrap();
        content
            .add_rel_table_schema("Knows", vec![], person, person, RelMultiplicity::ManyOne)
            .unwrap();
        content.set_table_comment(person, "people").unwrap();
        content.save(&path).unwrap();
        let back = CatalogContent::load(&path).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn copy_on_write_versions() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(!catalog.has_updates());
        catalog
            .with_write_version(|c| c.add_node_table_schema("Person", person_props(), 0))
            .unwrap();
        assert!(catalog.has_updates());
        // readers still see the old snapshot
        assert!(catalog.snapshot().table_id_by_name("Person").is_err());
        catalog.checkpoint_in_memory();
        assert!(catalog.snapshot().table_id_by_name("Person").is_ok());
        assert!(!catalog.has_updates());
    }

    #[test]
    fn alter_operations() {
        let mut content = CatalogContent::default();
        let person = content
            .add_node_table_schema("Person", person_props(), 0)
            .unwrap();
        content
            .add_property(person, "age", LogicalType::Int64)
            .unwrap();
        assert!(content.add_property(person, "age", LogicalType::Int64).is_err());
        content.rename_property(person, "age", "years").unwrap();
        content.drop_property(person, "years").unwrap();
        assert!(content.drop_property(person, "id").is_err()); // primary key
        content.rename_table(person, "Human").unwrap();
        assert!(content.table_id_by_name("Person").is_err());
        assert_eq!(content.table_id_by_name("Human").unwrap(), person);
    }
}
