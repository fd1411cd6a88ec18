use std::path::{Path, PathBuf};

use crate::catalog::schema::RelDirection;
use crate::types::{PropertyId, TableId};

/// Which generation of a persistent file a caller wants: the checked-in
/// primary, or the shadow written ahead of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbFileType {
    Original,
    WalVersion,
}

pub const WAL_FILE_SUFFIX: &str = ".wal";

/// Shadow name of a primary file. Companion suffixes (`.hdr`, `.meta`,
/// `.ovf`) are always applied before this one, so every shadow file ends
/// with `.wal` and checkpoint promotion is a suffix strip.
pub fn wal_version(path: &Path) -> PathBuf {
    versioned(path.to_path_buf(), DbFileType::WalVersion)
}

fn versioned(path: PathBuf, file_type: DbFileType) -> PathBuf {
    match file_type {
        DbFileType::Original => path,
        DbFileType::WalVersion => {
            let mut s = path.into_os_string();
            s.push(WAL_FILE_SUFFIX);
            PathBuf::from(s)
        }
    }
}

pub fn catalog_path(db_dir: &Path, file_type: DbFileType) -> PathBuf {
    versioned(db_dir.join("catalog.kz"), file_type)
}

pub fn nodes_statistics_path(db_dir: &Path, file_type: DbFileType) -> PathBuf {
    versioned(db_dir.join("nodes.statistics"), file_type)
}

pub fn rels_statistics_path(db_dir: &Path, file_type: DbFileType) -> PathBuf {
    versioned(db_dir.join("rels.statistics"), file_type)
}

pub fn wal_path(db_dir: &Path) -> PathBuf {
    db_dir.join("wal.log")
}

pub fn table_dir(db_dir: &Path, table_id: TableId) -> PathBuf {
    db_dir.join(format!("t{}", table_id))
}

pub fn node_column_path(
    db_dir: &Path,
    table_id: TableId,
    prop: PropertyId,
    file_type: DbFileType,
) -> PathBuf {
    versioned(table_dir(db_dir, table_id).join(format!("col{}.col", prop)), file_type)
}

pub fn node_column_overflow_path(
    db_dir: &Path,
    table_id: TableId,
    prop: PropertyId,
    file_type: DbFileType,
) -> PathBuf {
    versioned(table_dir(db_dir, table_id).join(format!("col{}.ovf", prop)), file_type)
}

pub fn pk_index_path(db_dir: &Path, table_id: TableId, file_type: DbFileType) -> PathBuf {
    versioned(table_dir(db_dir, table_id).join("pk.idx"), file_type)
}

pub fn adj_column_path(
    db_dir: &Path,
    table_id: TableId,
    dir: RelDirection,
    file_type: DbFileType,
) -> PathBuf {
    versioned(
        table_dir(db_dir, table_id).join(format!("adj.{}.col", dir)),
        file_type,
    )
}

pub fn adj_lists_path(
    db_dir: &Path,
    table_id: TableId,
    dir: RelDirection,
    file_type: DbFileType,
) -> PathBuf {
    versioned(
        table_dir(db_dir, table_id).join(format!("adj.{}.lst", dir)),
        file_type,
    )
}

pub fn rel_property_column_path(
    db_dir: &Path,
    table_id: TableId,
    dir: RelDirection,
    prop: PropertyId,
    file_type: DbFileType,
) -> PathBuf {
    versioned(
        table_dir(db_dir, table_id).join(format!("prop{}.{}.col", prop, dir)),
        file_type,
    )
}

pub fn rel_property_lists_path(
    db_dir: &Path,
    table_id: TableId,
    dir: RelDirection,
    prop: PropertyId,
    file_type: DbFileType,
) -> PathBuf {
    versioned(
        table_dir(db_dir, table_id).join(format!("prop{}.{}.lst", prop, dir)),
        file_type,
    )
}

/// Companion files of a `.lst` data file.
pub fn headers_path(lst_path: &Path) -> PathBuf {
    sibling_with_extra_suffix(lst_path, ".hdr")
}

pub fn metadata_path(lst_path: &Path) -> PathBuf {
    sibling_with_extra_suffix(lst_path, ".meta")
}

/// Overflow companion of a column or list file.
pub fn overflow_path(path: &Path) -> PathBuf {
    sibling_with_extra_suffix(path, ".ovf")
}

fn sibling_with_extra_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.to_path_buf().into_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wal_version_appends_suffix() {
        let dir = Path::new("/db");
        assert_eq!(
            catalog_path(dir, DbFileType::Original),
            PathBuf::from("/db/catalog.kz")
        );
        assert_eq!(
            catalog_path(dir, DbFileType::WalVersion),
            PathBuf::from("/db/catalog.kz.wal")
        );
    }

    #[test]
    fn lst_companions() {
        let dir = Path::new("/db");
        let lst = adj_lists_path(dir, 3, RelDirection::Fwd, DbFileType::Original);
        assert_eq!(lst, PathBuf::from("/db/t3/adj.FWD.lst"));
        assert_eq!(headers_path(&lst), PathBuf::from("/db/t3/adj.FWD.lst.hdr"));
        // shadow names keep `.wal` at the very end for checkpoint promotion
        assert_eq!(
            wal_version(&headers_path(&lst)),
            PathBuf::from("/db/t3/adj.FWD.lst.hdr.wal")
        );
    }
}
