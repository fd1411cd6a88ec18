use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::error::{DbError, DbResult};
use crate::storage::file_utils::{self, BinReader, BinWriter};
use crate::storage::storage_utils;
use crate::types::{PageIdx, TableId};

/// One write-ahead-log entry. The log is committed iff its final record
/// is `Commit`.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    PageUpdate {
        /// Path of the target file relative to the database directory.
        file: String,
        page_idx: PageIdx,
        image: Vec<u8>,
    },
    Commit,
    Catalog,
    TableStatistics {
        is_node_table: bool,
    },
    CopyNode {
        table_id: TableId,
    },
    CopyRel {
        table_id: TableId,
    },
}

const REC_PAGE_UPDATE: u8 = 0;
const REC_COMMIT: u8 = 1;
const REC_CATALOG: u8 = 2;
const REC_TABLE_STATISTICS: u8 = 3;
const REC_COPY_NODE: u8 = 4;
const REC_COPY_REL: u8 = 5;

impl WalRecord {
    fn type_tag(&self) -> u8 {
        match self {
            WalRecord::PageUpdate { .. } => REC_PAGE_UPDATE,
            WalRecord::Commit => REC_COMMIT,
            WalRecord::Catalog => REC_CATALOG,
            WalRecord::TableStatistics { .. } => REC_TABLE_STATISTICS,
            WalRecord::CopyNode { .. } => REC_COPY_NODE,
            WalRecord::CopyRel { .. } => REC_COPY_REL,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut w = BinWriter::new();
        match self {
            WalRecord::PageUpdate {
                file,
                page_idx,
                image,
            } => {
                w.write(file);
                w.write(page_idx);
                w.write(&(image.len() as u32));
            }
            WalRecord::Commit | WalRecord::Catalog => {}
            WalRecord::TableStatistics { is_node_table } => w.write(is_node_table),
            WalRecord::CopyNode { table_id } | WalRecord::CopyRel { table_id } => {
                w.write(table_id)
            }
        }
        let mut payload = w.into_bytes();
        if let WalRecord::PageUpdate { image, .. } = self {
            payload.extend_from_slice(image);
        }
        payload
    }

    fn decode(type_tag: u8, payload: &[u8]) -> DbResult<WalRecord> {
        let mut r = BinReader::new(payload);
        match type_tag {
            REC_PAGE_UPDATE => {
                let file: String = r.read()?;
                let page_idx: PageIdx = r.read()?;
                let image_len: u32 = r.read()?;
                let image = r.read_exact(image_len as usize)?.to_vec();
                Ok(WalRecord::PageUpdate {
                    file,
                    page_idx,
                    image,
                })
            }
            REC_COMMIT => Ok(WalRecord::Commit),
            REC_CATALOG => Ok(WalRecord::Catalog),
            REC_TABLE_STATISTICS => Ok(WalRecord::TableStatistics {
                is_node_table: r.read()?,
            }),
            REC_COPY_NODE => Ok(WalRecord::CopyNode {
                table_id: r.read()?,
            }),
            REC_COPY_REL => Ok(WalRecord::CopyRel {
                table_id: r.read()?,
            }),
            other => Err(DbError::corruption(format!(
                "invalid wal record type: {}",
                other
            ))),
        }
    }
}

/// Append-only record log. Framing per record:
/// `type(1) | payload_len(4) | payload | crc32(4)`, crc over type and
/// payload. Appends are buffered in the OS; durability comes from
/// [`Wal::flush_all_pages`].
pub struct Wal {
    file: Mutex<File>,
    path: PathBuf,
}

impl Wal {
    pub fn new(db_dir: &Path) -> DbResult<Self> {
        let path = storage_utils::wal_path(db_dir);
        let mut file = file_utils::open_file(&path)?;
        file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: Mutex::new(file),
            path,
        })
    }

    pub fn log_page_update(&self, file: &str, page_idx: PageIdx, image: &[u8]) -> DbResult<()> {
        self.append(&WalRecord::PageUpdate {
            file: file.to_string(),
            page_idx,
            image: image.to_vec(),
        })
    }

    pub fn log_commit(&self) -> DbResult<()> {
        self.append(&WalRecord::Commit)
    }

    pub fn log_catalog(&self) -> DbResult<()> {
        self.append(&WalRecord::Catalog)
    }

    pub fn log_table_statistics(&self, is_node_table: bool) -> DbResult<()> {
        self.append(&WalRecord::TableStatistics { is_node_table })
    }

    pub fn log_copy_node(&self, table_id: TableId) -> DbResult<()> {
        self.append(&WalRecord::CopyNode { table_id })
    }

    pub fn log_copy_rel(&self, table_id: TableId) -> DbResult<()> {
        self.append(&WalRecord::CopyRel { table_id })
    }

    fn append(&self, record: &WalRecord) -> DbResult<()> {
        let payload = record.encode_payload();
        let mut framed = Vec::with_capacity(payload.len() + 9);
        framed.push(record.type_tag());
        framed.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        framed.extend_from_slice(&payload);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[record.type_tag()]);
        hasher.update(&payload);
        framed.extend_from_slice(&hasher.finalize().to_le_bytes());
        let mut file = self.file.lock().unwrap();
        file.write_all(&framed)?;
        Ok(())
    }

    /// fsync the log. The WAL is the single durability point.
    pub fn flush_all_pages(&self) -> DbResult<()> {
        let file = self.file.lock().unwrap();
        file.sync_all()?;
        Ok(())
    }

    pub fn clear(&self) -> DbResult<()> {
        debug!("clearing wal {:?}", self.path);
        let mut file = self.file.lock().unwrap();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_all()?;
        Ok(())
    }

    pub fn is_empty(&self) -> DbResult<bool> {
        let file = self.file.lock().unwrap();
        Ok(file.metadata()?.len() == 0)
    }

    /// Read every complete record. A truncated tail (torn final append)
    /// is ignored; a bad checksum on a complete record is corruption.
    pub fn read_records(&self) -> DbResult<Vec<WalRecord>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        file.seek(SeekFrom::End(0))?;
        drop(file);

        let mut records = Vec::new();
        let mut pos = 0usize;
        while pos + 5 <= bytes.len() {
            let type_tag = bytes[pos];
            let payload_len =
                u32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
            let rec_end = pos + 5 + payload_len + 4;
            if rec_end > bytes.len() {
                // torn write at the tail: everything before it is intact
                break;
            }
            let payload = &bytes[pos + 5..pos + 5 + payload_len];
            let stored_crc =
                u32::from_le_bytes(bytes[rec_end - 4..rec_end].try_into().unwrap());
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&[type_tag]);
            hasher.update(payload);
            if hasher.finalize() != stored_crc {
                return Err(DbError::corruption(format!(
                    "wal record at byte {} failed crc check",
                    pos
                )));
            }
            records.push(WalRecord::decode(type_tag, payload)?);
            pos = rec_end;
        }
        Ok(records)
    }

    /// The log only counts as committed when it ends with `Commit`.
    pub fn is_last_record_commit(&self) -> DbResult<bool> {
        Ok(matches!(self.read_records()?.last(), Some(WalRecord::Commit)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal() -> (tempfile::TempDir, Wal) {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        (dir, wal)
    }

    #[test]
    fn round_trip_records() {
        let (_dir, wal) = temp_wal();
        wal.log_catalog().unwrap();
        wal.log_table_statistics(true).unwrap();
        wal.log_copy_node(7).unwrap();
        wal.log_page_update("t7/col0.col", 3, &[1, 2, 3, 4]).unwrap();
        wal.log_commit().unwrap();
        wal.flush_all_pages().unwrap();

        let records = wal.read_records().unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], WalRecord::Catalog);
        assert_eq!(
            records[3],
            WalRecord::PageUpdate {
                file: "t7/col0.col".to_string(),
                page_idx: 3,
                image: vec![1, 2, 3, 4],
            }
        );
        assert!(wal.is_last_record_commit().unwrap());
    }

    #[test]
    fn uncommitted_wal_is_detected() {
        let (_dir, wal) = temp_wal();
        wal.log_copy_node(1).unwrap();
        assert!(!wal.is_last_record_commit().unwrap());
    }

    #[test]
    fn torn_tail_is_ignored() {
        let (dir, wal) = temp_wal();
        wal.log_commit().unwrap();
        wal.flush_all_pages().unwrap();
        // append half a record by hand
        {
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(storage_utils::wal_path(dir.path()))
                .unwrap();
            f.write_all(&[REC_COPY_NODE, 4, 0]).unwrap();
        }
        let records = wal.read_records().unwrap();
        assert_eq!(records, vec![WalRecord::Commit]);
    }

    #[test]
    fn bad_crc_is_corruption() {
        let (dir, wal) = temp_wal();
        wal.log_copy_node(1).unwrap();
        wal.flush_all_pages().unwrap();
        let path = storage_utils::wal_path(dir.path());
        let mut bytes = std::fs::read(&path).unwrap();
        let idx = bytes.len() - 5;
        bytes[idx] ^= 0xFF; // corrupt payload
        std::fs::write(&path, &bytes).unwrap();
        let wal = Wal::new(dir.path()).unwrap();
        assert!(matches!(wal.read_records(), Err(DbError::Corruption(_))));
    }

    #[test]
    fn clear_truncates() {
        let (_dir, wal) = temp_wal();
        wal.log_commit().unwrap();
        wal.clear().unwrap();
        assert!(wal.is_empty().unwrap());
        assert!(wal.read_records().unwrap().is_empty());
    }
}
