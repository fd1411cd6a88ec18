use std::fs::File;

use crate::common::copy_desc::CsvReaderConfig;
use crate::common::date_time;
use crate::copier::ROWS_PER_BLOCK;
use crate::error::{DbError, DbResult};

/// One block of rows handed to a copy task. Cells are textual; `None`
/// is NULL (the empty-string convention of the CSV reader and the
/// NULL fields of Parquet).
pub struct RecordBatch {
    columns: Vec<Vec<Option<String>>>,
    num_rows: usize,
}

impl RecordBatch {
    pub fn new(num_columns: usize) -> Self {
        Self {
            columns: vec![Vec::new(); num_columns],
            num_rows: 0,
        }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) {
        if row.len() > self.columns.len() {
            self.columns.resize(row.len(), vec![None; self.num_rows]);
        }
        for (col, cell) in self.columns.iter_mut().zip(row.into_iter().chain(std::iter::repeat(None))) {
            col.push(cell);
        }
        self.num_rows += 1;
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn cell(&self, row: usize, col: usize) -> DbResult<Option<&str>> {
        let column = self.columns.get(col).ok_or_else(|| {
            DbError::copy(format!(
                "number of columns mismatch: need column {}, file has {}",
                col + 1,
                self.columns.len()
            ))
        })?;
        Ok(column[row].as_deref())
    }
}

/// Streaming producer of row blocks; CSV, Parquet and (separately)
/// NPY feed the same populate tasks through this seam.
pub trait RecordBatchSource: Send {
    fn next_batch(&mut self) -> DbResult<Option<RecordBatch>>;
}

pub struct CsvBatchSource {
    reader: csv::Reader<File>,
    num_columns: usize,
}

impl CsvBatchSource {
    pub fn open(path: &str, config: &CsvReaderConfig) -> DbResult<Self> {
        let reader = csv::ReaderBuilder::new()
            .delimiter(config.delimiter as u8)
            .quote(config.quote as u8)
            .escape(if config.escape == config.quote {
                None
            } else {
                Some(config.escape as u8)
            })
            .has_headers(config.has_header)
            .flexible(true)
            .from_path(path)
            .map_err(|e| DbError::copy(format!("cannot open {}: {}", path, e)))?;
        Ok(Self {
            reader,
            num_columns: 0,
        })
    }
}

impl RecordBatchSource for CsvBatchSource {
    fn next_batch(&mut self) -> DbResult<Option<RecordBatch>> {
        let mut batch = RecordBatch::new(self.num_columns);
        for record in self.reader.records().take(ROWS_PER_BLOCK as usize) {
            let record = record.map_err(|e| DbError::copy(format!("csv error: {}", e)))?;
            let row: Vec<Option<String>> = record
                .iter()
                .map(|cell| {
                    if cell.is_empty() {
                        // only the empty string is treated as NULL
                        None
                    } else {
                        Some(cell.to_string())
                    }
                })
                .collect();
            batch.push_row(row);
        }
        if batch.num_rows() == 0 {
            return Ok(None);
        }
        self.num_columns = batch.num_columns();
        Ok(Some(batch))
    }
}

pub struct ParquetBatchSource {
    /// row-group row counts not yet consumed
    remaining_blocks: std::collections::VecDeque<u64>,
    rows: std::vec::IntoIter<Vec<Option<String>>>,
}

impl ParquetBatchSource {
    pub fn open(path: &str) -> DbResult<Self> {
        use parquet::file::reader::{FileReader, SerializedFileReader};

        let file = File::open(path)
            .map_err(|e| DbError::copy(format!("cannot open {}: {}", path, e)))?;
        let reader = SerializedFileReader::new(file)
            .map_err(|e| DbError::copy(format!("cannot read parquet file {}: {}", path, e)))?;
        let metadata = reader.metadata();
        let mut remaining_blocks = std::collections::VecDeque::new();
        for i in 0..metadata.num_row_groups() {
            remaining_blocks.push_back(metadata.row_group(i).num_rows() as u64);
        }
        // materialize rows up front; blocks follow the row-group sizes
        let mut rows = Vec::new();
        let iter = reader
            .get_row_iter(None)
            .map_err(|e| DbError::copy(format!("parquet error in {}: {}", path, e)))?;
        for row in iter {
            let mut cells = Vec::new();
            for (_, field) in row.get_column_iter() {
                cells.push(field_to_cell(field)?);
            }
            rows.push(cells);
        }
        Ok(Self {
            remaining_blocks,
            rows: rows.into_iter(),
        })
    }
}

fn field_to_cell(field: &parquet::record::Field) -> DbResult<Option<String>> {
    use parquet::record::Field;
    Ok(match field {
        Field::Null => None,
        Field::Bool(v) => Some(v.to_string()),
        Field::Byte(v) => Some(v.to_string()),
        Field::Short(v) => Some(v.to_string()),
        Field::Int(v) => Some(v.to_string()),
        Field::Long(v) => Some(v.to_string()),
        Field::UByte(v) => Some(v.to_string()),
        Field::UShort(v) => Some(v.to_string()),
        Field::UInt(v) => Some(v.to_string()),
        Field::ULong(v) => Some(v.to_string()),
        Field::Float(v) => Some(v.to_string()),
        Field::Double(v) => Some(v.to_string()),
        Field::Str(v) => Some(v.clone()),
        Field::Date(days) => Some(date_time::format_date(*days as i32)),
        Field::TimestampMillis(ms) => Some(date_time::format_timestamp(*ms as i64 * 1000)),
        Field::TimestampMicros(us) => Some(date_time::format_timestamp(*us as i64)),
        other => {
            return Err(DbError::copy(format!(
                "unsupported parquet field {:?} for copy",
                other
            )))
        }
    })
}

impl RecordBatchSource for ParquetBatchSource {
    fn next_batch(&mut self) -> DbResult<Option<RecordBatch>> {
        let block_rows = match self.remaining_blocks.pop_front() {
            Some(n) => n,
            None => return Ok(None),
        };
        let mut batch = RecordBatch::new(0);
        for _ in 0..block_rows {
            match self.rows.next() {
                Some(row) => batch.push_row(row),
                None => break,
            }
        }
        if batch.num_rows() == 0 {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_batches_with_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1,Alice").unwrap();
        writeln!(f, "2,").unwrap();
        writeln!(f, "3,Carol").unwrap();
        drop(f);

        let mut source =
            CsvBatchSource::open(path.to_str().unwrap(), &CsvReaderConfig::default()).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.cell(0, 1).unwrap(), Some("Alice"));
        assert_eq!(batch.cell(1, 1).unwrap(), None);
        assert_eq!(batch.cell(2, 0).unwrap(), Some("3"));
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn csv_header_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.csv");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "id,name").unwrap();
        writeln!(f, "1,Alice").unwrap();
        drop(f);

        let config = CsvReaderConfig {
            has_header: true,
            ..Default::default()
        };
        let mut source = CsvBatchSource::open(path.to_str().unwrap(), &config).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.cell(0, 0).unwrap(), Some("1"));
    }

    #[test]
    fn missing_column_is_an_error() {
        let mut batch = RecordBatch::new(2);
        batch.push_row(vec![Some("a".into()), Some("b".into())]);
        assert!(batch.cell(0, 2).is_err());
    }
}
