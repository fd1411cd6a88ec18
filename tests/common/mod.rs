#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use warren_db::{Database, DbConfig, Transaction, Value};

/// Set up logging once and hand out a scratch database directory.
pub fn setup() -> tempfile::TempDir {
    warren_db::logging::init_log();
    tempfile::tempdir().unwrap()
}

pub fn open_db(dir: &Path) -> Database {
    let config = DbConfig {
        buffer_pool_bytes: 4 * 1024 * 1024,
        max_num_threads: 4,
    };
    Database::open(dir, config).unwrap()
}

/// Write a fixture file and return its path as a string.
pub fn write_file(dir: &Path, name: &str, content: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

/// Run one statement inside its own write transaction and commit.
pub fn run_write(db: &Database, input: &str) {
    let tx = db.begin_write().unwrap();
    db.execute(&tx, input).unwrap();
    db.commit(&tx).unwrap();
}

/// Run a read query and return the rows.
pub fn query(db: &Database, input: &str) -> Vec<Vec<Value>> {
    let tx = db.begin_read().unwrap();
    let result = db.execute(&tx, input).unwrap();
    db.commit(&tx).unwrap();
    result.rows
}

pub fn query_single_i64(db: &Database, input: &str) -> i64 {
    let rows = query(db, input);
    assert_eq!(rows.len(), 1, "expected one row, got {:?}", rows);
    match &rows[0][0] {
        Value::Int64(v) => *v,
        other => panic!("expected an INT64, got {:?}", other),
    }
}

pub fn i64_column(rows: &[Vec<Value>], idx: usize) -> Vec<i64> {
    rows.iter()
        .map(|r| match &r[idx] {
            Value::Int64(v) => *v,
            other => panic!("expected an INT64, got {:?}", other),
        })
        .collect()
}

pub fn string_column(rows: &[Vec<Value>], idx: usize) -> Vec<String> {
    rows.iter()
        .map(|r| match &r[idx] {
            Value::String(s) => s.clone(),
            other => panic!("expected a STRING, got {:?}", other),
        })
        .collect()
}

/// Minimal `.npy` writer for copy-by-column fixtures (version 1.0,
/// little-endian, C order).
pub fn write_npy(path: &PathBuf, descr: &str, shape: &str, data: &[u8]) {
    let header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    let mut padded = header.into_bytes();
    while (10 + padded.len()) % 64 != 0 {
        padded.push(b' ');
    }
    padded.push(b'\n');
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(b"\x93NUMPY").unwrap();
    f.write_all(&[1, 0]).unwrap();
    f.write_all(&(padded.len() as u16).to_le_bytes()).unwrap();
    f.write_all(&padded).unwrap();
    f.write_all(data).unwrap();
}

/// Leak-free helper: keep a tx handle around for multi-statement
/// transactions.
pub fn in_write_tx<R>(db: &Database, f: impl FnOnce(&Transaction) -> R) -> R {
    let tx = db.begin_write().unwrap();
    let result = f(&tx);
    db.commit(&tx).unwrap();
    result
}
