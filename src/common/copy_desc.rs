use std::collections::HashMap;

use crate::error::{DbError, DbResult};
use crate::types::PropertyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Csv,
    Parquet,
    Npy,
}

impl FileType {
    pub fn from_path(path: &str) -> DbResult<FileType> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".csv") {
            Ok(FileType::Csv)
        } else if lower.ends_with(".parquet") {
            Ok(FileType::Parquet)
        } else if lower.ends_with(".npy") {
            Ok(FileType::Npy)
        } else {
            Err(DbError::copy(format!("unrecognized file type: {}", path)))
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileType::Csv => "CSV",
            FileType::Parquet => "PARQUET",
            FileType::Npy => "NPY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvReaderConfig {
    pub delimiter: char,
    pub quote: char,
    pub escape: char,
    pub list_begin: char,
    pub list_end: char,
    pub has_header: bool,
}

impl Default for CsvReaderConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            escape: '\\',
            list_begin: '[',
            list_end: ']',
            has_header: false,
        }
    }
}

/// Everything a `COPY ... FROM` carries into the loader.
#[derive(Debug, Clone)]
pub struct CopyDescription {
    pub file_paths: Vec<String>,
    pub file_type: FileType,
    pub csv_config: CsvReaderConfig,
    /// For `COPY ... BY COLUMN`: which NPY file backs which property.
    pub property_to_npy: Option<HashMap<PropertyId, String>>,
}

impl CopyDescription {
    pub fn new(file_paths: Vec<String>, options: &HashMap<String, String>) -> DbResult<Self> {
        if file_paths.is_empty() {
            return Err(DbError::copy("COPY requires at least one file"));
        }
        let file_type = FileType::from_path(&file_paths[0])?;
        for path in &file_paths[1..] {
            if FileType::from_path(path)? != file_type {
                return Err(DbError::copy("all files of one COPY must share a file type"));
            }
        }
        let mut csv_config = CsvReaderConfig::default();
        for (key, value) in options {
            match key.to_ascii_uppercase().as_str() {
                "DELIM" | "DELIMITER" => csv_config.delimiter = single_char(key, value)?,
                "QUOTE" => csv_config.quote = single_char(key, value)?,
                "ESCAPE" => csv_config.escape = single_char(key, value)?,
                "HEADER" => {
                    csv_config.has_header = value.eq_ignore_ascii_case("true");
                }
                other => {
                    return Err(DbError::copy(format!("unrecognized copy option: {}", other)));
                }
            }
        }
        Ok(Self {
            file_paths,
            file_type,
            csv_config,
            property_to_npy: None,
        })
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            file_paths: vec![],
            file_type: FileType::Csv,
            csv_config: CsvReaderConfig::default(),
            property_to_npy: None,
        }
    }
}

fn single_char(key: &str, value: &str) -> DbResult<char> {
    let mut chars = value.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(DbError::copy(format!(
            "copy option {} must be a single character, got {:?}",
            key, value
        ))),
    }
}
