use std::io::Read;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::common::logical_type::LogicalType;
use crate::error::{DbError, DbResult};

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Minimal reader for `.npy` files: little-endian numeric dtypes,
/// C-order, 1-D or 2-D shapes. 2-D files map onto `FIXED_LIST`
/// properties; rows are copied byte-wise into column chunks.
pub struct NpyReader {
    file_name: String,
    element_type: LogicalType,
    element_size: usize,
    num_rows: u64,
    num_elements_per_row: u64,
    data: Vec<u8>,
}

impl NpyReader {
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let file_name = path.as_ref().to_string_lossy().into_owned();
        let mut file = std::fs::File::open(&path)
            .map_err(|e| DbError::copy(format!("cannot open {}: {}", file_name, e)))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
            return Err(DbError::copy(format!("{} is not an npy file", file_name)));
        }
        let major = bytes[6];
        let header_len = match major {
            1 => LittleEndian::read_u16(&bytes[8..10]) as usize,
            2 | 3 => LittleEndian::read_u32(&bytes[8..12]) as usize,
            other => {
                return Err(DbError::copy(format!(
                    "unsupported npy version {} in {}",
                    other, file_name
                )))
            }
        };
        let header_start = if major == 1 { 10 } else { 12 };
        if bytes.len() < header_start + header_len {
            return Err(DbError::copy(format!("npy header truncated in {}", file_name)));
        }
        let header = String::from_utf8_lossy(&bytes[header_start..header_start + header_len])
            .into_owned();

        let descr = extract_quoted(&header, "descr").ok_or_else(|| {
            DbError::copy(format!("npy header of {} has no descr", file_name))
        })?;
        let (element_type, element_size) = parse_descr(&descr, &file_name)?;
        if header.contains("'fortran_order': True") {
            return Err(DbError::copy(format!(
                "fortran-order npy file {} is not supported",
                file_name
            )));
        }
        let shape = extract_shape(&header).ok_or_else(|| {
            DbError::copy(format!("npy header of {} has no shape", file_name))
        })?;
        let (num_rows, num_elements_per_row) = match shape.len() {
            1 => (shape[0], 1),
            2 => (shape[0], shape[1]),
            n => {
                return Err(DbError::copy(format!(
                    "npy file {} has {} dimensions; only 1-D and 2-D are supported",
                    file_name, n
                )))
            }
        };
        let data = bytes[header_start + header_len..].to_vec();
        let expected = num_rows * num_elements_per_row * element_size as u64;
        if (data.len() as u64) < expected {
            return Err(DbError::copy(format!(
                "npy file {} holds {} data bytes, expected {}",
                file_name,
                data.len(),
                expected
            )));
        }
        Ok(Self {
            file_name,
            element_type,
            element_size,
            num_rows,
            num_elements_per_row,
            data,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn num_rows(&self) -> u64 {
        self.num_rows
    }

    pub fn num_elements_per_row(&self) -> u64 {
        self.num_elements_per_row
    }

    pub fn element_type(&self) -> &LogicalType {
        &self.element_type
    }

    pub fn row_size(&self) -> usize {
        self.element_size * self.num_elements_per_row as usize
    }

    pub fn row_bytes(&self, row: u64) -> &[u8] {
        let size = self.row_size();
        let at = row as usize * size;
        &self.data[at..at + size]
    }

    /// The property type this file can populate: the scalar type for
    /// 1-D files, `FIXED_LIST` of the right width for 2-D files.
    pub fn validate_against(&self, property_type: &LogicalType, table_name: &str) -> DbResult<()> {
        match property_type {
            ty if *ty == self.element_type => {
                if self.num_elements_per_row != 1 {
                    return Err(DbError::copy(format!(
                        "cannot copy a vector column of {} to scalar property of table {}",
                        self.file_name, table_name
                    )));
                }
                Ok(())
            }
            LogicalType::FixedList(child, n) => {
                if **child != self.element_type {
                    return Err(DbError::copy(format!(
                        "the type of npy file {} does not match the type defined in table {}",
                        self.file_name, table_name
                    )));
                }
                if self.num_elements_per_row != *n as u64 {
                    return Err(DbError::copy(format!(
                        "the shape of {} does not match the length of the fixed list property in table {}",
                        self.file_name, table_name
                    )));
                }
                Ok(())
            }
            _ => Err(DbError::copy(format!(
                "the type of npy file {} does not match the type defined in table {}",
                self.file_name, table_name
            ))),
        }
    }
}

fn parse_descr(descr: &str, file_name: &str) -> DbResult<(LogicalType, usize)> {
    match descr {
        "<i2" => Ok((LogicalType::Int16, 2)),
        "<i4" => Ok((LogicalType::Int32, 4)),
        "<i8" => Ok((LogicalType::Int64, 8)),
        "<f4" => Ok((LogicalType::Float, 4)),
        "<f8" => Ok((LogicalType::Double, 8)),
        other => Err(DbError::copy(format!(
            "unsupported npy data type {} in {}",
            other, file_name
        ))),
    }
}

fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let at = header.find(&format!("'{}'", key))?;
    let rest = &header[at..];
    let colon = rest.find(':')?;
    let rest = rest[colon + 1..].trim_start();
    let quote = rest.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let end = rest[1..].find(quote)?;
    Some(rest[1..1 + end].to_string())
}

fn extract_shape(header: &str) -> Option<Vec<u64>> {
    let at = header.find("'shape'")?;
    let rest = &header[at..];
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let inner = &rest[open + 1..close];
    let mut dims = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        dims.push(part.parse().ok()?);
    }
    Some(dims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub fn write_npy(path: &Path, descr: &str, shape: &str, data: &[u8]) {
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
        f.write_all(NPY_MAGIC).unwrap();
        f.write_all(&[1, 0]).unwrap();
        f.write_all(&((padded.len()) as u16).to_le_bytes()).unwrap();
        f.write_all(&padded).unwrap();
        f.write_all(data).unwrap();
    }

    #[test]
    fn read_one_dimensional_int64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ids.npy");
        let mut data = Vec::new();
        for v in [10i64, 20, 30] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        write_npy(&path, "<i8", "(3,)", &data);

        let reader = NpyReader::open(&path).unwrap();
        assert_eq!(reader.num_rows(), 3);
        assert_eq!(reader.num_elements_per_row(), 1);
        assert_eq!(reader.element_type(), &LogicalType::Int64);
        assert_eq!(reader.row_bytes(1), &20i64.to_le_bytes());
    }

    #[test]
    fn two_dimensional_maps_to_fixed_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vec.npy");
        let data = vec![0u8; 2 * 3 * 4];
        write_npy(&path, "<f4", "(2, 3)", &data);

        let reader = NpyReader::open(&path).unwrap();
        assert_eq!(reader.num_rows(), 2);
        assert_eq!(reader.num_elements_per_row(), 3);
        reader
            .validate_against(
                &LogicalType::FixedList(Box::new(LogicalType::Float), 3),
                "T",
            )
            .unwrap();
        assert!(reader
            .validate_against(
                &LogicalType::FixedList(Box::new(LogicalType::Float), 4),
                "T"
            )
            .is_err());
        assert!(reader.validate_against(&LogicalType::Float, "T").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.npy");
        std::fs::write(&path, b"not an npy file at all").unwrap();
        assert!(NpyReader::open(&path).is_err());
    }
}
