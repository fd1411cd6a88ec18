use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem::size_of;
use std::path::Path;

use crate::error::{DbError, DbResult};

/// Open (creating if absent) a file for read/write.
pub fn open_file<P: AsRef<Path>>(path: P) -> DbResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?)
}

/// Overwrite `path` with `bytes` and fsync.
pub fn overwrite_file<P: AsRef<Path>>(path: P, bytes: &[u8]) -> DbResult<()> {
    let mut file = open_file(&path)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_file_to_bytes<P: AsRef<Path>>(path: P) -> DbResult<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(bytes)
}

pub trait Encodeable {
    fn encode(&self, buf: &mut Vec<u8>);
}

pub trait Decodeable: Sized {
    fn decode(reader: &mut BinReader) -> DbResult<Self>;
}

/// Append-only binary writer used by the catalog, statistics and index
/// serializers.
pub struct BinWriter {
    buf: Vec<u8>,
}

impl BinWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        obj.encode(&mut self.buf);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Default for BinWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over a byte slice with checked reads.
pub struct BinReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BinReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read<T: Decodeable>(&mut self) -> DbResult<T> {
        T::decode(self)
    }

    pub fn read_exact(&mut self, count: usize) -> DbResult<&'a [u8]> {
        if self.pos + count > self.bytes.len() {
            return Err(DbError::corruption(format!(
                "unexpected end of file: need {} bytes at position {}, have {}",
                count,
                self.pos,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self, buf: &mut Vec<u8>) {
                    buf.extend_from_slice(&self.to_le_bytes());
                }
            }

            impl Decodeable for $t {
                fn decode(reader: &mut BinReader) -> DbResult<Self> {
                    let bytes = reader.read_exact(size_of::<Self>())?;
                    Ok(Self::from_le_bytes(bytes.try_into().unwrap()))
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64, i16, i32, i64, f32, f64);

impl Encodeable for bool {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(*self as u8);
    }
}

impl Decodeable for bool {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        Ok(reader.read_exact(1)?[0] == 1)
    }
}

/// Strings are length-prefixed with a u32.
impl Encodeable for String {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        buf.extend_from_slice(self.as_bytes());
    }
}

impl Decodeable for String {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        let len: u32 = reader.read()?;
        let bytes = reader.read_exact(len as usize)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DbError::corruption("invalid utf-8 in stored string"))
    }
}

impl<T: Encodeable> Encodeable for Vec<T> {
    fn encode(&self, buf: &mut Vec<u8>) {
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: Decodeable> Decodeable for Vec<T> {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        let len: u32 = reader.read()?;
        let mut items = Vec::with_capacity(len as usize);
        for _ in 0..len {
            items.push(reader.read()?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut w = BinWriter::new();
        w.write(&42u64);
        w.write(&true);
        w.write(&"hello".to_string());
        let bytes = w.into_bytes();
        let mut r = BinReader::new(&bytes);
        assert_eq!(r.read::<u64>().unwrap(), 42);
        assert_eq!(r.read::<bool>().unwrap(), true);
        assert_eq!(r.read::<String>().unwrap(), "hello");
        assert!(r.is_exhausted());
    }

    #[test]
    fn truncated_read_is_corruption() {
        let bytes = vec![1u8, 2];
        let mut r = BinReader::new(&bytes);
        assert!(matches!(r.read::<u64>(), Err(DbError::Corruption(_))));
    }
}
