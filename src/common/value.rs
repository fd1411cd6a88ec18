use std::cmp::Ordering;
use std::fmt;

use crate::common::date_time::{self, Interval};
use crate::common::logical_type::LogicalType;
use crate::common::CopyDescription;
use crate::error::{DbError, DbResult};
use crate::types::InternalId;

/// Runtime value flowing through the executor and returned to clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Date(i32),
    Timestamp(i64),
    Interval(Interval),
    String(String),
    VarList(Vec<Value>),
    FixedList(Vec<Value>),
    InternalId(InternalId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Parse a textual cell into a value of `ty`. The empty string is
    /// NULL (matching the loader's CSV convention).
    pub fn parse(cell: &str, ty: &LogicalType, copy_desc: &CopyDescription) -> DbResult<Value> {
        if cell.is_empty() {
            return Ok(Value::Null);
        }
        let bad = |what: &str| DbError::copy(format!("cannot parse {:?} as {}", cell, what));
        match ty {
            LogicalType::Bool => match cell.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "0" => Ok(Value::Bool(false)),
                _ => Err(bad("BOOL")),
            },
            LogicalType::Int16 => cell
                .trim()
                .parse()
                .map(Value::Int16)
                .map_err(|_| bad("INT16")),
            LogicalType::Int32 => cell
                .trim()
                .parse()
                .map(Value::Int32)
                .map_err(|_| bad("INT32")),
            LogicalType::Int64 | LogicalType::Serial => cell
                .trim()
                .parse()
                .map(Value::Int64)
                .map_err(|_| bad("INT64")),
            LogicalType::Float => cell
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|_| bad("FLOAT")),
            LogicalType::Double => cell
                .trim()
                .parse()
                .map(Value::Double)
                .map_err(|_| bad("DOUBLE")),
            LogicalType::Date => date_time::parse_date(cell).map(Value::Date),
            LogicalType::Timestamp => date_time::parse_timestamp(cell).map(Value::Timestamp),
            LogicalType::Interval => date_time::parse_interval(cell).map(Value::Interval),
            LogicalType::String => Ok(Value::String(cell.to_string())),
            LogicalType::VarList(child) => {
                let elems = parse_list_elements(cell, copy_desc)?;
                let mut values = Vec::with_capacity(elems.len());
                for elem in elems {
                    values.push(Value::parse(&elem, child, copy_desc)?);
                }
                Ok(Value::VarList(values))
            }
            LogicalType::FixedList(child, n) => {
                let elems = parse_list_elements(cell, copy_desc)?;
                if elems.len() != *n as usize {
                    return Err(DbError::copy(format!(
                        "each fixed list should have a fixed number of elements, expected: {}, actual: {}",
                        n,
                        elems.len()
                    )));
                }
                let mut values = Vec::with_capacity(elems.len());
                for elem in elems {
                    values.push(Value::parse(&elem, child, copy_desc)?);
                }
                Ok(Value::FixedList(values))
            }
            LogicalType::Struct(_) | LogicalType::InternalId => Err(DbError::copy(format!(
                "unsupported data type {} for parsing",
                ty
            ))),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int16(v) => Some(*v as i64),
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int16(v) => Some(*v as f64),
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Coerce into the storage type of a property; used by the
    /// interactive write path where expression results are widest-type.
    pub fn cast_to(&self, ty: &LogicalType) -> DbResult<Value> {
        let fail = || {
            DbError::binder(format!(
                "cannot cast {} to data type {}",
                self, ty
            ))
        };
        if self.is_null() {
            return Ok(Value::Null);
        }
        Ok(match ty {
            LogicalType::Bool => Value::Bool(self.as_bool().ok_or_else(fail)?),
            LogicalType::Int16 => {
                Value::Int16(self.as_i64().ok_or_else(fail)?.try_into().map_err(|_| fail())?)
            }
            LogicalType::Int32 => {
                Value::Int32(self.as_i64().ok_or_else(fail)?.try_into().map_err(|_| fail())?)
            }
            LogicalType::Int64 | LogicalType::Serial => {
                Value::Int64(self.as_i64().ok_or_else(fail)?)
            }
            LogicalType::Float => Value::Float(self.as_f64().ok_or_else(fail)? as f32),
            LogicalType::Double => Value::Double(self.as_f64().ok_or_else(fail)?),
            LogicalType::Date => match self {
                Value::Date(d) => Value::Date(*d),
                Value::String(s) => Value::Date(date_time::parse_date(s)?),
                _ => return Err(fail()),
            },
            LogicalType::Timestamp => match self {
                Value::Timestamp(t) => Value::Timestamp(*t),
                Value::String(s) => Value::Timestamp(date_time::parse_timestamp(s)?),
                _ => return Err(fail()),
            },
            LogicalType::Interval => match self {
                Value::Interval(iv) => Value::Interval(*iv),
                Value::String(s) => Value::Interval(date_time::parse_interval(s)?),
                _ => return Err(fail()),
            },
            LogicalType::String => match self {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            },
            LogicalType::VarList(child) => match self {
                Value::VarList(items) => {
                    let mut cast = Vec::with_capacity(items.len());
                    for item in items {
                        cast.push(item.cast_to(child)?);
                    }
                    Value::VarList(cast)
                }
                _ => return Err(fail()),
            },
            LogicalType::FixedList(child, n) => match self {
                Value::VarList(items) | Value::FixedList(items) => {
                    if items.len() != *n as usize {
                        return Err(fail());
                    }
                    let mut cast = Vec::with_capacity(items.len());
                    for item in items {
                        cast.push(item.cast_to(child)?);
                    }
                    Value::FixedList(cast)
                }
                _ => return Err(fail()),
            },
            LogicalType::Struct(_) | LogicalType::InternalId => return Err(fail()),
        })
    }

    /// Total order used by ORDER BY and comparison operators. NULL sorts
    /// last; numeric values compare across widths.
    pub fn compare(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Greater,
            (_, Null) => Ordering::Less,
            (Bool(a), Bool(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Interval(a), Interval(b)) => (a.months, a.days, a.micros)
                .cmp(&(b.months, b.days, b.micros)),
            (InternalId(a), InternalId(b)) => {
                (a.table_id, a.offset).cmp(&(b.table_id, b.offset))
            }
            (VarList(a), VarList(b)) | (FixedList(a), FixedList(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
        }
    }
}

/// Split a `[a,b,c]` literal into element strings, honoring nested
/// brackets. Empty elements are skipped.
fn parse_list_elements(cell: &str, copy_desc: &CopyDescription) -> DbResult<Vec<String>> {
    let cfg = &copy_desc.csv_config;
    let cell = cell.trim();
    let inner = cell
        .strip_prefix(cfg.list_begin)
        .and_then(|s| s.strip_suffix(cfg.list_end))
        .ok_or_else(|| DbError::copy(format!("cannot parse {:?} as a list", cell)))?;
    let mut elements = Vec::new();
    let mut bracket = 0i32;
    let mut current = String::new();
    for c in inner.chars() {
        if c == cfg.list_begin {
            bracket += 1;
        } else if c == cfg.list_end {
            bracket -= 1;
        } else if bracket == 0 && c == cfg.delimiter {
            if !current.trim().is_empty() {
                elements.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        elements.push(current.trim().to_string());
    }
    Ok(elements)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int16(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Date(v) => write!(f, "{}", date_time::format_date(*v)),
            Value::Timestamp(v) => write!(f, "{}", date_time::format_timestamp(*v)),
            Value::Interval(v) => {
                write!(f, "{} months {} days {} micros", v.months, v.days, v.micros)
            }
            Value::String(v) => write!(f, "{}", v),
            Value::VarList(vs) | Value::FixedList(vs) => {
                write!(f, "[")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::InternalId(id) => write!(f, "{}:{}", id.table_id, id.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> CopyDescription {
        CopyDescription::for_test()
    }

    #[test]
    fn parse_scalars() {
        let d = desc();
        assert_eq!(
            Value::parse("42", &LogicalType::Int64, &d).unwrap(),
            Value::Int64(42)
        );
        assert_eq!(
            Value::parse("true", &LogicalType::Bool, &d).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(Value::parse("", &LogicalType::Int64, &d).unwrap(), Value::Null);
    }

    #[test]
    fn parse_nested_list() {
        let d = desc();
        let ty = LogicalType::VarList(Box::new(LogicalType::VarList(Box::new(
            LogicalType::Int64,
        ))));
        let v = Value::parse("[[1,2],[3]]", &ty, &d).unwrap();
        assert_eq!(
            v,
            Value::VarList(vec![
                Value::VarList(vec![Value::Int64(1), Value::Int64(2)]),
                Value::VarList(vec![Value::Int64(3)]),
            ])
        );
    }

    #[test]
    fn fixed_list_length_check() {
        let d = desc();
        let ty = LogicalType::FixedList(Box::new(LogicalType::Int64), 3);
        assert!(Value::parse("[1,2]", &ty, &d).is_err());
        assert!(Value::parse("[1,2,3]", &ty, &d).is_ok());
    }

    #[test]
    fn null_sorts_last() {
        assert_eq!(Value::Null.compare(&Value::Int64(1)), Ordering::Greater);
        assert_eq!(Value::Int64(1).compare(&Value::Null), Ordering::Less);
    }
}
