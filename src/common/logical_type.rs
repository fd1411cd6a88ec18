use crate::error::{DbError, DbResult};

/// Logical type of a property. Fixed-width types are stored inline in
/// column/list slots; `String` and `VarList` are stored as 16-byte
/// descriptors pointing into an overflow file.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalType {
    Bool,
    Int16,
    Int32,
    Int64,
    Float,
    Double,
    /// Days since 1970-01-01.
    Date,
    /// Microseconds since 1970-01-01 00:00:00 UTC.
    Timestamp,
    Interval,
    String,
    VarList(Box<LogicalType>),
    FixedList(Box<LogicalType>, u32),
    Struct(Vec<(String, LogicalType)>),
    /// `(table_id, offset)` pair; the table id is implied by the schema,
    /// so the stored element is the 8-byte offset.
    InternalId,
    /// Auto-assigned dense integer key; never read from input files.
    Serial,
}

impl LogicalType {
    /// Number of bytes one element occupies in a column or list slot.
    pub fn element_size(&self) -> usize {
        match self {
            LogicalType::Bool => 1,
            LogicalType::Int16 => 2,
            LogicalType::Int32 => 4,
            LogicalType::Int64 => 8,
            LogicalType::Float => 4,
            LogicalType::Double => 8,
            LogicalType::Date => 4,
            LogicalType::Timestamp => 8,
            LogicalType::Interval => 16,
            LogicalType::String => 16,
            LogicalType::VarList(_) => 16,
            LogicalType::FixedList(child, n) => child.element_size() * (*n as usize),
            // not storable in a fixed-width slot; columns reject it
            LogicalType::Struct(_) => 0,
            LogicalType::InternalId => 8,
            LogicalType::Serial => 8,
        }
    }

    pub fn has_overflow(&self) -> bool {
        matches!(self, LogicalType::String | LogicalType::VarList(_))
    }

    pub fn child_type(&self) -> Option<&LogicalType> {
        match self {
            LogicalType::VarList(child) => Some(child),
            LogicalType::FixedList(child, _) => Some(child),
            _ => None,
        }
    }

    pub fn parse(name: &str) -> DbResult<Self> {
        let upper = name.trim().to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("FIXED_LIST") {
            // FIXED_LIST(INT64, 3)
            let inner = rest
                .trim()
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| DbError::catalog(format!("cannot parse data type: {}", name)))?;
            let (child, len) = inner
                .rsplit_once(',')
                .ok_or_else(|| DbError::catalog(format!("cannot parse data type: {}", name)))?;
            let len: u32 = len
                .trim()
                .parse()
                .map_err(|_| DbError::catalog(format!("bad fixed list length in: {}", name)))?;
            return Ok(LogicalType::FixedList(Box::new(Self::parse(child)?), len));
        }
        if let Some(child) = upper
            .strip_suffix("[]")
            .map(str::to_string)
            .or_else(|| parse_bracketed(&upper, "VAR_LIST"))
            .or_else(|| parse_bracketed(&upper, "LIST"))
        {
            return Ok(LogicalType::VarList(Box::new(Self::parse(&child)?)));
        }
        match upper.as_str() {
            "BOOL" | "BOOLEAN" => Ok(LogicalType::Bool),
            "INT16" => Ok(LogicalType::Int16),
            "INT32" | "INT" => Ok(LogicalType::Int32),
            "INT64" => Ok(LogicalType::Int64),
            "FLOAT" => Ok(LogicalType::Float),
            "DOUBLE" => Ok(LogicalType::Double),
            "DATE" => Ok(LogicalType::Date),
            "TIMESTAMP" => Ok(LogicalType::Timestamp),
            "INTERVAL" => Ok(LogicalType::Interval),
            "STRING" => Ok(LogicalType::String),
            "SERIAL" => Ok(LogicalType::Serial),
            _ => Err(DbError::catalog(format!("unknown data type: {}", name))),
        }
    }
}

fn parse_bracketed(upper: &str, prefix: &str) -> Option<String> {
    upper
        .strip_prefix(prefix)
        .and_then(|rest| rest.trim().strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
        .map(str::to_string)
}

impl std::fmt::Display for LogicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LogicalType::Bool => write!(f, "BOOL"),
            LogicalType::Int16 => write!(f, "INT16"),
            LogicalType::Int32 => write!(f, "INT32"),
            LogicalType::Int64 => write!(f, "INT64"),
            LogicalType::Float => write!(f, "FLOAT"),
            LogicalType::Double => write!(f, "DOUBLE"),
            LogicalType::Date => write!(f, "DATE"),
            LogicalType::Timestamp => write!(f, "TIMESTAMP"),
            LogicalType::Interval => write!(f, "INTERVAL"),
            LogicalType::String => write!(f, "STRING"),
            LogicalType::VarList(child) => write!(f, "{}[]", child),
            LogicalType::FixedList(child, n) => write!(f, "FIXED_LIST({}, {})", child, n),
            LogicalType::Struct(_) => write!(f, "STRUCT"),
            LogicalType::InternalId => write!(f, "INTERNAL_ID"),
            LogicalType::Serial => write!(f, "SERIAL"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_scalar_types() {
        assert_eq!(LogicalType::parse("INT64").unwrap(), LogicalType::Int64);
        assert_eq!(LogicalType::parse("string").unwrap(), LogicalType::String);
        assert_eq!(LogicalType::parse(" Date ").unwrap(), LogicalType::Date);
    }

    #[test]
    fn parse_list_types() {
        assert_eq!(
            LogicalType::parse("INT64[]").unwrap(),
            LogicalType::VarList(Box::new(LogicalType::Int64))
        );
        assert_eq!(
            LogicalType::parse("FIXED_LIST(DOUBLE, 4)").unwrap(),
            LogicalType::FixedList(Box::new(LogicalType::Double), 4)
        );
    }

    #[test]
    fn element_sizes() {
        assert_eq!(LogicalType::Interval.element_size(), 16);
        assert_eq!(LogicalType::String.element_size(), 16);
        assert_eq!(
            LogicalType::FixedList(Box::new(LogicalType::Int32), 3).element_size(),
            12
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(LogicalType::parse("BLOB").is_err());
    }
}
