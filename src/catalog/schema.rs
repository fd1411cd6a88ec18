use std::fmt;

use crate::common::logical_type::LogicalType;
use crate::error::{DbError, DbResult};
use crate::storage::file_utils::{BinReader, Decodeable, Encodeable};
use crate::types::{PropertyId, TableId};

pub const INTERNAL_REL_ID_PROPERTY_NAME: &str = "_id";
pub const REL_FROM_PROPERTY_NAME: &str = "_FROM_";
pub const REL_TO_PROPERTY_NAME: &str = "_TO_";

pub fn is_reserved_property_name(name: &str) -> bool {
    name == INTERNAL_REL_ID_PROPERTY_NAME
        || name == REL_FROM_PROPERTY_NAME
        || name == REL_TO_PROPERTY_NAME
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelDirection {
    Fwd,
    Bwd,
}

pub const REL_DIRECTIONS: [RelDirection; 2] = [RelDirection::Fwd, RelDirection::Bwd];

impl RelDirection {
    pub fn reverse(&self) -> RelDirection {
        match self {
            RelDirection::Fwd => RelDirection::Bwd,
            RelDirection::Bwd => RelDirection::Fwd,
        }
    }
}

impl fmt::Display for RelDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RelDirection::Fwd => write!(f, "FWD"),
            RelDirection::Bwd => write!(f, "BWD"),
        }
    }
}

/// Multiplicity of a rel table, read as `src TO dst`. `ManyOne` means
/// many sources share one destination, i.e. each source has at most
/// one neighbour in the forward direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelMultiplicity {
    OneOne,
    OneMany,
    ManyOne,
    ManyMany,
}

impl RelMultiplicity {
    pub fn parse(s: &str) -> DbResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ONE_ONE" => Ok(RelMultiplicity::OneOne),
            "ONE_MANY" => Ok(RelMultiplicity::OneMany),
            "MANY_ONE" => Ok(RelMultiplicity::ManyOne),
            "MANY_MANY" => Ok(RelMultiplicity::ManyMany),
            other => Err(DbError::catalog(format!(
                "cannot bind {} as relationship multiplicity",
                other
            ))),
        }
    }

    pub fn is_single_in_direction(&self, dir: RelDirection) -> bool {
        match self {
            RelMultiplicity::OneOne => true,
            RelMultiplicity::ManyOne => dir == RelDirection::Fwd,
            RelMultiplicity::OneMany => dir == RelDirection::Bwd,
            RelMultiplicity::ManyMany => false,
        }
    }
}

impl fmt::Display for RelMultiplicity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            RelMultiplicity::OneOne => "ONE_ONE",
            RelMultiplicity::OneMany => "ONE_MANY",
            RelMultiplicity::ManyOne => "MANY_ONE",
            RelMultiplicity::ManyMany => "MANY_MANY",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    pub logical_type: LogicalType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTableSchema {
    pub table_id: TableId,
    pub name: String,
    pub comment: String,
    pub properties: Vec<Property>,
    pub primary_key_idx: usize,
}

impl NodeTableSchema {
    pub fn primary_key(&self) -> &Property {
        &self.properties[self.primary_key_idx]
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelTableSchema {
    pub table_id: TableId,
    pub name: String,
    pub comment: String,
    /// `properties[0]` is the internal rel-id property.
    pub properties: Vec<Property>,
    pub src_table_id: TableId,
    pub dst_table_id: TableId,
    pub multiplicity: RelMultiplicity,
}

impl RelTableSchema {
    pub const INTERNAL_REL_ID_PROPERTY_ID: PropertyId = 0;

    pub fn bound_table_id(&self, dir: RelDirection) -> TableId {
        match dir {
            RelDirection::Fwd => self.src_table_id,
            RelDirection::Bwd => self.dst_table_id,
        }
    }

    pub fn is_single_in_direction(&self, dir: RelDirection) -> bool {
        self.multiplicity.is_single_in_direction(dir)
    }

    pub fn user_properties(&self) -> &[Property] {
        &self.properties[1..]
    }

    pub fn property_by_name(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSchema {
    Node(NodeTableSchema),
    Rel(RelTableSchema),
}

impl TableSchema {
    pub fn table_id(&self) -> TableId {
        match self {
            TableSchema::Node(s) => s.table_id,
            TableSchema::Rel(s) => s.table_id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TableSchema::Node(s) => &s.name,
            TableSchema::Rel(s) => &s.name,
        }
    }

    pub fn is_node_table(&self) -> bool {
        matches!(self, TableSchema::Node(_))
    }

    pub fn properties(&self) -> &[Property] {
        match self {
            TableSchema::Node(s) => &s.properties,
            TableSchema::Rel(s) => &s.properties,
        }
    }

    pub fn properties_mut(&mut self) -> &mut Vec<Property> {
        match self {
            TableSchema::Node(s) => &mut s.properties,
            TableSchema::Rel(s) => &mut s.properties,
        }
    }

    pub fn set_comment(&mut self, comment: String) {
        match self {
            TableSchema::Node(s) => s.comment = comment,
            TableSchema::Rel(s) => s.comment = comment,
        }
    }
}

// catalog file serialization

impl Encodeable for LogicalType {
    fn encode(&self, buf: &mut Vec<u8>) {
        format!("{}", self).encode(buf);
    }
}

impl Decodeable for LogicalType {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        let name: String = reader.read()?;
        LogicalType::parse(&name).map_err(|e| DbError::corruption(e.to_string()))
    }
}

impl Encodeable for Property {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.id.encode(buf);
        self.name.encode(buf);
        self.logical_type.encode(buf);
    }
}

impl Decodeable for Property {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        Ok(Property {
            id: reader.read()?,
            name: reader.read()?,
            logical_type: reader.read()?,
        })
    }
}

impl Encodeable for TableSchema {
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            TableSchema::Node(s) => {
                buf.push(0);
                s.table_id.encode(buf);
                s.name.encode(buf);
                s.comment.encode(buf);
                s.properties.encode(buf);
                (s.primary_key_idx as u32).encode(buf);
            }
            TableSchema::Rel(s) => {
                buf.push(1);
                s.table_id.encode(buf);
                s.name.encode(buf);
                s.comment.encode(buf);
                s.properties.encode(buf);
                s.src_table_id.encode(buf);
                s.dst_table_id.encode(buf);
                format!("{}", s.multiplicity).encode(buf);
            }
        }
    }
}

impl Decodeable for TableSchema {
    fn decode(reader: &mut BinReader) -> DbResult<Self> {
        let tag: u8 = reader.read()?;
        match tag {
            0 => Ok(TableSchema::Node(NodeTableSchema {
                table_id: reader.read()?,
                name: reader.read()?,
                comment: reader.read()?,
                properties: reader.read()?,
                primary_key_idx: reader.read::<u32>()? as usize,
            })),
            1 => Ok(TableSchema::Rel(RelTableSchema {
                table_id: reader.read()?,
                name: reader.read()?,
                comment: reader.read()?,
                properties: reader.read()?,
                src_table_id: reader.read()?,
                dst_table_id: reader.read()?,
                multiplicity: {
                    let s: String = reader.read()?;
                    RelMultiplicity::parse(&s)
                        .map_err(|e| DbError::corruption(e.to_string()))?
                },
            })),
            other => Err(DbError::corruption(format!(
                "invalid table schema tag: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file_utils::BinWriter;

    #[test]
    fn multiplicity_directions() {
        assert!(RelMultiplicity::ManyOne.is_single_in_direction(RelDirection::Fwd));
        assert!(!RelMultiplicity::ManyOne.is_single_in_direction(RelDirection::Bwd));
        assert!(RelMultiplicity::OneMany.is_single_in_direction(RelDirection::Bwd));
        assert!(!RelMultiplicity::ManyMany.is_single_in_direction(RelDirection::Fwd));
        assert!(RelMultiplicity::OneOne.is_single_in_direction(RelDirection::Bwd));
    }

    #[test]
    fn schema_round_trip() {
        let schema = TableSchema::Rel(RelTableSchema {
            table_id: 3,
            name: "Knows".to_string(),
            comment: String::new(),
            properties: vec![
                Property {
                    id: 0,
                    name: INTERNAL_REL_ID_PROPERTY_NAME.to_string(),
                    logical_type: LogicalType::Serial,
                },
                Property {
                    id: 1,
                    name: "since".to_string(),
                    logical_type: LogicalType::Int64,
                },
            ],
            src_table_id: 0,
            dst_table_id: 1,
            multiplicity: RelMultiplicity::ManyMany,
        });
        let mut w = BinWriter::new();
        w.write(&schema);
        let bytes = w.into_bytes();
        let mut r = BinReader::new(&bytes);
        let back: TableSchema = r.read().unwrap();
        assert_eq!(back, schema);
    }
}
