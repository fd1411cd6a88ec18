pub mod exec;
pub mod operators;

use crate::common::value::Value;

/// Result of one executed statement: named columns plus materialized
/// rows. Iteration consumes the rows in order.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub column_names: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_message(message: String) -> Self {
        Self {
            column_names: vec!["result".to_string()],
            rows: vec![vec![Value::String(message)]],
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vec<Value>> {
        self.rows.iter()
    }

    /// First cell of the first row, for single-value queries.
    pub fn single_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.first())
    }
}

impl IntoIterator for QueryResult {
    type Item = Vec<Value>;
    type IntoIter = std::vec::IntoIter<Vec<Value>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}
