//! Result rows.

use serde::ser::{Serialize, SerializeMap, Serializer};
use smallvec::SmallVec;

use super::statement::SharedColumns;
use super::types::Value;

/// One result row. Values are stored inline for rows of up to 16 columns.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[Value; 16]>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: SmallVec<[Value; 16]>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value at a column position.
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the first column with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|field| field.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|field| field.name.as_str())
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

/// Rows serialize as `{column: value}` objects.
impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.columns.iter().zip(self.values.iter()) {
            map.serialize_entry(&field.name, value)?;
        }
        map.end()
    }
}
