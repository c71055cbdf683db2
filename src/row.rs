//! Decoded result rows.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::pg::types::Oid;
use crate::value::{FromValue, Value};

/// Result column metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
    oid: Oid,
}

impl Column {
    pub fn new(name: impl Into<String>, oid: Oid) -> Self {
        Self {
            name: name.into(),
            oid,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }
}

/// Column descriptions shared by every row of one result set.
pub type Columns = Arc<Vec<Column>>;

/// Something that selects a column: a position or a name.
pub trait ColumnIndex {
    fn index(&self, columns: &[Column]) -> Result<usize>;
}

impl ColumnIndex for usize {
    fn index(&self, columns: &[Column]) -> Result<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(Error::ColumnNotFound(format!(
                "index {} out of range for {} columns",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for str {
    fn index(&self, columns: &[Column]) -> Result<usize> {
        columns
            .iter()
            .position(|c| c.name == self)
            .ok_or_else(|| Error::ColumnNotFound(self.to_string()))
    }
}

impl ColumnIndex for String {
    fn index(&self, columns: &[Column]) -> Result<usize> {
        self.as_str().index(columns)
    }
}

impl<T: ColumnIndex + ?Sized> ColumnIndex for &T {
    fn index(&self, columns: &[Column]) -> Result<usize> {
        (**self).index(columns)
    }
}

/// One result tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Columns,
    values: Vec<Value>,
}

impl Row {
    pub(crate) fn new(columns: Columns, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// The value of a column. The first column with a matching name wins.
    pub fn value<I: ColumnIndex>(&self, index: I) -> Result<&Value> {
        let idx = index.index(&self.columns)?;
        self.values
            .get(idx)
            .ok_or_else(|| Error::ColumnNotFound(format!("index {} has no value", idx)))
    }

    /// Typed read of a column through the value's accessors.
    ///
    /// ```ignore
    /// let id: i32 = row.get("id")?;
    /// let note: Option<String> = row.get(1)?;
    /// let tags: Vec<Option<String>> = row.get("tags")?;
    /// ```
    pub fn get<T: FromValue, I: ColumnIndex>(&self, index: I) -> Result<T> {
        T::from_value(self.value(index)?)
    }

    pub fn is_null<I: ColumnIndex>(&self, index: I) -> Result<bool> {
        self.value(index).map(Value::is_null)
    }
}
