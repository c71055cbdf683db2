//! Statements accepted by `query` and `execute`.

use crate::error::{Error, Result};
use crate::value::Value;

/// Statement text with positional parameters (`$1`, `$2`, ...).
///
/// Bindings are addressed by 0-based ordinal and may be set in any order;
/// gaps are only reported when the statement is executed.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedStatement {
    query: String,
    bindings: Vec<Option<Value>>,
}

impl PreparedStatement {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            bindings: Vec::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Bind `value` at `index`, replacing any earlier binding.
    pub fn set(&mut self, index: usize, value: impl Into<Value>) -> &mut Self {
        if index >= self.bindings.len() {
            self.bindings.resize(index + 1, None);
        }
        self.bindings[index] = Some(value.into());
        self
    }

    pub fn set_null(&mut self, index: usize) -> &mut Self {
        self.set(index, Value::Null)
    }

    /// Bind the next ordinal.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.bindings.push(Some(value.into()));
        self
    }

    pub fn bindings(&self) -> &[Option<Value>] {
        &self.bindings
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// The bound values in order, failing at the first gap.
    pub fn params(&self) -> Result<Vec<&Value>> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(index, binding)| binding.as_ref().ok_or(Error::UnboundParameter(index)))
            .collect()
    }
}

/// Input of `query`/`execute`: plain text or a statement with bindings.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Text(String),
    Prepared(PreparedStatement),
}

impl Statement {
    pub fn sql(&self) -> &str {
        match self {
            Statement::Text(sql) => sql,
            Statement::Prepared(stmt) => stmt.query(),
        }
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::Text(sql.to_string())
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::Text(sql)
    }
}

impl From<PreparedStatement> for Statement {
    fn from(stmt: PreparedStatement) -> Self {
        Statement::Prepared(stmt)
    }
}

impl From<&PreparedStatement> for Statement {
    fn from(stmt: &PreparedStatement) -> Self {
        Statement::Prepared(stmt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overwrites_and_grows() {
        let mut stmt = PreparedStatement::new("SELECT $1, $2");
        stmt.set(1, "b").set(0, 1i32).set(0, 2i32);
        assert_eq!(
            stmt.bindings(),
            &[Some(Value::from(2i32)), Some(Value::from("b"))]
        );
    }

    #[test]
    fn test_gap_reported_at_params() {
        let mut stmt = PreparedStatement::new("SELECT $1, $2, $3");
        stmt.set(0, 1i32).set(2, 3i32);
        assert!(matches!(stmt.params(), Err(Error::UnboundParameter(1))));

        stmt.set_null(1);
        assert_eq!(stmt.params().unwrap().len(), 3);
    }

    #[test]
    fn test_bind_appends() {
        let stmt = PreparedStatement::new("SELECT $1, $2").bind(1i64).bind(None::<String>);
        let params = stmt.params().unwrap();
        assert_eq!(params[0], &Value::from(1i64));
        assert!(params[1].is_null());
    }
}
