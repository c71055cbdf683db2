//! Server-side prepared statement cache.
//!
//! This module provides:
//! - `CachedStatement`: a statement parsed by the server under a name
//! - `StatementCache`: O(1) LRU cache of those statements per connection

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::types::Oid;
use crate::row::Columns;

/// Cache key: statement text plus the parameter OIDs it was parsed with.
///
/// The same text bound with different kinds is parsed separately, since the
/// server fixes parameter types at Parse time.
pub type StatementKey = (String, Vec<Oid>);

// ============================================================================
// Cached Statement
// ============================================================================

/// A statement that has been parsed by PostgreSQL.
///
/// Created via Parse + Describe and executed any number of times via
/// Bind + Execute.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    /// Server-side name for this statement (e.g., "__pga_1")
    pub name: String,
    /// The SQL query text
    pub query: String,
    /// Parameter type OIDs (from ParameterDescription)
    pub param_types: Vec<Oid>,
    /// Result column descriptions (from RowDescription), shared with every
    /// row the statement produces.
    pub columns: Columns,
}

impl CachedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    /// Check if this statement returns rows.
    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }
}

// ============================================================================
// Statement Cache (O(1) LRU)
// ============================================================================

/// O(1) LRU cache for prepared statements.
///
/// Each connection maintains its own cache; server-side statements are
/// per-session. Entries are `Arc`-wrapped so a hit costs a refcount bump.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<CachedStatement>>,
    /// Counter for generating unique statement names
    next_id: u32,
}

impl StatementCache {
    /// Create a new statement cache with the given capacity (at least 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, query: &str, param_types: &[Oid]) -> Option<Arc<CachedStatement>> {
        let key = (query.to_string(), param_types.to_vec());
        self.cache.get(&key).map(Arc::clone)
    }

    /// Check whether a statement is cached without touching LRU order.
    pub fn contains(&self, query: &str, param_types: &[Oid]) -> bool {
        self.cache.contains(&(query.to_string(), param_types.to_vec()))
    }

    /// Insert a statement under the key it was parsed with.
    ///
    /// If the cache is at capacity the least recently used statement is
    /// evicted and its server-side name returned, so the caller can Close it.
    pub fn insert(
        &mut self,
        param_types: Vec<Oid>,
        statement: Arc<CachedStatement>,
    ) -> Option<String> {
        let key = (statement.query.clone(), param_types);
        match self.cache.push(key, statement) {
            // push returns the old value on key replacement as well
            Some((_, old)) => Some(old.name.clone()),
            None => None,
        }
    }

    /// Generate a unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        format!("__pga_{}", id)
    }

    /// Get the number of cached statements.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    /// Get all statement names, most recently used first.
    pub fn statement_names(&self) -> Vec<String> {
        self.cache.iter().map(|(_, stmt)| stmt.name.clone()).collect()
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        // Default capacity of 100 statements per connection
        Self::new(100)
    }
}
