//! Per-connection prepared statement cache.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::protocol::FieldDescription;
use super::types::{Oid, Value};

/// Column descriptions shared between a cached statement and its results.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// A statement the server has parsed under a connection-local name.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    /// Server-side name (e.g. "__ps_3")
    pub name: String,
    /// Parameter types as resolved by the server
    pub param_types: Vec<Oid>,
    /// Result columns; empty for statements that return no rows
    pub columns: SharedColumns,
}

/// Cache key: the query text plus the parameter types it was parsed with.
///
/// The same text bound with differently typed values needs its own
/// statement; the server fixes parameter types at Parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementKey {
    query: String,
    param_types: Vec<Oid>,
}

impl StatementKey {
    pub fn new(query: &str, params: &[Value]) -> Self {
        Self {
            query: query.to_owned(),
            param_types: params.iter().map(Value::type_oid).collect(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn param_types(&self) -> &[Oid] {
        &self.param_types
    }
}

/// LRU cache from statement key to prepared statement.
///
/// Names are never reused within a connection, so an evicted statement can
/// linger server-side until the connection closes. Pools recycle
/// connections on idle timeout, which bounds that growth.
pub struct StatementCache {
    cache: LruCache<StatementKey, Arc<PreparedStatement>>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            cache: LruCache::new(capacity),
            next_id: 0,
        }
    }

    /// Look up a statement and mark it recently used.
    pub fn get(&mut self, key: &StatementKey) -> Option<Arc<PreparedStatement>> {
        self.cache.get(key).map(Arc::clone)
    }

    pub fn insert(&mut self, key: StatementKey, stmt: Arc<PreparedStatement>) {
        self.cache.put(key, stmt);
    }

    /// Generate the next unique statement name for this connection.
    pub fn next_statement_name(&mut self) -> String {
        self.next_id += 1;
        format!("__ps_{}", self.next_id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
