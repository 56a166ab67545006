//! Prepared statements and the per-connection statement cache.
//!
//! A connection tracks two kinds of server-side statements:
//! - named statements created with `prepare`, unique per connection until
//!   deallocated;
//! - implicit statements created by `execute`/`query` with SQL text, kept in
//!   an LRU keyed by that text and the parameter types sent with Parse, so
//!   repeated queries skip Parse and differently typed values get their own
//!   statement.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::protocol::FieldDescription;
use crate::types::Oid;

/// Column descriptions shared between a statement and every result it produces.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Name prefix reserved for implicit statements.
const IMPLICIT_PREFIX: &str = "__pgd_";

// ============================================================================
// Prepared Statement
// ============================================================================

/// A statement parsed by the server.
///
/// Column `format`s are the result formats requested at execution time,
/// chosen from the registry when the statement was described.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub name: String,
    pub query: String,
    /// Parameter types as reported by ParameterDescription.
    pub param_types: Vec<Oid>,
    pub columns: SharedColumns,
}

impl PreparedStatement {
    pub fn new(name: String, query: String) -> Self {
        Self {
            name,
            query,
            param_types: Vec::new(),
            columns: Arc::new(Vec::new()),
        }
    }

    pub fn param_count(&self) -> usize {
        self.param_types.len()
    }

    pub fn returns_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

// ============================================================================
// Statement Cache
// ============================================================================

/// SQL text plus the parameter types declared in Parse.
type ImplicitKey = (String, Vec<Oid>);

pub struct StatementCache {
    named: HashMap<String, Arc<PreparedStatement>>,
    implicit: LruCache<ImplicitKey, Arc<PreparedStatement>>,
    /// Evicted implicit statements still allocated on the server.
    pending_close: Vec<String>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            named: HashMap::new(),
            implicit: LruCache::new(cap),
            pending_close: Vec::new(),
            next_id: 0,
        }
    }

    pub fn named(&self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.named.get(name).map(Arc::clone)
    }

    pub fn insert_named(&mut self, statement: Arc<PreparedStatement>) {
        self.named.insert(statement.name.clone(), statement);
    }

    pub fn remove_named(&mut self, name: &str) -> Option<Arc<PreparedStatement>> {
        self.named.remove(name)
    }

    /// Look up an implicit statement parsed with `declared` parameter types,
    /// marking it recently used.
    pub fn implicit(&mut self, query: &str, declared: &[Oid]) -> Option<Arc<PreparedStatement>> {
        let key = (query.to_string(), declared.to_vec());
        self.implicit.get(&key).map(Arc::clone)
    }

    /// Cache an implicit statement parsed with `declared` parameter types.
    /// The least recently used one is queued for closing when the cache is full.
    pub fn insert_implicit(&mut self, declared: Vec<Oid>, statement: Arc<PreparedStatement>) {
        let name = statement.name.clone();
        let key = (statement.query.clone(), declared);
        // push returns either the evicted entry or the replaced one for the same key
        if let Some((_, displaced)) = self.implicit.push(key, statement) {
            if displaced.name != name {
                self.pending_close.push(displaced.name.clone());
            }
        }
    }

    /// Drop an implicit statement the server no longer knows about.
    pub fn forget(&mut self, name: &str) {
        let key = self
            .implicit
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            self.implicit.pop(&key);
        }
    }

    /// Names of evicted statements to close on the server.
    pub fn take_pending_closes(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending_close)
    }

    pub fn next_statement_name(&mut self) -> String {
        self.next_id = self.next_id.wrapping_add(1);
        format!("{}{}", IMPLICIT_PREFIX, self.next_id)
    }

    pub fn is_reserved_name(name: &str) -> bool {
        name.starts_with(IMPLICIT_PREFIX)
    }

    pub fn named_len(&self) -> usize {
        self.named.len()
    }

    pub fn implicit_len(&self) -> usize {
        self.implicit.len()
    }

    /// Forget everything, e.g. after the session ended.
    pub fn clear(&mut self) {
        self.named.clear();
        self.implicit.clear();
        self.pending_close.clear();
    }
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stmt(name: &str, query: &str) -> Arc<PreparedStatement> {
        Arc::new(PreparedStatement::new(name.to_string(), query.to_string()))
    }

    #[test]
    fn test_prepared_statement_creation() {
        let mut s = PreparedStatement::new("s1".to_string(), "SELECT $1".to_string());
        assert_eq!(s.name, "s1");
        assert!(!s.returns_rows());
        s.param_types = vec![Oid::INT4];
        assert_eq!(s.param_count(), 1);
    }

    #[test]
    fn test_named_statements() {
        let mut cache = StatementCache::new(10);
        cache.insert_named(stmt("by_id", "SELECT 1"));
        assert_eq!(cache.named("by_id").unwrap().query, "SELECT 1");
        assert!(cache.named("other").is_none());

        assert!(cache.remove_named("by_id").is_some());
        assert!(cache.named("by_id").is_none());
        assert!(cache.remove_named("by_id").is_none());
    }

    #[test]
    fn test_implicit_lru_eviction_queues_close() {
        let mut cache = StatementCache::new(2);
        cache.insert_implicit(vec![], stmt("s1", "q1"));
        cache.insert_implicit(vec![], stmt("s2", "q2"));

        // Touch q1 so q2 becomes least recently used
        assert!(cache.implicit("q1", &[]).is_some());
        cache.insert_implicit(vec![], stmt("s3", "q3"));

        assert!(cache.implicit("q2", &[]).is_none());
        assert!(cache.implicit("q1", &[]).is_some());
        assert_eq!(cache.take_pending_closes(), vec!["s2".to_string()]);
        assert!(cache.take_pending_closes().is_empty());
    }

    #[test]
    fn test_replacing_implicit_statement_closes_old_one() {
        let mut cache = StatementCache::new(4);
        cache.insert_implicit(vec![Oid::INT4], stmt("s1", "q1"));
        cache.insert_implicit(vec![Oid::INT4], stmt("s2", "q1"));
        assert_eq!(cache.implicit("q1", &[Oid::INT4]).unwrap().name, "s2");
        assert_eq!(cache.take_pending_closes(), vec!["s1".to_string()]);
    }

    #[test]
    fn test_implicit_statements_keyed_by_declared_types() {
        let mut cache = StatementCache::new(4);
        cache.insert_implicit(vec![Oid::INT2], stmt("s1", "SELECT $1"));
        cache.insert_implicit(vec![Oid::INT4], stmt("s2", "SELECT $1"));

        assert_eq!(cache.implicit("SELECT $1", &[Oid::INT2]).unwrap().name, "s1");
        assert_eq!(cache.implicit("SELECT $1", &[Oid::INT4]).unwrap().name, "s2");
        assert!(cache.implicit("SELECT $1", &[Oid::TEXT]).is_none());
        assert_eq!(cache.implicit_len(), 2);
        assert!(cache.take_pending_closes().is_empty());
    }

    #[test]
    fn test_forget() {
        let mut cache = StatementCache::new(4);
        cache.insert_implicit(vec![], stmt("s1", "q1"));
        cache.forget("s1");
        assert!(cache.implicit("q1", &[]).is_none());
        assert_eq!(cache.implicit_len(), 0);
    }

    #[test]
    fn test_unique_statement_names() {
        let mut cache = StatementCache::new(10);
        let names: std::collections::HashSet<String> = (0..10).map(|_| cache.next_statement_name()).collect();
        assert_eq!(names.len(), 10);
        assert!(names.iter().all(|n| StatementCache::is_reserved_name(n)));
    }
}
