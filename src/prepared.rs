//! Prepared-statement cache keyed by the md5 of the statement text.
//!
//! The digest doubles as the prepared id handed back to clients, so an
//! `EXECUTE` can be classified without any backend round trip. Entries are
//! never evicted; a colliding insert replaces the earlier entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};

use crate::parse::Statement;

pub const PREPARED_ID_SIZE: usize = 16;

#[derive(Debug)]
pub struct PreparedEntry {
    pub id: [u8; PREPARED_ID_SIZE],
    pub query: String,
    pub stmt: Statement,
}

/// Requests dispatch from multiple tasks, so the map is mutex-wrapped rather
/// than relying on a single-writer thread.
#[derive(Default)]
pub struct PreparedCache {
    entries: Mutex<HashMap<[u8; PREPARED_ID_SIZE], Arc<PreparedEntry>>>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, query: &str, stmt: Statement) -> Arc<PreparedEntry> {
        let id = hash_query(query);
        let entry = Arc::new(PreparedEntry {
            id,
            query: query.to_string(),
            stmt,
        });
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(id, Arc::clone(&entry));
        entry
    }

    /// Exact 16-byte lookup; any other id length always misses.
    pub fn get(&self, id: &[u8]) -> Option<Arc<PreparedEntry>> {
        let key: [u8; PREPARED_ID_SIZE] = id.try_into().ok()?;
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&key).cloned()
    }
}

pub fn hash_query(query: &str) -> [u8; PREPARED_ID_SIZE] {
    let digest = Md5::digest(query.as_bytes());
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{Expr, SystemTable};

    fn select_local() -> Statement {
        Statement::Select {
            table: SystemTable::Local,
            is_table: true,
            exprs: vec![Expr::Star],
        }
    }

    #[test]
    fn insert_then_lookup() {
        let cache = PreparedCache::new();
        let entry = cache.insert("SELECT * FROM system.local", select_local());
        assert_eq!(entry.id.len(), PREPARED_ID_SIZE);

        let found = cache.get(&entry.id).unwrap();
        assert_eq!(found.query, "SELECT * FROM system.local");
        assert_eq!(found.stmt, select_local());
    }

    #[test]
    fn lookup_misses() {
        let cache = PreparedCache::new();
        cache.insert("SELECT * FROM system.local", select_local());

        assert!(cache.get(&[0u8; PREPARED_ID_SIZE]).is_none());
        // Wrong-length ids never match.
        assert!(cache.get(&[0u8; 8]).is_none());
        assert!(cache.get(&[]).is_none());
    }

    #[test]
    fn same_query_replaces_entry() {
        let cache = PreparedCache::new();
        let first = cache.insert("USE myks", Statement::Use { keyspace: "myks".into() });
        let second = cache.insert("USE myks", Statement::Use { keyspace: "myks".into() });
        assert_eq!(first.id, second.id);

        let found = cache.get(&first.id).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[test]
    fn digest_is_stable_md5() {
        // md5("") is the canonical fixture.
        assert_eq!(
            hash_query(""),
            [
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec,
                0xf8, 0x42, 0x7e
            ]
        );
    }
}
