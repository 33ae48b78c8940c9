use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::ObjectId;

/// Identifier of a query registered with the in-memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryId {
    id: i64,
}

impl QueryId {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self { id }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.id)
    }
}

/// Thread-safe ID generator
#[derive(Debug)]
pub struct IdGen {
    next_id: AtomicI64,
}

impl IdGen {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
        }
    }

    /// Get the next unique ID
    pub fn get_next(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_query(&self) -> QueryId {
        QueryId::new(self.get_next())
    }

    pub fn next_object(&self) -> ObjectId {
        ObjectId(self.get_next())
    }
}

impl Default for IdGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_ids_are_unique_across_threads() {
        let ids = Arc::new(IdGen::new());
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                std::thread::spawn(move || (0..100).map(|_| ids.get_next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn test_query_ids_order_by_issue_and_display() {
        let ids = IdGen::new();
        let first = ids.next_query();
        let object = ids.next_object();
        let second = ids.next_query();
        assert!(first < second);
        assert_eq!(first.to_string(), "q1");
        assert_eq!(object, ObjectId(2));
        assert_eq!(second.to_string(), "q3");
    }
}
