//! Identifier generation capability.
//!
//! Sessions, intents, and jobs need ids that stay unique across the whole
//! lifetime of a repository, not just within one session; restarts must not
//! re-mint an id a crashed run already persisted. Production uses random
//! UUIDs, tests use a deterministic counter.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

pub trait IdGen: Send + Sync {
    fn next_id(&self) -> String;
}

/// Random v4 UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGen;

impl IdGen for UuidGen {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Deterministic `<prefix>-1`, `<prefix>-2`, ... sequence for tests.
#[derive(Debug)]
pub struct SeqGen {
    prefix: String,
    counter: AtomicU64,
}

impl SeqGen {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGen for SeqGen {
    fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_gen_unique() {
        let ids = UuidGen;
        assert_ne!(ids.next_id(), ids.next_id());
    }

    #[test]
    fn test_seq_gen_deterministic() {
        let ids = SeqGen::new("job");
        assert_eq!(ids.next_id(), "job-1");
        assert_eq!(ids.next_id(), "job-2");
        assert_eq!(ids.next_id(), "job-3");
    }
}
