//! Failover across resolved candidates

use std::net::SocketAddr;

use sha2::{Digest, Sha256};

/// Via branch for a retried request, derived from the previous one
pub fn next_branch(previous: &str) -> String {
    format!("z9hG4bK{:x}", Sha256::digest(previous.as_bytes()))
}

/// Walks the candidate list of one transport
#[derive(Debug, Clone)]
pub struct FailoverCursor {
    candidates: Vec<SocketAddr>,
    position: usize,
    limit: usize,
}

impl FailoverCursor {
    /// `max_failover` is the number of retries allowed after the first attempt
    pub fn new(candidates: Vec<SocketAddr>, max_failover: usize) -> Self {
        let limit = candidates.len().min(max_failover.saturating_add(1));
        Self {
            candidates,
            position: 0,
            limit,
        }
    }

    pub fn current(&self) -> Option<SocketAddr> {
        if self.position < self.limit {
            self.candidates.get(self.position).copied()
        } else {
            None
        }
    }

    pub fn has_next(&self) -> bool {
        self.position + 1 < self.limit
    }

    pub fn advance(&mut self) -> Option<SocketAddr> {
        if !self.has_next() {
            return None;
        }
        self.position += 1;
        self.current()
    }

    /// Attempts made so far, counting the current one
    pub fn attempts(&self) -> usize {
        self.position + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addrs(n: u16) -> Vec<SocketAddr> {
        (0..n).map(|i| SocketAddr::from(([192, 0, 2, 1], 5060 + i))).collect()
    }

    #[test]
    fn test_cursor_budget() {
        let mut cursor = FailoverCursor::new(addrs(5), 2);
        assert_eq!(cursor.current().map(|a| a.port()), Some(5060));
        assert_eq!(cursor.advance().map(|a| a.port()), Some(5061));
        assert_eq!(cursor.advance().map(|a| a.port()), Some(5062));
        assert!(!cursor.has_next());
        assert_eq!(cursor.advance(), None);
        assert_eq!(cursor.attempts(), 3);
    }

    #[test]
    fn test_cursor_single_candidate() {
        let mut cursor = FailoverCursor::new(addrs(1), 3);
        assert!(!cursor.has_next());
        assert_eq!(cursor.advance(), None);
        assert!(FailoverCursor::new(Vec::new(), 3).current().is_none());
    }

    #[test]
    fn test_branch_rewrite() {
        let first = next_branch("z9hG4bK776asdhds");
        assert!(first.starts_with("z9hG4bK"));
        assert_eq!(first.len(), 7 + 64);
        assert_eq!(first, next_branch("z9hG4bK776asdhds"));
        assert_ne!(first, next_branch(&first));
    }

    proptest! {
        #[test]
        fn prop_cursor_never_exceeds_budget(count in 0u16..12, max_failover in 0usize..12) {
            let mut cursor = FailoverCursor::new(addrs(count), max_failover);
            let mut seen = usize::from(cursor.current().is_some());
            while cursor.advance().is_some() {
                seen += 1;
            }
            prop_assert_eq!(seen, usize::from(count).min(max_failover + 1));
        }
    }
}
