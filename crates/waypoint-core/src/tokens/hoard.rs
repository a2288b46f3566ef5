//! Disk tokens set aside by the table cleaner for write-back

use super::pool::{TokenKind, WorkToken};
use parking_lot::Mutex;

/// Disk tokens hoarded by the cleaner and handed to writers on demand.
///
/// Hoarded tokens stay outstanding in their pool until a writer drops them.
#[derive(Debug)]
pub struct DiskHoard {
    tokens: Mutex<Vec<WorkToken>>,
    limit: usize,
}

impl DiskHoard {
    /// Hoard holding at most `limit` tokens
    pub fn new(limit: usize) -> Self {
        Self {
            tokens: Mutex::new(Vec::with_capacity(limit)),
            limit,
        }
    }

    /// Keep a disk token for a later writer. Returns the token when it is
    /// not a disk token or the hoard is full.
    pub fn hoard(&self, token: WorkToken) -> Result<(), WorkToken> {
        if token.kind() != TokenKind::Disk {
            return Err(token);
        }
        let mut tokens = self.tokens.lock();
        if tokens.len() >= self.limit {
            return Err(token);
        }
        tokens.push(token);
        Ok(())
    }

    /// Hand one hoarded token to a writer
    pub fn hand_to_writer(&self) -> Option<WorkToken> {
        self.tokens.lock().pop()
    }

    /// Tokens currently hoarded
    pub fn len(&self) -> usize {
        self.tokens.lock().len()
    }

    /// True when nothing is hoarded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::tokens::TokenPool;

    #[test]
    fn test_hoard_and_hand_out() {
        let pool = TokenPool::new(&TokenConfig {
            cpu_tokens: 1,
            disk_tokens: 1,
            cleaner_cpu_tokens: 0,
            cleaner_disk_tokens: 2,
        })
        .unwrap();
        let hoard = DiskHoard::new(1);

        let cpu = pool.acquire(TokenKind::Cpu, 0).unwrap();
        assert!(hoard.hoard(cpu).is_err());

        hoard.hoard(pool.acquire_cleaner(TokenKind::Disk).unwrap()).unwrap();
        let rejected = hoard.hoard(pool.acquire_cleaner(TokenKind::Disk).unwrap());
        assert!(rejected.is_err());
        drop(rejected);

        // hoarded tokens remain outstanding
        assert_eq!(pool.cleaner_stats(TokenKind::Disk).outstanding, 1);
        let writer = hoard.hand_to_writer().unwrap();
        assert!(hoard.is_empty());
        drop(writer);
        assert_eq!(pool.cleaner_stats(TokenKind::Disk).outstanding, 0);
    }
}
