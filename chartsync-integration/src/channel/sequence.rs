use crate::error::ChannelError;
use std::collections::BTreeMap;
use tracing::debug;

/// Releases sequenced items strictly in order, exactly once.
///
/// Items at or below the delivered watermark are duplicates and are dropped. Items ahead of
/// the next expected sequence number are held until the gap closes. Holding more than
/// `capacity` items fails with [`ChannelError::ReorderOverflow`]: the missing item is never
/// skipped.
#[derive(Debug)]
pub struct SequenceTracker<T> {
    delivered: u64,
    pending: BTreeMap<u64, T>,
    capacity: usize,
    duplicates: u64,
}

impl<T> SequenceTracker<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            delivered: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            duplicates: 0,
        }
    }

    /// Highest sequence number released so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Number of duplicate items dropped so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Number of ahead-of-order items currently held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Accept an item and return every item that is now releasable, in order.
    pub fn accept(&mut self, seq: u64, item: T) -> Result<Vec<T>, ChannelError> {
        if seq <= self.delivered || self.pending.contains_key(&seq) {
            self.duplicates += 1;
            debug!(seq, delivered = self.delivered, "dropping duplicate frame");
            return Ok(vec![]);
        }

        let expected = self.delivered + 1;
        if seq != expected && self.pending.len() >= self.capacity {
            return Err(ChannelError::ReorderOverflow {
                expected,
                held: self.pending.len() + 1,
            });
        }
        self.pending.insert(seq, item);

        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&(self.delivered + 1)) {
            self.delivered += 1;
            released.push(item);
        }
        Ok(released)
    }
}
