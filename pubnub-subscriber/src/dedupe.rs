//! Bounded FIFO of recently announced message identifiers.

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

/// Identifier of a delivered event: channel, publish timetoken, publisher
/// and a digest of the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct DedupeKey {
    channel: String,
    timetoken: u64,
    publisher: Option<String>,
    digest: [u8; 32],
}

impl DedupeKey {
    pub(crate) fn new(
        channel: &str,
        timetoken: u64,
        publisher: Option<&str>,
        payload: &serde_json::Value,
    ) -> Self {
        let digest: [u8; 32] = Sha256::digest(payload.to_string().as_bytes()).into();
        Self {
            channel: channel.to_string(),
            timetoken,
            publisher: publisher.map(str::to_string),
            digest,
        }
    }
}

#[derive(Debug)]
pub(crate) struct DedupeCache {
    enabled: bool,
    capacity: usize,
    seen: HashSet<DedupeKey>,
    order: VecDeque<DedupeKey>,
}

impl DedupeCache {
    pub(crate) fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity,
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` when the event should be announced, recording it.
    pub(crate) fn should_announce(&mut self, key: DedupeKey) -> bool {
        if !self.enabled || self.capacity == 0 {
            return true;
        }
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}
