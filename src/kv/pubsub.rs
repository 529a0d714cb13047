use std::sync::RwLock;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender, TrySendError};
use log::debug;

use crate::{kv::glob::glob_match, utils::Latched};

/// What subscribers hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvEvent {
    Set { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    Expire { key: Bytes },
}

impl KvEvent {
    pub fn key(&self) -> &Bytes {
        match self {
            KvEvent::Set { key, .. } => key,
            KvEvent::Delete { key } => key,
            KvEvent::Expire { key } => key,
        }
    }
}

struct Subscription {
    pattern: Vec<u8>,
    sender: Sender<KvEvent>,
}

/// Subscription fan-out. Publishing never blocks the write path: channels
/// are unbounded and dead receivers are pruned on the next publish.
pub struct Publisher {
    subscriptions: RwLock<Vec<Subscription>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    /// Subscribe to events whose key matches the glob `pattern`.
    pub fn subscribe(&self, pattern: &[u8]) -> Receiver<KvEvent> {
        let (sender, receiver) = unbounded();
        self.subscriptions.latch_write().push(Subscription {
            pattern: pattern.to_vec(),
            sender,
        });
        debug!("new subscription for {:?}", String::from_utf8_lossy(pattern));
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.latch_read().len()
    }

    /// Fan the event out to matching subscribers, dropping any whose
    /// receiver has gone away.
    pub fn publish(&self, event: &KvEvent) {
        let mut subs = self.subscriptions.latch_write();
        subs.retain(|sub| {
            if !glob_match(&sub.pattern, event.key()) {
                return true;
            }
            match sub.sender.try_send(event.clone()) {
                Err(TrySendError::Disconnected(_)) => false,
                _ => true,
            }
        });
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_fan_out() {
        let publisher = Publisher::new();
        let user_rx = publisher.subscribe(b"user:*");
        let all_rx = publisher.subscribe(b"*");

        publisher.publish(&KvEvent::Set {
            key: Bytes::from_static(b"user:1"),
            value: Bytes::from_static(b"v"),
        });
        publisher.publish(&KvEvent::Delete {
            key: Bytes::from_static(b"other"),
        });

        assert_eq!(user_rx.len(), 1);
        assert_eq!(all_rx.len(), 2);
    }
}
