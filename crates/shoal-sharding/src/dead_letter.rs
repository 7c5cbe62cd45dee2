//! Dead Letter Sink
//!
//! Terminal destination for messages the router cannot or will not
//! deliver: unroutable payloads, empty ids, and buffer overflow drops.
//! The default sink logs a warning and counts; tests read the counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The extractor did not recognize the message.
    Unroutable,
    /// The extractor produced an empty entry id.
    EmptyEntryId,
    /// The resolver produced an empty shard id.
    EmptyShardId,
    /// The region or shard buffer was at capacity.
    BufferFull,
    /// The shard was mid-handoff; ownership is already gone.
    HandingOff,
}

impl DropReason {
    fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unroutable => "unroutable",
            DropReason::EmptyEntryId => "empty_entry_id",
            DropReason::EmptyShardId => "empty_shard_id",
            DropReason::BufferFull => "buffer_full",
            DropReason::HandingOff => "handing_off",
        }
    }
}

/// Sink for undeliverable messages.
pub trait DeadLetterSink<M>: Send + Sync + 'static {
    fn publish(&self, msg: M, reason: DropReason);
}

/// Default sink: log and count.
#[derive(Clone, Default)]
pub struct LogDeadLetters {
    dropped: Arc<AtomicU64>,
}

impl LogDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total messages dropped through this sink.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<M: Send + Sync + 'static> DeadLetterSink<M> for LogDeadLetters {
    fn publish(&self, _msg: M, reason: DropReason) {
        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            reason = reason.as_str(),
            total_dropped = total,
            "Message dropped to dead letters"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments() {
        let sink = LogDeadLetters::new();
        DeadLetterSink::<u32>::publish(&sink, 1, DropReason::Unroutable);
        DeadLetterSink::<u32>::publish(&sink, 2, DropReason::BufferFull);
        assert_eq!(sink.dropped(), 2);
    }
}
