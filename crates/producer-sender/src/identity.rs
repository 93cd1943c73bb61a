//! Value types shared across the sender: partition addressing and producer identity.

use std::fmt;

/// A (topic, partition) pair. Hashable and cheap to clone, matching the way
/// the accumulator and broker client address batches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Identifies a broker node. The sender never dials nodes itself; it only
/// ever carries the id the `BrokerClient` handed it back.
pub type NodeId = i32;

/// The broker-issued (producer_id, producer_epoch) pair that keys idempotence
/// and fencing. Created on first successful Init-PID; replaced wholesale on
/// every subsequent successful Init-PID (e.g. after a restart that re-used
/// the same transactional id).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl ProducerIdentity {
    pub const NONE: ProducerIdentity = ProducerIdentity {
        producer_id: -1,
        producer_epoch: -1,
    };

    pub fn is_present(&self) -> bool {
        *self != Self::NONE
    }
}

impl Default for ProducerIdentity {
    fn default() -> Self {
        Self::NONE
    }
}

/// The two coordinator roles the broker cluster exposes. A producer driving a
/// transaction ever needs at most one of each concurrently: the transaction
/// coordinator for its `transactional_id`, and the group coordinator for the
/// consumer group it commits offsets on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorRole {
    Transaction,
    Group,
}

impl fmt::Display for CoordinatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorRole::Transaction => write!(f, "transaction"),
            CoordinatorRole::Group => write!(f, "group"),
        }
    }
}
