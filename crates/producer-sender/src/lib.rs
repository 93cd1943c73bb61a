//! The background delivery and transaction-coordination engine of a Kafka
//! producer client: drains accumulated record batches to their leader nodes
//! and, when the producer is transactional, drives the Init-PID /
//! Add-Partitions / Add-Offsets / Txn-Offset-Commit / End-Txn handshake
//! against the broker's transaction and group coordinators.
//!
//! This crate owns none of the wire codec, connection pooling, record
//! accumulation, or the transaction manager's own state machine — see
//! `external` for the trait surfaces it consumes from its host. What it owns
//! is the single coordinating loop in `sender::Sender` and the handlers it
//! drives.

pub mod backoff;
pub mod config;
pub mod coordinator_cache;
pub mod error;
pub mod external;
pub mod handler;
pub mod handlers;
pub mod identity;
pub mod sender;

pub use config::SenderConfig;
pub use error::{SenderError, SenderResult};
pub use external::{Accumulator, Batch, BrokerClient, TransactionManager};
pub use identity::{CoordinatorRole, NodeId, ProducerIdentity, TopicPartition};
pub use sender::Sender;
