//! The interfaces the sender consumes from its external collaborators
//! (spec.md §6). None of these are implemented by this crate: the batch
//! accumulator, the wire codec, the connection pool and the transaction
//! manager's own state machine all live elsewhere. The sender only ever
//! sees these trait surfaces.

use std::collections::HashMap;

use kafka_protocol::error::ResponseError;

use crate::identity::{CoordinatorRole, NodeId, ProducerIdentity, TopicPartition};

/// A handle to one accumulator-held batch of records destined for a single
/// partition. Addressable by the `TopicPartition` key under which the
/// accumulator returned it.
#[async_trait::async_trait]
pub trait Batch: Send {
    /// Serialised record data ready to go on the wire.
    fn data_buffer(&self) -> &[u8];

    /// Complete the batch successfully: records were appended starting at
    /// `base_offset`, written at `log_append_time` (-1 if the broker did not
    /// report one, e.g. produce wire version < 2).
    async fn done(self: Box<Self>, base_offset: i64, log_append_time: i64);

    /// Complete the batch successfully with no response expected
    /// (`required_acks == 0`).
    async fn done_noack(self: Box<Self>);

    /// Fail the batch terminally.
    async fn failure(self: Box<Self>, error: crate::error::SenderError);

    /// True once the batch's delivery deadline has elapsed. Only consulted
    /// when idempotence and transactions are both disabled (spec.md
    /// `can_retry`).
    fn expired(&self) -> bool;
}

/// A snapshot of drained batches for one target node, keyed by partition.
pub type NodeBatches = HashMap<TopicPartition, Box<dyn Batch>>;

/// The in-memory accumulator of record batches (spec.md §6, "Accumulator").
#[async_trait::async_trait]
pub trait Accumulator: Send + Sync {
    /// Non-blocking snapshot: drains everything ready to send, excluding
    /// `ignore_nodes` (nodes already hosting an in-flight request from this
    /// sender) and `muted_partitions` (partitions pending enrolment or
    /// already in flight). Returns the per-node batch maps plus whether any
    /// drained partition currently lacks a known leader.
    async fn drain_by_nodes(
        &self,
        ignore_nodes: &[NodeId],
        muted_partitions: &[TopicPartition],
    ) -> (HashMap<NodeId, NodeBatches>, bool);

    /// Resolves when new data arrives for some non-muted partition.
    async fn data_waiter(&self);

    /// Resolves once every batch present at call time has reached a
    /// terminal state (spec.md I3, the End-Txn precondition).
    async fn flush_for_commit(&self);

    /// Force-fails every batch currently pending, used by the drive-loop
    /// completion hook (spec.md §4.9 "Termination contract").
    async fn fail_all(&self, error: &crate::error::SenderError);

    /// Returns a batch to the accumulator's head for its partition,
    /// preserving per-partition order for the next drain.
    async fn reenqueue(&self, tp: TopicPartition, batch: Box<dyn Batch>);
}

/// A broker API version triple, used to pick the produce wire version
/// (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u16,
    pub minor: u16,
}

impl ApiVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

/// A single partition's outcome in a produce response.
#[derive(Debug, Clone)]
pub struct ProducePartitionResult {
    pub partition: i32,
    pub error: ResponseError,
    pub base_offset: i64,
    pub log_append_time: i64,
}

/// A produce response, grouped by topic as the wire format is.
#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub topics: HashMap<String, Vec<ProducePartitionResult>>,
}

/// A transport-level failure from `BrokerClient::send`.
#[derive(Debug, thiserror::Error)]
#[error("broker transport error: {message}")]
pub struct TransportError {
    pub message: String,
    pub invalid_metadata: bool,
}

/// Which connection group a request is sent over (spec.md §4.2): produce
/// traffic uses `Default`, transaction/offset/coordinator traffic uses
/// `Coordination`. Kept distinct because the connection layer rate-limits
/// and pools them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionGroup {
    Default,
    Coordination,
}

/// The broker client (spec.md §6, "Broker client"). Wire encoding, transport,
/// and connection pooling all live behind this trait; this crate never
/// constructs a gRPC/TCP connection itself.
#[async_trait::async_trait]
pub trait BrokerClient: Send + Sync {
    async fn init_producer_id(
        &self,
        node_id: NodeId,
        transactional_id: Option<&str>,
        transaction_timeout_ms: i32,
    ) -> Result<InitProducerIdOutcome, TransportError>;

    async fn add_partitions_to_txn(
        &self,
        node_id: NodeId,
        identity: ProducerIdentity,
        transactional_id: &str,
        partitions: &[TopicPartition],
    ) -> Result<Vec<(TopicPartition, ResponseError)>, TransportError>;

    async fn add_offsets_to_txn(
        &self,
        node_id: NodeId,
        identity: ProducerIdentity,
        transactional_id: &str,
        group_id: &str,
    ) -> Result<ResponseError, TransportError>;

    async fn txn_offset_commit(
        &self,
        node_id: NodeId,
        identity: ProducerIdentity,
        transactional_id: &str,
        group_id: &str,
        offsets: &HashMap<TopicPartition, (i64, String)>,
    ) -> Result<Vec<(TopicPartition, ResponseError)>, TransportError>;

    async fn end_txn(
        &self,
        node_id: NodeId,
        identity: ProducerIdentity,
        transactional_id: &str,
        committed: bool,
    ) -> Result<ResponseError, TransportError>;

    async fn produce(
        &self,
        node_id: NodeId,
        request: ProduceRequestArgs<'_>,
    ) -> Result<ProduceResponse, TransportError>;

    /// Probes connectivity within a named connection group.
    async fn ready(&self, node_id: NodeId, group: ConnectionGroup) -> bool;

    /// Finds the coordinator broker for a role/key pair.
    async fn coordinator_lookup(
        &self,
        role: CoordinatorRole,
        key: &str,
    ) -> Result<NodeId, TransportError>;

    fn force_metadata_update(&self);

    async fn wait_metadata(&self);

    async fn get_random_node(&self) -> Option<NodeId>;

    fn api_version(&self) -> ApiVersion;
}

#[derive(Debug, Clone, Copy)]
pub struct InitProducerIdOutcome {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub error: ResponseError,
}

/// Arguments for a produce dispatch: one request per node, grouped by topic
/// then partition (spec.md §4.8 "Request composition").
pub struct ProduceRequestArgs<'a> {
    pub acks: i16,
    pub timeout_ms: i32,
    pub transactional_id: Option<&'a str>,
    pub identity: ProducerIdentity,
    pub topics: &'a HashMap<String, Vec<(i32, &'a [u8])>>,
}

/// The query/signal surface the transaction manager exposes (spec.md §3, §6).
/// Its own state machine (pending/enrolled sets, pending offsets, pending
/// finalisation) is opaque to the sender; the sender only ever asks it
/// questions and reports outcomes back.
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    fn transactional_id(&self) -> Option<&str>;
    fn transaction_timeout_ms(&self) -> i32;

    fn has_pid(&self) -> bool;
    fn identity(&self) -> ProducerIdentity;
    fn set_pid_and_epoch(&self, pid: i64, epoch: i16);

    /// Topic-partitions produced to in the current transaction but not yet
    /// confirmed enrolled.
    fn pending_partitions(&self) -> Vec<TopicPartition>;
    fn partition_added(&self, tp: TopicPartition);

    /// A pending consumer-group enrolment, if the transaction manager has one
    /// queued (`add_offsets_to_txn` not yet sent for this group).
    fn pending_group(&self) -> Option<String>;
    fn consumer_group_added(&self, group_id: String);

    /// A pending offset commit batch, if queued.
    fn pending_offsets(&self) -> Option<(HashMap<TopicPartition, (i64, String)>, String)>;
    fn offset_committed(&self, tp: TopicPartition, offset: i64, group_id: &str);

    /// Absent, or a requested COMMIT/ABORT.
    fn pending_finalisation(&self) -> Option<bool>;
    fn complete_transaction(&self);

    fn is_empty_transaction(&self) -> bool;

    /// Resolves when any of the above queries would return a different
    /// answer than it does right now.
    async fn task_waiter(&self);
}
