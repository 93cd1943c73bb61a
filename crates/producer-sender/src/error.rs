//! The sender's single error type, and the design-level classification
//! handlers and the drive loop dispatch on.

use kafka_protocol::error::ResponseError;

use crate::identity::TopicPartition;

#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// Connection or I/O failure reported by the broker client. Always
    /// retriable at the handler level; carries whether the transport layer
    /// flagged its cached metadata as stale.
    #[error("transport error talking to node {node_id}: {source}")]
    Transport {
        node_id: crate::identity::NodeId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
        invalid_metadata: bool,
    },

    /// A single broker error code surfaced by a response, not yet classified
    /// into an action. Handlers turn this into a `Retriable`, a fatal
    /// variant below, or a local success effect.
    #[error("broker returned {code:?} for {tp:?}")]
    Broker {
        code: ResponseError,
        tp: Option<TopicPartition>,
    },

    /// The producer's epoch has been superseded by a later Init-PID holding
    /// the same transactional id (spec.md I5). Terminal: the drive loop must
    /// stop making requests once this is observed.
    #[error("producer fenced: a newer producer instance holds this transactional id")]
    Fenced,

    /// invalid-producer-id-mapping, invalid-txn-state,
    /// out-of-order-sequence-number: unrecoverable protocol states that are
    /// not fencing but are not retriable either.
    #[error("fatal transaction state error: {0}")]
    FatalTxnState(&'static str),

    /// Any other broker error the handler protocol does not special-case.
    #[error("fatal broker error: {0:?}")]
    FatalOther(ResponseError),

    /// A spawned handler task panicked or was joined with an unexpected
    /// error. Per spec.md §4.9 step 2f this is a bug, not a retriable
    /// condition.
    #[error("sender task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The drive loop was asked to stop while requests were outstanding; the
    /// accumulator is about to be drained by the completion hook with this
    /// error.
    #[error("sender is shutting down")]
    Closed,
}

impl SenderError {
    /// True if this error is, or wraps, a producer fencing signal. Per
    /// spec.md I5, once true no further requests may be dispatched and the
    /// drive loop must terminate.
    pub fn is_fenced(&self) -> bool {
        matches!(self, SenderError::Fenced)
    }

    /// True for the "fatal" classes of spec.md §7 that escape a handler and
    /// the drive loop unchanged, as opposed to per-batch failures that a
    /// handler resolves without tearing down the sender.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SenderError::Fenced
                | SenderError::FatalTxnState(_)
                | SenderError::FatalOther(_)
                | SenderError::Join(_)
                | SenderError::Closed
        )
    }
}

pub type SenderResult<T> = Result<T, SenderError>;
