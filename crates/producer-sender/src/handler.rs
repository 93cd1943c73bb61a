//! The common single-shot broker interaction envelope (spec.md §4.2).
//!
//! Every handler in `handlers/` builds a request from its own inputs, sends
//! it over the designated connection group, and classifies the response
//! into one of three outcomes. Rather than a base class with overrides (the
//! shape the original took, see spec.md §9 "Polymorphism across handler
//! kinds"), this is a single shared classification function plus a tagged
//! `Outcome` every handler returns — a capability set, not an inheritance
//! hierarchy.

use std::time::Duration;

use kafka_protocol::error::ResponseError;
use tracing::warn;

use crate::error::SenderError;

/// What a single handler attempt did. The drive loop re-spawns the handler
/// next iteration on `NotDone`; `Done` and an `Err` both retire the handler
/// for this iteration (an `Err` additionally propagates per spec.md §4.9
/// step 2f/2g, unless the caller chooses to swallow a per-partition error).
#[derive(Debug)]
pub enum Outcome {
    Done,
    NotDone,
}

pub type HandlerResult = Result<Outcome, SenderError>;

/// Sleeps `duration` and returns `NotDone` — the shared tail of every
/// handler's retriable paths (spec.md §4.2 steps 3 and "retriable with
/// backoff B").
pub async fn retry_after(duration: Duration) -> HandlerResult {
    tokio::time::sleep(duration).await;
    Ok(Outcome::NotDone)
}

pub async fn transport_failure(err: &crate::external::TransportError, node_id: i32, backoff: Duration) -> HandlerResult {
    warn!(node_id, error = %err.message, "transport failure dispatching to broker, backing off");
    retry_after(backoff).await
}

/// The classification table shared by Init-PID, Add-Partitions-To-Txn,
/// Add-Offsets-To-Txn, Txn-Offset-Commit and End-Txn (spec.md §4.3-§4.7):
/// they differ only in which coordinator role they evict on
/// coordinator-unavailable and whether `ConcurrentTransactions` gets the
/// fast-path override, both of which the caller applies around this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnClassification {
    Success,
    /// coordinator-not-available, not-coordinator (and, for offset-commit
    /// only, request-timed-out): evict the coordinator cache and retry.
    CoordinatorDead,
    /// coordinator-load-in-progress, concurrent-transactions (when not
    /// eligible for the fast override), unknown-topic-or-partition: retry
    /// after the default backoff.
    Backoff,
    /// concurrent-transactions, and the caller determined this transaction
    /// has no partitions enrolled yet: retry after the 20ms override.
    BackoffFast,
    Fenced,
    FatalTxnState(&'static str),
    FatalOther(ResponseError),
}

/// Combines per-partition classifications from a single response into the
/// one action the handler takes for this attempt: fatal outcomes dominate,
/// and among retriable outcomes the slower/safer one wins so the handler
/// never under-backs-off relative to any partition in the response.
pub fn merge_classifications(
    current: Option<TxnClassification>,
    next: TxnClassification,
) -> TxnClassification {
    match current {
        Some(current) if severity(&current) >= severity(&next) => current,
        _ => next,
    }
}

fn severity(c: &TxnClassification) -> u8 {
    match c {
        TxnClassification::Success => 0,
        TxnClassification::BackoffFast => 1,
        TxnClassification::Backoff => 2,
        TxnClassification::CoordinatorDead => 3,
        TxnClassification::FatalTxnState(_) => 4,
        TxnClassification::FatalOther(_) => 4,
        TxnClassification::Fenced => 5,
    }
}

pub fn classify_txn_error(code: ResponseError, empty_transaction: bool) -> TxnClassification {
    use ResponseError::*;
    match code {
        None => TxnClassification::Success,
        CoordinatorNotAvailable | NotCoordinator => TxnClassification::CoordinatorDead,
        CoordinatorLoadInProgress | UnknownTopicOrPartition => TxnClassification::Backoff,
        ConcurrentTransactions => {
            if empty_transaction {
                TxnClassification::BackoffFast
            } else {
                TxnClassification::Backoff
            }
        }
        InvalidProducerEpoch => TxnClassification::Fenced,
        InvalidProducerIdMapping => TxnClassification::FatalTxnState("invalid producer id mapping"),
        InvalidTxnState => TxnClassification::FatalTxnState("invalid transaction state"),
        other => TxnClassification::FatalOther(other),
    }
}
