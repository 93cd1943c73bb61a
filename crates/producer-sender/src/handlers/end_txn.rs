//! End-Txn Handler (spec.md §4.7).
//!
//! The precondition — the accumulator has flushed everything batched at the
//! moment commit/abort was decided (spec.md I3) — is enforced by the drive
//! loop before this handler is ever spawned, not by the handler itself: see
//! `sender::Sender::spawn_transactional_task`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::coordinator_cache::CoordinatorCache;
use crate::error::SenderError;
use crate::external::{BrokerClient, TransactionManager};
use crate::handler::{classify_txn_error, HandlerResult, Outcome, TxnClassification};
use crate::identity::CoordinatorRole;

pub async fn run(
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    txn: Arc<dyn TransactionManager>,
    committed: bool,
    default_backoff: Duration,
) -> HandlerResult {
    // An empty transaction never reaches the broker (spec.md §4.7
    // "Precondition"); the transaction manager marks itself complete and the
    // drive loop never dispatches this handler for it. Guard here too, since
    // the caller is expected to have already checked this.
    if txn.is_empty_transaction() {
        debug!("transaction is empty, completing locally without dispatching EndTxn");
        txn.complete_transaction();
        return Ok(Outcome::Done);
    }

    let transactional_id = txn
        .transactional_id()
        .expect("end-txn is only dispatched for transactional producers")
        .to_owned();

    let node_id = coordinators
        .lock()
        .await
        .lookup(
            CoordinatorRole::Transaction,
            &transactional_id,
            client.as_ref(),
            default_backoff,
        )
        .await;

    let result = client
        .end_txn(node_id, txn.identity(), &transactional_id, committed)
        .await;

    let code = match result {
        Ok(code) => code,
        Err(err) => return crate::handler::transport_failure(&err, node_id, default_backoff).await,
    };

    match classify_txn_error(code, false) {
        TxnClassification::Success => {
            txn.complete_transaction();
            Ok(Outcome::Done)
        }
        TxnClassification::CoordinatorDead => {
            warn!(node_id, "transaction coordinator unavailable during end-txn");
            coordinators.lock().await.mark_dead(CoordinatorRole::Transaction);
            crate::handler::retry_after(default_backoff).await
        }
        TxnClassification::Backoff | TxnClassification::BackoffFast => {
            crate::handler::retry_after(default_backoff).await
        }
        TxnClassification::Fenced => Err(SenderError::Fenced),
        TxnClassification::FatalTxnState(msg) => Err(SenderError::FatalTxnState(msg)),
        TxnClassification::FatalOther(other) => Err(SenderError::FatalOther(other)),
    }
}
