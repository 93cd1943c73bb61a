//! Add-Offsets-To-Txn Handler (spec.md §4.5).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::coordinator_cache::CoordinatorCache;
use crate::error::SenderError;
use crate::external::{BrokerClient, TransactionManager};
use crate::handler::{classify_txn_error, HandlerResult, Outcome, TxnClassification};
use crate::identity::CoordinatorRole;

pub async fn run(
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    txn: Arc<dyn TransactionManager>,
    group_id: String,
    default_backoff: Duration,
) -> HandlerResult {
    let transactional_id = txn
        .transactional_id()
        .expect("add-offsets is only dispatched for transactional producers")
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
        .add_offsets_to_txn(node_id, txn.identity(), &transactional_id, &group_id)
        .await;

    let code = match result {
        Ok(code) => code,
        Err(err) => return crate::handler::transport_failure(&err, node_id, default_backoff).await,
    };

    // is_empty_transaction() doesn't gate the fast path here: Add-Offsets can
    // only ever run after at least one partition or a prior group has been
    // enrolled, so the 20ms override (spec.md §4.4) never applies to it.
    match classify_txn_error(code, false) {
        TxnClassification::Success => {
            txn.consumer_group_added(group_id);
            Ok(Outcome::Done)
        }
        TxnClassification::CoordinatorDead => {
            warn!(node_id, "transaction coordinator unavailable during add-offsets");
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
