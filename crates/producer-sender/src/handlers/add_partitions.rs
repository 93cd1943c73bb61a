//! Add-Partitions-To-Txn Handler (spec.md §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backoff::CONCURRENT_TRANSACTIONS_OVERRIDE;
use crate::coordinator_cache::CoordinatorCache;
use crate::error::SenderError;
use crate::external::BrokerClient;
use crate::external::TransactionManager;
use crate::handler::{classify_txn_error, HandlerResult, Outcome, TxnClassification};
use crate::identity::{CoordinatorRole, TopicPartition};

pub async fn run(
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    txn: Arc<dyn TransactionManager>,
    default_backoff: Duration,
) -> HandlerResult {
    // Snapshot the pending-enrolment set at dispatch (spec.md §4.4 "Inputs").
    let pending = txn.pending_partitions();
    if pending.is_empty() {
        return Ok(Outcome::Done);
    }

    let transactional_id = txn
        .transactional_id()
        .expect("add-partitions is only dispatched for transactional producers")
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

    let results = client
        .add_partitions_to_txn(node_id, txn.identity(), &transactional_id, &pending)
        .await;

    let results = match results {
        Ok(results) => results,
        Err(err) => return crate::handler::transport_failure(&err, node_id, default_backoff).await,
    };

    // The fast 20ms override applies only while no partition is yet enrolled
    // in this transaction (spec.md §4.4 "Rationale").
    let empty_transaction = txn.is_empty_transaction();

    let mut worst: Option<TxnClassification> = None;
    for (tp, error) in &results {
        match classify_txn_error(*error, empty_transaction) {
            TxnClassification::Success => {
                txn.partition_added(tp.clone());
            }
            other => worst = Some(merge(worst, other)),
        }
    }

    match worst {
        None => Ok(Outcome::Done),
        Some(TxnClassification::CoordinatorDead) => {
            warn!(node_id, "transaction coordinator unavailable during add-partitions");
            coordinators.lock().await.mark_dead(CoordinatorRole::Transaction);
            crate::handler::retry_after(default_backoff).await
        }
        Some(TxnClassification::Backoff) => crate::handler::retry_after(default_backoff).await,
        Some(TxnClassification::BackoffFast) => {
            debug!("add-partitions hit concurrent-transactions on an empty transaction, using fast override");
            crate::handler::retry_after(CONCURRENT_TRANSACTIONS_OVERRIDE).await
        }
        Some(TxnClassification::Fenced) => Err(SenderError::Fenced),
        Some(TxnClassification::FatalTxnState(msg)) => Err(SenderError::FatalTxnState(msg)),
        Some(TxnClassification::FatalOther(code)) => Err(SenderError::FatalOther(code)),
        Some(TxnClassification::Success) => unreachable!(),
    }
}

use crate::handler::merge_classifications as merge;
