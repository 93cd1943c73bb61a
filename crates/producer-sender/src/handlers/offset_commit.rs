//! Txn-Offset-Commit Handler (spec.md §4.6). Dispatches to the GROUP
//! coordinator, not the transaction coordinator — the one handler in this
//! family that resolves a different coordinator role.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::warn;

use crate::coordinator_cache::CoordinatorCache;
use crate::error::SenderError;
use crate::external::BrokerClient;
use crate::external::TransactionManager;
use crate::handler::merge_classifications as merge;
use crate::handler::{classify_txn_error, HandlerResult, Outcome, TxnClassification};
use crate::identity::{CoordinatorRole, TopicPartition};

pub async fn run(
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    txn: Arc<dyn TransactionManager>,
    offsets: HashMap<TopicPartition, (i64, String)>,
    group_id: String,
    default_backoff: Duration,
) -> HandlerResult {
    let transactional_id = txn
        .transactional_id()
        .expect("offset-commit is only dispatched for transactional producers")
        .to_owned();

    let node_id = coordinators
        .lock()
        .await
        .lookup(CoordinatorRole::Group, &group_id, client.as_ref(), default_backoff)
        .await;

    let results = client
        .txn_offset_commit(node_id, txn.identity(), &transactional_id, &group_id, &offsets)
        .await;

    let results = match results {
        Ok(results) => results,
        Err(err) => return crate::handler::transport_failure(&err, node_id, default_backoff).await,
    };

    let mut worst: Option<TxnClassification> = None;
    for (tp, code) in &results {
        match classify_txn_error(*code, false) {
            TxnClassification::Success => {
                if let Some((offset, _metadata)) = offsets.get(tp) {
                    txn.offset_committed(tp.clone(), *offset, &group_id);
                }
            }
            // request-timed-out is a coordinator-dead signal for the GROUP
            // role specifically (spec.md §4.6 "two additions"). The broker
            // client surfaces it as a `ResponseError` like any other code.
            other => {
                let escalated = if *code == kafka_protocol::error::ResponseError::RequestTimedOut {
                    TxnClassification::CoordinatorDead
                } else {
                    other
                };
                worst = Some(merge(worst, escalated));
            }
        }
    }

    match worst {
        None => Ok(Outcome::Done),
        Some(TxnClassification::CoordinatorDead) => {
            warn!(node_id, %group_id, "group coordinator unavailable during offset commit");
            coordinators.lock().await.mark_dead(CoordinatorRole::Group);
            crate::handler::retry_after(default_backoff).await
        }
        Some(TxnClassification::Backoff | TxnClassification::BackoffFast) => {
            crate::handler::retry_after(default_backoff).await
        }
        Some(TxnClassification::Fenced) => Err(SenderError::Fenced),
        Some(TxnClassification::FatalTxnState(msg)) => Err(SenderError::FatalTxnState(msg)),
        Some(TxnClassification::FatalOther(code)) => Err(SenderError::FatalOther(code)),
        Some(TxnClassification::Success) => unreachable!(),
    }
}
