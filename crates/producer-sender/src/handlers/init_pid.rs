//! Init-PID Handler (spec.md §4.3): acquires or renews a producer
//! identifier/epoch.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::coordinator_cache::CoordinatorCache;
use crate::error::SenderError;
use crate::external::{BrokerClient, TransactionManager};
use crate::handler::{HandlerResult, Outcome};
use crate::identity::CoordinatorRole;

/// Resolves the node to dispatch Init-PID to: the transaction coordinator if
/// `transactional_id` is set, otherwise any node the broker client currently
/// considers ready (spec.md §4.3 "Node selection", recovered from
/// `sender.py`'s bootstrap-node retry in SPEC_FULL.md §B).
async fn select_node(
    transactional_id: Option<&str>,
    coordinators: &Mutex<CoordinatorCache>,
    client: &dyn BrokerClient,
    backoff: Duration,
) -> i32 {
    if let Some(txn_id) = transactional_id {
        let mut cache = coordinators.lock().await;
        return cache
            .lookup(CoordinatorRole::Transaction, txn_id, client, backoff)
            .await;
    }

    loop {
        if let Some(node_id) = client.get_random_node().await {
            if client
                .ready(node_id, crate::external::ConnectionGroup::Coordination)
                .await
            {
                return node_id;
            }
        }
        tokio::time::sleep(backoff).await;
    }
}

pub async fn run(
    client: Arc<dyn BrokerClient>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    txn: Arc<dyn TransactionManager>,
    backoff: Duration,
) -> HandlerResult {
    let transactional_id = txn.transactional_id().map(str::to_owned);
    let node_id = select_node(
        transactional_id.as_deref(),
        &coordinators,
        client.as_ref(),
        backoff,
    )
    .await;

    let outcome = client
        .init_producer_id(
            node_id,
            transactional_id.as_deref(),
            txn.transaction_timeout_ms(),
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => return crate::handler::transport_failure(&err, node_id, backoff).await,
    };

    use kafka_protocol::error::ResponseError::*;
    match outcome.error {
        None => {
            txn.set_pid_and_epoch(outcome.producer_id, outcome.producer_epoch);
            debug!(
                node_id,
                producer_id = outcome.producer_id,
                producer_epoch = outcome.producer_epoch,
                "acquired producer identity"
            );
            Ok(Outcome::Done)
        }
        CoordinatorNotAvailable | NotCoordinator => {
            warn!(node_id, "transaction coordinator unavailable during Init-PID");
            if transactional_id.is_some() {
                coordinators.lock().await.mark_dead(CoordinatorRole::Transaction);
            }
            crate::handler::retry_after(backoff).await
        }
        CoordinatorLoadInProgress | ConcurrentTransactions => {
            crate::handler::retry_after(backoff).await
        }
        other => Err(SenderError::FatalOther(other)),
    }
}
