//! The Drive Loop (spec.md §4.9): the sender's single coordinating task.
//!
//! Nothing here holds a `Mutex` across an `.await` boundary except the
//! `CoordinatorCache` handlers share (spec.md I2 makes that contention
//! formal, never real); the in-flight node set and the muted-partition set
//! are owned exclusively by this loop and are never handed to a spawned
//! task, so there is nothing else to synchronize.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::SenderConfig;
use crate::coordinator_cache::CoordinatorCache;
use crate::error::{SenderError, SenderResult};
use crate::external::{Accumulator, BrokerClient, TransactionManager};
use crate::handler::HandlerResult;
use crate::handlers;
use crate::identity::{NodeId, TopicPartition};

/// Tags a spawned task with the bookkeeping the drive loop must undo once it
/// completes: which node to free, and which partitions to unmute.
enum TaskKind {
    Transactional { unmute: Vec<TopicPartition> },
    Produce { node_id: NodeId, unmute: Vec<TopicPartition> },
}

pub struct Sender {
    config: SenderConfig,
    client: Arc<dyn BrokerClient>,
    accumulator: Arc<dyn Accumulator>,
    txn: Arc<dyn TransactionManager>,
    coordinators: Arc<Mutex<CoordinatorCache>>,
    backoff: Backoff,
}

impl Sender {
    pub fn new(
        config: SenderConfig,
        client: Arc<dyn BrokerClient>,
        accumulator: Arc<dyn Accumulator>,
        txn: Arc<dyn TransactionManager>,
    ) -> Self {
        let backoff = Backoff::new(config.retry_backoff_ms);
        Self {
            config,
            client,
            accumulator,
            txn,
            coordinators: Arc::new(Mutex::new(CoordinatorCache::new())),
            backoff,
        }
    }

    /// Drives the sender until a fatal error is observed or `shutdown`
    /// resolves. Either way, every batch still held by the accumulator is
    /// failed via `Accumulator::fail_all` before this returns (spec.md §4.9
    /// "Termination contract"); a requested shutdown waits for tasks already
    /// spawned to finish rather than aborting them.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> SenderResult<()> {
        tokio::pin!(shutdown);

        let mut tasks: JoinSet<(TaskKind, HandlerResult)> = JoinSet::new();
        let mut in_flight_nodes: HashSet<NodeId> = HashSet::new();
        let mut muted: HashSet<TopicPartition> = HashSet::new();
        let mut transactional_busy = false;
        let mut stopping = false;
        let mut missing_metadata = false;

        let result: SenderResult<()> = loop {
            if self.config.requires_pid() && !self.txn.has_pid() {
                if let Err(err) = self.run_init_pid().await {
                    break Err(err);
                }
                continue;
            }

            if !stopping {
                if !transactional_busy {
                    transactional_busy = self.spawn_transactional_task(&mut tasks, &mut muted).await;
                }

                missing_metadata = self
                    .spawn_produce_tasks(&mut tasks, &mut in_flight_nodes, &muted)
                    .await;
            }

            if stopping && tasks.is_empty() {
                break Ok(());
            }

            tokio::select! {
                biased;

                _ = &mut shutdown, if !stopping => {
                    info!("shutdown requested, waiting for in-flight tasks to complete");
                    stopping = true;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (kind, outcome) = match joined {
                        Ok(pair) => pair,
                        Err(join_err) => break Err(SenderError::Join(join_err)),
                    };

                    match kind {
                        TaskKind::Transactional { unmute } => {
                            transactional_busy = false;
                            for tp in unmute {
                                muted.remove(&tp);
                            }
                        }
                        TaskKind::Produce { node_id, unmute } => {
                            in_flight_nodes.remove(&node_id);
                            for tp in unmute {
                                muted.remove(&tp);
                            }
                        }
                    }

                    if let Err(err) = outcome {
                        if err.is_fatal() {
                            break Err(err);
                        }
                        warn!(error = %err, "handler returned a non-fatal error that escaped its own retry path");
                    }
                }

                // Some drained partition had no known leader: wait on
                // metadata resolving rather than on new data, which may
                // never arrive (spec.md §4.9 step 2e).
                _ = self.client.wait_metadata(), if !stopping && missing_metadata => {}

                _ = self.accumulator.data_waiter(), if !stopping && !missing_metadata => {}

                _ = self.txn.task_waiter(), if !stopping => {}
            }
        };

        // Drain whatever is still spawned before reporting, fatal or not:
        // cancellation never aborts work already dispatched to a broker.
        while let Some(joined) = tasks.join_next().await {
            if let Ok((_, Err(err))) = &joined {
                debug!(error = %err, "late-completing task failed during shutdown drain");
            }
        }

        let fail_error = match &result {
            Ok(()) => SenderError::Closed,
            Err(err) => describe(err),
        };
        self.accumulator.fail_all(&fail_error).await;

        result
    }

    async fn run_init_pid(&self) -> HandlerResult {
        handlers::init_pid::run(
            self.client.clone(),
            self.coordinators.clone(),
            self.txn.clone(),
            self.backoff.default_delay(),
        )
        .await
    }

    /// At most one transactional handler runs at a time (spec.md I2),
    /// selected in priority order: a pending commit/abort outranks new
    /// enrolment, which outranks a still-pending offset commit.
    async fn spawn_transactional_task(
        &self,
        tasks: &mut JoinSet<(TaskKind, HandlerResult)>,
        muted: &mut HashSet<TopicPartition>,
    ) -> bool {
        if let Some(committed) = self.txn.pending_finalisation() {
            let client = self.client.clone();
            let coordinators = self.coordinators.clone();
            let txn = self.txn.clone();
            let accumulator = self.accumulator.clone();
            let backoff = self.backoff.default_delay();
            tasks.spawn(async move {
                accumulator.flush_for_commit().await;
                let outcome = handlers::end_txn::run(client, coordinators, txn, committed, backoff).await;
                (TaskKind::Transactional { unmute: vec![] }, outcome)
            });
            return true;
        }

        let pending = self.txn.pending_partitions();
        if !pending.is_empty() {
            for tp in &pending {
                muted.insert(tp.clone());
            }
            let client = self.client.clone();
            let coordinators = self.coordinators.clone();
            let txn = self.txn.clone();
            let backoff = self.backoff.default_delay();
            let unmute = pending.clone();
            tasks.spawn(async move {
                let outcome = handlers::add_partitions::run(client, coordinators, txn, backoff).await;
                (TaskKind::Transactional { unmute }, outcome)
            });
            return true;
        }

        if let Some(group_id) = self.txn.pending_group() {
            let client = self.client.clone();
            let coordinators = self.coordinators.clone();
            let txn = self.txn.clone();
            let backoff = self.backoff.default_delay();
            tasks.spawn(async move {
                let outcome = handlers::add_offsets::run(client, coordinators, txn, group_id, backoff).await;
                (TaskKind::Transactional { unmute: vec![] }, outcome)
            });
            return true;
        }

        if let Some((offsets, group_id)) = self.txn.pending_offsets() {
            let client = self.client.clone();
            let coordinators = self.coordinators.clone();
            let txn = self.txn.clone();
            let backoff = self.backoff.default_delay();
            tasks.spawn(async move {
                let outcome =
                    handlers::offset_commit::run(client, coordinators, txn, offsets, group_id, backoff).await;
                (TaskKind::Transactional { unmute: vec![] }, outcome)
            });
            return true;
        }

        false
    }

    /// Drains the accumulator, excluding nodes already hosting an in-flight
    /// produce request and partitions currently muted for transactional
    /// enrolment, and spawns one produce task per node returned. Returns
    /// whether this drain found a partition with no known leader, so the
    /// caller can wait on metadata resolving instead of on new data next
    /// iteration (spec.md §4.9 step 2e).
    async fn spawn_produce_tasks(
        &self,
        tasks: &mut JoinSet<(TaskKind, HandlerResult)>,
        in_flight_nodes: &mut HashSet<NodeId>,
        muted: &HashSet<TopicPartition>,
    ) -> bool {
        let ignore_nodes: Vec<NodeId> = in_flight_nodes.iter().copied().collect();
        let muted_partitions: Vec<TopicPartition> = muted.iter().cloned().collect();

        let (by_node, missing_metadata) = self
            .accumulator
            .drain_by_nodes(&ignore_nodes, &muted_partitions)
            .await;

        if missing_metadata {
            self.client.force_metadata_update();
        }

        if by_node.is_empty() {
            return missing_metadata;
        }

        let idempotent_or_transactional = self.config.enable_idempotence || self.config.is_transactional();
        let linger = Duration::from_millis(self.config.linger_ms);

        for (node_id, batches) in by_node {
            let partitions: Vec<TopicPartition> = batches.keys().cloned().collect();
            in_flight_nodes.insert(node_id);

            let client = self.client.clone();
            let accumulator = self.accumulator.clone();
            let identity = self.txn.identity();
            let acks = self.config.acks;
            let request_timeout_ms = self.config.request_timeout_ms;
            let transactional_id = self.txn.transactional_id().map(str::to_owned);
            let backoff = self.backoff.default_delay();

            tasks.spawn(async move {
                let start = tokio::time::Instant::now();
                let outcome = handlers::produce::run(
                    client,
                    accumulator,
                    node_id,
                    batches,
                    acks,
                    request_timeout_ms,
                    transactional_id,
                    identity,
                    idempotent_or_transactional,
                    backoff,
                )
                .await;

                // Hold the node/partitions until linger_ms has elapsed since
                // dispatch, not just since the response arrived, so a
                // produce that completes quickly doesn't immediately open
                // the node back up for a sub-linger second drain (spec.md
                // §4.8 "Post-handler").
                let elapsed = start.elapsed();
                if elapsed < linger {
                    tokio::time::sleep(linger - elapsed).await;
                }

                (
                    TaskKind::Produce {
                        node_id,
                        unmute: partitions,
                    },
                    outcome,
                )
            });
        }

        missing_metadata
    }
}

/// Re-derives a `SenderError` for the completion hook without needing
/// `SenderError` itself to implement `Clone` (its `Transport` variant boxes a
/// non-`Clone` trait object). Only the discriminant matters here: by the time
/// `Accumulator::fail_all` runs, every batch just needs to know the sender is
/// gone and why, not replay the original source error.
fn describe(err: &SenderError) -> SenderError {
    match err {
        SenderError::Fenced => SenderError::Fenced,
        SenderError::FatalTxnState(msg) => SenderError::FatalTxnState(msg),
        SenderError::FatalOther(code) => SenderError::FatalOther(*code),
        SenderError::Broker { code, tp } => SenderError::Broker {
            code: *code,
            tp: tp.clone(),
        },
        SenderError::Transport { node_id, invalid_metadata, .. } => SenderError::Transport {
            node_id: *node_id,
            source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "sender shut down")),
            invalid_metadata: *invalid_metadata,
        },
        SenderError::Join(_) | SenderError::Closed => SenderError::Closed,
    }
}
