//! Produce Handler (spec.md §4.8): batch-oriented send to a leader node with
//! per-partition outcome classification and re-enqueue of retriable
//! failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kafka_protocol::error::ResponseError;
use tracing::{debug, warn};

use crate::error::SenderError;
use crate::external::{Accumulator, ApiVersion, Batch, BrokerClient, NodeBatches, ProduceRequestArgs};
use crate::handler::{HandlerResult, Outcome};
use crate::identity::{NodeId, ProducerIdentity, TopicPartition};

/// Produce request wire versions spec.md §4.8 enumerates (0-3). Nothing in
/// this crate speaks the wire format itself (that's the external codec's
/// job); this only decides which version string the `BrokerClient` is asked
/// to use and whether the transactional id is eligible to ride along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProduceVersion(pub u16);

pub fn select_version(api_version: ApiVersion) -> ProduceVersion {
    if api_version >= ApiVersion::new(0, 11) {
        ProduceVersion(3)
    } else if api_version >= ApiVersion::new(0, 10) {
        ProduceVersion(2)
    } else if api_version == ApiVersion::new(0, 9) {
        ProduceVersion(1)
    } else {
        ProduceVersion(0)
    }
}

/// Error codes treated as carrying stale leadership metadata: a produce
/// failure with one of these should also kick off a metadata refresh so the
/// next drain has a chance of choosing a better leader.
fn marks_invalid_metadata(code: ResponseError) -> bool {
    matches!(
        code,
        ResponseError::UnknownTopicOrPartition
            | ResponseError::NotLeaderOrFollower
            | ResponseError::LeaderNotAvailable
            | ResponseError::FencedLeaderEpoch
            | ResponseError::UnknownLeaderEpoch
    )
}

/// spec.md §4.8 `can_retry`.
fn can_retry(code: ResponseError, batch: &dyn Batch, idempotent_or_transactional: bool) -> bool {
    if !idempotent_or_transactional && batch.expired() {
        return false;
    }
    code.is_retriable() || code == ResponseError::UnknownTopicOrPartition
}

#[allow(clippy::too_many_arguments)]
pub async fn run(
    client: Arc<dyn BrokerClient>,
    accumulator: Arc<dyn Accumulator>,
    node_id: NodeId,
    mut batches: NodeBatches,
    acks: i16,
    request_timeout_ms: i32,
    transactional_id: Option<String>,
    identity: ProducerIdentity,
    idempotent_or_transactional: bool,
    default_backoff: Duration,
) -> HandlerResult {
    if batches.is_empty() {
        return Ok(Outcome::Done);
    }

    let version = select_version(client.api_version());

    // Group by topic then partition (spec.md §4.8 "Request composition").
    // Scoped so the borrows of `batches` behind `topics`/`args` end before
    // `batches` needs to be consumed below.
    let response = {
        let mut topics: HashMap<String, Vec<(i32, &[u8])>> = HashMap::new();
        for (tp, batch) in &batches {
            topics
                .entry(tp.topic.clone())
                .or_default()
                .push((tp.partition, batch.data_buffer()));
        }

        let args = ProduceRequestArgs {
            acks,
            timeout_ms: request_timeout_ms,
            transactional_id: if version.0 >= 3 {
                transactional_id.as_deref()
            } else {
                None
            },
            identity,
            topics: &topics,
        };

        client.produce(node_id, args).await
    };

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            if err.invalid_metadata {
                client.force_metadata_update();
            }
            let mut staged = Vec::new();
            for (tp, batch) in batches {
                if !idempotent_or_transactional && batch.expired() {
                    batch
                        .failure(SenderError::Transport {
                            node_id,
                            source: Box::new(std::io::Error::new(std::io::ErrorKind::TimedOut, err.message.clone())),
                            invalid_metadata: err.invalid_metadata,
                        })
                        .await;
                } else {
                    staged.push((tp, batch));
                }
            }
            return finish(client.as_ref(), accumulator.as_ref(), staged, false, default_backoff).await;
        }
    };

    if acks == 0 {
        debug!(node_id, "acks=0, completing all batches without waiting on a response");
        for (_, batch) in batches {
            batch.done_noack().await;
        }
        return Ok(Outcome::Done);
    }

    let mut staged = Vec::new();
    let mut fenced = false;
    let mut request_metadata_refresh = false;

    for (topic, partitions) in response.topics {
        for part in partitions {
            let tp = TopicPartition::new(topic.clone(), part.partition);
            let Some(batch) = batches.remove(&tp) else {
                warn!(node_id, %tp, "produce response referenced a partition with no matching batch");
                continue;
            };

            match part.error {
                ResponseError::None => {
                    batch.done(part.base_offset, part.log_append_time).await;
                }
                ResponseError::DuplicateSequenceNumber => {
                    // The broker already durably appended this batch and
                    // lost the bookkeeping to recognize the retry; treating
                    // it as success is what preserves idempotent-producer
                    // semantics (spec.md §4.8).
                    batch.done(part.base_offset, part.log_append_time).await;
                }
                ResponseError::InvalidProducerEpoch => {
                    fenced = true;
                    batch.failure(SenderError::Fenced).await;
                }
                other => {
                    if marks_invalid_metadata(other) {
                        request_metadata_refresh = true;
                    }
                    if can_retry(other, batch.as_ref(), idempotent_or_transactional) {
                        staged.push((tp, batch));
                    } else {
                        batch
                            .failure(SenderError::Broker {
                                code: other,
                                tp: Some(tp),
                            })
                            .await;
                    }
                }
            }
        }
    }

    if request_metadata_refresh {
        client.force_metadata_update();
    }

    // Any batch the response didn't mention at all stays muted/outstanding;
    // surface it as a stray so operators notice rather than silently losing
    // an acknowledgement.
    for (tp, batch) in batches {
        warn!(node_id, %tp, "batch was drained but absent from the produce response");
        batch
            .failure(SenderError::Broker {
                code: ResponseError::UnknownServerError,
                tp: Some(tp),
            })
            .await;
    }

    finish(client.as_ref(), accumulator.as_ref(), staged, fenced, default_backoff).await
}

/// Shared tail for both the transport-failure and response-classification
/// paths: re-enqueue anything staged, then report the fenced signal if one
/// was observed (spec.md §4.8 "After classification").
async fn finish(
    client: &dyn BrokerClient,
    accumulator: &dyn Accumulator,
    staged: Vec<(TopicPartition, Box<dyn Batch>)>,
    fenced: bool,
    default_backoff: Duration,
) -> HandlerResult {
    if !staged.is_empty() {
        tokio::time::sleep(default_backoff).await;
        for (tp, batch) in staged {
            accumulator.reenqueue(tp, batch).await;
        }
        client.wait_metadata().await;
    }

    if fenced {
        Err(SenderError::Fenced)
    } else {
        Ok(Outcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{
        ApiVersion, ConnectionGroup, InitProducerIdOutcome, ProduceResponse, ProducePartitionResult,
        TransportError,
    };
    use crate::identity::CoordinatorRole;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FakeBatch {
        data: Vec<u8>,
        outcome: Arc<StdMutex<Option<String>>>,
        expired: bool,
    }

    #[async_trait]
    impl Batch for FakeBatch {
        fn data_buffer(&self) -> &[u8] {
            &self.data
        }
        async fn done(self: Box<Self>, base_offset: i64, log_append_time: i64) {
            *self.outcome.lock().unwrap() = Some(format!("done({base_offset},{log_append_time})"));
        }
        async fn done_noack(self: Box<Self>) {
            *self.outcome.lock().unwrap() = Some("done_noack".into());
        }
        async fn failure(self: Box<Self>, error: SenderError) {
            *self.outcome.lock().unwrap() = Some(format!("failure({error})"));
        }
        fn expired(&self) -> bool {
            self.expired
        }
    }

    struct FakeAccumulator {
        reenqueued: StdMutex<Vec<TopicPartition>>,
    }

    #[async_trait]
    impl Accumulator for FakeAccumulator {
        async fn drain_by_nodes(
            &self,
            _ignore_nodes: &[NodeId],
            _muted_partitions: &[TopicPartition],
        ) -> (HashMap<NodeId, NodeBatches>, bool) {
            (HashMap::new(), false)
        }
        async fn data_waiter(&self) {
            futures::future::pending::<()>().await;
        }
        async fn flush_for_commit(&self) {}
        async fn fail_all(&self, _error: &SenderError) {}
        async fn reenqueue(&self, tp: TopicPartition, _batch: Box<dyn Batch>) {
            self.reenqueued.lock().unwrap().push(tp);
        }
    }

    struct FakeClient {
        response: ProduceResponse,
        metadata_refreshed: StdMutex<bool>,
    }

    #[async_trait]
    impl BrokerClient for FakeClient {
        async fn init_producer_id(
            &self,
            _: i32,
            _: Option<&str>,
            _: i32,
        ) -> Result<InitProducerIdOutcome, TransportError> {
            unimplemented!()
        }
        async fn add_partitions_to_txn(
            &self,
            _: i32,
            _: ProducerIdentity,
            _: &str,
            _: &[TopicPartition],
        ) -> Result<Vec<(TopicPartition, ResponseError)>, TransportError> {
            unimplemented!()
        }
        async fn add_offsets_to_txn(
            &self,
            _: i32,
            _: ProducerIdentity,
            _: &str,
            _: &str,
        ) -> Result<ResponseError, TransportError> {
            unimplemented!()
        }
        async fn txn_offset_commit(
            &self,
            _: i32,
            _: ProducerIdentity,
            _: &str,
            _: &str,
            _: &HashMap<TopicPartition, (i64, String)>,
        ) -> Result<Vec<(TopicPartition, ResponseError)>, TransportError> {
            unimplemented!()
        }
        async fn end_txn(
            &self,
            _: i32,
            _: ProducerIdentity,
            _: &str,
            _: bool,
        ) -> Result<ResponseError, TransportError> {
            unimplemented!()
        }
        async fn produce(
            &self,
            _node_id: i32,
            _args: ProduceRequestArgs<'_>,
        ) -> Result<ProduceResponse, TransportError> {
            Ok(self.response.clone())
        }
        async fn ready(&self, _: i32, _: ConnectionGroup) -> bool {
            true
        }
        async fn coordinator_lookup(&self, _: CoordinatorRole, _: &str) -> Result<i32, TransportError> {
            unimplemented!()
        }
        fn force_metadata_update(&self) {
            *self.metadata_refreshed.lock().unwrap() = true;
        }
        async fn wait_metadata(&self) {}
        async fn get_random_node(&self) -> Option<i32> {
            Some(1)
        }
        fn api_version(&self) -> ApiVersion {
            ApiVersion::new(0, 11)
        }
    }

    fn batch(expired: bool) -> (Box<dyn Batch>, Arc<StdMutex<Option<String>>>) {
        let outcome = Arc::new(StdMutex::new(None));
        (
            Box::new(FakeBatch {
                data: b"hello".to_vec(),
                outcome: outcome.clone(),
                expired,
            }),
            outcome,
        )
    }

    #[tokio::test]
    async fn scenario_1_idempotent_first_success() {
        let tp = TopicPartition::new("t", 0);
        let (b, outcome) = batch(false);
        let mut batches = NodeBatches::new();
        batches.insert(tp.clone(), b);

        let client = Arc::new(FakeClient {
            response: ProduceResponse {
                topics: HashMap::from([(
                    "t".to_string(),
                    vec![ProducePartitionResult {
                        partition: 0,
                        error: ResponseError::None,
                        base_offset: 42,
                        log_append_time: 1000,
                    }],
                )]),
            },
            metadata_refreshed: StdMutex::new(false),
        });
        let accumulator = Arc::new(FakeAccumulator {
            reenqueued: StdMutex::new(vec![]),
        });

        let outcome_result = run(
            client,
            accumulator,
            1,
            batches,
            -1,
            30_000,
            None,
            ProducerIdentity {
                producer_id: 7,
                producer_epoch: 0,
            },
            true,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert!(matches!(outcome_result, Outcome::Done));
        assert_eq!(outcome.lock().unwrap().as_deref(), Some("done(42,1000)"));
    }

    #[tokio::test]
    async fn scenario_2_duplicate_sequence_is_success() {
        let tp = TopicPartition::new("t", 0);
        let (b, outcome) = batch(false);
        let mut batches = NodeBatches::new();
        batches.insert(tp.clone(), b);

        let client = Arc::new(FakeClient {
            response: ProduceResponse {
                topics: HashMap::from([(
                    "t".to_string(),
                    vec![ProducePartitionResult {
                        partition: 0,
                        error: ResponseError::DuplicateSequenceNumber,
                        base_offset: 99,
                        log_append_time: -1,
                    }],
                )]),
            },
            metadata_refreshed: StdMutex::new(false),
        });
        let accumulator = Arc::new(FakeAccumulator {
            reenqueued: StdMutex::new(vec![]),
        });

        run(
            client,
            accumulator.clone(),
            1,
            batches,
            -1,
            30_000,
            None,
            ProducerIdentity {
                producer_id: 7,
                producer_epoch: 0,
            },
            true,
            Duration::from_millis(1),
        )
        .await
        .unwrap();

        assert_eq!(outcome.lock().unwrap().as_deref(), Some("done(99,-1)"));
        assert!(accumulator.reenqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scenario_3_fenced_on_produce() {
        let tp = TopicPartition::new("t", 0);
        let (b, outcome) = batch(false);
        let mut batches = NodeBatches::new();
        batches.insert(tp.clone(), b);

        let client = Arc::new(FakeClient {
            response: ProduceResponse {
                topics: HashMap::from([(
                    "t".to_string(),
                    vec![ProducePartitionResult {
                        partition: 0,
                        error: ResponseError::InvalidProducerEpoch,
                        base_offset: -1,
                        log_append_time: -1,
                    }],
                )]),
            },
            metadata_refreshed: StdMutex::new(false),
        });
        let accumulator = Arc::new(FakeAccumulator {
            reenqueued: StdMutex::new(vec![]),
        });

        let err = run(
            client,
            accumulator,
            1,
            batches,
            -1,
            30_000,
            None,
            ProducerIdentity {
                producer_id: 7,
                producer_epoch: 0,
            },
            true,
            Duration::from_millis(1),
        )
        .await
        .unwrap_err();

        assert!(err.is_fenced());
        assert!(outcome.lock().unwrap().as_ref().unwrap().starts_with("failure"));
    }
}
