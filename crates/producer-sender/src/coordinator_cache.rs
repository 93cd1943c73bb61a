//! Coordinator Cache (spec.md §4.1). The drive loop hands a shared
//! `Arc<tokio::sync::Mutex<CoordinatorCache>>` to whichever transactional
//! handler it spawns, since a handler resolves its coordinator from inside a
//! spawned task rather than the loop itself. Invariant I2 (at most one
//! transactional request in flight) means the lock is formal, never really
//! contended — the same single-writer guarantee `crates/gazette/src/router.rs`'s
//! `Router` documents, just realized with a real lock instead of exclusive
//! ownership because this type crosses a task boundary.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::external::{BrokerClient, TransportError};
use crate::identity::{CoordinatorRole, NodeId};

/// spec.md's "at most one entry per role" simplification: this crate keys
/// strictly by role since a `Sender` drives exactly one transactional id and
/// at most one consumer group for its lifetime (see SPEC_FULL.md §B). A
/// deployment that needed multiple concurrent group ids per sender would key
/// this by `(CoordinatorRole, key)` instead.
#[derive(Debug, Default)]
pub struct CoordinatorCache {
    entries: HashMap<CoordinatorRole, NodeId>,
}

impl CoordinatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, role: CoordinatorRole) -> Option<NodeId> {
        self.entries.get(&role).copied()
    }

    /// Removes the cached entry for `role`, if any. Idempotent.
    pub fn mark_dead(&mut self, role: CoordinatorRole) {
        if self.entries.remove(&role).is_some() {
            debug!(%role, "evicted coordinator from cache");
        }
    }

    /// Returns the cached node id if present; otherwise issues a
    /// coordinator-lookup request and probes connectivity, retrying
    /// indefinitely with `backoff` between attempts on any failure. Never
    /// returns without a usable node: a caller that cancels the awaiting
    /// task is the only way to stop this loop short.
    pub async fn lookup(
        &mut self,
        role: CoordinatorRole,
        key: &str,
        client: &dyn BrokerClient,
        backoff: Duration,
    ) -> NodeId {
        if let Some(node_id) = self.cached(role) {
            return node_id;
        }

        loop {
            match self.try_discover(role, key, client).await {
                Some(node_id) => {
                    self.entries.insert(role, node_id);
                    return node_id;
                }
                None => {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn try_discover(
        &self,
        role: CoordinatorRole,
        key: &str,
        client: &dyn BrokerClient,
    ) -> Option<NodeId> {
        let node_id = match client.coordinator_lookup(role, key).await {
            Ok(node_id) => node_id,
            Err(TransportError { message, .. }) => {
                debug!(%role, key, %message, "coordinator lookup failed");
                return None;
            }
        };

        if client
            .ready(node_id, crate::external::ConnectionGroup::Coordination)
            .await
        {
            Some(node_id)
        } else {
            debug!(%role, key, node_id, "discovered coordinator is not ready");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::ApiVersion;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeClient {
        lookups: AtomicUsize,
        ready_after: usize,
        node_id: NodeId,
        recorded_roles: Mutex<Vec<CoordinatorRole>>,
    }

    #[async_trait]
    impl BrokerClient for FakeClient {
        async fn init_producer_id(
            &self,
            _: NodeId,
            _: Option<&str>,
            _: i32,
        ) -> Result<crate::external::InitProducerIdOutcome, TransportError> {
            unimplemented!()
        }
        async fn add_partitions_to_txn(
            &self,
            _: NodeId,
            _: crate::identity::ProducerIdentity,
            _: &str,
            _: &[crate::identity::TopicPartition],
        ) -> Result<Vec<(crate::identity::TopicPartition, kafka_protocol::error::ResponseError)>, TransportError>
        {
            unimplemented!()
        }
        async fn add_offsets_to_txn(
            &self,
            _: NodeId,
            _: crate::identity::ProducerIdentity,
            _: &str,
            _: &str,
        ) -> Result<kafka_protocol::error::ResponseError, TransportError> {
            unimplemented!()
        }
        async fn txn_offset_commit(
            &self,
            _: NodeId,
            _: crate::identity::ProducerIdentity,
            _: &str,
            _: &str,
            _: &Map<crate::identity::TopicPartition, (i64, String)>,
        ) -> Result<Vec<(crate::identity::TopicPartition, kafka_protocol::error::ResponseError)>, TransportError>
        {
            unimplemented!()
        }
        async fn end_txn(
            &self,
            _: NodeId,
            _: crate::identity::ProducerIdentity,
            _: &str,
            _: bool,
        ) -> Result<kafka_protocol::error::ResponseError, TransportError> {
            unimplemented!()
        }
        async fn produce(
            &self,
            _: NodeId,
            _: crate::external::ProduceRequestArgs<'_>,
        ) -> Result<crate::external::ProduceResponse, TransportError> {
            unimplemented!()
        }
        async fn ready(&self, _: NodeId, _: crate::external::ConnectionGroup) -> bool {
            self.lookups.load(Ordering::SeqCst) >= self.ready_after
        }
        async fn coordinator_lookup(
            &self,
            role: CoordinatorRole,
            _: &str,
        ) -> Result<NodeId, TransportError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.recorded_roles.lock().unwrap().push(role);
            Ok(self.node_id)
        }
        fn force_metadata_update(&self) {}
        async fn wait_metadata(&self) {}
        async fn get_random_node(&self) -> Option<NodeId> {
            Some(self.node_id)
        }
        fn api_version(&self) -> ApiVersion {
            ApiVersion::new(2, 8)
        }
    }

    #[tokio::test]
    async fn caches_after_first_successful_probe() {
        let client = FakeClient {
            lookups: AtomicUsize::new(0),
            ready_after: 1,
            node_id: 7,
            recorded_roles: Mutex::new(vec![]),
        };
        let mut cache = CoordinatorCache::new();

        let node = cache
            .lookup(
                CoordinatorRole::Transaction,
                "txn-1",
                &client,
                Duration::from_millis(1),
            )
            .await;
        assert_eq!(node, 7);
        assert_eq!(cache.cached(CoordinatorRole::Transaction), Some(7));

        // Second lookup must not hit the client again.
        let node = cache
            .lookup(
                CoordinatorRole::Transaction,
                "txn-1",
                &client,
                Duration::from_millis(1),
            )
            .await;
        assert_eq!(node, 7);
        assert_eq!(client.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mark_dead_forces_rediscovery() {
        let client = FakeClient {
            lookups: AtomicUsize::new(0),
            ready_after: 0,
            node_id: 3,
            recorded_roles: Mutex::new(vec![]),
        };
        let mut cache = CoordinatorCache::new();
        cache
            .lookup(CoordinatorRole::Group, "g1", &client, Duration::from_millis(1))
            .await;
        cache.mark_dead(CoordinatorRole::Group);
        assert_eq!(cache.cached(CoordinatorRole::Group), None);

        cache
            .lookup(CoordinatorRole::Group, "g1", &client, Duration::from_millis(1))
            .await;
        assert_eq!(client.lookups.load(Ordering::SeqCst), 2);
    }
}
