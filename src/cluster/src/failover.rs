// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Master failover: promotes a surviving slave when a master dies.
//!
//! Correctness rests on the meta store's global mutex, one failover of a
//! shard runs cluster-wide at a time; the per-shard latch merely keeps one
//! gateway from queueing up duplicates, and the post-lock re-read detects
//! a promotion another gateway already performed.

use std::{sync::Arc, time::Duration};

use lazy_static::lazy_static;
use logger::{error, info, warn};
use meta_client::{types::Node, MetaClientRef};
use prometheus::{register_int_counter_vec, IntCounterVec};
use shard_client::SlaveOfSenderRef;
use snafu::{ensure, OptionExt, ResultExt};
use tokio::time;

use crate::{
    config::ClusterConfig,
    topology::ClusterViewRef,
    NoAvailableSlave, PromotionFailed, PromotionTimeout, Result, ShardNotFound,
};

/// Name of the global failover mutex in the meta store.
const FAILOVER_MUTEX: &str = "failover";

/// Bound on waiting for the promotion reply; beyond it the outcome is
/// unknown and the next node event re-drives reconciliation.
const PROMOTION_REPLY_TIMEOUT: Duration = Duration::from_secs(15);

lazy_static! {
    static ref FAILOVER_COUNTER: IntCounterVec = register_int_counter_vec!(
        "failover_total",
        "Failover attempts by outcome",
        &["outcome"]
    )
    .unwrap();
}

pub struct FailoverCoordinator {
    meta_client: MetaClientRef,
    view: ClusterViewRef,
    sender: SlaveOfSenderRef,
    config: ClusterConfig,
}

pub type FailoverCoordinatorRef = Arc<FailoverCoordinator>;

impl FailoverCoordinator {
    pub fn new(
        meta_client: MetaClientRef,
        view: ClusterViewRef,
        sender: SlaveOfSenderRef,
        config: ClusterConfig,
    ) -> Self {
        Self {
            meta_client,
            view,
            sender,
            config,
        }
    }

    /// Invoked on every node DELETE the watcher sees. Does nothing unless
    /// the vanished node is a genuinely dead member of a known shard, and
    /// at most one failover per shard runs in this process at a time.
    pub async fn failover_if_needed(&self, dead: &Node) -> Result<()> {
        let shard = match self.view.shard(dead.shard_id) {
            Some(shard) => shard,
            None => {
                info!(
                    "Vanished node belongs to no known shard, addr:{}, shard:{}",
                    dead.addr(),
                    dead.shard_id
                );
                return Ok(());
            }
        };

        if dead.may_online(self.config.session_expire_ttl.0) {
            info!(
                "Node key vanished but its heartbeat is fresh, treating as a blip, addr:{}",
                dead.addr()
            );
            return Ok(());
        }

        if !shard.begin_failover() {
            info!(
                "Failover of shard:{} already in flight here, skip",
                dead.shard_id
            );
            return Ok(());
        }
        FAILOVER_COUNTER.with_label_values(&["started"]).inc();

        let result = self
            .meta_client
            .with_lock(
                FAILOVER_MUTEX,
                self.config.failover_lock_lease_ttl(),
                || self.promote_for(dead),
            )
            .await;
        shard.end_failover();

        match result {
            Ok(inner) => inner,
            Err(e) => {
                error!(
                    "Failed to take the failover mutex, shard:{}, err:{}",
                    dead.shard_id, e
                );
                FAILOVER_COUNTER.with_label_values(&["lock_failed"]).inc();
                Err(crate::Error::MetaFailure { source: e })
            }
        }
    }

    /// Runs with the failover mutex held.
    async fn promote_for(&self, dead: &Node) -> Result<()> {
        // Re-read the cluster so a promotion done by another gateway while
        // we waited on the mutex is visible.
        self.view.refresh().await?;
        let shard = self
            .view
            .shard(dead.shard_id)
            .context(ShardNotFound {
                shard_id: dead.shard_id,
            })?;

        if let Some(master) = &shard.master {
            if master.addr() != dead.addr() {
                info!(
                    "Shard:{} already failed over to addr:{}, nothing to do",
                    dead.shard_id,
                    master.addr()
                );
                FAILOVER_COUNTER.with_label_values(&["lost"]).inc();
                return Ok(());
            }
        }

        ensure!(
            !shard.slaves.is_empty(),
            NoAvailableSlave {
                shard_id: dead.shard_id,
            }
        );

        // Prefer a slave in the dead master's idc, else the first one.
        let target = shard
            .slaves
            .iter()
            .find(|slave| slave.idc == dead.idc)
            .unwrap_or(&shard.slaves[0]);
        let target_addr = target.addr();
        info!(
            "Promoting slave, shard:{}, addr:{}, idc:{}",
            dead.shard_id, target_addr, target.idc
        );

        let sent = time::timeout(
            PROMOTION_REPLY_TIMEOUT,
            self.sender.slave_of(&target_addr, ""),
        )
        .await;
        match sent {
            Err(_) => {
                warn!(
                    "Promotion reply timed out, outcome unknown, shard:{}, addr:{}",
                    dead.shard_id, target_addr
                );
                FAILOVER_COUNTER.with_label_values(&["timeout"]).inc();
                PromotionTimeout {
                    shard_id: dead.shard_id,
                    addr: target_addr,
                }
                .fail()
            }
            Ok(Err(e)) => {
                FAILOVER_COUNTER.with_label_values(&["failed"]).inc();
                Err(e).context(PromotionFailed {
                    shard_id: dead.shard_id,
                    addr: target_addr,
                })
            }
            Ok(Ok(())) => {
                FAILOVER_COUNTER.with_label_values(&["won"]).inc();
                info!(
                    "Promoted slave to master, shard:{}, addr:{}",
                    dead.shard_id, target_addr
                );
                // Publish the new master before returning.
                self.view.refresh().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use meta_client::{keys::KeyLayout, mem::MemStore, MetaClient};
    use shard_client::SlaveOfSender;
    use time_ext::current_time_millis;

    use super::*;
    use crate::{topology::ClusterView, Error};

    /// Records promotion commands; optionally refuses them.
    struct RecordingSender {
        sent: Mutex<Vec<(String, String)>>,
        accept: bool,
    }

    impl RecordingSender {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                accept,
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SlaveOfSender for RecordingSender {
        async fn slave_of(&self, addr: &str, master_addr: &str) -> shard_client::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((addr.to_string(), master_addr.to_string()));
            if self.accept {
                Ok(())
            } else {
                shard_client::ShardFailed {
                    addr: addr.to_string(),
                    msg: "not ready".to_string(),
                }
                .fail()
            }
        }
    }

    fn node(shard_id: u32, ip: &str, idc: &str, master_of: Option<&str>) -> Node {
        Node {
            shard_id,
            ip: ip.to_string(),
            port: "8088".to_string(),
            master_ip: master_of.map(str::to_string).unwrap_or_default(),
            master_port: master_of.map(|_| "8088".to_string()).unwrap_or_default(),
            idc: idc.to_string(),
            heartbeat_at: 0,
        }
    }

    struct Fixture {
        coordinator: FailoverCoordinator,
        view: ClusterViewRef,
        client: MetaClientRef,
        sender: Arc<RecordingSender>,
    }

    async fn fixture(nodes: Vec<Node>, accept: bool) -> Fixture {
        let store = Arc::new(MemStore::default());
        let client = Arc::new(MetaClient::new(
            store,
            KeyLayout::try_new("/baudtime").unwrap(),
        ));
        for n in &nodes {
            let key = client.keys().node_key(&n.addr());
            client.store().put(&key, n.to_json(), None).await.unwrap();
        }
        let view = Arc::new(ClusterView::new(client.clone()));
        view.refresh().await.unwrap();
        let sender = RecordingSender::new(accept);
        let coordinator = FailoverCoordinator::new(
            client.clone(),
            view.clone(),
            sender.clone(),
            ClusterConfig::default(),
        );
        Fixture {
            coordinator,
            view,
            client,
            sender,
        }
    }

    #[tokio::test]
    async fn test_promotes_idc_matching_slave() {
        let dead = node(1, "10.0.0.1", "z1", None);
        let fx = fixture(
            vec![
                dead.clone(),
                node(1, "10.0.0.2", "z2", Some("10.0.0.1")),
                node(1, "10.0.0.3", "z1", Some("10.0.0.1")),
            ],
            true,
        )
        .await;

        // The master's key is gone by the time the watcher reacts.
        fx.client
            .store()
            .delete(&fx.client.keys().node_key(&dead.addr()))
            .await
            .unwrap();

        fx.coordinator.failover_if_needed(&dead).await.unwrap();

        // The z1 slave is chosen over the z2 one listed before it.
        assert_eq!(
            fx.sender.sent(),
            vec![("10.0.0.3:8088".to_string(), String::new())]
        );
    }

    #[tokio::test]
    async fn test_no_slaves_fails() {
        let dead = node(1, "10.0.0.1", "z1", None);
        let fx = fixture(vec![dead.clone()], true).await;
        fx.client
            .store()
            .delete(&fx.client.keys().node_key(&dead.addr()))
            .await
            .unwrap();

        let err = fx.coordinator.failover_if_needed(&dead).await.unwrap_err();
        assert!(matches!(err, Error::NoAvailableSlave { .. }));
        assert!(fx.sender.sent().is_empty());
        // The shard is gone from the rebuilt view entirely, so there is no
        // master to read; a later registration will bring it back.
        assert!(fx.view.shard(1).is_none());
    }

    #[tokio::test]
    async fn test_fresh_heartbeat_is_a_blip() {
        let mut dead = node(1, "10.0.0.1", "z1", None);
        dead.heartbeat_at = current_time_millis();
        let fx = fixture(
            vec![dead.clone(), node(1, "10.0.0.2", "z1", Some("10.0.0.1"))],
            true,
        )
        .await;

        fx.coordinator.failover_if_needed(&dead).await.unwrap();
        assert!(fx.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_already_failed_over_elsewhere() {
        let dead = node(1, "10.0.0.1", "z1", None);
        // Another gateway already promoted 10.0.0.2: it is a master now.
        let fx = fixture(
            vec![node(1, "10.0.0.2", "z1", None)],
            true,
        )
        .await;

        fx.coordinator.failover_if_needed(&dead).await.unwrap();
        assert!(fx.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_promotion_refused_surfaces() {
        let dead = node(1, "10.0.0.1", "z1", None);
        let fx = fixture(
            vec![dead.clone(), node(1, "10.0.0.2", "z1", Some("10.0.0.1"))],
            false,
        )
        .await;
        fx.client
            .store()
            .delete(&fx.client.keys().node_key(&dead.addr()))
            .await
            .unwrap();

        let err = fx.coordinator.failover_if_needed(&dead).await.unwrap_err();
        assert!(matches!(err, Error::PromotionFailed { .. }));
    }

    #[tokio::test]
    async fn test_latch_blocks_reentry() {
        let dead = node(1, "10.0.0.1", "z1", None);
        let fx = fixture(
            vec![dead.clone(), node(1, "10.0.0.2", "z1", Some("10.0.0.1"))],
            true,
        )
        .await;

        let shard = fx.view.shard(1).unwrap();
        assert!(shard.begin_failover());

        // With the latch held the coordinator backs off without sending.
        fx.coordinator.failover_if_needed(&dead).await.unwrap();
        assert!(fx.sender.sent().is_empty());
    }
}
