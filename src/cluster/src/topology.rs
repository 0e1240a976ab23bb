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

//! The atomically published snapshot of all shards.
//!
//! Readers load the pointer once and keep using the map they got; writers
//! build a complete replacement and swap it in. [ClusterView::refresh] is
//! the only mutator and concurrent refreshes coalesce, the loser returns
//! immediately because the winner's rebuild subsumes it.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use common_types::ShardId;
use logger::{debug, warn};
use meta_client::{types::Node, MetaClientRef};
use snafu::ResultExt;

use crate::{MetaFailure, Result, Shard, ShardRef};

type ShardMap = HashMap<ShardId, ShardRef>;

pub struct ClusterView {
    meta_client: MetaClientRef,
    shards: ArcSwap<ShardMap>,
    refreshing: AtomicBool,
}

pub type ClusterViewRef = Arc<ClusterView>;

impl ClusterView {
    pub fn new(meta_client: MetaClientRef) -> Self {
        Self {
            meta_client,
            shards: ArcSwap::from_pointee(ShardMap::new()),
            refreshing: AtomicBool::new(false),
        }
    }

    pub fn shard(&self, shard_id: ShardId) -> Option<ShardRef> {
        self.shards.load().get(&shard_id).cloned()
    }

    /// The current snapshot. Holding on to it is safe while further
    /// rebuilds are published.
    pub fn snapshot(&self) -> Arc<ShardMap> {
        self.shards.load_full()
    }

    /// Address of the shard's master, what the fan-out dials for it.
    pub fn master_addr(&self, shard_id: ShardId) -> Option<String> {
        self.shard(shard_id)
            .and_then(|shard| shard.master.as_ref().map(Node::addr))
    }

    /// Rebuild the snapshot from the node records in the meta store.
    /// Idempotent; a refresh racing with another returns immediately.
    pub async fn refresh(&self) -> Result<()> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Cluster refresh already running, skip");
            return Ok(());
        }

        let result = self.do_refresh().await;
        self.refreshing.store(false, Ordering::Release);
        result
    }

    async fn do_refresh(&self) -> Result<()> {
        let mut nodes = self.meta_client.get_nodes().await.context(MetaFailure)?;
        // Deterministic build order regardless of store iteration order.
        nodes.sort_by_key(Node::addr);

        let mut masters: HashMap<ShardId, Node> = HashMap::new();
        let mut slaves: HashMap<ShardId, Vec<Node>> = HashMap::new();
        let mut seen_addrs: HashSet<String> = HashSet::new();

        for node in nodes {
            if !seen_addrs.insert(node.addr()) {
                warn!("Node listed twice, keeping first, addr:{}", node.addr());
                continue;
            }
            if node.is_master() {
                if let Some(current) = masters.get(&node.shard_id) {
                    warn!(
                        "Two masters for shard:{}, keeping addr:{}, dropping addr:{}",
                        node.shard_id,
                        current.addr(),
                        node.addr()
                    );
                    continue;
                }
                masters.insert(node.shard_id, node);
            } else {
                slaves.entry(node.shard_id).or_default().push(node);
            }
        }

        let old = self.shards.load_full();
        let shard_ids: HashSet<ShardId> =
            masters.keys().chain(slaves.keys()).copied().collect();

        let mut rebuilt = ShardMap::with_capacity(shard_ids.len());
        for shard_id in shard_ids {
            // The failover latch survives rebuilds of the same shard so a
            // refresh cannot reopen a failover already in flight here.
            let latch = old
                .get(&shard_id)
                .map(|shard| shard.latch())
                .unwrap_or_default();
            let shard = Shard::new(
                shard_id,
                masters.remove(&shard_id),
                slaves.remove(&shard_id).unwrap_or_default(),
                latch,
            );
            rebuilt.insert(shard_id, Arc::new(shard));
        }

        self.shards.store(Arc::new(rebuilt));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use meta_client::{keys::KeyLayout, mem::MemStore, MetaClient};

    use super::*;

    fn node(shard_id: u32, ip: &str, master_of: Option<&str>) -> Node {
        Node {
            shard_id,
            ip: ip.to_string(),
            port: "8088".to_string(),
            master_ip: master_of.map(str::to_string).unwrap_or_default(),
            master_port: master_of.map(|_| "8088".to_string()).unwrap_or_default(),
            idc: "z1".to_string(),
            heartbeat_at: 0,
        }
    }

    async fn view_with(nodes: Vec<Node>) -> (ClusterView, MetaClientRef) {
        let store = Arc::new(MemStore::default());
        let client = Arc::new(MetaClient::new(
            store,
            KeyLayout::try_new("/baudtime").unwrap(),
        ));
        for n in nodes {
            let key = client.keys().node_key(&n.addr());
            client.store().put(&key, n.to_json(), None).await.unwrap();
        }
        (ClusterView::new(client.clone()), client)
    }

    #[tokio::test]
    async fn test_refresh_classifies_roles() {
        let (view, _client) = view_with(vec![
            node(1, "10.0.0.1", None),
            node(1, "10.0.0.2", Some("10.0.0.1")),
            node(2, "10.0.0.3", None),
        ])
        .await;

        view.refresh().await.unwrap();

        let shard1 = view.shard(1).unwrap();
        assert_eq!(shard1.master.as_ref().unwrap().addr(), "10.0.0.1:8088");
        assert_eq!(shard1.slaves.len(), 1);
        assert_eq!(shard1.slaves[0].addr(), "10.0.0.2:8088");

        let shard2 = view.shard(2).unwrap();
        assert!(shard2.master.is_some());
        assert!(shard2.slaves.is_empty());

        assert_eq!(view.master_addr(1), Some("10.0.0.1:8088".to_string()));
        assert_eq!(view.master_addr(3), None);
    }

    #[tokio::test]
    async fn test_published_view_invariants() {
        let (view, _client) = view_with(vec![
            node(1, "10.0.0.1", None),
            node(1, "10.0.0.2", Some("10.0.0.1")),
            node(2, "10.0.0.3", None),
            node(2, "10.0.0.4", Some("10.0.0.3")),
        ])
        .await;
        view.refresh().await.unwrap();

        let snapshot = view.snapshot();
        let mut seen = HashSet::new();
        for (id, shard) in snapshot.iter() {
            if let Some(master) = &shard.master {
                assert_eq!(master.shard_id, *id);
                assert!(master.is_master());
                assert!(seen.insert(master.addr()));
            }
            for slave in &shard.slaves {
                assert_eq!(slave.shard_id, *id);
                assert!(!slave.is_master());
                assert!(seen.insert(slave.addr()));
            }
        }
    }

    #[tokio::test]
    async fn test_old_snapshot_stays_usable() {
        let (view, client) = view_with(vec![node(1, "10.0.0.1", None)]).await;
        view.refresh().await.unwrap();
        let before = view.snapshot();

        // Master of shard 1 disappears and the view is rebuilt.
        client
            .store()
            .delete(&client.keys().node_key("10.0.0.1:8088"))
            .await
            .unwrap();
        view.refresh().await.unwrap();

        // The reader holding the old snapshot still sees the old master.
        assert!(before.get(&1).unwrap().master.is_some());
        assert!(view.shard(1).is_none());
    }

    #[tokio::test]
    async fn test_failover_latch_survives_rebuild() {
        let (view, _client) = view_with(vec![
            node(1, "10.0.0.1", None),
            node(1, "10.0.0.2", Some("10.0.0.1")),
        ])
        .await;
        view.refresh().await.unwrap();

        let before = view.shard(1).unwrap();
        assert!(before.begin_failover());

        view.refresh().await.unwrap();
        let after = view.shard(1).unwrap();
        assert!(after.is_failovering());
        assert!(!after.begin_failover());

        // Ending on the old handle releases the shared latch.
        before.end_failover();
        assert!(after.begin_failover());
    }
}
