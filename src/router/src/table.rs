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

//! The per-process route cache and shard-group allocator.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use common_types::{label::Labels, time::Day, ShardId};
use dashmap::DashMap;
use lazy_static::lazy_static;
use logger::{debug, info};
use meta_client::{types::ShardGroup, MetaClientRef};
use prometheus::{register_int_counter, IntCounter};
use snafu::{ensure, ResultExt};
use tokio::sync::Mutex;

use crate::{
    config::RouterConfig, EmptyShardGroup, MetaFailure, Result, Route, Router, RoutingFailed,
};

lazy_static! {
    static ref ROUTE_ALLOC_COUNTER: IntCounter = register_int_counter!(
        "route_group_alloc_total",
        "Number of shard groups allocated by this gateway"
    )
    .unwrap();
}

/// No day routed yet.
const NO_TIMELINE: i64 = i64::MIN;

/// Cached routes of one metric. The fill lock serialises the
/// miss → store read → allocate → write section so a burst of misses for
/// the same metric costs one round-trip; hits only take the read lock.
struct RouteInfo {
    fill_lock: Mutex<()>,
    days: RwLock<HashMap<Day, ShardGroup>>,
    /// The most recently routed day. When the store drops this day the
    /// whole metric is stale and gets evicted.
    timeline: AtomicI64,
    shard_group_route_key: RwLock<Option<String>>,
}

impl RouteInfo {
    fn new() -> Self {
        Self {
            fill_lock: Mutex::new(()),
            days: RwLock::new(HashMap::new()),
            timeline: AtomicI64::new(NO_TIMELINE),
            shard_group_route_key: RwLock::new(None),
        }
    }

    fn lookup(&self, day: Day) -> Option<ShardGroup> {
        self.days.read().unwrap().get(&day).cloned()
    }

    fn adopt(&self, day: Day, group: ShardGroup) {
        self.days.write().unwrap().insert(day, group);
        self.timeline.fetch_max(day, Ordering::AcqRel);
    }

    fn route_key(&self) -> Option<String> {
        self.shard_group_route_key.read().unwrap().clone()
    }
}

pub struct RouteTable {
    meta_client: MetaClientRef,
    config: RouterConfig,
    metrics: DashMap<String, Arc<RouteInfo>>,
}

impl RouteTable {
    pub fn new(meta_client: MetaClientRef, config: RouterConfig) -> Self {
        Self {
            meta_client,
            config,
            metrics: DashMap::new(),
        }
    }

    fn info_of(&self, metric: &str) -> Arc<RouteInfo> {
        self.metrics
            .entry(metric.to_string())
            .or_insert_with(|| Arc::new(RouteInfo::new()))
            .value()
            .clone()
    }

    /// Allocate a fresh group: the first `shard_group_cap` master shards in
    /// ascending shard-id order, so every gateway derives the same group.
    async fn allocate(&self, metric: &str, day: Day) -> Result<ShardGroup> {
        let masters = self.meta_client.get_masters().await.context(MetaFailure)?;
        ensure!(
            masters.len() >= self.config.shard_group_cap,
            RoutingFailed {
                available: masters.len(),
                need: self.config.shard_group_cap,
            }
        );

        let group: ShardGroup = masters
            .iter()
            .take(self.config.shard_group_cap)
            .map(|node| node.shard_id)
            .collect();

        let winner = self
            .meta_client
            .put_route_if_absent(metric, day, &group, self.config.route_info_ttl.0)
            .await
            .context(MetaFailure)?;

        match winner {
            None => {
                ROUTE_ALLOC_COUNTER.inc();
                info!(
                    "Allocated shard group, metric:{}, day:{}, group:{:?}",
                    metric, day, group
                );
                Ok(group)
            }
            // Another gateway wrote first, its group is authoritative.
            Some(theirs) => {
                debug!(
                    "Lost route allocation race, metric:{}, day:{}, adopted:{:?}",
                    metric, day, theirs
                );
                Ok(theirs)
            }
        }
    }
}

#[async_trait]
impl Router for RouteTable {
    async fn get_shard_ids(&self, metric: &str, day: Day) -> Result<Route> {
        let info = self.info_of(metric);
        if let Some(group) = info.lookup(day) {
            return Ok(Route {
                shard_ids: group,
                shard_group_route_key: info.route_key(),
            });
        }

        let _fill = info.fill_lock.lock().await;
        // A concurrent filler may have run while we queued on the lock.
        if let Some(group) = info.lookup(day) {
            return Ok(Route {
                shard_ids: group,
                shard_group_route_key: info.route_key(),
            });
        }

        let group = match self
            .meta_client
            .get_route(metric, day)
            .await
            .context(MetaFailure)?
        {
            Some(group) => group,
            None => self.allocate(metric, day).await?,
        };
        ensure!(
            !group.is_empty(),
            EmptyShardGroup {
                metric: metric.to_string(),
                day,
            }
        );
        info.adopt(day, group.clone());

        Ok(Route {
            shard_ids: group,
            shard_group_route_key: info.route_key(),
        })
    }

    async fn shard_for(&self, day: Day, labels: &Labels, hash: u64) -> Result<ShardId> {
        let metric = labels.metric_name().unwrap_or_default().to_string();
        let route = self.get_shard_ids(&metric, day).await?;
        let idx = (hash % route.shard_ids.len() as u64) as usize;
        Ok(route.shard_ids[idx])
    }

    fn update_route(&self, metric: &str, day: Day, group: ShardGroup) {
        if group.is_empty() {
            return;
        }
        self.info_of(metric).adopt(day, group);
    }

    fn invalidate(&self, metric: &str, day: Day) {
        let drop_metric = match self.metrics.get(metric) {
            None => return,
            Some(entry) => {
                let info = entry.value();
                if info.timeline.load(Ordering::Acquire) == day {
                    true
                } else {
                    info.days.write().unwrap().remove(&day);
                    false
                }
            }
        };
        // The guard from `get` must be gone before removing the key.
        if drop_metric {
            self.metrics.remove(metric);
            info!("Dropped route cache of metric:{}, timeline day:{}", metric, day);
        }
    }

    fn set_shard_group_route_key(&self, metric: &str, key: Option<String>) {
        let info = self.info_of(metric);
        *info.shard_group_route_key.write().unwrap() = key;
    }

    fn shard_group_route_key(&self, metric: &str) -> Option<String> {
        self.metrics
            .get(metric)
            .and_then(|entry| entry.value().route_key())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering as AtomicOrdering},
        time::Duration,
    };

    use meta_client::{
        keys::KeyLayout, mem::MemStore, types::Node, EventStream, LeaseId, MetaClient, MetaStore,
        MetaStoreRef,
    };

    use super::*;
    use crate::Error;

    /// Counts writes going through to the backing store.
    struct CountingStore {
        inner: MetaStoreRef,
        puts: AtomicUsize,
    }

    #[async_trait]
    impl MetaStore for CountingStore {
        async fn get(&self, key: &str) -> meta_client::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }

        async fn get_prefix(
            &self,
            prefix: &str,
        ) -> meta_client::Result<Vec<(String, Vec<u8>)>> {
            self.inner.get_prefix(prefix).await
        }

        async fn put(
            &self,
            key: &str,
            value: Vec<u8>,
            lease: Option<LeaseId>,
        ) -> meta_client::Result<()> {
            self.inner.put(key, value, lease).await
        }

        async fn put_if_absent(
            &self,
            key: &str,
            value: Vec<u8>,
            lease: Option<LeaseId>,
        ) -> meta_client::Result<Option<Vec<u8>>> {
            self.puts.fetch_add(1, AtomicOrdering::SeqCst);
            self.inner.put_if_absent(key, value, lease).await
        }

        async fn delete(&self, key: &str) -> meta_client::Result<()> {
            self.inner.delete(key).await
        }

        async fn grant_lease(&self, ttl: Duration) -> meta_client::Result<LeaseId> {
            self.inner.grant_lease(ttl).await
        }

        async fn keep_lease_alive(&self, lease: LeaseId) -> meta_client::Result<()> {
            self.inner.keep_lease_alive(lease).await
        }

        async fn watch_prefix(
            &self,
            prefix: &str,
            with_prev_value: bool,
        ) -> meta_client::Result<EventStream> {
            self.inner.watch_prefix(prefix, with_prev_value).await
        }

        async fn lock(&self, name: &str, lease_ttl: Duration) -> meta_client::Result<Vec<u8>> {
            self.inner.lock(name, lease_ttl).await
        }

        async fn unlock(&self, lock_key: Vec<u8>) -> meta_client::Result<()> {
            self.inner.unlock(lock_key).await
        }
    }

    fn master(shard_id: u32, ip: &str) -> Node {
        Node {
            shard_id,
            ip: ip.to_string(),
            port: "8088".to_string(),
            master_ip: String::new(),
            master_port: String::new(),
            idc: "z1".to_string(),
            heartbeat_at: 0,
        }
    }

    async fn seed_masters(client: &MetaClient, shard_ids: &[u32]) {
        for (idx, shard_id) in shard_ids.iter().enumerate() {
            let node = master(*shard_id, &format!("10.0.0.{idx}"));
            let key = client.keys().node_key(&node.addr());
            client.store().put(&key, node.to_json(), None).await.unwrap();
        }
    }

    fn table_over(store: MetaStoreRef, cap: usize) -> (Arc<RouteTable>, MetaClientRef) {
        let client = Arc::new(MetaClient::new(
            store,
            KeyLayout::try_new("/baudtime").unwrap(),
        ));
        let config = RouterConfig {
            shard_group_cap: cap,
            ..Default::default()
        };
        (Arc::new(RouteTable::new(client.clone(), config)), client)
    }

    #[tokio::test]
    async fn test_cold_miss_allocates_and_caches() {
        let counting = Arc::new(CountingStore {
            inner: Arc::new(MemStore::default()),
            puts: AtomicUsize::new(0),
        });
        let (table, client) = table_over(counting.clone(), 2);
        seed_masters(&client, &[3, 1, 2]).await;

        let route = table.get_shard_ids("cpu", 19723).await.unwrap();
        // Masters sorted by shard id, first two taken.
        assert_eq!(route.shard_ids, vec![1, 2]);

        // The second lookup is served from the cache without a write.
        let again = table.get_shard_ids("cpu", 19723).await.unwrap();
        assert_eq!(again.shard_ids, vec![1, 2]);
        assert_eq!(counting.puts.load(AtomicOrdering::SeqCst), 1);

        // Any other gateway reads the same group back.
        assert_eq!(
            client.get_route("cpu", 19723).await.unwrap(),
            Some(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn test_concurrent_cold_misses_issue_one_write() {
        let counting = Arc::new(CountingStore {
            inner: Arc::new(MemStore::default()),
            puts: AtomicUsize::new(0),
        });
        let (table, client) = table_over(counting.clone(), 2);
        seed_masters(&client, &[1, 2, 3]).await;

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                table.get_shard_ids("cpu", 19723).await.unwrap().shard_ids
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap(), vec![1, 2]);
        }
        assert_eq!(counting.puts.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_enough_masters() {
        let store: MetaStoreRef = Arc::new(MemStore::default());
        let (table, client) = table_over(store, 2);
        seed_masters(&client, &[1]).await;

        let err = table.get_shard_ids("cpu", 19723).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RoutingFailed {
                available: 1,
                need: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_adopts_group_written_by_other_gateway() {
        let store: MetaStoreRef = Arc::new(MemStore::default());
        let (table, client) = table_over(store, 2);
        seed_masters(&client, &[1, 2]).await;

        // Another gateway wrote its own (different) allocation first.
        client
            .put_route_if_absent("cpu", 19723, &[7, 8], Duration::from_secs(60))
            .await
            .unwrap();

        let route = table.get_shard_ids("cpu", 19723).await.unwrap();
        assert_eq!(route.shard_ids, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_invalidate_timeline_day_drops_metric() {
        let store: MetaStoreRef = Arc::new(MemStore::default());
        let (table, _client) = table_over(store, 2);

        table.update_route("cpu", 100, vec![1, 2]);
        table.update_route("cpu", 101, vec![1, 2]);

        // Dropping a non-timeline day keeps the rest of the metric.
        table.invalidate("cpu", 100);
        assert!(table.metrics.get("cpu").is_some());
        assert!(table.metrics.get("cpu").unwrap().lookup(101).is_some());

        // Dropping the timeline day evicts the whole metric.
        table.invalidate("cpu", 101);
        assert!(table.metrics.get("cpu").is_none());
    }

    #[tokio::test]
    async fn test_shard_for_spreads_by_hash() {
        let store: MetaStoreRef = Arc::new(MemStore::default());
        let (table, client) = table_over(store, 2);
        seed_masters(&client, &[1, 2]).await;

        let labels = Labels::from(vec![("__name__", "cpu"), ("host", "a")]);
        let day = 19723;
        assert_eq!(table.shard_for(day, &labels, 0).await.unwrap(), 1);
        assert_eq!(table.shard_for(day, &labels, 1).await.unwrap(), 2);
        assert_eq!(table.shard_for(day, &labels, 5).await.unwrap(), 2);
    }
}
