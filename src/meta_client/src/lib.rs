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

//! Client of the consensus store holding cluster metadata.
//!
//! [MetaStore] is the primitive surface (get/put/watch/lease/mutex) with an
//! etcd implementation in [etcd_impl]; [MetaClient] layers the typed key
//! space on top of it: node records, per-day route entries, shard-group
//! route keys and the failover mutex.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::Stream;
use logger::warn;
use macros::define_result;
use snafu::{Backtrace, OptionExt, Snafu};

use crate::{
    keys::KeyLayout,
    types::{decode_shard_group, encode_shard_group, Node, ShardGroup},
};

pub mod config;
pub mod etcd_impl;
pub mod heartbeat;
pub mod keys;
#[cfg(any(test, feature = "test"))]
pub mod mem;
pub mod types;

/// Boxed error carried by [Error::StoreFailure].
pub type GenericError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to access meta store, msg:{}, err:{}", msg, source))]
    StoreFailure {
        msg: String,
        #[snafu(source(from(etcd_client::Error, Box::new)))]
        source: GenericError,
    },

    #[snafu(display("Key not found in meta store, key:{}", key))]
    KeyNotFound { key: String, backtrace: Backtrace },

    #[snafu(display("Invalid value under key:{}, msg:{}", key, msg))]
    InvalidValue {
        key: String,
        msg: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid arguments, msg:{}", msg))]
    InvalidArguments { msg: String, backtrace: Backtrace },

    #[snafu(display("Watch stream was closed by the meta store"))]
    WatchClosed { backtrace: Backtrace },
}

define_result!(Error);

/// Lease identifier granted by the store.
pub type LeaseId = i64;

/// A single membership/routing change delivered by a watch stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: Vec<u8>,
    },
    /// Deletes carry the previous value when the watch was opened with
    /// `with_prev_value`, which node watches rely on to recover the dead
    /// node's identity.
    Delete {
        key: String,
        prev_value: Option<Vec<u8>>,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } => key,
            WatchEvent::Delete { key, .. } => key,
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

/// Primitive operations the rest of the gateway consumes. Implementations
/// must be safe to share across tasks.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// All `(key, value)` pairs under `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<()>;

    /// Create `key` only if it does not exist yet. Returns `None` when this
    /// call created it, or the current value when another writer won.
    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// One keep-alive tick for a previously granted lease.
    async fn keep_lease_alive(&self, lease: LeaseId) -> Result<()>;

    /// Watch all keys under `prefix`, starting from the current revision.
    async fn watch_prefix(&self, prefix: &str, with_prev_value: bool) -> Result<EventStream>;

    /// Acquire the named global mutex, returning an opaque ownership key to
    /// pass to [MetaStore::unlock]. The lock is leased so a crashed holder
    /// releases it after `lease_ttl`.
    async fn lock(&self, name: &str, lease_ttl: Duration) -> Result<Vec<u8>>;

    async fn unlock(&self, lock_key: Vec<u8>) -> Result<()>;
}

pub type MetaStoreRef = Arc<dyn MetaStore>;

/// Typed view over the gateway's key space.
pub struct MetaClient {
    store: MetaStoreRef,
    keys: KeyLayout,
}

pub type MetaClientRef = Arc<MetaClient>;

impl MetaClient {
    pub fn new(store: MetaStoreRef, keys: KeyLayout) -> Self {
        Self { store, keys }
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn store(&self) -> &MetaStoreRef {
        &self.store
    }

    /// All registered nodes, regardless of role.
    pub async fn get_nodes(&self) -> Result<Vec<Node>> {
        let kvs = self.store.get_prefix(&self.keys.node_prefix()).await?;
        let mut nodes = Vec::with_capacity(kvs.len());
        for (key, value) in kvs {
            let node = Node::from_json(&value)
                .map_err(|e| InvalidValue { key, msg: e.to_string() }.build())?;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// All nodes currently acting as a shard master.
    pub async fn get_masters(&self) -> Result<Vec<Node>> {
        let mut masters: Vec<Node> = self
            .get_nodes()
            .await?
            .into_iter()
            .filter(Node::is_master)
            .collect();
        // Sort so group allocation is reproducible across gateways.
        masters.sort_by_key(|n| n.shard_id);
        Ok(masters)
    }

    /// The shard group stored for `(metric, day)`, if any.
    pub async fn get_route(
        &self,
        metric: &str,
        day: common_types::time::Day,
    ) -> Result<Option<ShardGroup>> {
        let key = self.keys.route_key(metric, day);
        match self.store.get(&key).await? {
            Some(value) => {
                let group = decode_shard_group(&value)
                    .map_err(|msg| InvalidValue { key, msg }.build())?;
                Ok(Some(group))
            }
            None => Ok(None),
        }
    }

    /// Write the shard group for `(metric, day)` under a fresh lease of
    /// `ttl`. When another gateway wins the race, its group is returned
    /// instead and no second write happens.
    pub async fn put_route_if_absent(
        &self,
        metric: &str,
        day: common_types::time::Day,
        group: &[common_types::ShardId],
        ttl: Duration,
    ) -> Result<Option<ShardGroup>> {
        let key = self.keys.route_key(metric, day);
        let lease = self.store.grant_lease(ttl).await?;
        match self
            .store
            .put_if_absent(&key, encode_shard_group(group), Some(lease))
            .await?
        {
            None => Ok(None),
            Some(current) => {
                let winner = decode_shard_group(&current)
                    .map_err(|msg| InvalidValue { key, msg }.build())?;
                Ok(Some(winner))
            }
        }
    }

    /// The opaque shard-group route key of `metric`, if any.
    pub async fn get_shard_group_route_key(&self, metric: &str) -> Result<Option<String>> {
        let key = self.keys.sgroute_key(metric);
        match self.store.get(&key).await? {
            Some(value) => {
                let value = String::from_utf8(value).map_err(|_| {
                    InvalidValue {
                        key,
                        msg: "not utf-8",
                    }
                    .build()
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn watch_routes(&self) -> Result<EventStream> {
        self.store
            .watch_prefix(&self.keys.route_prefix(), false)
            .await
    }

    pub async fn watch_shard_group_routes(&self) -> Result<EventStream> {
        self.store
            .watch_prefix(&self.keys.sgroute_prefix(), false)
            .await
    }

    /// Node watches ask for previous values so a DELETE still identifies
    /// the vanished node.
    pub async fn watch_nodes(&self) -> Result<EventStream> {
        self.store.watch_prefix(&self.keys.node_prefix(), true).await
    }

    /// Run `f` while holding the named global mutex. The lock is released
    /// on both the success and the error path; a failed release is logged
    /// and left to lease expiry.
    pub async fn with_lock<T, F, Fut>(&self, name: &str, lease_ttl: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mutex_key = self.keys.mutex_key(name);
        let lock_key = self.store.lock(&mutex_key, lease_ttl).await?;
        let ret = f().await;
        if let Err(e) = self.store.unlock(lock_key).await {
            warn!("Failed to release mutex, left to lease expiry, name:{}, err:{}", name, e);
        }
        Ok(ret)
    }

    /// Fetch a node record by address.
    pub async fn get_node(&self, addr: &str) -> Result<Node> {
        let key = self.keys.node_key(addr);
        let value = self
            .store
            .get(&key)
            .await?
            .context(KeyNotFound { key: key.clone() })?;
        Node::from_json(&value).map_err(|e| InvalidValue { key, msg: e.to_string() }.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keys::KeyLayout, mem::MemStore};

    fn client() -> MetaClient {
        let store = Arc::new(MemStore::default());
        MetaClient::new(store, KeyLayout::try_new("/baudtime").unwrap())
    }

    fn node(shard_id: u32, ip: &str, master: bool) -> Node {
        Node {
            shard_id,
            ip: ip.to_string(),
            port: "8088".to_string(),
            master_ip: if master { String::new() } else { "1.1.1.1".to_string() },
            master_port: if master { String::new() } else { "8088".to_string() },
            idc: "z1".to_string(),
            heartbeat_at: 0,
        }
    }

    #[tokio::test]
    async fn test_get_masters_sorted() {
        let client = client();
        for n in [node(3, "c", true), node(1, "a", true), node(2, "b", false)] {
            let key = client.keys().node_key(&n.addr());
            client
                .store()
                .put(&key, n.to_json(), None)
                .await
                .unwrap();
        }

        let masters = client.get_masters().await.unwrap();
        assert_eq!(
            masters.iter().map(|n| n.shard_id).collect::<Vec<_>>(),
            vec![1, 3]
        );
    }

    #[tokio::test]
    async fn test_route_round_trip() {
        let client = client();
        assert!(client.get_route("cpu", 19723).await.unwrap().is_none());

        let won = client
            .put_route_if_absent("cpu", 19723, &[1, 2], Duration::from_secs(60))
            .await
            .unwrap();
        assert!(won.is_none());

        let raced = client
            .put_route_if_absent("cpu", 19723, &[3, 4], Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(raced, Some(vec![1, 2]));

        assert_eq!(
            client.get_route("cpu", 19723).await.unwrap(),
            Some(vec![1, 2])
        );
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let client = client();
        let out = client
            .with_lock("failover", Duration::from_secs(5), || async { 7 })
            .await
            .unwrap();
        assert_eq!(out, 7);

        // Reacquirable after release.
        let out = client
            .with_lock("failover", Duration::from_secs(5), || async { 8 })
            .await
            .unwrap();
        assert_eq!(out, 8);
    }
}
