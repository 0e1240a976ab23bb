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

//! Follows the meta store's watch streams and applies membership deltas.
//!
//! Three prefixes are watched: day-route keys, shard-group route keys and
//! node keys (the latter with previous values, so a DELETE still names the
//! dead node). Any stream error tears the cycle down; the next cycle
//! starts with a full view refresh before deltas are trusted again.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use logger::{error, info, warn};
use meta_client::{
    types::{decode_shard_group, Node},
    MetaClientRef, WatchEvent,
};
use router::RouterRef;
use runtime::{JoinHandle, Runtime};
use snafu::{OptionExt, ResultExt};
use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    time,
};

use crate::{
    config::ClusterConfig, failover::FailoverCoordinatorRef, topology::ClusterViewRef,
    MetaFailure, Result, WatchStreamEnded,
};

pub struct MembershipWatcher {
    inner: Arc<Inner>,
    runtime: Arc<Runtime>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl MembershipWatcher {
    pub fn new(
        meta_client: MetaClientRef,
        router: RouterRef,
        view: ClusterViewRef,
        failover: FailoverCoordinatorRef,
        config: ClusterConfig,
        runtime: Arc<Runtime>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                meta_client,
                router,
                view,
                failover,
                config,
            }),
            runtime,
            handle: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Spawn the watch loop in the background.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let (tx, mut rx) = mpsc::channel(1);

        let handle = self.runtime.spawn(async move {
            inner.run(&mut rx).await;
        });

        *self.stop_tx.lock().unwrap() = Some(tx);
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub async fn stop(&self) {
        let tx = self.stop_tx.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }

        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

pub(crate) struct Inner {
    meta_client: MetaClientRef,
    router: RouterRef,
    view: ClusterViewRef,
    failover: FailoverCoordinatorRef,
    config: ClusterConfig,
}

impl Inner {
    async fn run(&self, stop_rx: &mut Receiver<()>) {
        info!("Membership watcher starting");
        loop {
            match self.watch_cycle(stop_rx).await {
                Ok(()) => {
                    warn!("Receive exit command and exit watch loop");
                    return;
                }
                Err(e) => {
                    error!("Watch cycle failed, resyncing, err:{}", e);
                    time::sleep(self.config.watch_retry_interval.0).await;
                }
            }
        }
    }

    /// One watch session. Returns Ok on an external stop, Err when any
    /// stream breaks and a resync is needed.
    pub(crate) async fn watch_cycle(&self, stop_rx: &mut Receiver<()>) -> Result<()> {
        // Deltas are only valid relative to a fresh snapshot.
        self.view.refresh().await?;

        let mut routes = self.meta_client.watch_routes().await.context(MetaFailure)?;
        let mut sgroutes = self
            .meta_client
            .watch_shard_group_routes()
            .await
            .context(MetaFailure)?;
        let mut nodes = self.meta_client.watch_nodes().await.context(MetaFailure)?;

        loop {
            tokio::select! {
                _ = stop_rx.recv() => return Ok(()),
                event = routes.next() => {
                    let event = event.context(WatchStreamEnded)?.context(MetaFailure)?;
                    self.on_route_event(event);
                }
                event = sgroutes.next() => {
                    let event = event.context(WatchStreamEnded)?.context(MetaFailure)?;
                    self.on_sgroute_event(event);
                }
                event = nodes.next() => {
                    let event = event.context(WatchStreamEnded)?.context(MetaFailure)?;
                    self.on_node_event(event).await?;
                }
            }
        }
    }

    fn on_route_event(&self, event: WatchEvent) {
        let keys = self.meta_client.keys();
        match event {
            WatchEvent::Put { key, value } => {
                let Some((metric, day)) = keys.parse_route_key(&key) else {
                    warn!("Unparseable route key:{}", key);
                    return;
                };
                match decode_shard_group(&value) {
                    Ok(group) => self.router.update_route(metric, day, group),
                    Err(msg) => warn!("Bad shard group under key:{}, msg:{}", key, msg),
                }
            }
            WatchEvent::Delete { key, .. } => {
                let Some((metric, day)) = keys.parse_route_key(&key) else {
                    warn!("Unparseable route key:{}", key);
                    return;
                };
                self.router.invalidate(metric, day);
            }
        }
    }

    fn on_sgroute_event(&self, event: WatchEvent) {
        let keys = self.meta_client.keys();
        match event {
            WatchEvent::Put { key, value } => {
                let Some(metric) = keys.parse_sgroute_key(&key) else {
                    warn!("Unparseable sgroute key:{}", key);
                    return;
                };
                match String::from_utf8(value) {
                    Ok(route_key) => {
                        self.router.set_shard_group_route_key(metric, Some(route_key))
                    }
                    Err(_) => warn!("Non utf-8 sgroute value under key:{}", key),
                }
            }
            WatchEvent::Delete { key, .. } => {
                let Some(metric) = keys.parse_sgroute_key(&key) else {
                    warn!("Unparseable sgroute key:{}", key);
                    return;
                };
                self.router.set_shard_group_route_key(metric, None);
            }
        }
    }

    async fn on_node_event(&self, event: WatchEvent) -> Result<()> {
        match event {
            WatchEvent::Put { key, .. } => {
                info!("Node joined or changed, key:{}", key);
            }
            WatchEvent::Delete { key, prev_value } => {
                match prev_value.as_deref().map(Node::from_json) {
                    Some(Ok(dead)) => {
                        info!("Node vanished, addr:{}, shard:{}", dead.addr(), dead.shard_id);
                        // Failover errors are logged and left to the next
                        // node event to re-drive.
                        if let Err(e) = self.failover.failover_if_needed(&dead).await {
                            error!(
                                "Failover attempt failed, shard:{}, err:{}",
                                dead.shard_id, e
                            );
                        }
                    }
                    Some(Err(e)) => warn!("Bad node record under key:{}, err:{}", key, e),
                    None => warn!("Node delete without previous value, key:{}", key),
                }
            }
        }
        // Either way the member set changed.
        self.view.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, time::Duration};

    use async_trait::async_trait;
    use meta_client::{keys::KeyLayout, mem::MemStore, types::encode_shard_group, MetaClient};
    use router::{config::RouterConfig, table::RouteTable, Router};
    use shard_client::SlaveOfSender;

    use super::*;
    use crate::{failover::FailoverCoordinator, topology::ClusterView};

    struct RecordingSender {
        sent: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl SlaveOfSender for RecordingSender {
        async fn slave_of(&self, addr: &str, _master_addr: &str) -> shard_client::Result<()> {
            self.sent.lock().unwrap().push(addr.to_string());
            Ok(())
        }
    }

    struct Fixture {
        inner: Arc<Inner>,
        client: Arc<MetaClient>,
        router: Arc<RouteTable>,
        view: ClusterViewRef,
        sender: Arc<RecordingSender>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::default());
        let client = Arc::new(MetaClient::new(
            store,
            KeyLayout::try_new("/baudtime").unwrap(),
        ));
        let router = Arc::new(RouteTable::new(client.clone(), RouterConfig::default()));
        let view = Arc::new(ClusterView::new(client.clone()));
        let sender = Arc::new(RecordingSender {
            sent: StdMutex::new(Vec::new()),
        });
        let failover = Arc::new(FailoverCoordinator::new(
            client.clone(),
            view.clone(),
            sender.clone(),
            ClusterConfig::default(),
        ));
        let inner = Arc::new(Inner {
            meta_client: client.clone(),
            router: router.clone(),
            view: view.clone(),
            failover,
            config: ClusterConfig::default(),
        });
        Fixture {
            inner,
            client,
            router,
            view,
            sender,
        }
    }

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

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_route_events_flow_into_cache() {
        let fx = fixture();
        let route_key = fx.client.keys().route_key("cpu", 100);

        // No masters are registered, so only the cache can answer this.
        fx.inner.on_route_event(WatchEvent::Put {
            key: route_key.clone(),
            value: encode_shard_group(&[1, 2]),
        });
        let route = fx.router.get_shard_ids("cpu", 100).await.unwrap();
        assert_eq!(route.shard_ids, vec![1, 2]);

        // Deleting the timeline day evicts the whole metric; the next
        // lookup falls through to allocation, which has no masters.
        fx.inner.on_route_event(WatchEvent::Delete {
            key: route_key,
            prev_value: None,
        });
        assert!(fx.router.get_shard_ids("cpu", 100).await.is_err());
    }

    #[tokio::test]
    async fn test_node_delete_drives_failover_and_refresh() {
        let fx = fixture();
        let master = node(1, "10.0.0.1", None);
        let slave = node(1, "10.0.0.2", Some("10.0.0.1"));
        for n in [&master, &slave] {
            let key = fx.client.keys().node_key(&n.addr());
            fx.client
                .store()
                .put(&key, n.to_json(), None)
                .await
                .unwrap();
        }

        let (stop_tx, mut stop_rx) = mpsc::channel(1);
        let inner = fx.inner.clone();
        let cycle = tokio::spawn(async move { inner.watch_cycle(&mut stop_rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        fx.client
            .store()
            .delete(&fx.client.keys().node_key(&master.addr()))
            .await
            .unwrap();

        let sender = fx.sender.clone();
        wait_until(move || !sender.sent.lock().unwrap().is_empty()).await;
        assert_eq!(
            fx.sender.sent.lock().unwrap().as_slice(),
            &["10.0.0.2:8088".to_string()]
        );

        // The refresh that followed no longer lists the dead master.
        let view = fx.view.clone();
        wait_until(move || {
            view.shard(1)
                .map(|s| s.master.is_none())
                .unwrap_or(false)
        })
        .await;

        stop_tx.send(()).await.unwrap();
        cycle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sgroute_events_update_pointer() {
        let fx = fixture();
        let key = fx.client.keys().sgroute_key("cpu");

        fx.inner.on_sgroute_event(WatchEvent::Put {
            key: key.clone(),
            value: b"policy-7".to_vec(),
        });
        assert_eq!(
            fx.router.shard_group_route_key("cpu"),
            Some("policy-7".to_string())
        );

        fx.inner.on_sgroute_event(WatchEvent::Delete {
            key,
            prev_value: None,
        });
        assert_eq!(fx.router.shard_group_route_key("cpu"), None);
    }
}
