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

//! Node registration with a heartbeated session lease.
//!
//! The node key disappears when the session lease expires, which is the
//! cluster's failure signal. Gateways never register themselves; storage
//! nodes embedding this crate do.

use std::{sync::Arc, time::Duration};

use logger::{error, info, warn};
use runtime::{JoinHandle, Runtime};
use time_ext::current_time_millis;
use tokio::{
    sync::mpsc::{self, Sender},
    time,
};

use crate::{types::Node, MetaClientRef, Result};

/// A running registration: refreshes the node record and its lease until
/// stopped or dropped.
pub struct NodeRegistration {
    handle: Option<JoinHandle<()>>,
    stop_tx: Sender<()>,
}

impl NodeRegistration {
    /// Register `node` under a lease of `session_expire_ttl` and start the
    /// heartbeat loop on `runtime`, refreshing every `heartbeat_interval`.
    pub async fn start(
        meta_client: MetaClientRef,
        runtime: &Runtime,
        mut node: Node,
        session_expire_ttl: Duration,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let lease = meta_client.store().grant_lease(session_expire_ttl).await?;
        let key = meta_client.keys().node_key(&node.addr());

        node.heartbeat_at = current_time_millis();
        meta_client
            .store()
            .put(&key, node.to_json(), Some(lease))
            .await?;
        info!("Node registered, addr:{}, shard:{}", node.addr(), node.shard_id);

        let (tx, mut rx) = mpsc::channel(1);
        let error_wait = heartbeat_interval / 2;
        let client = meta_client;
        let handle = runtime.spawn(async move {
            loop {
                node.heartbeat_at = current_time_millis();
                let beat = async {
                    client.store().keep_lease_alive(lease).await?;
                    client.store().put(&key, node.to_json(), Some(lease)).await
                };
                let wait = match beat.await {
                    Ok(()) => heartbeat_interval,
                    Err(e) => {
                        error!("Node heartbeat failed, addr:{}, err:{}", node.addr(), e);
                        error_wait
                    }
                };

                if time::timeout(wait, rx.recv()).await.is_ok() {
                    warn!("Receive exit command and exit heartbeat loop");
                    break;
                }
            }
        });

        Ok(Self {
            handle: Some(handle),
            stop_tx: tx,
        })
    }

    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(()).await;
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Helper to build a registration from shared components.
pub async fn register_node(
    meta_client: MetaClientRef,
    runtime: &Arc<Runtime>,
    node: Node,
    session_expire_ttl: Duration,
    heartbeat_interval: Duration,
) -> Result<NodeRegistration> {
    NodeRegistration::start(
        meta_client,
        runtime,
        node,
        session_expire_ttl,
        heartbeat_interval,
    )
    .await
}
