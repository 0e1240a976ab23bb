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

//! Write fan-out.
//!
//! Samples are routed to their day's shard and buffered per shard; a
//! buffer flushes when it fills, and a background loop sweeps half-filled
//! buffers on an interval. Writes are best-effort per shard: a flush
//! reports every shard's failure but aborts none of the others.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use cluster::topology::ClusterViewRef;
use common_types::{label::Labels, sample::{Sample, Series}, time::day_of, ShardId};
use dashmap::DashMap;
use lazy_static::lazy_static;
use logger::{error, warn};
use prometheus::{register_int_counter, IntCounter};
use router::RouterRef;
use runtime::{JoinHandle, Runtime};
use shard_client::{protocol::AddRequest, ShardClientProviderRef};
use snafu::{OptionExt, ResultExt};
use tokio::{
    sync::{
        mpsc::{self, Sender},
        Mutex,
    },
    time,
};

use crate::{fold_errors, NoMaster, Result, RouteFailure, ShardRpc};

lazy_static! {
    static ref SAMPLES_ROUTED_COUNTER: IntCounter = register_int_counter!(
        "fanout_samples_routed_total",
        "Samples routed to a shard batch"
    )
    .unwrap();
}

#[async_trait]
pub trait Appender: Send + Sync {
    /// Route one sample. `hash` is the caller's stable hash of the label
    /// set, see [Labels::stable_hash].
    async fn add(&self, labels: Labels, timestamp: i64, value: f64, hash: u64) -> Result<()>;

    /// Flush every shard's buffer, collecting failures without aborting
    /// the rest.
    async fn flush(&self) -> Result<()>;
}

pub type AppenderRef = Arc<dyn Appender>;

/// Buffer of one shard.
struct ShardAppender {
    shard_id: ShardId,
    view: ClusterViewRef,
    clients: ShardClientProviderRef,
    max_batch_size: usize,
    buf: Mutex<Vec<Series>>,
}

impl ShardAppender {
    async fn add(&self, series: Series) -> Result<()> {
        let full_batch = {
            let mut buf = self.buf.lock().await;
            buf.push(series);
            if buf.len() >= self.max_batch_size {
                Some(std::mem::take(&mut *buf))
            } else {
                None
            }
        };
        match full_batch {
            Some(batch) => self.send(batch).await,
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.buf.lock().await);
        if batch.is_empty() {
            return Ok(());
        }
        self.send(batch).await
    }

    async fn send(&self, batch: Vec<Series>) -> Result<()> {
        let addr = self.view.master_addr(self.shard_id).context(NoMaster {
            shard_id: self.shard_id,
        })?;
        self.clients
            .client_for(&addr)
            .add(AddRequest { series: batch })
            .await
            .context(ShardRpc {
                shard_id: self.shard_id,
            })
    }
}

pub struct FanoutAppender {
    router: RouterRef,
    view: ClusterViewRef,
    clients: ShardClientProviderRef,
    max_batch_size: usize,
    appenders: DashMap<ShardId, Arc<ShardAppender>>,
}

impl FanoutAppender {
    pub fn new(
        router: RouterRef,
        view: ClusterViewRef,
        clients: ShardClientProviderRef,
        max_batch_size: usize,
    ) -> Self {
        Self {
            router,
            view,
            clients,
            max_batch_size: max_batch_size.max(1),
            appenders: DashMap::new(),
        }
    }

    fn appender_of(&self, shard_id: ShardId) -> Arc<ShardAppender> {
        self.appenders
            .entry(shard_id)
            .or_insert_with(|| {
                Arc::new(ShardAppender {
                    shard_id,
                    view: self.view.clone(),
                    clients: self.clients.clone(),
                    max_batch_size: self.max_batch_size,
                    buf: Mutex::new(Vec::new()),
                })
            })
            .value()
            .clone()
    }
}

#[async_trait]
impl Appender for FanoutAppender {
    async fn add(&self, labels: Labels, timestamp: i64, value: f64, hash: u64) -> Result<()> {
        let day = day_of(timestamp);
        let shard_id = self
            .router
            .shard_for(day, &labels, hash)
            .await
            .context(RouteFailure)?;
        SAMPLES_ROUTED_COUNTER.inc();

        let series = Series::new(labels, vec![Sample::new(timestamp, value)]);
        self.appender_of(shard_id).add(series).await
    }

    async fn flush(&self) -> Result<()> {
        let appenders: Vec<Arc<ShardAppender>> = self
            .appenders
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let results =
            futures::future::join_all(appenders.iter().map(|appender| appender.flush())).await;
        let errors: Vec<crate::Error> = results.into_iter().filter_map(|r| r.err()).collect();
        fold_errors(errors)
    }
}

/// Background sweep of half-filled batches, the time half of the
/// size/time flush contract.
pub struct TimedFlusher {
    handle: StdMutex<Option<JoinHandle<()>>>,
    stop_tx: StdMutex<Option<Sender<()>>>,
}

impl TimedFlusher {
    pub fn start(
        appender: AppenderRef,
        interval: std::time::Duration,
        runtime: &Runtime,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = runtime.spawn(async move {
            loop {
                if time::timeout(interval, rx.recv()).await.is_ok() {
                    // Final sweep so stopping loses nothing buffered.
                    if let Err(e) = appender.flush().await {
                        error!("Final flush failed, err:{}", e);
                    }
                    warn!("Receive exit command and exit flush loop");
                    break;
                }
                if let Err(e) = appender.flush().await {
                    error!("Timed flush failed, err:{}", e);
                }
            }
        });

        Self {
            handle: StdMutex::new(Some(handle)),
            stop_tx: StdMutex::new(Some(tx)),
        }
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
