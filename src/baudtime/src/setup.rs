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

//! Setup gateway

use std::sync::Arc;

use cluster::{
    failover::FailoverCoordinator, topology::ClusterView, watcher::MembershipWatcher,
};
use logger::info;
use meta_client::{etcd_impl::EtcdStore, keys::KeyLayout, MetaClient};
use proxy::{AppenderRef, FanoutAppender, Proxy, ProxyRef, TimedFlusher};
use router::{table::RouteTable, RouterRef};
use runtime::Runtime;
use shard_client::ShardClientFactory;

use crate::config::Config;

/// Setup log with given `config`, returns the root logger.
pub fn setup_logger(config: &Config) -> logger::slog::Logger {
    logger::init_log(&config.log).expect("Failed to init log.")
}

fn build_runtime(name: &str, threads_num: usize) -> Runtime {
    runtime::Builder::default()
        .worker_threads(threads_num)
        .thread_name(name)
        .enable_all()
        .build()
        .expect("Failed to create runtime")
}

/// The wired-up gateway. The embedding server exposes `proxy` and
/// `appender` to its query and ingest endpoints.
pub struct Gateway {
    proxy: ProxyRef,
    appender: AppenderRef,
    watcher: MembershipWatcher,
    flusher: TimedFlusher,
}

impl Gateway {
    pub fn proxy(&self) -> ProxyRef {
        self.proxy.clone()
    }

    pub fn appender(&self) -> AppenderRef {
        self.appender.clone()
    }

    pub async fn stop(self) {
        info!("Gateway is stopping");
        self.flusher.stop().await;
        self.watcher.stop().await;
        info!("Gateway has stopped");
    }
}

/// Connect to the meta store and assemble every component.
pub async fn build_gateway(config: &Config, runtime: Arc<Runtime>) -> Gateway {
    let store = EtcdStore::connect(&config.etcd)
        .await
        .expect("Failed to connect to etcd");
    let keys = KeyLayout::try_new(&config.etcd.root_path).expect("Invalid etcd root path");
    let meta_client = Arc::new(MetaClient::new(Arc::new(store), keys));

    let view = Arc::new(ClusterView::new(meta_client.clone()));
    view.refresh()
        .await
        .expect("Failed to load the initial cluster view");

    let router: RouterRef = Arc::new(RouteTable::new(meta_client.clone(), config.router.clone()));
    let clients = Arc::new(ShardClientFactory::new(config.shard_client.clone()));

    let failover = Arc::new(FailoverCoordinator::new(
        meta_client.clone(),
        view.clone(),
        clients.clone(),
        config.cluster.clone(),
    ));
    let watcher = MembershipWatcher::new(
        meta_client,
        router.clone(),
        view.clone(),
        failover,
        config.cluster.clone(),
        runtime.clone(),
    );
    watcher.start();

    let proxy = Arc::new(Proxy::new(
        router.clone(),
        view.clone(),
        clients.clone(),
        config.proxy.clone(),
    ));
    let appender: AppenderRef = Arc::new(FanoutAppender::new(
        router,
        view,
        clients,
        config.proxy.max_batch_size,
    ));
    let flusher = TimedFlusher::start(appender.clone(), config.proxy.flush_interval.0, &runtime);

    Gateway {
        proxy,
        appender,
        watcher,
        flusher,
    }
}

/// Run the gateway until a shutdown signal arrives.
pub fn run_server(config: Config) {
    if let Err(msg) = config.validate() {
        panic!("Invalid config, err:{msg}");
    }

    let runtime = Arc::new(build_runtime("baudtime", config.runtime.worker_threads));
    info!("Gateway starts up, config:{:#?}", config);

    let rt = runtime.clone();
    runtime.block_on(async move {
        let gateway = build_gateway(&config, rt).await;
        info!("Gateway has started");

        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for shutdown signal");
        gateway.stop().await;
    });
}
