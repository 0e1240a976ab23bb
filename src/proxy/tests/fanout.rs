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

//! End-to-end fan-out over scripted in-memory shards.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use cluster::topology::ClusterView;
use common_types::{
    label::Labels,
    matcher::{MatchType, Matcher},
    sample::{Sample, Series},
};
use meta_client::{keys::KeyLayout, mem::MemStore, types::Node, MetaClient};
use proxy::{Appender, FanoutAppender, Proxy, ProxyConfig};
use router::{config::RouterConfig, table::RouteTable, Router};
use shard_client::{
    protocol::{AddRequest, LabelValuesRequest, SelectRequest},
    ShardClient, ShardClientProvider, ShardClientRef,
};

/// A shard backend that stores what it is given and answers equality
/// matchers.
#[derive(Default)]
struct FakeShard {
    series: Mutex<Vec<Series>>,
}

impl FakeShard {
    fn push(&self, series: Series) {
        self.series.lock().unwrap().push(series);
    }

    fn matches(labels: &Labels, matchers: &[Matcher]) -> bool {
        matchers.iter().all(|m| match m.match_type {
            MatchType::Equal => labels.get(&m.name) == Some(m.value.as_str()),
            MatchType::NotEqual => labels.get(&m.name) != Some(m.value.as_str()),
            // The gateway never asks fake shards regex questions here.
            _ => true,
        })
    }
}

#[async_trait]
impl ShardClient for FakeShard {
    async fn select(&self, request: SelectRequest) -> shard_client::Result<Vec<Series>> {
        let mut out = Vec::new();
        for stored in self.series.lock().unwrap().iter() {
            if !Self::matches(&stored.labels, &request.matchers) {
                continue;
            }
            let samples: Vec<Sample> = stored
                .samples
                .iter()
                .copied()
                .filter(|s| s.timestamp >= request.mint && s.timestamp <= request.maxt)
                .collect();
            if !samples.is_empty() {
                out.push(Series::new(stored.labels.clone(), samples));
            }
        }
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        Ok(out)
    }

    async fn label_values(
        &self,
        request: LabelValuesRequest,
    ) -> shard_client::Result<Vec<String>> {
        let mut values: Vec<String> = self
            .series
            .lock()
            .unwrap()
            .iter()
            .filter(|s| Self::matches(&s.labels, &request.matchers))
            .filter_map(|s| s.labels.get(&request.name).map(str::to_string))
            .collect();
        values.sort_unstable();
        values.dedup();
        Ok(values)
    }

    async fn add(&self, request: AddRequest) -> shard_client::Result<()> {
        let mut stored = self.series.lock().unwrap();
        stored.extend(request.series);
        Ok(())
    }
}

/// A shard whose master cannot be reached.
struct DownShard;

#[async_trait]
impl ShardClient for DownShard {
    async fn select(&self, _request: SelectRequest) -> shard_client::Result<Vec<Series>> {
        shard_client::Timeout {
            addr: "10.0.0.2:8088".to_string(),
            op: "call",
        }
        .fail()
    }

    async fn label_values(
        &self,
        _request: LabelValuesRequest,
    ) -> shard_client::Result<Vec<String>> {
        shard_client::Timeout {
            addr: "10.0.0.2:8088".to_string(),
            op: "call",
        }
        .fail()
    }

    async fn add(&self, _request: AddRequest) -> shard_client::Result<()> {
        shard_client::Timeout {
            addr: "10.0.0.2:8088".to_string(),
            op: "call",
        }
        .fail()
    }
}

struct MapProvider {
    clients: HashMap<String, ShardClientRef>,
}

impl ShardClientProvider for MapProvider {
    fn client_for(&self, addr: &str) -> ShardClientRef {
        self.clients
            .get(addr)
            .cloned()
            .unwrap_or_else(|| Arc::new(DownShard))
    }
}

struct Harness {
    proxy: Proxy,
    router: Arc<RouteTable>,
    view: Arc<ClusterView>,
    shard1: Arc<FakeShard>,
    shard2: Arc<FakeShard>,
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

async fn harness(shard2_down: bool) -> Harness {
    let store = Arc::new(MemStore::default());
    let client = Arc::new(MetaClient::new(
        store,
        KeyLayout::try_new("/baudtime").unwrap(),
    ));
    for node in [master(1, "10.0.0.1"), master(2, "10.0.0.2")] {
        let key = client.keys().node_key(&node.addr());
        client.store().put(&key, node.to_json(), None).await.unwrap();
    }

    let view = Arc::new(ClusterView::new(client.clone()));
    view.refresh().await.unwrap();
    let router = Arc::new(RouteTable::new(
        client.clone(),
        RouterConfig {
            shard_group_cap: 2,
            ..Default::default()
        },
    ));

    let shard1 = Arc::new(FakeShard::default());
    let shard2 = Arc::new(FakeShard::default());
    let mut clients: HashMap<String, ShardClientRef> = HashMap::new();
    clients.insert("10.0.0.1:8088".to_string(), shard1.clone());
    if shard2_down {
        clients.insert("10.0.0.2:8088".to_string(), Arc::new(DownShard));
    } else {
        clients.insert("10.0.0.2:8088".to_string(), shard2.clone());
    }
    let provider = Arc::new(MapProvider { clients });

    let proxy = Proxy::new(
        router.clone(),
        view.clone(),
        provider,
        ProxyConfig::default(),
    );
    Harness {
        proxy,
        router,
        view,
        shard1,
        shard2,
    }
}

fn cpu_labels(host: &str) -> Labels {
    Labels::from(vec![("__name__", "cpu"), ("host", host)])
}

fn cpu_matchers(host: &str) -> Vec<Matcher> {
    vec![
        Matcher::equal("__name__", "cpu"),
        Matcher::equal("host", host),
    ]
}

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let hx = harness(false).await;
    let appender = FanoutAppender::new(
        hx.router.clone(),
        hx.view.clone(),
        hx.proxy.clients().clone(),
        128,
    );

    let labels = cpu_labels("a");
    let hash = labels.stable_hash();
    appender.add(labels, 1_000, 1.5, hash).await.unwrap();
    appender.flush().await.unwrap();

    let merged = hx
        .proxy
        .select(1_000, 1_000, 0, cpu_matchers("a"))
        .await
        .unwrap()
        .into_vec()
        .unwrap();

    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].labels, cpu_labels("a"));
    assert_eq!(merged[0].samples, vec![Sample::new(1_000, 1.5)]);
}

#[tokio::test]
async fn test_equal_label_series_merge_across_shards() {
    let hx = harness(false).await;
    // Route "cpu" so the select fans out to both shards.
    hx.router.get_shard_ids("cpu", 0).await.unwrap();

    let labels = cpu_labels("a");
    hx.shard1.push(Series::new(
        labels.clone(),
        vec![Sample::new(1, 1.0), Sample::new(3, 3.0)],
    ));
    hx.shard2
        .push(Series::new(labels.clone(), vec![Sample::new(2, 2.0)]));
    hx.shard2.push(Series::new(
        cpu_labels("b"),
        vec![Sample::new(1, 9.0)],
    ));

    let merged = hx
        .proxy
        .select(0, 10, 0, vec![Matcher::equal("__name__", "cpu")])
        .await
        .unwrap()
        .into_vec()
        .unwrap();

    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].labels, cpu_labels("a"));
    assert_eq!(
        merged[0].samples,
        vec![Sample::new(1, 1.0), Sample::new(2, 2.0), Sample::new(3, 3.0)]
    );
    assert_eq!(merged[1].labels, cpu_labels("b"));
}

#[tokio::test]
async fn test_partial_failure_fails_whole_query() {
    let hx = harness(true).await;
    hx.router.get_shard_ids("cpu", 0).await.unwrap();
    hx.shard1.push(Series::new(
        cpu_labels("a"),
        vec![Sample::new(1, 1.0), Sample::new(2, 2.0)],
    ));

    let err = hx
        .proxy
        .select(0, 10, 0, vec![Matcher::equal("__name__", "cpu")])
        .await
        .unwrap_err();

    // No partial data: the healthy shard's two series are not returned.
    assert!(matches!(
        err,
        proxy::Error::ShardRpc { shard_id: 2, .. } | proxy::Error::MultipleFailures { .. }
    ));
}

#[tokio::test]
async fn test_select_requires_metric_name() {
    let hx = harness(false).await;
    let err = hx
        .proxy
        .select(0, 10, 0, vec![Matcher::new(MatchType::Regexp, "host", ".*")])
        .await
        .unwrap_err();
    assert!(matches!(err, proxy::Error::MissingMetricName { .. }));
}

#[tokio::test]
async fn test_label_values_is_global() {
    let hx = harness(false).await;
    // No route exists for "mem": label discovery still reaches both
    // shards because it goes by the cluster view.
    hx.shard1
        .push(Series::new(cpu_labels("a"), vec![Sample::new(1, 1.0)]));
    hx.shard2
        .push(Series::new(cpu_labels("b"), vec![Sample::new(1, 1.0)]));
    hx.shard2
        .push(Series::new(cpu_labels("a"), vec![Sample::new(2, 1.0)]));

    let values = hx
        .proxy
        .label_values("host".to_string(), vec![])
        .await
        .unwrap();
    assert_eq!(values, vec!["a".to_string(), "b".to_string()]);
}
