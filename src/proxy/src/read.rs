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

//! Query fan-out.
//!
//! `select` resolves the metric's day routes to a shard set and queries
//! those shards; `label_values` is discovery and asks every shard in the
//! cluster view. Reads are not partial-tolerant: any shard failure fails
//! the query with the collected errors.

use std::collections::HashSet;

use cluster::topology::ClusterViewRef;
use common_types::{
    matcher::{metric_name_of, Matcher},
    sample::Series,
    time::days_in_range,
    ShardId,
};
use futures::StreamExt;
use lazy_static::lazy_static;
use prometheus::{register_int_counter, IntCounter};
use router::RouterRef;
use shard_client::{
    protocol::{LabelValuesRequest, SelectRequest},
    ShardClientProviderRef,
};
use snafu::{OptionExt, ResultExt};
use tokio::time;

use crate::{
    fold_errors,
    merge::{MergeSeriesSet, SeriesSet, VecSeriesSet},
    MissingMetricName, NoMaster, ProxyConfig, QueryTimeout, Result, RouteFailure, ShardRpc,
};

lazy_static! {
    static ref QUERY_COUNTER: IntCounter = register_int_counter!(
        "fanout_select_total",
        "Select queries fanned out by this gateway"
    )
    .unwrap();
    static ref SHARD_ERROR_COUNTER: IntCounter = register_int_counter!(
        "fanout_shard_error_total",
        "Shard sub-queries that failed"
    )
    .unwrap();
}

pub struct Proxy {
    router: RouterRef,
    view: ClusterViewRef,
    clients: ShardClientProviderRef,
    config: ProxyConfig,
}

impl Proxy {
    pub fn new(
        router: RouterRef,
        view: ClusterViewRef,
        clients: ShardClientProviderRef,
        config: ProxyConfig,
    ) -> Self {
        Self {
            router,
            view,
            clients,
            config,
        }
    }

    pub fn router(&self) -> &RouterRef {
        &self.router
    }

    pub fn view(&self) -> &ClusterViewRef {
        &self.view
    }

    pub fn clients(&self) -> &ShardClientProviderRef {
        &self.clients
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Query `[mint, maxt]` with `matchers` across the responsible shards,
    /// returning the merged, label-ordered series set.
    pub async fn select(
        &self,
        mint: i64,
        maxt: i64,
        interval: i64,
        matchers: Vec<Matcher>,
    ) -> Result<MergeSeriesSet> {
        QUERY_COUNTER.inc();
        time::timeout(
            self.config.query_timeout.0,
            self.do_select(mint, maxt, interval, matchers),
        )
        .await
        .map_err(|_| QueryTimeout {}.build())?
    }

    async fn do_select(
        &self,
        mint: i64,
        maxt: i64,
        interval: i64,
        matchers: Vec<Matcher>,
    ) -> Result<MergeSeriesSet> {
        let metric = metric_name_of(&matchers)
            .context(MissingMetricName)?
            .to_string();

        // Union of the day groups, first-seen order.
        let mut seen = HashSet::new();
        let mut shard_ids = Vec::new();
        for day in days_in_range(mint, maxt) {
            let route = self
                .router
                .get_shard_ids(&metric, day)
                .await
                .context(RouteFailure)?;
            for shard_id in route.shard_ids {
                if seen.insert(shard_id) {
                    shard_ids.push(shard_id);
                }
            }
        }

        let request = SelectRequest {
            mint,
            maxt,
            interval,
            matchers,
        };
        let results = self.dispatch_select(shard_ids, request).await;

        let mut children: Vec<Box<dyn SeriesSet>> = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(series) => children.push(Box::new(VecSeriesSet::new(series))),
                Err(e) => {
                    SHARD_ERROR_COUNTER.inc();
                    errors.push(e);
                }
            }
        }
        // Reads are all-or-nothing: partial data is worse than an error.
        fold_errors(errors)?;

        Ok(MergeSeriesSet::new(children))
    }

    async fn dispatch_select(
        &self,
        shard_ids: Vec<ShardId>,
        request: SelectRequest,
    ) -> Vec<Result<Vec<Series>>> {
        futures::stream::iter(shard_ids.into_iter().map(|shard_id| {
            let request = request.clone();
            async move {
                let addr = self
                    .view
                    .master_addr(shard_id)
                    .context(NoMaster { shard_id })?;
                self.clients
                    .client_for(&addr)
                    .select(request)
                    .await
                    .context(ShardRpc { shard_id })
            }
        }))
        .buffer_unordered(self.config.query_concurrency)
        .collect()
        .await
    }

    /// Values of label `name` across the whole cluster. Discovery is
    /// global, so this asks every shard in the view, not just routed ones.
    pub async fn label_values(
        &self,
        name: String,
        matchers: Vec<Matcher>,
    ) -> Result<Vec<String>> {
        time::timeout(
            self.config.query_timeout.0,
            self.do_label_values(name, matchers),
        )
        .await
        .map_err(|_| QueryTimeout {}.build())?
    }

    async fn do_label_values(
        &self,
        name: String,
        matchers: Vec<Matcher>,
    ) -> Result<Vec<String>> {
        let mut shard_ids: Vec<ShardId> = self.view.snapshot().keys().copied().collect();
        shard_ids.sort_unstable();

        let request = LabelValuesRequest { name, matchers };
        let results: Vec<Result<Vec<String>>> =
            futures::stream::iter(shard_ids.into_iter().map(|shard_id| {
                let request = request.clone();
                async move {
                    let addr = self
                        .view
                        .master_addr(shard_id)
                        .context(NoMaster { shard_id })?;
                    let mut values = self
                        .clients
                        .client_for(&addr)
                        .label_values(request)
                        .await
                        .context(ShardRpc { shard_id })?;
                    values.sort_unstable();
                    Ok(values)
                }
            }))
            .buffer_unordered(self.config.query_concurrency)
            .collect()
            .await;

        let mut lists = Vec::with_capacity(results.len());
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(values) => lists.push(values),
                Err(e) => {
                    SHARD_ERROR_COUNTER.inc();
                    errors.push(e);
                }
            }
        }
        fold_errors(errors)?;

        Ok(merge_sorted_values(lists))
    }
}

/// Pairwise divide-and-conquer merge of sorted string lists, dropping
/// duplicates.
fn merge_sorted_values(mut lists: Vec<Vec<String>>) -> Vec<String> {
    match lists.len() {
        0 => Vec::new(),
        1 => lists.pop().unwrap_or_default(),
        _ => {
            let right = lists.split_off(lists.len() / 2);
            merge_pair(merge_sorted_values(lists), merge_sorted_values(right))
        }
    }
}

fn merge_pair(left: Vec<String>, right: Vec<String>) -> Vec<String> {
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();

    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l <= r,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let value = if take_left {
            left.next()
        } else {
            right.next()
        };
        if let Some(value) = value {
            if merged.last() != Some(&value) {
                merged.push(value);
            }
        }
    }
    merged
}
