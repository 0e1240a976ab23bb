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

//! Maps `(metric, day)` onto shard groups.
//!
//! Routes live in the meta store under a ttl lease; this crate caches them
//! per process and allocates fresh groups on a true miss. The membership
//! watcher keeps the cache in step with other gateways through
//! [Router::update_route] and [Router::invalidate].

use std::sync::Arc;

use async_trait::async_trait;
use common_types::{label::Labels, time::Day, ShardId};
use macros::define_result;
use meta_client::types::ShardGroup;
use snafu::{Backtrace, Snafu};

pub mod config;
pub mod table;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display(
        "Not enough master shards to build a group, available:{}, need:{}",
        available,
        need
    ))]
    RoutingFailed {
        available: usize,
        need: usize,
        backtrace: Backtrace,
    },

    #[snafu(display("Failed to access meta store, err:{}", source))]
    MetaFailure { source: meta_client::Error },

    #[snafu(display("Shard group is empty, metric:{}, day:{}", metric, day))]
    EmptyShardGroup {
        metric: String,
        day: Day,
        backtrace: Backtrace,
    },
}

define_result!(Error);

/// A resolved route of one `(metric, day)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Shards responsible for the day, in allocation order.
    pub shard_ids: ShardGroup,
    /// Opaque shard-group route key of the metric, when one is set by the
    /// external routing policy.
    pub shard_group_route_key: Option<String>,
}

#[async_trait]
pub trait Router: Send + Sync {
    /// The shard group of `(metric, day)`, consulting the meta store and
    /// allocating on a true miss.
    async fn get_shard_ids(&self, metric: &str, day: Day) -> Result<Route>;

    /// The shard one sample lands on: a stable-hash pick within the day's
    /// group.
    async fn shard_for(&self, day: Day, labels: &Labels, hash: u64) -> Result<ShardId>;

    /// Adopt a route learned from a watch event.
    fn update_route(&self, metric: &str, day: Day, group: ShardGroup);

    /// Drop a cached day. Dropping the metric's timeline day drops the
    /// whole metric.
    fn invalidate(&self, metric: &str, day: Day);

    fn set_shard_group_route_key(&self, metric: &str, key: Option<String>);

    fn shard_group_route_key(&self, metric: &str) -> Option<String>;
}

pub type RouterRef = Arc<dyn Router>;
