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

//! The gateway's view of the storage cluster and how it is kept fresh.
//!
//! [topology::ClusterView] publishes an immutable shard snapshot per
//! rebuild; [watcher::MembershipWatcher] follows the meta store's watch
//! streams to keep it and the route cache in step; and
//! [failover::FailoverCoordinator] promotes a surviving slave when a
//! master dies.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use common_types::ShardId;
use macros::define_result;
use meta_client::types::Node;
use snafu::{Backtrace, Snafu};

pub mod config;
pub mod failover;
pub mod topology;
pub mod watcher;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Failed to access meta store, err:{}", source))]
    MetaFailure { source: meta_client::Error },

    #[snafu(display("Shard not found in cluster view, shard_id:{}", shard_id))]
    ShardNotFound {
        shard_id: ShardId,
        backtrace: Backtrace,
    },

    #[snafu(display("No surviving slave to promote, shard_id:{}", shard_id))]
    NoAvailableSlave {
        shard_id: ShardId,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "Failed to promote slave, shard_id:{}, addr:{}, err:{}",
        shard_id,
        addr,
        source
    ))]
    PromotionFailed {
        shard_id: ShardId,
        addr: String,
        source: shard_client::Error,
    },

    #[snafu(display(
        "Promotion reply timed out, outcome unknown, shard_id:{}, addr:{}",
        shard_id,
        addr
    ))]
    PromotionTimeout {
        shard_id: ShardId,
        addr: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Watch stream ended, a resync is required"))]
    WatchStreamEnded { backtrace: Backtrace },
}

define_result!(Error);

/// One shard of the published cluster view. The struct itself is immutable
/// snapshot data; only the failover latch, shared across rebuilds of the
/// same shard, is written after publication.
#[derive(Debug)]
pub struct Shard {
    pub id: ShardId,
    pub master: Option<Node>,
    pub slaves: Vec<Node>,
    failovering: Arc<AtomicBool>,
}

pub type ShardRef = Arc<Shard>;

impl Shard {
    pub(crate) fn new(
        id: ShardId,
        master: Option<Node>,
        slaves: Vec<Node>,
        failovering: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            master,
            slaves,
            failovering,
        }
    }

    /// Flip the failover latch, returning false when a failover of this
    /// shard is already running in this process.
    pub fn begin_failover(&self) -> bool {
        self.failovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_failover(&self) {
        self.failovering.store(false, Ordering::Release);
    }

    pub fn is_failovering(&self) -> bool {
        self.failovering.load(Ordering::Acquire)
    }

    /// The latch cell itself, shared with this shard's future rebuilds.
    pub(crate) fn latch(&self) -> Arc<AtomicBool> {
        self.failovering.clone()
    }
}
