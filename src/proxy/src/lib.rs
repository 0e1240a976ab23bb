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

//! The gateway's data plane: fans writes and queries out over the shards
//! the router names and reassembles the answers.

use std::{fmt, sync::Arc};

use common_types::ShardId;
use macros::define_result;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, Snafu};
use time_ext::ReadableDuration;

pub mod merge;
pub mod read;
pub mod write;

#[derive(Debug, Snafu)]
#[snafu(visibility = "pub")]
pub enum Error {
    #[snafu(display("Query has no equality matcher on the metric name"))]
    MissingMetricName { backtrace: Backtrace },

    #[snafu(display("Failed to route query, err:{}", source))]
    RouteFailure { source: router::Error },

    #[snafu(display("Shard has no master in the cluster view, shard_id:{}", shard_id))]
    NoMaster {
        shard_id: ShardId,
        backtrace: Backtrace,
    },

    #[snafu(display("Shard rpc failed, shard_id:{}, err:{}", shard_id, source))]
    ShardRpc {
        shard_id: ShardId,
        source: shard_client::Error,
    },

    #[snafu(display("Query timed out"))]
    QueryTimeout { backtrace: Backtrace },

    #[snafu(display("Series set failed, msg:{}", msg))]
    SeriesSetFailed { msg: String, backtrace: Backtrace },

    #[snafu(display("{}", format_multi(errors)))]
    MultipleFailures { errors: Vec<Error> },
}

define_result!(Error);

fn format_multi(errors: &[Error]) -> String {
    let mut msg = format!("{} shard operations failed:", errors.len());
    for e in errors {
        msg.push_str("\n\t");
        msg.push_str(&e.to_string());
    }
    msg
}

/// Fold errors collected from a fan-out into one failure, if any.
pub(crate) fn fold_errors(mut errors: Vec<Error>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(Error::MultipleFailures { errors }),
    }
}

#[derive(Clone, Deserialize, Debug, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Whole-query deadline, covering routing and every sub-query.
    pub query_timeout: ReadableDuration,
    /// Shard sub-queries in flight per query.
    pub query_concurrency: usize,
    /// Samples buffered per shard before the appender flushes that shard.
    pub max_batch_size: usize,
    /// Interval of the background flush of half-filled batches.
    pub flush_interval: ReadableDuration,
}

impl ProxyConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.query_concurrency == 0 {
            return Err("query_concurrency must be positive".to_string());
        }
        if self.max_batch_size == 0 {
            return Err("max_batch_size must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            query_timeout: ReadableDuration::secs(30),
            query_concurrency: 8,
            max_batch_size: 1024,
            flush_interval: ReadableDuration::secs(1),
        }
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeout:{}, concurrency:{}, batch:{}",
            self.query_timeout, self.query_concurrency, self.max_batch_size
        )
    }
}

pub use read::Proxy;
pub use write::{Appender, AppenderRef, FanoutAppender, TimedFlusher};

pub type ProxyRef = Arc<Proxy>;
