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

//! Records stored in the meta store.

use std::time::Duration;

use common_types::ShardId;
use serde::{Deserialize, Serialize};
use time_ext::current_time_millis;

/// An ordered list of shards responsible for one `(metric, day)`.
pub type ShardGroup = Vec<ShardId>;

/// A storage node as registered under `{ns}/node/{addr}`.
///
/// A node is a master iff both master fields are empty; otherwise they name
/// the master it replicates from. `idc` is an opaque locality tag consumed
/// by the failover tie-break.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Node {
    pub shard_id: ShardId,
    pub ip: String,
    pub port: String,
    #[serde(default)]
    pub master_ip: String,
    #[serde(default)]
    pub master_port: String,
    #[serde(default)]
    pub idc: String,
    /// Unix milliseconds of the node's last heartbeat.
    pub heartbeat_at: i64,
}

impl Node {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn master_addr(&self) -> String {
        format!("{}:{}", self.master_ip, self.master_port)
    }

    pub fn is_master(&self) -> bool {
        self.master_ip.is_empty() && self.master_port.is_empty()
    }

    /// Whether the node may still be alive judging by its last heartbeat.
    /// A vanished key of a node that may be online is a transient blip, not
    /// a death.
    pub fn may_online(&self, session_expire_ttl: Duration) -> bool {
        let elapsed = current_time_millis() - self.heartbeat_at;
        elapsed < session_expire_ttl.as_millis() as i64
    }

    pub fn to_json(&self) -> Vec<u8> {
        // A plain struct with string fields cannot fail to serialize.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Node> {
        serde_json::from_slice(bytes)
    }
}

/// Shard groups are stored as a JSON array of shard id strings.
pub fn encode_shard_group(group: &[ShardId]) -> Vec<u8> {
    let strs: Vec<String> = group.iter().map(ShardId::to_string).collect();
    serde_json::to_vec(&strs).unwrap_or_default()
}

pub fn decode_shard_group(bytes: &[u8]) -> Result<ShardGroup, String> {
    let strs: Vec<String> =
        serde_json::from_slice(bytes).map_err(|e| format!("not a shard group: {e}"))?;
    strs.iter()
        .map(|s| {
            s.parse::<ShardId>()
                .map_err(|_| format!("invalid shard id: {s}"))
        })
        .collect()
}
