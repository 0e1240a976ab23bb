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

use serde::{Deserialize, Serialize};
use time_ext::ReadableDuration;

#[derive(Clone, Deserialize, Debug, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Number of shards serving one metric per day.
    pub shard_group_cap: usize,
    /// Lease put on day-route entries; the store evicts them on expiry.
    pub route_info_ttl: ReadableDuration,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.shard_group_cap == 0 {
            return Err("shard_group_cap must be positive".to_string());
        }
        if self.route_info_ttl.is_zero() {
            return Err("route_info_ttl must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shard_group_cap: 2,
            route_info_ttl: ReadableDuration::days(15),
        }
    }
}
