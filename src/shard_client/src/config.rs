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
pub struct ShardClientConfig {
    /// Pooled connections kept per backend address.
    pub conn_num_per_backend: usize,
    /// Timeout to establish one connection.
    pub dial_timeout: ReadableDuration,
    /// Timeout of one request/response exchange.
    pub rw_timeout: ReadableDuration,
}

impl ShardClientConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.conn_num_per_backend == 0 {
            return Err("conn_num_per_backend must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for ShardClientConfig {
    fn default() -> Self {
        Self {
            conn_num_per_backend: 4,
            dial_timeout: ReadableDuration::secs(3),
            rw_timeout: ReadableDuration::secs(10),
        }
    }
}
