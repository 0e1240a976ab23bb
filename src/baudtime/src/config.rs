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

use std::fs;

use cluster::config::ClusterConfig;
use logger::LogConfig;
use meta_client::config::EtcdConfig;
use proxy::ProxyConfig;
use router::config::RouterConfig;
use serde::{Deserialize, Serialize};
use shard_client::config::ShardClientConfig;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 8 }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub runtime: RuntimeConfig,
    pub etcd: EtcdConfig,
    pub cluster: ClusterConfig,
    pub router: RouterConfig,
    pub shard_client: ShardClientConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Config, String> {
        let content =
            fs::read_to_string(path).map_err(|e| format!("read config {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("parse config {path}: {e}"))
    }

    pub fn validate(&self) -> Result<(), String> {
        self.etcd.validate()?;
        self.cluster.validate()?;
        self.router.validate()?;
        self.shard_client.validate()?;
        self.proxy.validate()?;
        if self.runtime.worker_threads == 0 {
            return Err("runtime.worker_threads must be positive".to_string());
        }
        Ok(())
    }
}
