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

const DEFAULT_ROOT_PATH: &str = "/baudtime";

#[derive(Clone, Deserialize, Debug, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enable: bool,
    pub domain: Option<String>,
    pub ca_cert_path: String,
    pub client_key_path: String,
    pub client_cert_path: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            domain: None,
            ca_cert_path: "".to_string(),
            client_key_path: "".to_string(),
            client_cert_path: "".to_string(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, Serialize)]
#[serde(default)]
pub struct EtcdConfig {
    /// The etcd server addresses.
    pub server_addrs: Vec<String>,
    /// Root path in etcd used by the gateway.
    pub root_path: String,

    /// Timeout to connect to the etcd cluster.
    pub dial_timeout: ReadableDuration,
    /// Timeout of a single etcd rpc.
    pub rw_timeout: ReadableDuration,

    /// Times a transient rpc failure is retried before surfacing.
    pub retry_num: usize,
    /// Pause between such retries.
    pub retry_interval: ReadableDuration,

    /// Tls config to access the etcd cluster.
    pub tls: TlsConfig,
}

impl EtcdConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server_addrs.is_empty() {
            return Err("server_addrs must not be empty".to_string());
        }
        if self.rw_timeout.is_zero() {
            return Err("rw_timeout must be positive".to_string());
        }
        Ok(())
    }
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["127.0.0.1:2379".to_string()],
            root_path: DEFAULT_ROOT_PATH.to_string(),
            dial_timeout: ReadableDuration::secs(5),
            rw_timeout: ReadableDuration::secs(5),
            retry_num: 3,
            retry_interval: ReadableDuration::millis(500),
            tls: TlsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(EtcdConfig::default().validate().is_ok());

        let no_addrs = EtcdConfig {
            server_addrs: vec![],
            ..Default::default()
        };
        assert!(no_addrs.validate().is_err());
    }
}
