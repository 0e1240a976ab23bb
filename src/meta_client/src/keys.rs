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

//! Layout of the gateway's keys inside the meta store.
//!
//! All keys live under a namespace root:
//!  - `{root}/route/{metric}/{day}` — shard group of a metric day, leased.
//!  - `{root}/sgroute/{metric}` — opaque shard-group route key.
//!  - `{root}/node/{addr}` — node record, kept alive by heartbeats.
//!  - `{root}/mutex/{name}` — global mutexes.

use common_types::time::Day;
use snafu::ensure;

use crate::{InvalidArguments, Result};

const ROUTE_SEGMENT: &str = "route";
const SGROUTE_SEGMENT: &str = "sgroute";
const NODE_SEGMENT: &str = "node";
const MUTEX_SEGMENT: &str = "mutex";

#[derive(Clone, Debug)]
pub struct KeyLayout {
    root: String,
}

impl KeyLayout {
    pub fn try_new(root_path: &str) -> Result<Self> {
        ensure!(
            root_path.starts_with('/'),
            InvalidArguments {
                msg: "root_path is required to start with /",
            }
        );
        ensure!(
            !root_path.ends_with('/'),
            InvalidArguments {
                msg: "root_path is required not to end with /",
            }
        );

        Ok(Self {
            root: root_path.to_string(),
        })
    }

    pub fn route_prefix(&self) -> String {
        format!("{}/{}/", self.root, ROUTE_SEGMENT)
    }

    pub fn route_key(&self, metric: &str, day: Day) -> String {
        format!("{}{}/{}", self.route_prefix(), metric, day)
    }

    /// Split a route key back into `(metric, day)`.
    pub fn parse_route_key<'a>(&self, key: &'a str) -> Option<(&'a str, Day)> {
        let rest = key.strip_prefix(&self.route_prefix())?;
        let (metric, day) = rest.rsplit_once('/')?;
        let day = day.parse().ok()?;
        if metric.is_empty() {
            return None;
        }
        Some((metric, day))
    }

    pub fn sgroute_prefix(&self) -> String {
        format!("{}/{}/", self.root, SGROUTE_SEGMENT)
    }

    pub fn sgroute_key(&self, metric: &str) -> String {
        format!("{}{}", self.sgroute_prefix(), metric)
    }

    pub fn parse_sgroute_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let metric = key.strip_prefix(&self.sgroute_prefix())?;
        (!metric.is_empty()).then_some(metric)
    }

    pub fn node_prefix(&self) -> String {
        format!("{}/{}/", self.root, NODE_SEGMENT)
    }

    pub fn node_key(&self, addr: &str) -> String {
        format!("{}{}", self.node_prefix(), addr)
    }

    pub fn mutex_key(&self, name: &str) -> String {
        format!("{}/{}/{}", self.root, MUTEX_SEGMENT, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_validation() {
        assert!(KeyLayout::try_new("/baudtime").is_ok());
        assert!(KeyLayout::try_new("baudtime").is_err());
        assert!(KeyLayout::try_new("/baudtime/").is_err());
    }

    #[test]
    fn test_route_key_round_trip() {
        let keys = KeyLayout::try_new("/baudtime").unwrap();
        let key = keys.route_key("cpu.busy", 19723);
        assert_eq!(key, "/baudtime/route/cpu.busy/19723");
        assert_eq!(keys.parse_route_key(&key), Some(("cpu.busy", 19723)));

        assert_eq!(keys.parse_route_key("/other/route/cpu/1"), None);
        assert_eq!(keys.parse_route_key("/baudtime/route/cpu"), None);
        assert_eq!(keys.parse_route_key("/baudtime/route/cpu/xx"), None);
    }

    #[test]
    fn test_other_keys() {
        let keys = KeyLayout::try_new("/baudtime").unwrap();
        assert_eq!(keys.sgroute_key("cpu"), "/baudtime/sgroute/cpu");
        assert_eq!(keys.parse_sgroute_key("/baudtime/sgroute/cpu"), Some("cpu"));
        assert_eq!(keys.node_key("10.0.0.1:8088"), "/baudtime/node/10.0.0.1:8088");
        assert_eq!(keys.mutex_key("failover"), "/baudtime/mutex/failover");
    }
}
