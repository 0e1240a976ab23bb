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

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time_ext::ReadableDuration;

const MIN_FAILOVER_LOCK_LEASE_TTL_SEC: u64 = 15;

#[derive(Clone, Deserialize, Debug, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// A node whose heartbeat is younger than this may still be online; its
    /// key disappearing is then treated as a blip, not a death.
    pub session_expire_ttl: ReadableDuration,
    /// Interval nodes refresh their record and session lease on.
    pub heartbeat_interval: ReadableDuration,

    /// Lease of the global failover mutex in seconds.
    ///
    /// A gateway that crashes mid-failover releases the mutex when this
    /// lease runs out.
    pub failover_lock_lease_ttl_sec: u64,

    /// Pause before reopening watch streams after an error.
    pub watch_retry_interval: ReadableDuration,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.failover_lock_lease_ttl_sec < MIN_FAILOVER_LOCK_LEASE_TTL_SEC {
            return Err(format!(
                "failover_lock_lease_ttl_sec should be greater than {MIN_FAILOVER_LOCK_LEASE_TTL_SEC}"
            ));
        }

        if self.heartbeat_interval.0 >= self.session_expire_ttl.0 {
            return Err(format!(
                "heartbeat_interval({}) should be less than session_expire_ttl({})",
                self.heartbeat_interval, self.session_expire_ttl,
            ));
        }

        Ok(())
    }

    pub fn failover_lock_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.failover_lock_lease_ttl_sec)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            session_expire_ttl: ReadableDuration::secs(30),
            heartbeat_interval: ReadableDuration::secs(10),
            failover_lock_lease_ttl_sec: 30,
            watch_retry_interval: ReadableDuration::secs(1),
        }
    }
}
