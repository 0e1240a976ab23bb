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

//! Day bucketing of millisecond timestamps.

pub const MS_PER_DAY: i64 = 86_400_000;

/// A day bucket, `timestamp_ms / 86_400_000`.
pub type Day = i64;

/// The day bucket of a millisecond timestamp. Uses euclidean division so
/// pre-epoch timestamps land in the preceding day rather than day zero.
pub fn day_of(timestamp_ms: i64) -> Day {
    timestamp_ms.div_euclid(MS_PER_DAY)
}

/// All day buckets touched by `[mint, maxt]`, ascending. Empty when the
/// range is inverted.
pub fn days_in_range(mint: i64, maxt: i64) -> Vec<Day> {
    if mint > maxt {
        return Vec::new();
    }
    (day_of(mint)..=day_of(maxt)).collect()
}
