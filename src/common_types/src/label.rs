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

//! Label set, the identity of a series.

use std::{fmt, hash::Hasher};

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::METRIC_NAME_LABEL;

/// A single `(name, value)` pair.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A label set: lexicographically sorted by name, unique by name.
///
/// The derived ordering is the series ordering used by the merge layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from arbitrary pairs. The input is sorted by name
    /// and duplicate names are collapsed keeping the first occurrence.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        labels.dedup_by(|next, prev| next.name == prev.name);
        Self(labels)
    }

    /// Wrap labels that are known to be sorted and unique already, e.g.
    /// decoded from a shard response.
    pub fn from_sorted(labels: Vec<Label>) -> Self {
        debug_assert!(labels.windows(2).all(|w| w[0].name < w[1].name));
        Self(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A hash of the label set that is stable across processes, used to
    /// spread series of one metric over its day's shard group.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        for label in &self.0 {
            hasher.write(label.name.as_bytes());
            hasher.write(&[0xff]);
            hasher.write(label.value.as_bytes());
            hasher.write(&[0xff]);
        }
        hasher.finish()
    }
}

impl From<Vec<(&str, &str)>> for Labels {
    fn from(pairs: Vec<(&str, &str)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, label) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}
