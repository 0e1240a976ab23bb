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

//! K-way merge of label-sorted series sets.
//!
//! Children iterate series in ascending label order; the merge yields the
//! union in the same order, folding series with identical label sets into
//! one whose samples are the time-sorted merge of the constituents.

use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    fmt,
};

use common_types::{
    label::Labels,
    sample::{Sample, Series},
};

use crate::Error;

/// A stream of series in ascending label order, the capability set the
/// merge operates on.
pub trait SeriesSet: Send {
    /// Advance to the next series, false when exhausted.
    fn next(&mut self) -> bool;

    /// The series at the cursor. Only valid after `next()` returned true.
    fn at(&self) -> Series;

    /// The first error the set ran into, if any.
    fn err(&self) -> Option<&Error>;
}

/// A set over an already fetched batch, e.g. one shard's select response.
pub struct VecSeriesSet {
    series: Vec<Series>,
    /// Cursor; starts one before the first element.
    pos: Option<usize>,
}

impl VecSeriesSet {
    pub fn new(mut series: Vec<Series>) -> Self {
        // Shards answer in label order already, but the merge is only
        // correct for sorted children, so order defensively.
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        Self { series, pos: None }
    }
}

impl SeriesSet for VecSeriesSet {
    fn next(&mut self) -> bool {
        let next = self.pos.map_or(0, |p| p + 1);
        if next >= self.series.len() {
            return false;
        }
        self.pos = Some(next);
        true
    }

    fn at(&self) -> Series {
        self.series[self.pos.unwrap_or(0)].clone()
    }

    fn err(&self) -> Option<&Error> {
        None
    }
}

/// Merge time-sorted sample runs. Equal timestamps across inputs keep the
/// value of the earliest input and drop the rest, so the result is
/// deterministic in input order and strictly time-ordered.
pub fn merge_samples(inputs: Vec<&[Sample]>) -> Vec<Sample> {
    let mut heap: BinaryHeap<Reverse<(i64, usize, usize)>> = BinaryHeap::new();
    let mut total = 0;
    for (input_idx, input) in inputs.iter().enumerate() {
        total += input.len();
        if let Some(first) = input.first() {
            heap.push(Reverse((first.timestamp, input_idx, 0)));
        }
    }

    let mut merged: Vec<Sample> = Vec::with_capacity(total);
    while let Some(Reverse((timestamp, input_idx, offset))) = heap.pop() {
        let sample = inputs[input_idx][offset];
        match merged.last() {
            Some(last) if last.timestamp == timestamp => {
                // Duplicate timestamp from a later input, skip it.
            }
            _ => merged.push(sample),
        }
        if let Some(next) = inputs[input_idx].get(offset + 1) {
            heap.push(Reverse((next.timestamp, input_idx, offset + 1)));
        }
    }
    merged
}

/// The k-way merge itself.
pub struct MergeSeriesSet {
    children: Vec<Box<dyn SeriesSet>>,
    /// Children keyed by their cursor's label set; the tuple ordering makes
    /// equal label sets pop in child order.
    heap: BinaryHeap<Reverse<(Labels, usize)>>,
    /// Children that produced the series emitted last.
    current: Vec<usize>,
    current_labels: Labels,
    initialized: bool,
}

impl fmt::Debug for MergeSeriesSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeSeriesSet")
            .field("children", &self.children.len())
            .field("current", &self.current)
            .field("current_labels", &self.current_labels)
            .field("initialized", &self.initialized)
            .finish()
    }
}

impl MergeSeriesSet {
    pub fn new(children: Vec<Box<dyn SeriesSet>>) -> Self {
        Self {
            children,
            heap: BinaryHeap::new(),
            current: Vec::new(),
            current_labels: Labels::default(),
            initialized: false,
        }
    }

    fn push_child(&mut self, idx: usize) {
        let labels = self.children[idx].at().labels;
        self.heap.push(Reverse((labels, idx)));
    }

    /// Drain the whole set. Fails if any child carries an error.
    pub fn into_vec(mut self) -> crate::Result<Vec<Series>> {
        let mut out = Vec::new();
        while self.next() {
            out.push(self.at());
        }
        for child in &self.children {
            if let Some(e) = child.err() {
                return crate::SeriesSetFailed { msg: e.to_string() }.fail();
            }
        }
        Ok(out)
    }
}

impl SeriesSet for MergeSeriesSet {
    fn next(&mut self) -> bool {
        if !self.initialized {
            self.initialized = true;
            for idx in 0..self.children.len() {
                if self.children[idx].next() {
                    self.push_child(idx);
                }
            }
        } else {
            let emitted = std::mem::take(&mut self.current);
            for idx in emitted {
                if self.children[idx].next() {
                    self.push_child(idx);
                }
            }
        }

        let Some(Reverse((labels, idx))) = self.heap.pop() else {
            return false;
        };
        self.current_labels = labels;
        self.current.push(idx);
        loop {
            let equal_top = match self.heap.peek() {
                Some(Reverse((next_labels, _))) => *next_labels == self.current_labels,
                None => false,
            };
            if !equal_top {
                break;
            }
            if let Some(Reverse((_, next_idx))) = self.heap.pop() {
                self.current.push(next_idx);
            }
        }
        true
    }

    fn at(&self) -> Series {
        if self.current.len() == 1 {
            return self.children[self.current[0]].at();
        }
        let parts: Vec<Series> = self
            .current
            .iter()
            .map(|idx| self.children[*idx].at())
            .collect();
        let samples = merge_samples(parts.iter().map(|s| s.samples.as_slice()).collect());
        Series {
            labels: self.current_labels.clone(),
            samples,
        }
    }

    fn err(&self) -> Option<&Error> {
        self.children.iter().find_map(|child| child.err())
    }
}
