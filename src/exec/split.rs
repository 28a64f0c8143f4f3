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
//! Split descriptors and source update batches.
//!
//! Responsibilities:
//! - Defines the input work units routed to scan drivers and the batched
//!   update messages the coordinator delivers for sources and output queues.
//!
//! Key exported interfaces:
//! - Types: `Split`, `ScheduledSplit`, `TaskSource`, `OutputBuffers`.

use std::fmt;

use bytes::Bytes;

use crate::common::ids::{OutputBufferId, PlanNodeId};

/// Opaque descriptor of one unit of input work for a scan source, e.g. a file
/// range or a tablet shard. The execution layer never interprets the payload.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Split {
    label: String,
    payload: Bytes,
}

impl Split {
    pub fn new(label: impl Into<String>, payload: Bytes) -> Self {
        Self {
            label: label.into(),
            payload,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Debug for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Split")
            .field("label", &self.label)
            .field("payload_bytes", &self.payload.len())
            .finish()
    }
}

/// A split plus its per-task acknowledgement sequence id.
///
/// Sequence ids are assigned by the coordinator and are monotone; batches may
/// replay already-acknowledged ids and the task drops those silently.
#[derive(Clone, Debug)]
pub struct ScheduledSplit {
    pub sequence_id: i64,
    pub split: Split,
}

impl ScheduledSplit {
    pub fn new(sequence_id: i64, split: Split) -> Self {
        Self { sequence_id, split }
    }
}

/// One batched source update: new splits for a source and/or its end-of-source
/// marker.
#[derive(Clone, Debug)]
pub struct TaskSource {
    pub source_id: PlanNodeId,
    pub splits: Vec<ScheduledSplit>,
    pub no_more_splits: bool,
}

impl TaskSource {
    pub fn new(source_id: PlanNodeId, splits: Vec<ScheduledSplit>, no_more_splits: bool) -> Self {
        Self {
            source_id,
            splits,
            no_more_splits,
        }
    }
}

/// Output queue registration update. `no_more_buffer_ids` is sticky: once set,
/// later registrations are rejected.
#[derive(Clone, Debug)]
pub struct OutputBuffers {
    pub buffer_ids: Vec<OutputBufferId>,
    pub no_more_buffer_ids: bool,
}

impl OutputBuffers {
    pub fn new(buffer_ids: Vec<OutputBufferId>, no_more_buffer_ids: bool) -> Self {
        Self {
            buffer_ids,
            no_more_buffer_ids,
        }
    }
}
