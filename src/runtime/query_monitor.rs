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
use crate::common::ids::TaskId;
use crate::micarocks_logging::info;
use crate::runtime::task_context::DriverStats;

/// Event sink for per-driver completion. The hosting binary wires this to its
/// event pipeline; the execution core only emits.
pub trait QueryMonitor: Send + Sync {
    fn split_completion_event(&self, task_id: &TaskId, stats: &DriverStats);
}

/// Default monitor that records completions in the worker log.
pub struct LoggingQueryMonitor;

impl QueryMonitor for LoggingQueryMonitor {
    fn split_completion_event(&self, task_id: &TaskId, stats: &DriverStats) {
        info!(
            "Split complete: task_id={} pipeline={} driver={} splits={} process_calls={} processing_ms={}",
            task_id,
            stats.pipeline_id,
            stats.driver_id,
            stats.splits_added,
            stats.process_calls,
            stats.processing_time_ms
        );
    }
}
