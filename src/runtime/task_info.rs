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
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::ids::{PlanNodeId, TaskId};
use crate::runtime::shared_buffer::SharedBufferInfo;
use crate::runtime::task_context::TaskStats;
use crate::runtime::task_state::TaskState;

/// First version handed out by a freshly created task.
pub const STARTING_VERSION: i64 = 0;

/// Versioned, self-consistent snapshot of one task for polling.
///
/// Versions are strictly increasing within a task lifetime; a snapshot taken
/// in a terminal state is never followed by a non-terminal snapshot with a
/// higher version.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub version: i64,
    pub state: TaskState,
    pub location: String,
    pub last_heartbeat: DateTime<Utc>,
    pub output_buffers: SharedBufferInfo,
    pub no_more_splits: Vec<PlanNodeId>,
    /// Present on `full` snapshots only.
    pub stats: Option<TaskStats>,
    pub failures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::shared_buffer::SharedOutputBuffer;
    use crate::common::types::DataSize;

    #[test]
    fn task_info_serializes_for_the_rpc_edge() {
        let buffer = SharedOutputBuffer::new(DataSize::from_mb(1));
        let info = TaskInfo {
            task_id: TaskId::new("q1.s1.t1"),
            version: STARTING_VERSION,
            state: TaskState::Running,
            location: "http://worker-1:8060/v1/task/q1.s1.t1".to_string(),
            last_heartbeat: Utc::now(),
            output_buffers: buffer.info(),
            no_more_splits: vec![PlanNodeId::new(7)],
            stats: None,
            failures: Vec::new(),
        };
        let json = serde_json::to_value(&info).expect("serialize task info");
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["no_more_splits"][0], 7);
    }
}
