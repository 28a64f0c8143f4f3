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
pub mod common;
pub mod exec;
pub mod runtime;

// Worker-core layout with `micarocks_*` convenience aliases.
pub use common::app_config as micarocks_config;
pub use common::logging as micarocks_logging;

pub use common::ids::{OutputBufferId, PlanNodeId, TaskId};
pub use common::types::{DataSize, Page, Session};
pub use exec::split::{OutputBuffers, ScheduledSplit, Split, TaskSource};
pub use exec::task_execution::TaskExecution;
pub use exec::task_executor::TaskExecutor;
pub use runtime::shared_buffer::{BufferResult, SharedOutputBuffer};
pub use runtime::task_info::TaskInfo;
pub use runtime::task_state::TaskState;
