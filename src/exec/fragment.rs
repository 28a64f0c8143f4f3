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
//! Fragment and local-planning boundary.
//!
//! Responsibilities:
//! - Carries the planned fragment handed to a worker and the interface the
//!   task uses to compile it into driver factories.
//!
//! Key exported interfaces:
//! - Types: `PlanFragment`, `LocalExecutionPlan`, `LocalPlanner`.

use std::sync::Arc;

use crate::common::ids::PlanNodeId;
use crate::common::types::Session;
use crate::exec::driver::DriverFactory;
use crate::runtime::shared_buffer::SharedOutputBuffer;

/// One subtree of a distributed query plan, assigned to this worker.
///
/// At most one source is partitioned: its splits each spawn an independent
/// driver. Every other source is unpartitioned and fans out to all drivers.
#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub fragment_id: u32,
    pub partitioned_source: Option<PlanNodeId>,
}

impl PlanFragment {
    pub fn new(fragment_id: u32, partitioned_source: Option<PlanNodeId>) -> Self {
        Self {
            fragment_id,
            partitioned_source,
        }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitioned_source.is_some()
    }
}

/// Result of local planning: the ordered pipelines of the fragment.
pub struct LocalExecutionPlan {
    pub driver_factories: Vec<Arc<dyn DriverFactory>>,
}

/// Compiles a fragment into driver factories. The output-side pipeline must
/// sink into the provided shared buffer.
pub trait LocalPlanner: Send + Sync {
    fn plan(
        &self,
        session: &Session,
        fragment: &PlanFragment,
        output: Arc<SharedOutputBuffer>,
    ) -> Result<LocalExecutionPlan, String>;
}
