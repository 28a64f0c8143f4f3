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
//! Driver execution contract.
//!
//! Responsibilities:
//! - Defines the cooperative-scheduling boundary between the task
//!   orchestration layer and a compiled pipeline instance.
//! - Defines the factory boundary the local planner produces drivers through.
//!
//! Key exported interfaces:
//! - Types: `ProcessStatus`, `Driver`, `DriverRef`, `DriverFactory`.
//!
//! Current limitations:
//! - Covers only the execution semantics wired by micarocks task
//!   orchestration; operator internals live behind this boundary.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::common::ids::PlanNodeId;
use crate::exec::signal::SignalFuture;
use crate::exec::split::Split;
use crate::runtime::task_context::DriverContext;

/// Outcome of one cooperative time slice.
///
/// `Blocked` carries the signal that completes when the driver can make
/// progress again; the executor must not reschedule the driver before then.
pub enum ProcessStatus {
    /// More work is available; reschedule when a slot frees up.
    Ready,
    /// Waiting on I/O, buffer space, or an upstream dependency.
    Blocked(Arc<SignalFuture>),
    /// The pipeline has produced all output and released its resources.
    Finished,
}

/// One instance of a compiled local pipeline.
///
/// The orchestration layer feeds splits in and runs the pipeline in bounded
/// time slices; everything between the source and the sink is opaque here.
pub trait Driver: Send {
    /// Hand the driver one more unit of work for the named source. Splits for
    /// sources this pipeline does not consume are ignored.
    fn add_split(&mut self, source_id: PlanNodeId, split: Split) -> Result<(), String>;

    /// Close a source: no further splits will arrive for it. Idempotent;
    /// unknown sources are ignored.
    fn no_more_splits(&mut self, source_id: PlanNodeId);

    /// Run until finished, blocked, or the budget is exhausted.
    fn process_for(&mut self, budget: Duration) -> Result<ProcessStatus, String>;

    fn is_finished(&self) -> bool;
}

/// Shared driver handle. The worker pool owns the strong reference while the
/// driver is scheduled; the task keeps only weak references for split fan-out.
pub type DriverRef = Arc<Mutex<dyn Driver>>;

/// Builds drivers for one pipeline of the fragment.
pub trait DriverFactory: Send + Sync {
    /// Source ids this pipeline consumes.
    fn source_ids(&self) -> Vec<PlanNodeId>;

    /// True when the pipeline starts from external input (a scan).
    fn is_input_driver(&self) -> bool;

    /// True when the pipeline ends in the task output sink.
    fn is_output_driver(&self) -> bool;

    fn create_driver(&self, ctx: Arc<DriverContext>) -> Result<DriverRef, String>;

    /// Release compile-time resources once no more drivers will be created.
    /// Idempotent.
    fn close(&self);
}
