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
//! Task-scoped runtime context tree.
//!
//! Responsibilities:
//! - Carries per-task, per-pipeline and per-driver accounting shared across
//!   driver instances: ids, memory trackers, timing and split counters.
//! - Aggregates driver statistics into the task stats surfaced by polling.
//!
//! Key exported interfaces:
//! - Types: `TaskContext`, `PipelineContext`, `DriverContext`, `TaskStats`,
//!   `DriverStats`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::common::ids::TaskId;
use crate::common::types::{DataSize, Session};
use crate::runtime::mem_tracker::MemTracker;

/// Per-driver statistics reported with split completion events.
#[derive(Clone, Debug, Serialize)]
pub struct DriverStats {
    pub pipeline_id: u32,
    pub driver_id: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub splits_added: u64,
    pub process_calls: u64,
    pub processing_time_ms: u64,
    pub memory_peak_bytes: i64,
}

/// Aggregated task statistics for polling.
#[derive(Clone, Debug, Serialize)]
pub struct TaskStats {
    pub pipelines: usize,
    pub total_drivers: usize,
    pub completed_drivers: usize,
    pub splits_added: u64,
    pub process_calls: u64,
    pub processing_time_ms: u64,
    pub memory_current_bytes: i64,
    pub memory_peak_bytes: i64,
}

/// Root of the context tree for one task.
pub struct TaskContext {
    task_id: TaskId,
    session: Session,
    operator_pre_allocated: DataSize,
    mem_tracker: Arc<MemTracker>,
    pipelines: Mutex<Vec<Arc<PipelineContext>>>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        session: Session,
        max_task_memory: DataSize,
        operator_pre_allocated: DataSize,
    ) -> Arc<Self> {
        let label = format!("task {}", task_id);
        let limit = i64::try_from(max_task_memory.bytes()).unwrap_or(i64::MAX);
        Arc::new(Self {
            task_id,
            session,
            operator_pre_allocated,
            mem_tracker: MemTracker::new_root(label, limit),
            pipelines: Mutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Memory each operator may reserve at creation without asking the
    /// tracker first.
    pub fn operator_pre_allocated(&self) -> DataSize {
        self.operator_pre_allocated
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn add_pipeline_context(
        self: &Arc<Self>,
        input_driver: bool,
        output_driver: bool,
    ) -> Arc<PipelineContext> {
        let mut pipelines = self.pipelines.lock().expect("task context lock");
        let pipeline_id = pipelines.len() as u32;
        let label = format!("pipeline {}", pipeline_id);
        let pipeline = Arc::new(PipelineContext {
            pipeline_id,
            input_driver,
            output_driver,
            next_driver_id: AtomicU32::new(0),
            mem_tracker: MemTracker::new_child(label, &self.mem_tracker),
            drivers: Mutex::new(Vec::new()),
        });
        pipelines.push(Arc::clone(&pipeline));
        pipeline
    }

    pub fn task_stats(&self) -> TaskStats {
        let pipelines = self.pipelines.lock().expect("task context lock");
        let mut stats = TaskStats {
            pipelines: pipelines.len(),
            total_drivers: 0,
            completed_drivers: 0,
            splits_added: 0,
            process_calls: 0,
            processing_time_ms: 0,
            memory_current_bytes: self.mem_tracker.current(),
            memory_peak_bytes: self.mem_tracker.peak(),
        };
        for pipeline in pipelines.iter() {
            let drivers = pipeline.drivers.lock().expect("pipeline context lock");
            stats.total_drivers += drivers.len();
            for driver in drivers.iter() {
                if driver.finished_at().is_some() {
                    stats.completed_drivers += 1;
                }
                stats.splits_added += driver.splits_added.load(Ordering::Relaxed);
                stats.process_calls += driver.process_calls.load(Ordering::Relaxed);
                stats.processing_time_ms +=
                    driver.processing_nanos.load(Ordering::Relaxed) / 1_000_000;
            }
        }
        stats
    }
}

/// Context shared by all drivers created from one pipeline factory.
pub struct PipelineContext {
    pipeline_id: u32,
    input_driver: bool,
    output_driver: bool,
    next_driver_id: AtomicU32,
    mem_tracker: Arc<MemTracker>,
    drivers: Mutex<Vec<Arc<DriverContext>>>,
}

impl PipelineContext {
    pub fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    pub fn is_input_driver(&self) -> bool {
        self.input_driver
    }

    pub fn is_output_driver(&self) -> bool {
        self.output_driver
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn add_driver_context(self: &Arc<Self>) -> Arc<DriverContext> {
        let driver_id = self.next_driver_id.fetch_add(1, Ordering::Relaxed);
        let label = format!("driver {}.{}", self.pipeline_id, driver_id);
        let driver = Arc::new(DriverContext {
            pipeline_id: self.pipeline_id,
            driver_id,
            created_at: Utc::now(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            splits_added: AtomicU64::new(0),
            process_calls: AtomicU64::new(0),
            processing_nanos: AtomicU64::new(0),
            mem_tracker: MemTracker::new_child(label, &self.mem_tracker),
        });
        let mut drivers = self.drivers.lock().expect("pipeline context lock");
        drivers.push(Arc::clone(&driver));
        driver
    }
}

/// Per-driver accounting handle, shared with the split runner.
pub struct DriverContext {
    pipeline_id: u32,
    driver_id: u32,
    created_at: DateTime<Utc>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    splits_added: AtomicU64,
    process_calls: AtomicU64,
    processing_nanos: AtomicU64,
    mem_tracker: Arc<MemTracker>,
}

impl DriverContext {
    pub fn pipeline_id(&self) -> u32 {
        self.pipeline_id
    }

    pub fn driver_id(&self) -> u32 {
        self.driver_id
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn record_start(&self) {
        let mut started = self.started_at.lock().expect("driver context lock");
        if started.is_none() {
            *started = Some(Utc::now());
        }
    }

    pub fn record_finished(&self) {
        let mut finished = self.finished_at.lock().expect("driver context lock");
        if finished.is_none() {
            *finished = Some(Utc::now());
        }
    }

    pub fn record_split_added(&self) {
        self.splits_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_process(&self, elapsed: Duration) {
        self.process_calls.fetch_add(1, Ordering::Relaxed);
        self.processing_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock().expect("driver context lock")
    }

    pub fn driver_stats(&self) -> DriverStats {
        DriverStats {
            pipeline_id: self.pipeline_id,
            driver_id: self.driver_id,
            created_at: self.created_at,
            started_at: *self.started_at.lock().expect("driver context lock"),
            finished_at: self.finished_at(),
            splits_added: self.splits_added.load(Ordering::Relaxed),
            process_calls: self.process_calls.load(Ordering::Relaxed),
            processing_time_ms: self.processing_nanos.load(Ordering::Relaxed) / 1_000_000,
            memory_peak_bytes: self.mem_tracker.peak(),
        }
    }
}
