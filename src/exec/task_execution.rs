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
//! Task execution orchestrator.
//!
//! Responsibilities:
//! - Owns one task's drivers: creates them as partitioned splits arrive, fans
//!   unpartitioned splits out to every live driver, and tracks completion
//!   over splits, output queues, and buffer drain.
//! - Drives the task state machine to a terminal state under normal
//!   completion, cancellation, and driver failure.
//!
//! Key exported interfaces:
//! - Types: `TaskExecution`.
//!
//! Current limitations:
//! - Covers only the execution semantics wired by micarocks task
//!   orchestration; plan compilation and operator internals stay behind the
//!   planner and driver boundaries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::common::ids::{OutputBufferId, PlanNodeId, TaskId};
use crate::common::types::{DataSize, Session};
use crate::exec::driver::{Driver, DriverFactory, DriverRef, ProcessStatus};
use crate::exec::fragment::{LocalPlanner, PlanFragment};
use crate::exec::split::{OutputBuffers, Split, TaskSource};
use crate::exec::task_executor::{SplitRunner, TaskExecutor, TaskHandle};
use crate::micarocks_logging::debug;
use crate::runtime::notify_executor::NotificationExecutor;
use crate::runtime::query_monitor::QueryMonitor;
use crate::runtime::shared_buffer::{BufferResult, SharedOutputBuffer};
use crate::runtime::task_context::{DriverContext, PipelineContext, TaskContext};
use crate::runtime::task_info::{STARTING_VERSION, TaskInfo};
use crate::runtime::task_state::{TaskState, TaskStateMachine};

type DriverBuilder = Box<dyn FnOnce(Arc<DriverContext>) -> Result<DriverRef, String> + Send>;

struct ExecState {
    /// Weak back-references for split fan-out; a driver released by the pool
    /// expires here and stops receiving splits.
    drivers: Vec<(Weak<Mutex<dyn Driver>>, Arc<DriverContext>)>,
    /// Unpartitioned splits seen so far, in routing order, deduplicated.
    unpartitioned_splits: HashMap<PlanNodeId, Vec<Split>>,
    completed_unpartitioned_sources: HashSet<PlanNodeId>,
    no_more_splits: HashSet<PlanNodeId>,
    max_acknowledged_split: i64,
}

/// The lifecycle owner of one task on this worker.
pub struct TaskExecution {
    task_id: TaskId,
    location: String,
    task_executor: Arc<TaskExecutor>,
    state_machine: Arc<TaskStateMachine>,
    task_context: Arc<TaskContext>,
    shared_buffer: Arc<SharedOutputBuffer>,
    query_monitor: Arc<dyn QueryMonitor>,
    task_handle: Arc<TaskHandle>,

    partitioned_source_id: Option<PlanNodeId>,
    partitioned_driver_factory: Option<Arc<dyn DriverFactory>>,
    partitioned_pipeline_context: Option<Arc<PipelineContext>>,
    all_source_ids: HashSet<PlanNodeId>,

    /// Drivers handed to the executor whose completion callback has not
    /// fired yet.
    remaining_driver_count: AtomicUsize,
    no_more_partitioned_splits: AtomicBool,
    next_task_info_version: AtomicI64,
    last_heartbeat: Mutex<DateTime<Utc>>,

    exec_state: Mutex<ExecState>,
    unpartitioned_drivers: Mutex<Vec<(DriverRef, Arc<DriverContext>)>>,
}

impl TaskExecution {
    /// Plan the fragment, create unpartitioned drivers, install the terminal
    /// cleanup listener and start the task.
    pub fn create(
        session: Session,
        task_id: TaskId,
        location: impl Into<String>,
        fragment: PlanFragment,
        planner: &dyn LocalPlanner,
        max_buffer_size: DataSize,
        task_executor: Arc<TaskExecutor>,
        notification_executor: Arc<NotificationExecutor>,
        max_task_memory: DataSize,
        operator_pre_allocated: DataSize,
        query_monitor: Arc<dyn QueryMonitor>,
    ) -> Result<Arc<Self>, String> {
        let state_machine =
            TaskStateMachine::new(task_id.clone(), Arc::clone(&notification_executor));
        let shared_buffer = SharedOutputBuffer::new(max_buffer_size);
        let task_context = TaskContext::new(
            task_id.clone(),
            session.clone(),
            max_task_memory,
            operator_pre_allocated,
        );
        let task_handle = task_executor.add_task(task_id.clone());

        let plan = planner.plan(&session, &fragment, Arc::clone(&shared_buffer))?;

        let mut partitioned_driver_factory: Option<Arc<dyn DriverFactory>> = None;
        let mut unpartitioned_drivers = Vec::new();
        let mut all_source_ids = HashSet::new();
        for factory in plan.driver_factories {
            all_source_ids.extend(factory.source_ids());
            let consumes_partitioned = fragment
                .partitioned_source
                .map(|source_id| factory.source_ids().contains(&source_id))
                .unwrap_or(false);
            if consumes_partitioned {
                if partitioned_driver_factory.is_some() {
                    return Err(format!(
                        "fragment {} has multiple pipelines consuming the partitioned source",
                        fragment.fragment_id
                    ));
                }
                partitioned_driver_factory = Some(factory);
            } else {
                let pipeline_context = task_context
                    .add_pipeline_context(factory.is_input_driver(), factory.is_output_driver());
                let driver_context = pipeline_context.add_driver_context();
                let driver = factory.create_driver(Arc::clone(&driver_context))?;
                unpartitioned_drivers.push((driver, driver_context));
            }
        }

        if fragment.is_partitioned() && partitioned_driver_factory.is_none() {
            return Err(format!(
                "fragment {} is partitioned, but no pipeline consumes the partitioned source",
                fragment.fragment_id
            ));
        }

        let partitioned_pipeline_context = partitioned_driver_factory.as_ref().map(|factory| {
            task_context.add_pipeline_context(factory.is_input_driver(), factory.is_output_driver())
        });

        let task = Arc::new(Self {
            task_id: task_id.clone(),
            location: location.into(),
            task_executor: Arc::clone(&task_executor),
            state_machine: Arc::clone(&state_machine),
            task_context,
            shared_buffer: Arc::clone(&shared_buffer),
            query_monitor,
            task_handle: Arc::clone(&task_handle),
            partitioned_source_id: fragment.partitioned_source,
            partitioned_driver_factory,
            partitioned_pipeline_context,
            all_source_ids,
            remaining_driver_count: AtomicUsize::new(0),
            no_more_partitioned_splits: AtomicBool::new(false),
            next_task_info_version: AtomicI64::new(STARTING_VERSION),
            last_heartbeat: Mutex::new(Utc::now()),
            exec_state: Mutex::new(ExecState {
                drivers: Vec::new(),
                unpartitioned_splits: HashMap::new(),
                completed_unpartitioned_sources: HashSet::new(),
                no_more_splits: HashSet::new(),
                max_acknowledged_split: i64::MIN,
            }),
            unpartitioned_drivers: Mutex::new(unpartitioned_drivers),
        });

        // Terminal cleanup: the executor drops queued runners for the task,
        // and a task that will never drain its buffer releases the consumers
        // blocked on it.
        {
            let task_executor = Arc::clone(&task_executor);
            let task_handle = Arc::clone(&task_handle);
            let shared_buffer = Arc::clone(&shared_buffer);
            state_machine.add_state_change_listener(Arc::new(move |state| {
                if state.is_done() {
                    task_executor.remove_task(&task_handle);
                    if state != TaskState::Finished {
                        shared_buffer.destroy();
                    }
                }
            }));
        }

        task.start();
        Ok(task)
    }

    /// Enqueue the eagerly-created unpartitioned drivers and move the task to
    /// RUNNING. Runs exactly once, from `create`.
    fn start(self: &Arc<Self>) {
        self.state_machine.start();
        let drivers = {
            let mut guard = self
                .unpartitioned_drivers
                .lock()
                .expect("unpartitioned drivers lock");
            std::mem::take(&mut *guard)
        };
        for (driver, driver_context) in drivers {
            {
                let mut state = self.exec_state.lock().expect("task execution lock");
                state
                    .drivers
                    .push((Arc::downgrade(&driver), Arc::clone(&driver_context)));
            }
            let runner = DriverSplitRunner::for_driver(driver, Arc::clone(&driver_context));
            self.enqueue_driver(driver_context, runner);
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn task_state(&self) -> TaskState {
        self.state_machine.get_state()
    }

    pub fn wait_for_state_change(&self, current: TaskState, max_wait: Duration) -> TaskState {
        self.state_machine.wait_for_state_change(current, max_wait)
    }

    /// Apply one batch of source updates. Replayed sequence ids are dropped;
    /// updates arriving after the task is terminal are ignored.
    pub fn add_sources(self: &Arc<Self>, sources: Vec<TaskSource>) -> Result<(), String> {
        if self.state_machine.get_state().is_done() {
            return Ok(());
        }
        for source in &sources {
            if !self.all_source_ids.contains(&source.source_id) {
                return Err(format!(
                    "unknown source {} for task {}",
                    source.source_id, self.task_id
                ));
            }
        }

        let mut pending_runners = Vec::new();
        let mut partitioned_source_closed = false;
        {
            let mut state = self.exec_state.lock().expect("task execution lock");
            let mut new_max_acknowledged = state.max_acknowledged_split;
            for source in sources {
                for scheduled in source.splits {
                    // Only route splits not already acknowledged.
                    if scheduled.sequence_id > state.max_acknowledged_split {
                        self.route_split(
                            &mut state,
                            source.source_id,
                            scheduled.split,
                            &mut pending_runners,
                        )?;
                        new_max_acknowledged = new_max_acknowledged.max(scheduled.sequence_id);
                    }
                }
                if source.no_more_splits {
                    self.close_source(&mut state, source.source_id, &mut partitioned_source_closed);
                }
            }
            state.max_acknowledged_split = new_max_acknowledged;
        }

        // The executor enqueue is done outside the routing critical section.
        for (driver_context, runner) in pending_runners {
            self.enqueue_driver(driver_context, runner);
        }
        if partitioned_source_closed {
            self.check_no_more_partitioned_splits();
        }
        Ok(())
    }

    /// Register output queues; `no_more_buffer_ids` is sticky.
    pub fn add_result_queue(&self, output_ids: OutputBuffers) -> Result<(), String> {
        for buffer_id in output_ids.buffer_ids {
            self.shared_buffer.add_queue(buffer_id)?;
        }
        if output_ids.no_more_buffer_ids {
            self.shared_buffer.no_more_queues();
        }
        Ok(())
    }

    pub fn get_results(
        &self,
        output_id: &OutputBufferId,
        starting_sequence_id: i64,
        max_size: DataSize,
        max_wait: Duration,
    ) -> Result<BufferResult, String> {
        self.shared_buffer
            .get(output_id, starting_sequence_id, max_size, max_wait)
    }

    pub fn abort_results(&self, output_id: &OutputBufferId) {
        self.shared_buffer.abort(output_id);
    }

    pub fn cancel(&self) {
        self.state_machine.cancel();
    }

    pub fn abort(&self) {
        self.state_machine.abort();
    }

    pub fn fail(&self, cause: impl Into<String>) {
        self.state_machine.failed(cause);
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock().expect("heartbeat lock") = Utc::now();
    }

    /// Versioned snapshot; runs a completion check first so a terminal
    /// version is never followed by a non-terminal one.
    pub fn get_task_info(&self, full: bool) -> TaskInfo {
        self.check_task_completion();

        let state = self.state_machine.get_state();
        let failures = if state == TaskState::Failed {
            self.state_machine.failure_causes()
        } else {
            Vec::new()
        };
        let no_more_splits = {
            let exec_state = self.exec_state.lock().expect("task execution lock");
            let mut closed: Vec<PlanNodeId> = exec_state.no_more_splits.iter().copied().collect();
            closed.sort_unstable();
            closed
        };

        TaskInfo {
            task_id: self.task_id.clone(),
            version: self.next_task_info_version.fetch_add(1, Ordering::SeqCst),
            state,
            location: self.location.clone(),
            last_heartbeat: *self.last_heartbeat.lock().expect("heartbeat lock"),
            output_buffers: self.shared_buffer.info(),
            no_more_splits,
            stats: full.then(|| self.task_context.task_stats()),
            failures,
        }
    }

    /// Route one unacknowledged split while holding the routing lock.
    /// Partitioned splits become pending driver runners; unpartitioned splits
    /// fan out to every live driver and are recorded for future drivers.
    fn route_split(
        self: &Arc<Self>,
        state: &mut ExecState,
        source_id: PlanNodeId,
        split: Split,
        pending_runners: &mut Vec<(Arc<DriverContext>, DriverSplitRunner)>,
    ) -> Result<(), String> {
        if Some(source_id) == self.partitioned_source_id {
            let pipeline_context = self
                .partitioned_pipeline_context
                .as_ref()
                .expect("partitioned pipeline context");
            let factory = Arc::clone(
                self.partitioned_driver_factory
                    .as_ref()
                    .expect("partitioned driver factory"),
            );
            let driver_context = pipeline_context.add_driver_context();
            let task = Arc::clone(self);
            let builder: DriverBuilder = Box::new(move |driver_context| {
                task.create_driver(factory.as_ref(), driver_context, Some(split))
            });
            let runner = DriverSplitRunner::with_builder(Arc::clone(&driver_context), builder);
            pending_runners.push((driver_context, runner));
            return Ok(());
        }

        let splits = state.unpartitioned_splits.entry(source_id).or_default();
        if splits.contains(&split) {
            return Ok(());
        }
        splits.push(split.clone());

        // Fan out to every live driver; expired entries are compacted away.
        let mut kept = Vec::with_capacity(state.drivers.len());
        for (weak_driver, driver_context) in state.drivers.drain(..) {
            let Some(driver) = weak_driver.upgrade() else {
                continue;
            };
            {
                let mut guard = driver.lock().unwrap_or_else(|e| e.into_inner());
                guard.add_split(source_id, split.clone())?;
            }
            driver_context.record_split_added();
            kept.push((weak_driver, driver_context));
        }
        state.drivers = kept;
        Ok(())
    }

    /// Close one source while holding the routing lock. Idempotent.
    fn close_source(
        &self,
        state: &mut ExecState,
        source_id: PlanNodeId,
        partitioned_source_closed: &mut bool,
    ) {
        if !state.no_more_splits.insert(source_id) {
            return;
        }
        if Some(source_id) == self.partitioned_source_id {
            self.no_more_partitioned_splits.store(true, Ordering::SeqCst);
            *partitioned_source_closed = true;
        } else {
            state.completed_unpartitioned_sources.insert(source_id);
            let mut kept = Vec::with_capacity(state.drivers.len());
            for (weak_driver, driver_context) in state.drivers.drain(..) {
                let Some(driver) = weak_driver.upgrade() else {
                    continue;
                };
                {
                    let mut guard = driver.lock().unwrap_or_else(|e| e.into_inner());
                    guard.no_more_splits(source_id);
                }
                kept.push((weak_driver, driver_context));
            }
            state.drivers = kept;
        }
    }

    /// Build a partitioned driver at first-schedule time: add its initial
    /// split, replay every known unpartitioned split and source closure, then
    /// record it for future fan-out.
    fn create_driver(
        self: &Arc<Self>,
        factory: &dyn DriverFactory,
        driver_context: Arc<DriverContext>,
        partitioned_split: Option<Split>,
    ) -> Result<DriverRef, String> {
        let mut state = self.exec_state.lock().expect("task execution lock");
        let driver = factory.create_driver(Arc::clone(&driver_context))?;
        {
            let mut guard = driver.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(split) = partitioned_split {
                // The scan operator requires its split before the first
                // process call.
                let source_id = self
                    .partitioned_source_id
                    .expect("partitioned source for partitioned driver");
                guard.add_split(source_id, split)?;
                driver_context.record_split_added();
            }
            for (source_id, splits) in state.unpartitioned_splits.iter() {
                for split in splits {
                    guard.add_split(*source_id, split.clone())?;
                    driver_context.record_split_added();
                }
            }
            for source_id in state.completed_unpartitioned_sources.iter() {
                guard.no_more_splits(*source_id);
            }
        }
        state
            .drivers
            .push((Arc::downgrade(&driver), Arc::clone(&driver_context)));
        Ok(driver)
    }

    /// Hand one runner to the executor and arrange the completion callback.
    fn enqueue_driver(
        self: &Arc<Self>,
        driver_context: Arc<DriverContext>,
        runner: DriverSplitRunner,
    ) {
        self.remaining_driver_count.fetch_add(1, Ordering::SeqCst);
        let task = Arc::clone(self);
        let completion = Box::new(move |result: Result<(), String>| {
            match result {
                Ok(()) => {
                    driver_context.record_finished();
                    let remaining =
                        task.remaining_driver_count.fetch_sub(1, Ordering::SeqCst) - 1;
                    if remaining == 0 {
                        task.check_no_more_partitioned_splits();
                    }
                    task.check_task_completion();
                }
                Err(cause) => {
                    debug!(
                        "Driver failed: task_id={} pipeline={} driver={} error={}",
                        task.task_id,
                        driver_context.pipeline_id(),
                        driver_context.driver_id(),
                        cause
                    );
                    task.state_machine.failed(cause);
                    driver_context.record_finished();
                    task.remaining_driver_count.fetch_sub(1, Ordering::SeqCst);
                    task.check_no_more_partitioned_splits();
                }
            }
            task.query_monitor
                .split_completion_event(&task.task_id, &driver_context.driver_stats());
        });
        self.task_executor
            .add_split(&self.task_handle, Box::new(runner), completion);
    }

    /// Close the partitioned factory once no further partitioned splits will
    /// arrive and every enqueued driver has completed.
    fn check_no_more_partitioned_splits(&self) {
        if let Some(factory) = &self.partitioned_driver_factory {
            if self.no_more_partitioned_splits.load(Ordering::SeqCst)
                && self.remaining_driver_count.load(Ordering::SeqCst) == 0
            {
                factory.close();
            }
        }
    }

    /// Move the task to FINISHED once the partitioned source is closed (or
    /// absent), all drivers completed, and the output buffer has drained.
    fn check_task_completion(&self) {
        if let Some(partitioned_source_id) = self.partitioned_source_id {
            let state = self.exec_state.lock().expect("task execution lock");
            if !state.no_more_splits.contains(&partitioned_source_id) {
                return;
            }
        }
        if self.remaining_driver_count.load(Ordering::SeqCst) != 0 {
            return;
        }

        // No more output will be created.
        self.shared_buffer.finish();

        if !self.shared_buffer.is_finished() {
            return;
        }

        self.state_machine.finished();
    }
}

/// Adapter the worker pool time-slices. Holds either a ready driver or the
/// lazy builder for a per-split driver, so construction happens on a worker
/// thread at first schedule.
struct DriverSplitRunner {
    driver_context: Arc<DriverContext>,
    driver: Option<DriverRef>,
    builder: Option<DriverBuilder>,
}

impl DriverSplitRunner {
    fn for_driver(driver: DriverRef, driver_context: Arc<DriverContext>) -> Self {
        Self {
            driver_context,
            driver: Some(driver),
            builder: None,
        }
    }

    fn with_builder(driver_context: Arc<DriverContext>, builder: DriverBuilder) -> Self {
        Self {
            driver_context,
            driver: None,
            builder: Some(builder),
        }
    }
}

impl SplitRunner for DriverSplitRunner {
    fn initialize(&mut self) -> Result<(), String> {
        if self.driver.is_none() {
            let builder = self
                .builder
                .take()
                .ok_or_else(|| "driver builder already consumed".to_string())?;
            self.driver = Some(builder(Arc::clone(&self.driver_context))?);
        }
        self.driver_context.record_start();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        match &self.driver {
            Some(driver) => driver
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_finished(),
            None => false,
        }
    }

    fn process_for(&mut self, budget: Duration) -> Result<ProcessStatus, String> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| "driver not initialized".to_string())?;
        let start = Instant::now();
        let result = {
            let mut guard = driver.lock().unwrap_or_else(|e| e.into_inner());
            guard.process_for(budget)
        };
        self.driver_context.record_process(start.elapsed());
        if matches!(result, Ok(ProcessStatus::Finished)) {
            self.driver_context.record_finished();
        }
        result
    }
}
