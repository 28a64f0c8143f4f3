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
//! Shared driver executor and worker pool.
//!
//! Responsibilities:
//! - Runs split runners cooperatively in bounded time slices across worker
//!   threads, round-robin across task handles and within each handle.
//! - Parks blocked runners until their wakeup signal completes and fires one
//!   completion callback per runner on the notification executor.
//!
//! Key exported interfaces:
//! - Types: `TaskExecutor`, `TaskHandle`, `SplitRunner`.
//!
//! Current limitations:
//! - Covers only the execution semantics wired by micarocks task
//!   orchestration; cluster-level admission stays outside this pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::common::ids::TaskId;
use crate::exec::blocked_runner_poller::BlockedRunnerPoller;
use crate::exec::driver::ProcessStatus;
use crate::micarocks_logging::debug;
use crate::runtime::notify_executor::NotificationExecutor;

/// One schedulable unit: a driver wrapped for cooperative time slicing.
///
/// `initialize` runs on a worker thread at first schedule so per-split driver
/// construction is amortized across the pool.
pub trait SplitRunner: Send {
    fn initialize(&mut self) -> Result<(), String>;
    fn is_finished(&self) -> bool;
    fn process_for(&mut self, budget: Duration) -> Result<ProcessStatus, String>;
}

/// Fired exactly once per enqueued runner: on finish, failure, panic, or
/// abort through `remove_task`. Delivered on the notification executor.
pub type SplitCompletionCallback = Box<dyn FnOnce(Result<(), String>) + Send + 'static>;

pub(crate) struct RunnerEntry {
    task_id: TaskId,
    runner: Box<dyn SplitRunner>,
    initialized: bool,
    completion: Option<SplitCompletionCallback>,
}

struct HandleState {
    ready: VecDeque<RunnerEntry>,
    in_run_queue: bool,
    closed: bool,
}

/// Fairness group for one task. Runners enqueued under the same handle take
/// turns; handles take turns against each other.
pub struct TaskHandle {
    task_id: TaskId,
    state: Mutex<HandleState>,
}

impl TaskHandle {
    fn new(task_id: TaskId) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            state: Mutex::new(HandleState {
                ready: VecDeque::new(),
                in_run_queue: false,
                closed: false,
            }),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().expect("task handle lock").closed
    }
}

pub(crate) struct ExecutorShared {
    run_queue: Mutex<VecDeque<Arc<TaskHandle>>>,
    cv: Condvar,
    shutdown: AtomicBool,
    notification_executor: Arc<NotificationExecutor>,
}

/// Time-sliced worker pool shared by every task on this worker process.
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    poller: BlockedRunnerPoller,
    quantum: Duration,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(
        num_threads: usize,
        quantum: Duration,
        notification_executor: Arc<NotificationExecutor>,
    ) -> Arc<Self> {
        let shared = Arc::new(ExecutorShared {
            run_queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            notification_executor,
        });
        let poller = BlockedRunnerPoller::new(Arc::clone(&shared));
        poller.start();

        let num_threads = num_threads.max(1);
        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared_cloned = Arc::clone(&shared);
            let poller_cloned = poller.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("task-executor-{i}"))
                    .spawn(move || worker_loop(shared_cloned, poller_cloned, quantum))
                    .expect("task executor worker thread"),
            );
        }
        Arc::new(Self {
            shared,
            poller,
            quantum,
            workers: Mutex::new(workers),
        })
    }

    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    /// Register a fairness group for one task.
    pub fn add_task(&self, task_id: TaskId) -> Arc<TaskHandle> {
        TaskHandle::new(task_id)
    }

    /// Enqueue one runner under the handle; non-blocking. The completion
    /// callback fires exactly once when the runner is done.
    pub fn add_split(
        &self,
        handle: &Arc<TaskHandle>,
        runner: Box<dyn SplitRunner>,
        completion: SplitCompletionCallback,
    ) {
        let entry = RunnerEntry {
            task_id: handle.task_id.clone(),
            runner,
            initialized: false,
            completion: Some(completion),
        };
        enqueue_entry(&self.shared, handle, entry);
    }

    /// Close the handle and abort its queued and parked runners. In-flight
    /// quanta run to their end and are not rescheduled.
    pub fn remove_task(&self, handle: &Arc<TaskHandle>) {
        let drained = {
            let mut state = handle.state.lock().expect("task handle lock");
            state.closed = true;
            state.ready.drain(..).collect::<Vec<_>>()
        };
        debug!(
            "Task removed from executor: task_id={} aborted_queued={}",
            handle.task_id,
            drained.len()
        );
        for entry in drained {
            abort_entry(&self.shared, entry);
        }
        // Parked runners are aborted by the poller on its next pass.
        self.poller.kick();
    }

    /// Stop worker threads. Queued runners are dropped without completion;
    /// only the hosting process exit and tests use this.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.cv.notify_all();
        self.poller.shutdown();
        let workers = {
            let mut guard = self.workers.lock().expect("task executor workers lock");
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Queue one entry under its handle and make the handle schedulable. Aborts
/// the entry instead when the handle is already closed.
pub(crate) fn enqueue_entry(
    shared: &Arc<ExecutorShared>,
    handle: &Arc<TaskHandle>,
    entry: RunnerEntry,
) {
    let should_queue = {
        let mut state = handle.state.lock().expect("task handle lock");
        if state.closed {
            drop(state);
            abort_entry(shared, entry);
            return;
        }
        state.ready.push_back(entry);
        if state.in_run_queue {
            false
        } else {
            state.in_run_queue = true;
            true
        }
    };
    if should_queue {
        let mut run_queue = shared.run_queue.lock().expect("executor run queue lock");
        run_queue.push_back(Arc::clone(handle));
        shared.cv.notify_one();
    }
}

pub(crate) fn abort_entry(shared: &Arc<ExecutorShared>, entry: RunnerEntry) {
    let cause = format!("task {} removed from task executor", entry.task_id);
    finish_entry(shared, entry, Err(cause));
}

fn finish_entry(shared: &Arc<ExecutorShared>, mut entry: RunnerEntry, result: Result<(), String>) {
    let Some(completion) = entry.completion.take() else {
        return;
    };
    // The runner (and its driver) is released before the callback observes
    // completion, so weak driver references are already expired.
    drop(entry);
    shared
        .notification_executor
        .execute(move || completion(result));
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn worker_loop(shared: Arc<ExecutorShared>, poller: BlockedRunnerPoller, quantum: Duration) {
    loop {
        let handle = {
            let mut run_queue = shared.run_queue.lock().expect("executor run queue lock");
            loop {
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                if let Some(handle) = run_queue.pop_front() {
                    break handle;
                }
                run_queue = shared
                    .cv
                    .wait(run_queue)
                    .expect("executor run queue condvar wait");
            }
        };

        // Pop one runner; leave the handle schedulable when more are ready so
        // sibling drivers of the same task can run on other workers.
        let (entry, requeue_handle, drained) = {
            let mut state = handle.state.lock().expect("task handle lock");
            if state.closed {
                state.in_run_queue = false;
                let drained = state.ready.drain(..).collect::<Vec<_>>();
                (None, false, drained)
            } else {
                match state.ready.pop_front() {
                    None => {
                        state.in_run_queue = false;
                        (None, false, Vec::new())
                    }
                    Some(entry) => {
                        let more = !state.ready.is_empty();
                        if !more {
                            state.in_run_queue = false;
                        }
                        (Some(entry), more, Vec::new())
                    }
                }
            }
        };
        for stale in drained {
            abort_entry(&shared, stale);
        }
        if requeue_handle {
            let mut run_queue = shared.run_queue.lock().expect("executor run queue lock");
            run_queue.push_back(Arc::clone(&handle));
            shared.cv.notify_one();
        }
        let Some(entry) = entry else {
            continue;
        };
        run_entry(&shared, &poller, &handle, entry, quantum);
    }
}

fn run_entry(
    shared: &Arc<ExecutorShared>,
    poller: &BlockedRunnerPoller,
    handle: &Arc<TaskHandle>,
    mut entry: RunnerEntry,
    quantum: Duration,
) {
    if !entry.initialized {
        entry.initialized = true;
        let init = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            entry.runner.initialize()
        }));
        match init {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                finish_entry(shared, entry, Err(err));
                return;
            }
            Err(payload) => {
                let msg = format!("panic in driver initialize: {}", panic_message(payload));
                finish_entry(shared, entry, Err(msg));
                return;
            }
        }
    }

    let status = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        entry.runner.process_for(quantum)
    }))
    .unwrap_or_else(|payload| {
        Err(format!(
            "panic in driver execution: {}",
            panic_message(payload)
        ))
    });

    match status {
        Ok(ProcessStatus::Finished) => {
            finish_entry(shared, entry, Ok(()));
        }
        Ok(ProcessStatus::Ready) => {
            if entry.runner.is_finished() {
                finish_entry(shared, entry, Ok(()));
            } else {
                enqueue_entry(shared, handle, entry);
            }
        }
        Ok(ProcessStatus::Blocked(signal)) => {
            if entry.runner.is_finished() {
                finish_entry(shared, entry, Ok(()));
            } else {
                poller.park_entry(Arc::clone(handle), entry, signal);
            }
        }
        Err(err) => {
            finish_entry(shared, entry, Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::signal::SignalFuture;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Instant;

    struct CountdownRunner {
        slices_left: usize,
    }

    impl SplitRunner for CountdownRunner {
        fn initialize(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.slices_left == 0
        }

        fn process_for(&mut self, _budget: Duration) -> Result<ProcessStatus, String> {
            self.slices_left -= 1;
            if self.slices_left == 0 {
                Ok(ProcessStatus::Finished)
            } else {
                Ok(ProcessStatus::Ready)
            }
        }
    }

    struct BlockingRunner {
        signal: Arc<SignalFuture>,
        ran_after_unblock: Arc<AtomicUsize>,
        blocked_once: bool,
    }

    impl SplitRunner for BlockingRunner {
        fn initialize(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn is_finished(&self) -> bool {
            false
        }

        fn process_for(&mut self, _budget: Duration) -> Result<ProcessStatus, String> {
            if !self.blocked_once {
                self.blocked_once = true;
                return Ok(ProcessStatus::Blocked(Arc::clone(&self.signal)));
            }
            self.ran_after_unblock.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessStatus::Finished)
        }
    }

    fn executor() -> Arc<TaskExecutor> {
        let notify = NotificationExecutor::new("executor-test-notify");
        TaskExecutor::new(2, Duration::from_millis(10), notify)
    }

    #[test]
    fn runner_completes_after_multiple_slices() {
        let executor = executor();
        let handle = executor.add_task(TaskId::new("t1"));
        let (tx, rx) = mpsc::channel();
        executor.add_split(
            &handle,
            Box::new(CountdownRunner { slices_left: 3 }),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(result.is_ok());
    }

    #[test]
    fn blocked_runner_resumes_when_signal_completes() {
        let executor = executor();
        let handle = executor.add_task(TaskId::new("t1"));
        let signal = SignalFuture::new();
        let resumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        executor.add_split(
            &handle,
            Box::new(BlockingRunner {
                signal: Arc::clone(&signal),
                ran_after_unblock: Arc::clone(&resumed),
                blocked_once: false,
            }),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        // Let the runner get parked, then wake it.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
        signal.complete();
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(result.is_ok());
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_task_aborts_queued_and_parked_runners() {
        let executor = executor();
        let handle = executor.add_task(TaskId::new("t1"));
        let signal = SignalFuture::new();
        let resumed = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        executor.add_split(
            &handle,
            Box::new(BlockingRunner {
                signal,
                ran_after_unblock: Arc::clone(&resumed),
                blocked_once: false,
            }),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        thread::sleep(Duration::from_millis(50));
        executor.remove_task(&handle);
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        let err = result.expect_err("aborted runner fails");
        assert!(err.contains("removed from task executor"));
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn add_split_after_remove_aborts_immediately() {
        let executor = executor();
        let handle = executor.add_task(TaskId::new("t1"));
        executor.remove_task(&handle);
        let (tx, rx) = mpsc::channel();
        executor.add_split(
            &handle,
            Box::new(CountdownRunner { slices_left: 1 }),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        assert!(result.is_err());
    }

    struct PanickyRunner;

    impl SplitRunner for PanickyRunner {
        fn initialize(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn is_finished(&self) -> bool {
            false
        }

        fn process_for(&mut self, _budget: Duration) -> Result<ProcessStatus, String> {
            panic!("operator bug");
        }
    }

    #[test]
    fn panicking_runner_fails_its_completion() {
        let executor = executor();
        let handle = executor.add_task(TaskId::new("t1"));
        let (tx, rx) = mpsc::channel();
        executor.add_split(
            &handle,
            Box::new(PanickyRunner),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let result = rx.recv_timeout(Duration::from_secs(5)).expect("completion");
        let err = result.expect_err("panic surfaces as failure");
        assert!(err.contains("panic in driver execution"));
    }

    #[test]
    fn runners_of_one_handle_share_the_pool_fairly() {
        let executor = executor();
        let handle_a = executor.add_task(TaskId::new("a"));
        let handle_b = executor.add_task(TaskId::new("b"));
        let (tx, rx) = mpsc::channel();
        for handle in [&handle_a, &handle_b] {
            for _ in 0..4 {
                let tx = tx.clone();
                executor.add_split(
                    handle,
                    Box::new(CountdownRunner { slices_left: 2 }),
                    Box::new(move |result| {
                        let _ = tx.send(result);
                    }),
                );
            }
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut completed = 0;
        while completed < 8 && Instant::now() < deadline {
            if rx.recv_timeout(Duration::from_secs(5)).is_ok() {
                completed += 1;
            }
        }
        assert_eq!(completed, 8);
    }
}
