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
//! Blocked-runner poller.
//!
//! Responsibilities:
//! - Holds runners whose `process_for` returned a pending wakeup signal and
//!   re-queues them once the signal completes.
//! - Aborts parked runners whose task handle was closed.
//!
//! Key exported interfaces:
//! - Types: `BlockedRunnerPoller`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::exec::signal::SignalFuture;
use crate::exec::task_executor::{
    ExecutorShared, RunnerEntry, TaskHandle, abort_entry, enqueue_entry,
};
use crate::micarocks_logging::debug;

const DEFAULT_POLL_INTERVAL_MS: u64 = 10;

struct ParkedRunner {
    handle: Arc<TaskHandle>,
    entry: RunnerEntry,
    signal: Arc<SignalFuture>,
}

struct PollerState {
    shared: Arc<ExecutorShared>,
    poll_interval: Duration,
    parked: Mutex<VecDeque<ParkedRunner>>,
    cv: Condvar,
    cv_mutex: Mutex<()>,
    shutdown: AtomicBool,
    started: AtomicBool,
}

/// Poller that re-queues parked runners when their wakeup signals complete.
///
/// Signal completion is observed by polling rather than callbacks so that an
/// entry parked for a closed task can be aborted even when its signal never
/// fires.
#[derive(Clone)]
pub(crate) struct BlockedRunnerPoller {
    state: Arc<PollerState>,
}

impl BlockedRunnerPoller {
    pub(crate) fn new(shared: Arc<ExecutorShared>) -> Self {
        Self {
            state: Arc::new(PollerState {
                shared,
                poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
                parked: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
                cv_mutex: Mutex::new(()),
                shutdown: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn start(&self) {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let state = Arc::clone(&self.state);
        thread::Builder::new()
            .name("blocked-runner-poller".to_string())
            .spawn(move || run_poller(state))
            .expect("blocked runner poller thread");
    }

    /// Park a blocked runner until its signal completes or its handle closes.
    pub(crate) fn park_entry(
        &self,
        handle: Arc<TaskHandle>,
        entry: RunnerEntry,
        signal: Arc<SignalFuture>,
    ) {
        debug!(
            "Runner parked on pending signal: task_id={}",
            handle.task_id()
        );
        let mut parked = self.state.parked.lock().expect("blocked poller lock");
        parked.push_back(ParkedRunner {
            handle,
            entry,
            signal,
        });
        self.state.cv.notify_one();
    }

    /// Wake the poller early, e.g. after a task was removed.
    pub(crate) fn kick(&self) {
        self.state.cv.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        self.state.shutdown.store(true, Ordering::Release);
        self.state.cv.notify_all();
    }
}

fn run_poller(state: Arc<PollerState>) {
    debug!(
        "BlockedRunnerPoller started with poll_interval={:?}",
        state.poll_interval
    );
    loop {
        if state.shutdown.load(Ordering::Acquire) {
            return;
        }

        let mut ready = Vec::new();
        let mut aborted = Vec::new();
        {
            let mut parked = state.parked.lock().expect("blocked poller lock");
            let mut pending = VecDeque::new();
            while let Some(runner) = parked.pop_front() {
                if runner.handle.is_closed() {
                    aborted.push(runner);
                } else if runner.signal.is_done() {
                    ready.push(runner);
                } else {
                    pending.push_back(runner);
                }
            }
            *parked = pending;
        }

        for runner in aborted {
            abort_entry(&state.shared, runner.entry);
        }
        for runner in ready {
            enqueue_entry(&state.shared, &runner.handle, runner.entry);
        }

        let guard = state.cv_mutex.lock().expect("blocked poller cv lock");
        let _ = state
            .cv
            .wait_timeout(guard, state.poll_interval)
            .expect("blocked poller cv wait");
    }
}
