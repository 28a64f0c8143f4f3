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
//! Task state machine.
//!
//! Responsibilities:
//! - Holds the authoritative task state and failure causes.
//! - Notifies registered listeners once per transition, off the transitioning
//!   thread, and wakes timed state-change waiters.
//!
//! Key exported interfaces:
//! - Types: `TaskState`, `TaskStateMachine`, `StateChangeListener`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::common::ids::TaskId;
use crate::micarocks_logging::debug;
use crate::runtime::notify_executor::NotificationExecutor;

/// Task lifecycle state.
///
/// ```text
/// PLANNED ──start──▶ RUNNING ──finish──▶ FINISHED
///                        │
///                        ├──cancel──▶ CANCELED
///                        ├──fail────▶ FAILED
///                        └──abort───▶ ABORTED
/// ```
///
/// The last four states are terminal and absorbing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Planned,
    Running,
    Finished,
    Canceled,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Canceled | TaskState::Failed | TaskState::Aborted
        )
    }
}

/// Listener invoked once per state transition, on the notification executor.
pub type StateChangeListener = Arc<dyn Fn(TaskState) + Send + Sync + 'static>;

struct StateMachineInner {
    state: TaskState,
    failure_causes: Vec<String>,
    listeners: Vec<StateChangeListener>,
}

/// Authoritative state holder for one task.
pub struct TaskStateMachine {
    task_id: TaskId,
    inner: Mutex<StateMachineInner>,
    cv: Condvar,
    notification_executor: Arc<NotificationExecutor>,
}

impl TaskStateMachine {
    pub fn new(task_id: TaskId, notification_executor: Arc<NotificationExecutor>) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            inner: Mutex::new(StateMachineInner {
                state: TaskState::Planned,
                failure_causes: Vec::new(),
                listeners: Vec::new(),
            }),
            cv: Condvar::new(),
            notification_executor,
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn get_state(&self) -> TaskState {
        self.inner.lock().expect("task state lock").state
    }

    pub fn failure_causes(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("task state lock")
            .failure_causes
            .clone()
    }

    /// Block until the state differs from `current` or `max_wait` elapses.
    /// Returns the state observed on wakeup; spurious wakeups are bounded by
    /// the deadline.
    pub fn wait_for_state_change(&self, current: TaskState, max_wait: Duration) -> TaskState {
        let deadline = Instant::now() + max_wait;
        let mut guard = self.inner.lock().expect("task state lock");
        while guard.state == current {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (g, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .expect("task state condvar wait");
            guard = g;
        }
        guard.state
    }

    /// Register a listener fired asynchronously once per subsequent
    /// transition.
    pub fn add_state_change_listener(&self, listener: StateChangeListener) {
        let mut guard = self.inner.lock().expect("task state lock");
        guard.listeners.push(listener);
    }

    /// PLANNED -> RUNNING. No-op in any other state.
    pub fn start(&self) -> bool {
        self.transition(TaskState::Running, |state| state == TaskState::Planned)
    }

    /// Transition to FINISHED. No-op once terminal.
    pub fn finished(&self) -> bool {
        self.transition(TaskState::Finished, |state| !state.is_done())
    }

    /// Transition to CANCELED. No-op once terminal.
    pub fn cancel(&self) -> bool {
        self.transition(TaskState::Canceled, |state| !state.is_done())
    }

    /// Transition to ABORTED. No-op once terminal.
    pub fn abort(&self) -> bool {
        self.transition(TaskState::Aborted, |state| !state.is_done())
    }

    /// Record the cause and transition to FAILED. Causes arriving after the
    /// task is already terminal are dropped with the transition.
    pub fn failed(&self, cause: impl Into<String>) -> bool {
        let cause = cause.into();
        let (transitioned, listeners) = {
            let mut guard = self.inner.lock().expect("task state lock");
            if guard.state.is_done() {
                return false;
            }
            guard.failure_causes.push(cause);
            guard.state = TaskState::Failed;
            self.cv.notify_all();
            (true, guard.listeners.clone())
        };
        self.notify(listeners, TaskState::Failed);
        transitioned
    }

    fn transition(&self, new_state: TaskState, allowed: impl Fn(TaskState) -> bool) -> bool {
        let listeners = {
            let mut guard = self.inner.lock().expect("task state lock");
            if !allowed(guard.state) || guard.state == new_state {
                return false;
            }
            guard.state = new_state;
            self.cv.notify_all();
            guard.listeners.clone()
        };
        self.notify(listeners, new_state);
        true
    }

    fn notify(&self, listeners: Vec<StateChangeListener>, state: TaskState) {
        debug!("Task state changed: task_id={} state={:?}", self.task_id, state);
        for listener in listeners {
            self.notification_executor.execute(move || listener(state));
        }
    }
}
