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
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::micarocks_logging::error;

type NotifyJob = Box<dyn FnOnce() + Send + 'static>;

/// FIFO executor for state-change listeners and driver completion callbacks.
///
/// Runs a single consumer thread so callbacks for one task are delivered in
/// submission order and never on the thread that triggered the transition;
/// listeners that re-enter the task cannot deadlock the transitioner.
pub struct NotificationExecutor {
    inner: Arc<NotifyInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct NotifyInner {
    queue: Mutex<VecDeque<NotifyJob>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl NotificationExecutor {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let inner = Arc::new(NotifyInner {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let inner_cloned = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(name.into())
            .spawn(move || worker_loop(inner_cloned))
            .expect("notification executor thread");
        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue a job; never blocks. Jobs submitted after shutdown are dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        let mut queue = self.inner.queue.lock().expect("notification queue lock");
        queue.push_back(Box::new(job));
        self.inner.cv.notify_one();
    }

    /// Stop the consumer after draining already-queued jobs.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cv.notify_all();
        let handle = {
            let mut guard = self.worker.lock().expect("notification worker lock");
            guard.take()
        };
        if let Some(handle) = handle {
            if thread::current().id() != handle.thread().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for NotificationExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<NotifyInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().expect("notification queue lock");
            loop {
                if let Some(job) = queue.pop_front() {
                    break Some(job);
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                queue = inner
                    .cv
                    .wait(queue)
                    .expect("notification queue condvar wait");
            }
        };
        let Some(job) = job else {
            return;
        };
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
            error!("notification job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let executor = NotificationExecutor::new("notify-test");
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            executor.execute(move || {
                let _ = tx.send(i);
            });
        }
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(rx.recv_timeout(Duration::from_secs(5)).expect("job ran"));
        }
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let executor = NotificationExecutor::new("notify-drain");
        let (tx, rx) = mpsc::channel();
        executor.execute(move || {
            let _ = tx.send(());
        });
        executor.shutdown();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn panicking_job_does_not_kill_consumer() {
        let executor = NotificationExecutor::new("notify-panic");
        executor.execute(|| panic!("listener bug"));
        let (tx, rx) = mpsc::channel();
        executor.execute(move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
