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
//! One-shot completion signals for cooperative suspension.
//!
//! Responsibilities:
//! - Carries the "more work is possible" future a blocked driver hands back
//!   to the executor, and the backpressure future of the shared buffer.
//! - Guarantees callbacks fire exactly once, with no missed wakeups.
//!
//! Key exported interfaces:
//! - Types: `SignalFuture`.

use std::sync::{Arc, Mutex};

type SignalCallback = Box<dyn FnOnce() + Send + 'static>;

struct SignalState {
    done: bool,
    callbacks: Vec<SignalCallback>,
}

/// One-shot latch a blocked component completes when progress is possible
/// again. Completion is idempotent; callbacks registered after completion run
/// inline on the registering thread.
pub struct SignalFuture {
    state: Mutex<SignalState>,
}

impl SignalFuture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                done: false,
                callbacks: Vec::new(),
            }),
        })
    }

    /// An already-completed signal, for the not-blocked fast path.
    pub fn completed() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SignalState {
                done: true,
                callbacks: Vec::new(),
            }),
        })
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().expect("signal lock").done
    }

    /// Complete the signal. Callbacks run on the calling thread, outside the
    /// signal lock.
    pub fn complete(&self) {
        let callbacks = {
            let mut guard = self.state.lock().expect("signal lock");
            if guard.done {
                return;
            }
            guard.done = true;
            std::mem::take(&mut guard.callbacks)
        };
        for callback in callbacks {
            callback();
        }
    }

    /// Register a callback to run once the signal completes. Registration and
    /// the done check happen under one lock, so a wakeup cannot be lost
    /// between them.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut guard = self.state.lock().expect("signal lock");
            if !guard.done {
                guard.callbacks.push(Box::new(callback));
                return;
            }
        }
        callback();
    }
}
