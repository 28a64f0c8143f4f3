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
//! Shared task output buffer.
//!
//! Responsibilities:
//! - Multiplexes produced pages to every registered output queue with
//!   per-consumer acknowledgement and long-poll reads.
//! - Retains pages until all declared consumers have taken them, applies soft
//!   backpressure to producers, and reports drain completion to the task.
//!
//! Key exported interfaces:
//! - Types: `SharedOutputBuffer`, `BufferResult`, `SharedBufferInfo`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::common::ids::OutputBufferId;
use crate::common::types::{DataSize, Page};
use crate::exec::signal::SignalFuture;

/// Result of one `get` long-poll: pages with contiguous sequence ids starting
/// at `starting_sequence_id`, and whether this queue has seen all output.
#[derive(Clone, Debug)]
pub struct BufferResult {
    pub starting_sequence_id: i64,
    pub pages: Vec<Page>,
    pub buffer_complete: bool,
}

impl BufferResult {
    pub fn empty(starting_sequence_id: i64, buffer_complete: bool) -> Self {
        Self {
            starting_sequence_id,
            pages: Vec::new(),
            buffer_complete,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn sequence_ids(&self) -> Vec<i64> {
        (self.starting_sequence_id..self.starting_sequence_id + self.pages.len() as i64).collect()
    }

    pub fn size_bytes(&self) -> u64 {
        self.pages.iter().map(Page::size_bytes).sum()
    }
}

/// Snapshot of the buffer for task info polling.
#[derive(Clone, Debug, Serialize)]
pub struct SharedBufferInfo {
    pub finished: bool,
    pub no_more_queues: bool,
    pub total_pages_added: u64,
    pub buffered_bytes: u64,
    pub queues: Vec<OutputQueueInfo>,
}

/// Per-consumer progress snapshot; `acknowledged_sequence_id` is the next
/// sequence id this consumer has not yet confirmed.
#[derive(Clone, Debug, Serialize)]
pub struct OutputQueueInfo {
    pub buffer_id: OutputBufferId,
    pub acknowledged_sequence_id: i64,
    pub aborted: bool,
}

#[derive(Debug)]
struct QueueState {
    current_sequence_id: i64,
    aborted: bool,
}

struct BufferState {
    pages: VecDeque<Page>,
    first_sequence_id: i64,
    next_sequence_id: i64,
    buffered_bytes: u64,
    total_pages_added: u64,
    // BTreeMap keeps info snapshots deterministic.
    queues: BTreeMap<OutputBufferId, QueueState>,
    no_more_queues: bool,
    finishing: bool,
    destroyed: bool,
    space_signals: Vec<Arc<SignalFuture>>,
}

/// Multi-queue page buffer between the task's output drivers and its remote
/// consumers.
pub struct SharedOutputBuffer {
    state: Mutex<BufferState>,
    cv: Condvar,
    max_buffered_bytes: u64,
}

impl SharedOutputBuffer {
    pub fn new(max_buffer_size: DataSize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BufferState {
                pages: VecDeque::new(),
                first_sequence_id: 0,
                next_sequence_id: 0,
                buffered_bytes: 0,
                total_pages_added: 0,
                queues: BTreeMap::new(),
                no_more_queues: false,
                finishing: false,
                destroyed: false,
                space_signals: Vec::new(),
            }),
            cv: Condvar::new(),
            max_buffered_bytes: max_buffer_size.bytes().max(1),
        })
    }

    /// Register an output queue. Re-registration of a known id is a no-op;
    /// new ids are rejected once `no_more_queues` is set.
    ///
    /// A new queue starts at the oldest retained page, which is sequence id 0
    /// until `no_more_queues` allows trimming, so late consumers still see
    /// every page.
    pub fn add_queue(&self, buffer_id: OutputBufferId) -> Result<(), String> {
        let mut state = self.state.lock().expect("shared buffer lock");
        if state.queues.contains_key(&buffer_id) {
            return Ok(());
        }
        if state.no_more_queues {
            return Err(format!(
                "no more queues already set, cannot add output queue {}",
                buffer_id
            ));
        }
        let start = state.first_sequence_id;
        state.queues.insert(
            buffer_id,
            QueueState {
                current_sequence_id: start,
                aborted: false,
            },
        );
        self.cv.notify_all();
        Ok(())
    }

    /// Declare that the set of output queues is complete. Idempotent.
    pub fn no_more_queues(&self) {
        let mut state = self.state.lock().expect("shared buffer lock");
        state.no_more_queues = true;
        self.advance(&mut state);
        self.cv.notify_all();
    }

    /// Append a page for every queue. Returns a backpressure signal: already
    /// complete while the buffer is under its soft limit, otherwise completed
    /// once consumers drain below it. Pages arriving after `finish` or
    /// `destroy` are dropped.
    pub fn add_page(&self, page: Page) -> Arc<SignalFuture> {
        let mut state = self.state.lock().expect("shared buffer lock");
        if state.finishing || state.destroyed {
            return SignalFuture::completed();
        }
        state.buffered_bytes += page.size_bytes();
        state.total_pages_added += 1;
        state.next_sequence_id += 1;
        state.pages.push_back(page);
        self.cv.notify_all();
        if state.buffered_bytes >= self.max_buffered_bytes {
            let signal = SignalFuture::new();
            state.space_signals.push(Arc::clone(&signal));
            signal
        } else {
            SignalFuture::completed()
        }
    }

    /// Long-poll read for one queue.
    ///
    /// Pages with sequence ids below `starting_sequence_id` are acknowledged
    /// and become eligible for trimming. Returns available pages at
    /// `starting_sequence_id` bounded by `max_size` (at least one page when
    /// any is available), or waits up to `max_wait` for pages, queue
    /// registration, or buffer completion.
    pub fn get(
        &self,
        buffer_id: &OutputBufferId,
        starting_sequence_id: i64,
        max_size: DataSize,
        max_wait: Duration,
    ) -> Result<BufferResult, String> {
        if max_size.bytes() == 0 {
            return Err("max_size must be at least 1 byte".to_string());
        }
        if starting_sequence_id < 0 {
            return Err(format!(
                "starting_sequence_id must be non-negative: {}",
                starting_sequence_id
            ));
        }
        let deadline = Instant::now() + max_wait;
        let mut state = self.state.lock().expect("shared buffer lock");
        loop {
            if state.destroyed {
                return Ok(BufferResult::empty(starting_sequence_id, true));
            }
            let lookup = state
                .queues
                .get(buffer_id)
                .map(|queue| (queue.aborted, queue.current_sequence_id));
            match lookup {
                None => {
                    // Queue unknown. Once the declared set is closed it can
                    // never appear, so report the stream complete; before
                    // that, wait out the poll for a late registration.
                    if state.no_more_queues {
                        return Ok(BufferResult::empty(starting_sequence_id, true));
                    }
                }
                Some((true, _)) => {
                    return Ok(BufferResult::empty(starting_sequence_id, true));
                }
                Some((false, current_sequence_id)) => {
                    // Acknowledge up to the requested id, clamped to what was
                    // actually produced.
                    let acknowledged = starting_sequence_id.min(state.next_sequence_id);
                    if acknowledged > current_sequence_id {
                        let queue = state.queues.get_mut(buffer_id).expect("queue present");
                        queue.current_sequence_id = acknowledged;
                        self.advance(&mut state);
                    }
                    let result = self.collect(&state, starting_sequence_id, max_size);
                    if !result.is_empty() || result.buffer_complete {
                        return Ok(result);
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(BufferResult::empty(starting_sequence_id, false));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("shared buffer condvar wait");
            state = guard;
        }
    }

    /// Discard one queue. Unknown ids are recorded as aborted so the consumer
    /// never resurrects; never fails.
    pub fn abort(&self, buffer_id: &OutputBufferId) {
        let mut state = self.state.lock().expect("shared buffer lock");
        match state.queues.get_mut(buffer_id) {
            Some(queue) => queue.aborted = true,
            None => {
                state.queues.insert(
                    buffer_id.clone(),
                    QueueState {
                        current_sequence_id: 0,
                        aborted: true,
                    },
                );
            }
        }
        self.advance(&mut state);
        self.cv.notify_all();
    }

    /// Declare that no more pages will be added. Idempotent.
    pub fn finish(&self) {
        let mut state = self.state.lock().expect("shared buffer lock");
        state.finishing = true;
        self.advance(&mut state);
        self.cv.notify_all();
    }

    /// True once `finish` and `no_more_queues` are set and every queue has
    /// drained or aborted.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock().expect("shared buffer lock");
        Self::is_finished_locked(&state)
    }

    /// Drop all pages and release every waiter. Used when the task reaches a
    /// terminal state that will never drain the buffer.
    pub fn destroy(&self) {
        let signals = {
            let mut state = self.state.lock().expect("shared buffer lock");
            state.destroyed = true;
            state.pages.clear();
            state.buffered_bytes = 0;
            self.cv.notify_all();
            std::mem::take(&mut state.space_signals)
        };
        for signal in signals {
            signal.complete();
        }
    }

    pub fn info(&self) -> SharedBufferInfo {
        let state = self.state.lock().expect("shared buffer lock");
        SharedBufferInfo {
            finished: Self::is_finished_locked(&state),
            no_more_queues: state.no_more_queues,
            total_pages_added: state.total_pages_added,
            buffered_bytes: state.buffered_bytes,
            queues: state
                .queues
                .iter()
                .map(|(id, queue)| OutputQueueInfo {
                    buffer_id: id.clone(),
                    acknowledged_sequence_id: queue.current_sequence_id,
                    aborted: queue.aborted,
                })
                .collect(),
        }
    }

    fn is_finished_locked(state: &BufferState) -> bool {
        if state.destroyed {
            return true;
        }
        state.finishing
            && state.no_more_queues
            && state
                .queues
                .values()
                .all(|queue| queue.aborted || queue.current_sequence_id >= state.next_sequence_id)
    }

    fn collect(&self, state: &BufferState, starting_sequence_id: i64, max_size: DataSize) -> BufferResult {
        // Pages below the retained window were already consumed and trimmed;
        // resume from the oldest retained page in that case.
        let start = starting_sequence_id.max(state.first_sequence_id);
        let mut pages = Vec::new();
        let mut bytes = 0u64;
        let mut index = (start - state.first_sequence_id) as usize;
        while index < state.pages.len() {
            let page = &state.pages[index];
            if !pages.is_empty() && bytes + page.size_bytes() > max_size.bytes() {
                break;
            }
            bytes += page.size_bytes();
            pages.push(page.clone());
            index += 1;
        }
        let end = start + pages.len() as i64;
        let buffer_complete = state.finishing && end >= state.next_sequence_id;
        BufferResult {
            starting_sequence_id: start,
            pages,
            buffer_complete,
        }
    }

    /// Trim acknowledged pages and release producer backpressure. Retention:
    /// nothing is trimmed until the queue set is closed, because a queue
    /// registered later must still see every page.
    fn advance(&self, state: &mut BufferState) {
        if !state.no_more_queues {
            return;
        }
        let min_unacknowledged = state
            .queues
            .values()
            .filter(|queue| !queue.aborted)
            .map(|queue| queue.current_sequence_id)
            .min()
            .unwrap_or(state.next_sequence_id);
        while state.first_sequence_id < min_unacknowledged {
            let Some(page) = state.pages.pop_front() else {
                break;
            };
            state.buffered_bytes = state.buffered_bytes.saturating_sub(page.size_bytes());
            state.first_sequence_id += 1;
        }
        if state.buffered_bytes < self.max_buffered_bytes && !state.space_signals.is_empty() {
            for signal in std::mem::take(&mut state.space_signals) {
                signal.complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::thread;

    fn page(tag: &str) -> Page {
        Page::new(Bytes::copy_from_slice(tag.as_bytes()), 1)
    }

    fn buffer() -> Arc<SharedOutputBuffer> {
        SharedOutputBuffer::new(DataSize::from_mb(1))
    }

    #[test]
    fn pages_are_delivered_in_order_with_contiguous_ids() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add queue");
        buffer.add_page(page("a"));
        buffer.add_page(page("b"));
        buffer.add_page(page("c"));

        let result = buffer
            .get(&q0, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.sequence_ids(), vec![0, 1, 2]);
        assert_eq!(result.pages[0].data().as_ref(), b"a");
        assert!(!result.buffer_complete);
    }

    #[test]
    fn max_size_bounds_result_but_returns_at_least_one_page() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add queue");
        buffer.add_page(page("0123456789"));
        buffer.add_page(page("0123456789"));

        let result = buffer
            .get(&q0, 0, DataSize::from_bytes(3), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.pages.len(), 1);
        let result = buffer
            .get(&q0, 0, DataSize::from_bytes(15), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.pages.len(), 1);
        let result = buffer
            .get(&q0, 0, DataSize::from_bytes(20), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.pages.len(), 2);
    }

    #[test]
    fn late_queue_sees_pages_added_before_registration() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        buffer.add_page(page("a"));
        buffer.add_page(page("b"));

        // q0 consumes and acknowledges everything before q1 exists.
        let result = buffer
            .get(&q0, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get q0");
        assert_eq!(result.pages.len(), 2);
        let _ = buffer.get(&q0, 2, DataSize::from_mb(1), Duration::from_millis(10));

        let q1 = OutputBufferId::new("q1");
        buffer.add_queue(q1.clone()).expect("add q1");
        buffer.no_more_queues();
        let result = buffer
            .get(&q1, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get q1");
        assert_eq!(result.sequence_ids(), vec![0, 1]);
    }

    #[test]
    fn add_queue_rejected_after_no_more_queues() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        buffer.no_more_queues();
        assert!(buffer.add_queue(q0).is_ok());
        assert!(buffer.add_queue(OutputBufferId::new("q1")).is_err());
    }

    #[test]
    fn finish_is_idempotent_and_completes_drained_queues() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        buffer.no_more_queues();
        buffer.add_page(page("a"));
        buffer.finish();
        buffer.finish();
        assert!(!buffer.is_finished());

        let result = buffer
            .get(&q0, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.pages.len(), 1);
        assert!(result.buffer_complete);
        assert!(!buffer.is_finished());

        // The final acknowledgement drains the queue.
        let result = buffer
            .get(&q0, 1, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("ack");
        assert!(result.is_empty());
        assert!(result.buffer_complete);
        assert!(buffer.is_finished());
    }

    #[test]
    fn long_poll_wakes_on_new_page() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        let buffer_cloned = Arc::clone(&buffer);
        let q0_cloned = q0.clone();
        let reader = thread::spawn(move || {
            buffer_cloned.get(&q0_cloned, 0, DataSize::from_mb(1), Duration::from_secs(10))
        });
        thread::sleep(Duration::from_millis(20));
        buffer.add_page(page("a"));
        let result = reader.join().expect("join reader").expect("get");
        assert_eq!(result.pages.len(), 1);
    }

    #[test]
    fn unknown_queue_completes_once_no_more_queues() {
        let buffer = buffer();
        let ghost = OutputBufferId::new("ghost");
        let result = buffer
            .get(&ghost, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get before close");
        assert!(!result.buffer_complete);
        buffer.no_more_queues();
        let result = buffer
            .get(&ghost, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get after close");
        assert!(result.buffer_complete);
    }

    #[test]
    fn abort_drops_queue_from_drain_accounting() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        let q1 = OutputBufferId::new("q1");
        buffer.add_queue(q0.clone()).expect("add q0");
        buffer.add_queue(q1.clone()).expect("add q1");
        buffer.no_more_queues();
        buffer.add_page(page("a"));
        buffer.finish();

        let _ = buffer.get(&q0, 1, DataSize::from_mb(1), Duration::from_millis(10));
        assert!(!buffer.is_finished());
        buffer.abort(&q1);
        assert!(buffer.is_finished());
        let result = buffer
            .get(&q1, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("aborted get");
        assert!(result.is_empty());
        assert!(result.buffer_complete);
    }

    #[test]
    fn backpressure_signal_completes_on_drain() {
        let buffer = SharedOutputBuffer::new(DataSize::from_bytes(4));
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        buffer.no_more_queues();

        let first = buffer.add_page(page("abcd"));
        assert!(!first.is_done());
        let result = buffer
            .get(&q0, 0, DataSize::from_mb(1), Duration::from_millis(10))
            .expect("get");
        assert_eq!(result.pages.len(), 1);
        // Acknowledge; the page is trimmed and space frees up.
        let _ = buffer.get(&q0, 1, DataSize::from_mb(1), Duration::from_millis(10));
        assert!(first.is_done());
    }

    #[test]
    fn destroy_unblocks_readers_with_complete_result() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        let buffer_cloned = Arc::clone(&buffer);
        let q0_cloned = q0.clone();
        let reader = thread::spawn(move || {
            buffer_cloned.get(&q0_cloned, 0, DataSize::from_mb(1), Duration::from_secs(10))
        });
        thread::sleep(Duration::from_millis(20));
        buffer.destroy();
        let result = reader.join().expect("join reader").expect("get");
        assert!(result.is_empty());
        assert!(result.buffer_complete);
        assert!(buffer.is_finished());
    }

    #[test]
    fn get_rejects_zero_max_size() {
        let buffer = buffer();
        let q0 = OutputBufferId::new("q0");
        buffer.add_queue(q0.clone()).expect("add q0");
        assert!(
            buffer
                .get(&q0, 0, DataSize::from_bytes(0), Duration::from_millis(10))
                .is_err()
        );
    }
}
