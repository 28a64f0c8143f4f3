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
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks logical memory usage for a component and its ancestors.
///
/// This is a lightweight accounting utility that only records bytes
/// explicitly reported by the caller. It does NOT reflect real process RSS or
/// allocator statistics.
#[derive(Debug)]
pub struct MemTracker {
    label: String,
    limit: i64,
    parent: Option<Arc<MemTracker>>,
    current: AtomicI64,
    peak: AtomicI64,
}

impl MemTracker {
    /// Create a root tracker. `limit < 0` means unlimited.
    pub fn new_root(label: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit,
            parent: None,
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    /// Create an unlimited child tracker; consumption propagates to the
    /// parent, so the parent limit still applies.
    pub fn new_child(label: impl Into<String>, parent: &Arc<MemTracker>) -> Arc<Self> {
        Arc::new(Self {
            label: label.into(),
            limit: -1,
            parent: Some(Arc::clone(parent)),
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Increase consumption for this tracker and all ancestors.
    pub fn consume(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(t) = tracker {
            let updated = t.current.fetch_add(bytes, Ordering::Relaxed) + bytes;
            t.peak.fetch_max(updated, Ordering::Relaxed);
            tracker = t.parent.as_deref();
        }
    }

    /// Consume, failing without side effects when any tracker in the chain
    /// would exceed its limit.
    pub fn try_consume(&self, bytes: i64) -> Result<(), String> {
        if bytes <= 0 {
            return Ok(());
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(t) = tracker {
            if t.limit >= 0 && t.current.load(Ordering::Relaxed) + bytes > t.limit {
                return Err(format!(
                    "memory limit exceeded: tracker={} limit={} requested={}",
                    t.label, t.limit, bytes
                ));
            }
            tracker = t.parent.as_deref();
        }
        self.consume(bytes);
        Ok(())
    }

    /// Decrease consumption for this tracker and all ancestors.
    pub fn release(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut tracker: Option<&MemTracker> = Some(self);
        while let Some(t) = tracker {
            t.current.fetch_sub(bytes, Ordering::Relaxed);
            tracker = t.parent.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumption_propagates_to_ancestors() {
        let root = MemTracker::new_root("task", -1);
        let pipeline = MemTracker::new_child("pipeline 0", &root);
        let driver = MemTracker::new_child("driver 0", &pipeline);

        driver.consume(100);
        assert_eq!(driver.current(), 100);
        assert_eq!(pipeline.current(), 100);
        assert_eq!(root.current(), 100);

        driver.release(40);
        assert_eq!(root.current(), 60);
        assert_eq!(root.peak(), 100);
    }

    #[test]
    fn try_consume_respects_ancestor_limit() {
        let root = MemTracker::new_root("task", 128);
        let child = MemTracker::new_child("driver", &root);
        child.try_consume(100).expect("within limit");
        let err = child.try_consume(100).expect_err("over limit");
        assert!(err.contains("memory limit exceeded"));
        assert_eq!(root.current(), 100);
    }
}
