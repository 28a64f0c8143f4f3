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
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Byte count used for buffer and memory limits.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct DataSize(u64);

impl DataSize {
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    pub const fn from_kb(kb: u64) -> Self {
        Self(kb * 1024)
    }

    pub const fn from_mb(mb: u64) -> Self {
        Self(mb * 1024 * 1024)
    }

    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

/// One buffered unit of task output: a serialized row batch.
///
/// Pages are cheap to clone; the payload is shared, so multi-queue delivery
/// does not copy row data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page {
    data: Bytes,
    position_count: u64,
}

impl Page {
    pub fn new(data: Bytes, position_count: u64) -> Self {
        Self {
            data,
            position_count,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn position_count(&self) -> u64 {
        self.position_count
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Session attributes the coordinator attached to the task.
///
/// The execution layer only carries these; interpretation belongs to the
/// planner and the operators it compiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    pub catalog: String,
    pub schema: String,
}

impl Session {
    pub fn new(
        user: impl Into<String>,
        catalog: impl Into<String>,
        schema: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            catalog: catalog.into(),
            schema: schema.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_size_units() {
        assert_eq!(DataSize::from_kb(2).bytes(), 2048);
        assert_eq!(DataSize::from_mb(1).bytes(), 1024 * 1024);
        assert!(DataSize::from_mb(1) > DataSize::from_kb(1023));
    }

    #[test]
    fn page_clone_shares_payload() {
        let page = Page::new(Bytes::from_static(b"rows"), 3);
        let copy = page.clone();
        assert_eq!(copy.size_bytes(), 4);
        assert_eq!(copy.position_count(), 3);
        assert_eq!(page.data().as_ptr(), copy.data().as_ptr());
    }
}
