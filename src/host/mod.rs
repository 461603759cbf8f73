// Copyright (c) 2021-2023 Via Technology Ltd. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host-side runtime: the virtual platform and the OpenCL object model the
//! application links against. Remote devices appear as local ones; every
//! operation is translated into requests to the daemons owning the target
//! devices.

pub mod command;
pub mod command_queue;
pub mod compute_node;
pub mod context;
pub mod device;
pub mod event;
pub mod kernel;
pub mod memory;
pub mod platform;
pub mod program;

use std::sync::atomic::{AtomicU32, Ordering};

/// OpenCL-style reference count. Objects start with one reference; the
/// release that drives the count to zero is the only one that may destroy
/// the object.
pub(crate) struct References(AtomicU32);

impl References {
    pub fn new() -> Self {
        Self(AtomicU32::new(1))
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn retain(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the count; `true` if this release dropped it to zero.
    pub fn release(&self) -> bool {
        let previous = self.0.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
        previous == 1
    }
}
