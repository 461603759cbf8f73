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

//! Small shared utilities.

use crate::types::cl_ulong;
use lazy_static::lazy_static;
use std::time::Instant;

lazy_static! {
    static ref CLOCK_EPOCH: Instant = Instant::now();
}

/// Monotonic process clock: nanoseconds since the first use in this
/// process. Event timestamps (queue times, receipt times, profiling) are
/// all taken from this clock.
pub fn clock_ns() -> cl_ulong {
    CLOCK_EPOCH.elapsed().as_nanos() as cl_ulong
}
