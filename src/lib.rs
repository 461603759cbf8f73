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

//! A distributed OpenCL runtime.
//!
//! # Description
//!
//! This crate makes the OpenCL devices of remote machines usable as if
//! they were local. A host application links the [host] runtime, which
//! presents every device of every connected compute node behind a single
//! virtual OpenCL platform. Each remote machine runs the `dcld` daemon
//! (the [daemon] module), wrapping one native OpenCL platform and serving
//! its devices over the network.
//!
//! Kernels, programs, buffers and events are transparently replicated
//! across the participating nodes:
//!
//! * **Memory objects** have one replica per node; replicas may diverge
//!   between synchronisation points. When a command's event wait list
//!   names an event produced on another node, the memory objects attached
//!   to that event are acquired before the command runs: OpenCL's
//!   release/acquire semantics, stretched over the network.
//! * **Events** are distributed objects: the node that enqueued the
//!   producing command owns the native event, every other node holds a
//!   replica driven by execution-status messages. An event and its
//!   command share one process-wide id, allocated by the host.
//! * **Commands** execute on exactly the node owning their target device.
//!   Reads and writes move their bytes over a dedicated bulk channel,
//!   correlated with the commands by payload id.
//!
//! # Architecture
//!
//! * [host]: the application-facing object model: platform, compute
//!   nodes, devices, contexts, command queues, memory objects, programs,
//!   kernels, events.
//! * [daemon]: the compute-node side: sessions, the enqueue mirror, the
//!   consistency protocol, execution-status broadcasting.
//! * [protocol]: requests, responses and notifications, encoded with a
//!   length-prefixed network-byte-order codec.
//! * [transport]: the connection contract plus the TCP transport and an
//!   in-process loopback used by the test-suite.
//! * [native]: the driver contract a daemon executes on, with the
//!   built-in software platform and (behind the `dynamic`/`static`
//!   features) a `cl3`-backed adapter for real OpenCL drivers.
//! * [registry]: per-process dispatch of asynchronous notifications by
//!   object id.

pub mod daemon;
pub mod error;
pub mod host;
pub mod native;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;
pub mod util;

pub use error::{Error, Result};
