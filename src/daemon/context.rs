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

//! Daemon-side context: the native context for the host's device selection,
//! the process handles of the host and the peer compute nodes, and the
//! dedicated I/O command queue.
//!
//! The I/O queue never executes application work; it is reserved for
//! consistency-protocol transfers so that a release operation cannot
//! deadlock against commands blocked on the application queues.

use crate::error::Result;
use crate::native;
use crate::transport::Process;
use crate::types::ObjectId;
use std::sync::Arc;

pub struct Context {
    id: ObjectId,
    native: Arc<dyn native::Context>,
    io_queue: Arc<dyn native::Queue>,
    host: Arc<dyn Process>,
    peers: Vec<Arc<dyn Process>>,
}

impl Context {
    pub fn new(
        id: ObjectId,
        platform: &Arc<dyn native::Platform>,
        device_indices: &[usize],
        host: Arc<dyn Process>,
        peers: Vec<Arc<dyn Process>>,
    ) -> Result<Arc<Self>> {
        let native = platform.create_context(device_indices)?;
        // default properties: the I/O queue must stay in-order
        let io_queue = native.create_queue(0, 0)?;
        Ok(Arc::new(Self { id, native, io_queue, host, peers }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn native(&self) -> &Arc<dyn native::Context> {
        &self.native
    }

    pub fn io_queue(&self) -> &Arc<dyn native::Queue> {
        &self.io_queue
    }

    pub fn host(&self) -> &Arc<dyn Process> {
        &self.host
    }

    pub fn peers(&self) -> &[Arc<dyn Process>] {
        &self.peers
    }
}
