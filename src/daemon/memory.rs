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

//! Daemon-side memory object.
//!
//! Wraps the native buffer and implements the data-movement half of the
//! release/acquire protocol. Both operations are enqueued asynchronously:
//! a map on the native queue, the bulk transfer on map completion, and an
//! unmap gated on a user event that the transfer completion sets. The
//! returned unmap event is what consumers wait on instead of the event
//! that carried the data.

use crate::error::Result;
use crate::native;
use crate::transport::{Process, SendConstPtr, SendPtr};
use crate::types::{
    cl_mem_flags, ObjectId, PayloadId, CL_COMPLETE, CL_IO_ERROR, CL_MAP_READ, CL_MAP_WRITE,
    CL_MEM_READ_WRITE, CL_MEM_WRITE_ONLY,
};
use log::{debug, error};
use std::sync::Arc;

pub struct Buffer {
    id: ObjectId,
    native: Arc<dyn native::Buffer>,
}

impl Buffer {
    pub fn new(id: ObjectId, native: Arc<dyn native::Buffer>) -> Arc<Self> {
        Arc::new(Self { id, native })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn native(&self) -> &Arc<dyn native::Buffer> {
        &self.native
    }

    pub fn size(&self) -> usize {
        self.native.size()
    }

    pub fn flags(&self) -> cl_mem_flags {
        self.native.flags()
    }

    /// A buffer is an output if a kernel may write it.
    pub fn is_output(&self) -> bool {
        self.flags() & (CL_MEM_WRITE_ONLY | CL_MEM_READ_WRITE) != 0
    }

    /// Acquires this buffer's bytes from `process` once `release_event`
    /// has completed there. Returns the native event of the trailing unmap;
    /// it completes when the new contents are visible to the device.
    pub fn acquire(
        &self,
        context: &Arc<dyn native::Context>,
        process: &Arc<dyn Process>,
        queue: &Arc<dyn native::Queue>,
        release_event: &Arc<dyn native::Event>,
        payload: PayloadId,
    ) -> Result<Arc<dyn native::Event>> {
        debug!("(SYN) acquiring buffer from '{}' (ID={})", process.url(), self.id);

        let data_receipt = context.create_user_event()?;
        let size = self.size();
        let (ptr, map_event) = self.native_map(queue, CL_MAP_WRITE, release_event)?;
        let acquire_event =
            queue.enqueue_unmap_buffer(&self.native, ptr, &[data_receipt.clone()])?;

        let process = process.clone();
        let receipt = data_receipt.clone();
        map_event.set_callback(
            CL_COMPLETE,
            Box::new(move |status| {
                if status == CL_COMPLETE {
                    match process.receive_data(payload, size, ptr) {
                        Ok(transfer) => transfer.set_callback(move |status| {
                            let _ = receipt.set_status(status);
                        }),
                        Err(err) => {
                            error!("(SYN) acquire failed: {err}");
                            let _ = receipt.set_status(CL_IO_ERROR);
                        }
                    }
                } else {
                    let _ = receipt.set_status(status);
                }
            }),
        );

        Ok(acquire_event)
    }

    /// Releases this buffer's bytes to `process` once `release_event` has
    /// completed locally.
    pub fn release(
        &self,
        context: &Arc<dyn native::Context>,
        process: &Arc<dyn Process>,
        queue: &Arc<dyn native::Queue>,
        release_event: &Arc<dyn native::Event>,
        payload: PayloadId,
    ) -> Result<()> {
        debug!("(SYN) releasing buffer to '{}' (ID={})", process.url(), self.id);

        let data_sending = context.create_user_event()?;
        let size = self.size();
        let (ptr, map_event) = self.native_map(queue, CL_MAP_READ, release_event)?;
        queue.enqueue_unmap_buffer(&self.native, ptr, &[data_sending.clone()])?;

        let process = process.clone();
        let sending = data_sending.clone();
        map_event.set_callback(
            CL_COMPLETE,
            Box::new(move |status| {
                let ptr = ptr;
                if status == CL_COMPLETE {
                    match process.send_data(payload, size, SendConstPtr(ptr.0 as *const u8)) {
                        Ok(transfer) => transfer.set_callback(move |status| {
                            let _ = sending.set_status(status);
                        }),
                        Err(err) => {
                            error!("(SYN) release failed: {err}");
                            let _ = sending.set_status(CL_IO_ERROR);
                        }
                    }
                } else {
                    let _ = sending.set_status(status);
                }
            }),
        );

        Ok(())
    }

    fn native_map(
        &self,
        queue: &Arc<dyn native::Queue>,
        map_flags: u64,
        release_event: &Arc<dyn native::Event>,
    ) -> Result<(SendPtr, Arc<dyn native::Event>)> {
        queue.enqueue_map_buffer(
            &self.native,
            map_flags,
            0,
            self.size(),
            std::slice::from_ref(release_event),
        )
    }
}
