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

//! Daemon-side command queue: the mirror of the host's enqueue protocol.
//!
//! Synchronisation is based on the events in a wait list. Events owned by
//! this node and user events are passed to the native driver directly; a
//! replica event is resolved through [`Event::synchronize`], which splices
//! the native events of the acquire operations into the wait list. The
//! acquires are enqueued once, on the first queue that consumes the event
//! on this node; a second queue waiting on the same event reuses them, so
//! the data becomes visible to its device without a second transfer.
//!
//! Read-style commands are finished by the host (it receives the bytes),
//! so this side sends only a `CL_SUBMITTED` notice when the transfer
//! starts. Write-style commands notify the host on completion of the
//! trailing unmap, whether or not an event was requested, so that blocking
//! writes return.

use super::context::Context;
use super::event::Event;
use super::memory::Buffer;
use super::program::Kernel;
use super::session::Session;
use crate::error::{Error, Result};
use crate::native;
use crate::protocol::{EnqueueHeader, EventMessage};
use crate::transport::{Process, SendConstPtr, SendPtr};
use crate::types::{
    cl_command_queue_properties, cl_map_flags, ObjectId, PayloadId, CL_COMPLETE, CL_INVALID_EVENT,
    CL_INVALID_VALUE, CL_IO_ERROR, CL_MAP_READ, CL_MAP_WRITE, CL_SUBMITTED,
};
use log::{debug, error};
use std::sync::Arc;

pub struct CommandQueue {
    context: Arc<Context>,
    native: Arc<dyn native::Queue>,
}

impl CommandQueue {
    pub fn new(
        context: Arc<Context>,
        device_index: usize,
        properties: cl_command_queue_properties,
    ) -> Result<Arc<Self>> {
        let native = context.native().create_queue(device_index, properties)?;
        Ok(Arc::new(Self { context, native }))
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Converts an event-id wait list into a native event wait list,
    /// enqueuing acquire operations for replica events as required. The
    /// native queue is flushed when a replica was resolved so the acquires
    /// make progress even if the consumer is never flushed explicitly.
    fn synchronize(
        &self,
        session: &Session,
        wait_list: &[ObjectId],
    ) -> Result<Vec<Arc<dyn native::Event>>> {
        if wait_list.is_empty() {
            return Ok(Vec::new());
        }
        debug!("synchronizing event wait list with {} event(s)", wait_list.len());

        let mut native_events = Vec::with_capacity(wait_list.len());
        let mut synchronization_pending = false;
        for id in wait_list {
            let event = session.event(*id).ok_or(Error::Cl(CL_INVALID_EVENT))?;
            if event.is_replica() {
                synchronization_pending = true;
            }
            native_events.extend(event.synchronize(&self.native)?);
        }
        if synchronization_pending {
            self.native.flush()?;
        }
        Ok(native_events)
    }

    pub fn enqueue_read_buffer(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        buffer: &Arc<Buffer>,
        blocking: bool,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;

        let copy_complete = self.context.native().create_user_event()?;
        let (ptr, map_data) =
            self.native
                .enqueue_map_buffer(buffer.native(), CL_MAP_READ, offset, size, &wait_list)?;
        let unmap_data =
            self.native
                .enqueue_unmap_buffer(buffer.native(), ptr, &[copy_complete.clone()])?;
        if blocking {
            self.native.flush()?;
        }

        // The host finishes read commands; only the submission notice and
        // the data itself leave this node.
        schedule_device_to_host(
            self.context.host().clone(),
            header.command_id,
            size,
            ptr,
            &map_data,
            copy_complete,
        );

        if header.want_event {
            let event = Event::read_compound(
                header.command_id,
                self.context.clone(),
                map_data,
                unmap_data,
            );
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_write_buffer(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        buffer: &Arc<Buffer>,
        blocking: bool,
        offset: usize,
        size: usize,
        payload: PayloadId,
    ) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;

        let copy_complete = self.context.native().create_user_event()?;
        let (ptr, map_data) =
            self.native
                .enqueue_map_buffer(buffer.native(), CL_MAP_WRITE, offset, size, &wait_list)?;
        let unmap_data =
            self.native
                .enqueue_unmap_buffer(buffer.native(), ptr, &[copy_complete.clone()])?;
        if blocking {
            self.native.flush()?;
        }

        schedule_host_to_device(
            self.context.host().clone(),
            header.command_id,
            payload,
            size,
            ptr,
            &map_data,
            copy_complete,
        );
        // The completion notice must also be sent when no event was
        // requested, so that a blocking write returns.
        schedule_set_complete(self.context.host().clone(), header.command_id, &unmap_data);

        if header.want_event {
            let event = Event::write_compound(
                header.command_id,
                self.context.clone(),
                buffer.clone(),
                map_data,
                unmap_data,
            );
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_copy_buffer(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    ) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;
        let copy = self.native.enqueue_copy_buffer(
            src.native(),
            dst.native(),
            src_offset,
            dst_offset,
            size,
            &wait_list,
        )?;
        if header.want_event {
            let event = Event::simple(
                header.command_id,
                self.context.clone(),
                vec![dst.clone()],
                copy,
            );
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_map_buffer(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        buffer: &Arc<Buffer>,
        blocking: bool,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
    ) -> Result<()> {
        if map_flags & CL_MAP_READ != 0 {
            // the mapped region must be downloaded to the host pointer
            self.enqueue_read_buffer(session, header, buffer, blocking, offset, size)
        } else {
            // nothing to transfer for a write-only mapping
            self.enqueue_phony_marker(session, header, blocking)
        }
    }

    pub fn enqueue_unmap_buffer(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        buffer: &Arc<Buffer>,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        payload: PayloadId,
    ) -> Result<()> {
        if map_flags & CL_MAP_WRITE != 0 {
            // upload the written region into the buffer
            self.enqueue_write_buffer(session, header, buffer, false, offset, size, payload)
        } else {
            self.enqueue_phony_marker(session, header, false)
        }
    }

    /// A marker standing in for a command with no device-side work. The
    /// completion notice drives the host-side command.
    fn enqueue_phony_marker(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        blocking: bool,
    ) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;
        let marker = self.native.enqueue_marker(&wait_list)?;
        if blocking {
            self.native.flush()?;
        }
        schedule_set_complete(self.context.host().clone(), header.command_id, &marker);
        if header.want_event {
            let event = Event::node_local(header.command_id, self.context.clone(), marker);
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_ndrange_kernel(
        &self,
        session: &Session,
        header: &EnqueueHeader,
        kernel: &Arc<Kernel>,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
    ) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;
        let run = self.native.enqueue_ndrange_kernel(
            kernel.native(),
            offset,
            global,
            local,
            &wait_list,
        )?;
        if header.want_event {
            let event = Event::simple(
                header.command_id,
                self.context.clone(),
                kernel.write_memory_objects(),
                run,
            );
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_marker(&self, session: &Session, header: &EnqueueHeader) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;
        let marker = self.native.enqueue_marker(&wait_list)?;
        if header.want_event {
            let event =
                Event::simple(header.command_id, self.context.clone(), Vec::new(), marker);
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_barrier(&self, session: &Session, header: &EnqueueHeader) -> Result<()> {
        let wait_list = self.synchronize(session, &header.wait_list)?;
        let barrier = self.native.enqueue_barrier(&wait_list)?;
        if header.want_event {
            let event =
                Event::simple(header.command_id, self.context.clone(), Vec::new(), barrier);
            session.insert_event(event);
        }
        Ok(())
    }

    pub fn enqueue_wait_for_events(
        &self,
        session: &Session,
        event_ids: &[ObjectId],
    ) -> Result<()> {
        if event_ids.is_empty() {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        let wait_list = self.synchronize(session, event_ids)?;
        self.native.enqueue_barrier(&wait_list)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.native.flush()
    }

    /// clFinish is a synchronisation point; only local completion is
    /// enforced, replication happens through event wait lists.
    pub fn finish(&self) -> Result<()> {
        self.native.finish()
    }
}

/// Sends the submission notice and starts the device-to-host transfer when
/// the map operation completes. `copy_complete` gates the trailing unmap.
fn schedule_device_to_host(
    host: Arc<dyn Process>,
    command_id: ObjectId,
    size: usize,
    ptr: SendPtr,
    map_data: &Arc<dyn native::Event>,
    copy_complete: Arc<dyn native::Event>,
) {
    map_data.set_callback(
        CL_COMPLETE,
        Box::new(move |status| {
            let ptr = ptr;
            if status != CL_COMPLETE {
                let _ = copy_complete.set_status(status);
                return;
            }
            let notice =
                EventMessage::CommandExecutionStatusChanged { id: command_id, status: CL_SUBMITTED };
            if let Err(err) = host.send_message(&notice) {
                error!("sending submission notice failed (ID={command_id}): {err}");
                let _ = copy_complete.set_status(CL_IO_ERROR);
                return;
            }
            match host.send_data(
                PayloadId::command(command_id),
                size,
                SendConstPtr(ptr.0 as *const u8),
            ) {
                Ok(transfer) => transfer.set_callback(move |status| {
                    let _ = copy_complete.set_status(status);
                }),
                Err(err) => {
                    error!("starting data upload failed (ID={command_id}): {err}");
                    let _ = copy_complete.set_status(CL_IO_ERROR);
                }
            }
        }),
    );
}

/// Sends the submission notice and starts the host-to-device transfer when
/// the map operation completes.
fn schedule_host_to_device(
    host: Arc<dyn Process>,
    command_id: ObjectId,
    payload: PayloadId,
    size: usize,
    ptr: SendPtr,
    map_data: &Arc<dyn native::Event>,
    copy_complete: Arc<dyn native::Event>,
) {
    map_data.set_callback(
        CL_COMPLETE,
        Box::new(move |status| {
            if status != CL_COMPLETE {
                let _ = copy_complete.set_status(status);
                return;
            }
            let notice =
                EventMessage::CommandExecutionStatusChanged { id: command_id, status: CL_SUBMITTED };
            if let Err(err) = host.send_message(&notice) {
                error!("sending submission notice failed (ID={command_id}): {err}");
                let _ = copy_complete.set_status(CL_IO_ERROR);
                return;
            }
            match host.receive_data(payload, size, ptr) {
                Ok(transfer) => transfer.set_callback(move |status| {
                    let _ = copy_complete.set_status(status);
                }),
                Err(err) => {
                    error!("starting data receipt failed (ID={command_id}): {err}");
                    let _ = copy_complete.set_status(CL_IO_ERROR);
                }
            }
        }),
    );
}

/// Reports the final status of a command to the host when `on` completes.
fn schedule_set_complete(host: Arc<dyn Process>, command_id: ObjectId, on: &Arc<dyn native::Event>) {
    on.set_callback(
        CL_COMPLETE,
        Box::new(move |status| {
            let status = if status < 0 { status } else { CL_COMPLETE };
            let message = EventMessage::CommandExecutionStatusChanged { id: command_id, status };
            if let Err(err) = host.send_message(&message) {
                error!("sending completion notice failed (ID={command_id}): {err}");
            }
        }),
    );
}
