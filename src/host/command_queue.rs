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

//! Host-side command queue.
//!
//! Every enqueue follows one outline: validate the arguments against the
//! queue's context, convert the event wait list into remote event ids,
//! create the local command (and its event), send the enqueue request to
//! the daemon owning the device, and, for blocking calls, wait on the
//! command. Completed commands are garbage-collected from the queue's
//! in-flight list on each enqueue; `finish` drains it.

use super::command::{Command, CommandKind};
use super::context::Context;
use super::device::Device;
use super::event::Event;
use super::kernel::Kernel;
use super::memory::{check_context, Buffer};
use super::References;
use crate::error::{Error, Result};
use crate::protocol::{EnqueueHeader, Request};
use crate::transport::{SendConstPtr, SendPtr};
use crate::types::{
    cl_command_queue_properties, cl_map_flags, ObjectId, PayloadId, CL_COMMAND_BARRIER,
    CL_COMMAND_BROADCAST_BUFFER, CL_COMMAND_COPY_BUFFER, CL_COMMAND_MAP_BUFFER,
    CL_COMMAND_MARKER, CL_COMMAND_NDRANGE_KERNEL, CL_COMMAND_READ_BUFFER, CL_COMMAND_TASK,
    CL_COMMAND_UNMAP_MEM_OBJECT, CL_COMMAND_WRITE_BUFFER, CL_INVALID_CONTEXT, CL_INVALID_DEVICE,
    CL_INVALID_EVENT, CL_INVALID_VALUE, CL_MAP_WRITE,
};
use log::{info, warn};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct CommandQueue {
    id: ObjectId,
    context: Arc<Context>,
    device: Arc<Device>,
    properties: cl_command_queue_properties,
    commands: Mutex<Vec<Arc<Command>>>,
    references: References,
    destroyed: AtomicBool,
}

impl CommandQueue {
    pub fn create(
        context: &Arc<Context>,
        device: &Arc<Device>,
        properties: cl_command_queue_properties,
    ) -> Result<Arc<Self>> {
        if !context.has_device(device) {
            return Err(Error::Cl(CL_INVALID_DEVICE));
        }
        let id = context.next_id();
        let node = device.compute_node()?;
        node.execute_command(&Request::CreateCommandQueue {
            id,
            context_id: context.id(),
            device_index: device.index(),
            properties,
        })?;
        info!("command queue created (ID={id})");
        Ok(Arc::new(Self {
            id,
            context: context.clone(),
            device: device.clone(),
            properties,
            commands: Mutex::new(Vec::new()),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn properties(&self) -> cl_command_queue_properties {
        self.properties
    }

    /// Forwards a flush to the daemon.
    pub fn flush(&self) -> Result<()> {
        let node = self.device.compute_node()?;
        node.execute_command(&Request::FlushQueue { id: self.id })?;
        Ok(())
    }

    /// Forwards a finish to the daemon, then awaits local completion of
    /// every command enqueued on this queue.
    pub fn finish(&self) -> Result<()> {
        let node = self.device.compute_node()?;
        node.execute_command(&Request::FinishQueue { id: self.id })?;
        self.finish_locally()?;
        info!("finished command queue (ID={})", self.id);
        Ok(())
    }

    /// Waits until every pending command has completed on the host.
    fn finish_locally(&self) -> Result<()> {
        let commands = {
            let mut commands = self.commands.lock().unwrap();
            std::mem::take(&mut *commands)
        };
        for command in commands {
            command.wait()?;
        }
        Ok(())
    }

    /// Converts the host-level wait list into remote event ids, validating
    /// that every event belongs to this queue's context.
    fn event_id_wait_list(&self, event_wait_list: &[Arc<Event>]) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::with_capacity(event_wait_list.len());
        for event in event_wait_list {
            if !Arc::ptr_eq(event.context(), &self.context) {
                return Err(Error::Cl(CL_INVALID_CONTEXT));
            }
            ids.push(event.remote_id());
        }
        Ok(ids)
    }

    /// Tracks a new in-flight command, dropping completed ones.
    fn enqueue_command(&self, command: &Arc<Command>) {
        let mut commands = self.commands.lock().unwrap();
        commands.retain(|command| !command.is_complete());
        commands.push(command.clone());
    }

    fn header(&self, command: &Arc<Command>, wait_list: Vec<ObjectId>) -> EnqueueHeader {
        EnqueueHeader {
            queue_id: self.id,
            command_id: command.id(),
            wait_list,
            want_event: true,
        }
    }

    /// Downloads `data.len()` elements of `buffer` at byte `offset` into
    /// `data`.
    ///
    /// The caller keeps `data` alive and unaliased until the returned
    /// event (or, for a blocking read, this call) completes.
    pub fn enqueue_read_buffer<T>(
        self: &Arc<Self>,
        buffer: &Arc<Buffer>,
        blocking: bool,
        offset: usize,
        data: &mut [T],
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        check_context(buffer, &self.context)?;
        let size = std::mem::size_of_val(data);
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(
            CL_COMMAND_READ_BUFFER,
            self.clone(),
            CommandKind::ReadBuffer { ptr: SendPtr(data.as_mut_ptr() as *mut u8), size },
        );
        self.enqueue_command(&command);
        let event = Event::new(self.context.clone(), command.clone(), Vec::new())?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueReadBuffer {
            header: self.header(&command, wait_list),
            buffer_id: buffer.id(),
            blocking,
            offset: offset as u64,
            size: size as u64,
        })?;
        info!(
            "enqueued data download from buffer (queue ID={}, buffer ID={}, size={size}, command ID={})",
            self.id,
            buffer.id(),
            command.id()
        );

        if blocking {
            command.wait()?;
        }
        Ok(event)
    }

    /// Uploads `data` into `buffer` at byte `offset`.
    ///
    /// The caller keeps `data` alive until the returned event (or, for a
    /// blocking write, this call) completes.
    pub fn enqueue_write_buffer<T>(
        self: &Arc<Self>,
        buffer: &Arc<Buffer>,
        blocking: bool,
        offset: usize,
        data: &[T],
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        check_context(buffer, &self.context)?;
        let size = std::mem::size_of_val(data);
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(
            CL_COMMAND_WRITE_BUFFER,
            self.clone(),
            CommandKind::WriteBuffer { ptr: SendConstPtr(data.as_ptr() as *const u8), size },
        );
        self.enqueue_command(&command);
        let event =
            Event::new(self.context.clone(), command.clone(), vec![buffer.clone()])?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueWriteBuffer {
            header: self.header(&command, wait_list),
            buffer_id: buffer.id(),
            blocking,
            offset: offset as u64,
            size: size as u64,
        })?;
        info!(
            "enqueued data upload to buffer (queue ID={}, buffer ID={}, size={size}, command ID={})",
            self.id,
            buffer.id(),
            command.id()
        );

        if blocking {
            command.wait()?;
        }
        Ok(event)
    }

    pub fn enqueue_copy_buffer(
        self: &Arc<Self>,
        src: &Arc<Buffer>,
        dst: &Arc<Buffer>,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        check_context(src, &self.context)?;
        check_context(dst, &self.context)?;
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(CL_COMMAND_COPY_BUFFER, self.clone(), CommandKind::Plain);
        self.enqueue_command(&command);
        let event = Event::new(self.context.clone(), command.clone(), vec![dst.clone()])?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueCopyBuffer {
            header: self.header(&command, wait_list),
            src_id: src.id(),
            dst_id: dst.id(),
            src_offset: src_offset as u64,
            dst_offset: dst_offset as u64,
            size: size as u64,
        })?;
        info!(
            "enqueued copy buffer (queue ID={}, src ID={}, dst ID={}, command ID={})",
            self.id,
            src.id(),
            dst.id(),
            command.id()
        );
        Ok(event)
    }

    /// Maps `size` bytes at `offset` into host memory. The returned
    /// pointer addresses the buffer's cached copy; for a read mapping its
    /// contents are valid once the returned event completes.
    pub fn enqueue_map_buffer(
        self: &Arc<Self>,
        buffer: &Arc<Buffer>,
        blocking: bool,
        map_flags: cl_map_flags,
        offset: usize,
        size: usize,
        event_wait_list: &[Arc<Event>],
    ) -> Result<(*mut c_void, Arc<Event>)> {
        check_context(buffer, &self.context)?;
        // allocates backing memory and records the mapping; no data moves
        let ptr = buffer.map(map_flags, offset, size)?;
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(
            CL_COMMAND_MAP_BUFFER,
            self.clone(),
            CommandKind::MapBuffer { flags: map_flags, ptr: SendPtr(ptr), size },
        );
        self.enqueue_command(&command);
        let event = Event::new(self.context.clone(), command.clone(), Vec::new())?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueMapBuffer {
            header: self.header(&command, wait_list),
            buffer_id: buffer.id(),
            blocking,
            map_flags,
            offset: offset as u64,
            size: size as u64,
        })?;
        info!(
            "enqueued map buffer (queue ID={}, buffer ID={}, command ID={})",
            self.id,
            buffer.id(),
            command.id()
        );

        if blocking {
            command.wait()?;
        }
        Ok((ptr as *mut c_void, event))
    }

    /// Unmaps a pointer returned by a map call, replaying the write for
    /// writable mappings.
    pub fn enqueue_unmap_buffer(
        self: &Arc<Self>,
        buffer: &Arc<Buffer>,
        ptr: *mut c_void,
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        check_context(buffer, &self.context)?;
        let mapping = buffer
            .find_mapping(ptr as *mut u8)
            .ok_or(Error::Cl(CL_INVALID_VALUE))?;
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(
            CL_COMMAND_UNMAP_MEM_OBJECT,
            self.clone(),
            CommandKind::UnmapBuffer {
                buffer: buffer.clone(),
                flags: mapping.flags,
                ptr: SendPtr(ptr as *mut u8),
                size: mapping.size,
            },
        );
        self.enqueue_command(&command);
        // an unmap after a write modifies the buffer; the event releases it
        let memory_objects = if mapping.flags & CL_MAP_WRITE != 0 {
            vec![buffer.clone()]
        } else {
            Vec::new()
        };
        let event = Event::new(self.context.clone(), command.clone(), memory_objects)?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueUnmapBuffer {
            header: self.header(&command, wait_list),
            buffer_id: buffer.id(),
            map_flags: mapping.flags,
            offset: mapping.offset as u64,
            size: mapping.size as u64,
        })?;
        info!(
            "enqueued unmapping memory object (queue ID={}, buffer ID={}, command ID={})",
            self.id,
            buffer.id(),
            command.id()
        );
        Ok(event)
    }

    pub fn enqueue_ndrange_kernel(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        offset: &[usize],
        global: &[usize],
        local: &[usize],
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        if !Arc::ptr_eq(kernel.program().context(), &self.context) {
            return Err(Error::Cl(CL_INVALID_CONTEXT));
        }
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(CL_COMMAND_NDRANGE_KERNEL, self.clone(), CommandKind::Plain);
        self.enqueue_command(&command);
        let event = Event::new(
            self.context.clone(),
            command.clone(),
            kernel.write_memory_objects(),
        )?;

        let to_u64 = |values: &[usize]| values.iter().map(|v| *v as u64).collect::<Vec<_>>();
        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueNDRangeKernel {
            header: self.header(&command, wait_list),
            kernel_id: kernel.id(),
            offset: to_u64(offset),
            global: to_u64(global),
            local: to_u64(local),
        })?;
        info!(
            "enqueued ND range kernel (queue ID={}, kernel ID={}, command ID={})",
            self.id,
            kernel.id(),
            command.id()
        );
        Ok(event)
    }

    /// A task is an ND-range kernel with one work item.
    pub fn enqueue_task(
        self: &Arc<Self>,
        kernel: &Arc<Kernel>,
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        if !Arc::ptr_eq(kernel.program().context(), &self.context) {
            return Err(Error::Cl(CL_INVALID_CONTEXT));
        }
        let wait_list = self.event_id_wait_list(event_wait_list)?;

        let command = Command::new(CL_COMMAND_TASK, self.clone(), CommandKind::Plain);
        self.enqueue_command(&command);
        let event = Event::new(
            self.context.clone(),
            command.clone(),
            kernel.write_memory_objects(),
        )?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueNDRangeKernel {
            header: self.header(&command, wait_list),
            kernel_id: kernel.id(),
            offset: Vec::new(),
            global: vec![1],
            local: vec![1],
        })?;
        info!(
            "enqueued task (queue ID={}, kernel ID={}, command ID={})",
            self.id,
            kernel.id(),
            command.id()
        );
        Ok(event)
    }

    pub fn enqueue_marker(
        self: &Arc<Self>,
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        let wait_list = self.event_id_wait_list(event_wait_list)?;
        let command = Command::new(CL_COMMAND_MARKER, self.clone(), CommandKind::Plain);
        self.enqueue_command(&command);
        let event = Event::new(self.context.clone(), command.clone(), Vec::new())?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueMarker {
            header: self.header(&command, wait_list),
        })?;
        info!("enqueued marker (queue ID={}, command ID={})", self.id, command.id());
        Ok(event)
    }

    pub fn enqueue_barrier(
        self: &Arc<Self>,
        event_wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        let wait_list = self.event_id_wait_list(event_wait_list)?;
        let command = Command::new(CL_COMMAND_BARRIER, self.clone(), CommandKind::Plain);
        self.enqueue_command(&command);
        let event = Event::new(self.context.clone(), command.clone(), Vec::new())?;

        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueBarrier {
            header: self.header(&command, wait_list),
        })?;
        info!("enqueued barrier (queue ID={}, command ID={})", self.id, command.id());
        Ok(event)
    }

    /// The OpenCL 1.1 wait-for-events command: blocks the queue until the
    /// listed events have completed. Unlike wait lists, an invalid event
    /// fails with `CL_INVALID_EVENT`.
    pub fn enqueue_wait_for_events(&self, events: &[Arc<Event>]) -> Result<()> {
        if events.is_empty() {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            if !Arc::ptr_eq(event.context(), &self.context) {
                return Err(Error::Cl(CL_INVALID_EVENT));
            }
            ids.push(event.remote_id());
        }
        let node = self.device.compute_node()?;
        node.execute_command(&Request::EnqueueWaitForEvents {
            queue_id: self.id,
            event_ids: ids,
        })?;
        info!("enqueued wait for events (queue ID={})", self.id);
        Ok(())
    }

    pub fn reference_count(&self) -> u32 {
        self.references.count()
    }

    pub fn retain(&self) {
        self.references.retain();
    }

    /// Releases the queue; the last release waits for pending commands and
    /// deletes the remote queue.
    pub fn release(&self) -> Result<()> {
        if self.references.release() {
            self.destroy()?;
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.finish_locally()?;
        let node = self.device.compute_node()?;
        node.execute_command(&Request::DeleteCommandQueue { id: self.id })?;
        info!("command queue deleted (ID={})", self.id);
        Ok(())
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) {
            if let Err(err) = self.destroy() {
                warn!("deleting command queue failed (ID={}): {err}", self.id);
            }
        }
    }
}

/// The collective broadcast: writes `size` bytes of `src`'s host cache at
/// `src_offset` into each `(queue, dst, dst_offset)` triple. The returned
/// event completes when every node has finished its write; the caller
/// keeps `src` alive until then.
pub fn enqueue_broadcast_buffer(
    queues: &[Arc<CommandQueue>],
    src: &Arc<Buffer>,
    dsts: &[Arc<Buffer>],
    src_offset: usize,
    dst_offsets: &[usize],
    size: usize,
    event_wait_list: &[Arc<Event>],
) -> Result<Arc<Event>> {
    let first = queues.first().ok_or(Error::Cl(CL_INVALID_VALUE))?;
    if dsts.len() != queues.len() || dst_offsets.len() != queues.len() {
        return Err(Error::Cl(CL_INVALID_VALUE));
    }
    let context = first.context().clone();
    check_context(src, &context)?;
    for (queue, dst) in queues.iter().zip(dsts) {
        if !Arc::ptr_eq(queue.context(), &context) {
            return Err(Error::Cl(CL_INVALID_CONTEXT));
        }
        check_context(dst, &context)?;
    }
    // a destination must not be written twice
    for (index, dst) in dsts.iter().enumerate() {
        if dsts[..index].iter().any(|other| Arc::ptr_eq(other, dst)) {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
    }
    let wait_list = first.event_id_wait_list(event_wait_list)?;

    let command = Command::new(
        CL_COMMAND_BROADCAST_BUFFER,
        first.clone(),
        CommandKind::Broadcast { remaining: AtomicUsize::new(queues.len()) },
    );
    first.enqueue_command(&command);
    let event = Event::new_collective(context, command.clone())?;

    let data = src.cached_data()?;
    let source = unsafe { SendConstPtr(data.0.add(src_offset)) };
    for ((queue, dst), dst_offset) in queues.iter().zip(dsts).zip(dst_offsets) {
        let node = queue.device().compute_node()?;
        // ship the payload first; the daemon waits for it by payload id
        node.process()
            .send_data(PayloadId::memory(command.id(), dst.id()), size, source)?;
        node.execute_command(&Request::EnqueueBroadcastBuffer {
            header: EnqueueHeader {
                queue_id: queue.id(),
                command_id: command.id(),
                wait_list: wait_list.clone(),
                want_event: false,
            },
            dst_id: dst.id(),
            offset: *dst_offset as u64,
            size: size as u64,
        })?;
    }
    info!("enqueued broadcast buffer (src ID={}, command ID={})", src.id(), command.id());
    Ok(event)
}
