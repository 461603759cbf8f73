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

//! The compute-node daemon.
//!
//! A [`Daemon`] wraps one native OpenCL platform and serves its devices to
//! connected hosts. Each host connection owns a [`Session`](session::Session)
//! holding the objects created through it; requests are translated into
//! native OpenCL work, asynchronous notifications are dispatched through
//! the daemon's object registry.

pub mod command_queue;
pub mod context;
pub mod event;
pub mod memory;
pub mod program;
pub mod session;

use crate::error::{Error, Result};
use crate::native;
use crate::protocol::{EventMessage, KernelArg, Request, Response};
use crate::registry::Registry;
use crate::transport::{PeerResolver, Process, SendPtr};
use crate::types::{
    ObjectId, PayloadId, CL_INVALID_COMMAND_QUEUE, CL_INVALID_CONTEXT, CL_INVALID_EVENT,
    CL_INVALID_KERNEL, CL_INVALID_MEM_OBJECT, CL_INVALID_PROGRAM,
};
use context::Context;
use log::{debug, info, warn};
use memory::Buffer;
use program::{Kernel, Program, ResolvedArg};
use session::Session;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct Daemon {
    platform: Arc<dyn native::Platform>,
    registry: Arc<Registry>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
}

impl Daemon {
    pub fn new(platform: Arc<dyn native::Platform>) -> Arc<Self> {
        info!(
            "serving platform '{}' ({} device(s))",
            platform.name(),
            platform.device_count()
        );
        Arc::new(Self {
            platform,
            registry: Arc::new(Registry::new()),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// A host connected; create its session.
    pub fn connect(&self, connection_id: u64) {
        let session = Session::new(self.registry.clone());
        self.sessions.lock().unwrap().insert(connection_id, session);
        info!("host connected (connection={connection_id})");
    }

    /// A host disconnected; destroy its session.
    pub fn disconnect(&self, connection_id: u64) {
        let session = self.sessions.lock().unwrap().remove(&connection_id);
        if let Some(session) = session {
            session.tear_down();
        }
        info!("host disconnected (connection={connection_id})");
    }

    /// Entry point for asynchronous notifications from any process.
    pub fn handle_message(&self, message: &EventMessage, from: &Arc<dyn Process>) {
        self.registry.dispatch(message, from);
    }

    /// Entry point for host requests; never fails, errors become typed
    /// error responses.
    pub fn handle_request(
        &self,
        connection_id: u64,
        host: &Arc<dyn Process>,
        resolver: &dyn PeerResolver,
        request: Request,
    ) -> Response {
        let session = match self.sessions.lock().unwrap().get(&connection_id) {
            Some(session) => session.clone(),
            None => return Response::Error(CL_INVALID_CONTEXT),
        };
        match self.execute(&session, host, resolver, request) {
            Ok(response) => response,
            Err(err) => {
                warn!("request failed: {err}");
                Response::Error(err.code())
            }
        }
    }

    fn execute(
        &self,
        session: &Arc<Session>,
        host: &Arc<dyn Process>,
        resolver: &dyn PeerResolver,
        request: Request,
    ) -> Result<Response> {
        match request {
            Request::ListDevices => {
                let mut devices = Vec::with_capacity(self.platform.device_count());
                for index in 0..self.platform.device_count() {
                    devices.push(self.platform.device_description(index)?);
                }
                Ok(Response::DeviceList(devices))
            }
            Request::CreateContext { id, device_indices, peer_urls } => {
                let mut peers = Vec::with_capacity(peer_urls.len());
                for url in &peer_urls {
                    peers.push(resolver.peer(url)?);
                }
                let indices: Vec<usize> =
                    device_indices.iter().map(|index| *index as usize).collect();
                let context =
                    Context::new(id, &self.platform, &indices, host.clone(), peers)?;
                session.insert_context(id, context);
                info!("context created (ID={id})");
                Ok(Response::Success)
            }
            Request::ReleaseContext { id } => {
                session.remove_context(id).ok_or(Error::Cl(CL_INVALID_CONTEXT))?;
                info!("context released (ID={id})");
                Ok(Response::Success)
            }
            Request::CreateCommandQueue { id, context_id, device_index, properties } => {
                let context = session.context(context_id).ok_or(Error::Cl(CL_INVALID_CONTEXT))?;
                let queue =
                    command_queue::CommandQueue::new(context, device_index as usize, properties)?;
                session.insert_command_queue(id, queue);
                info!("command queue created (ID={id})");
                Ok(Response::Success)
            }
            Request::DeleteCommandQueue { id } => {
                session.remove_command_queue(id).ok_or(Error::Cl(CL_INVALID_COMMAND_QUEUE))?;
                info!("command queue deleted (ID={id})");
                Ok(Response::Success)
            }
            Request::CreateBuffer { id, context_id, flags, size, initialized } => {
                let context = session.context(context_id).ok_or(Error::Cl(CL_INVALID_CONTEXT))?;
                let size = size as usize;
                let init = if initialized {
                    // the initial contents follow on the bulk channel
                    let mut bytes = vec![0u8; size];
                    host.receive_data(PayloadId::command(id), size, SendPtr(bytes.as_mut_ptr()))?
                        .wait_ok()?;
                    Some(bytes)
                } else {
                    None
                };
                let native = context.native().create_buffer(flags, size, init.as_deref())?;
                session.insert_buffer(id, Buffer::new(id, native));
                info!("buffer created (ID={id}, size={size})");
                Ok(Response::Success)
            }
            Request::DeleteMemory { id } => {
                session.remove_buffer(id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                info!("memory object deleted (ID={id})");
                Ok(Response::Success)
            }
            Request::CreateEvent { id, context_id, memory_ids } => {
                let context = session.context(context_id).ok_or(Error::Cl(CL_INVALID_CONTEXT))?;
                let mut memory_objects = Vec::with_capacity(memory_ids.len());
                for memory_id in &memory_ids {
                    memory_objects.push(
                        session.buffer(*memory_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?,
                    );
                }
                let event = event::Event::replica(id, context, memory_objects)?;
                session.insert_event(event);
                debug!("replica event created (ID={id})");
                Ok(Response::Success)
            }
            Request::DeleteEvent { id } => {
                session.remove_event(id).ok_or(Error::Cl(CL_INVALID_EVENT))?;
                debug!("event deleted (ID={id})");
                Ok(Response::Success)
            }
            Request::CreateProgram { id, context_id, source } => {
                let context = session.context(context_id).ok_or(Error::Cl(CL_INVALID_CONTEXT))?;
                let native = context.native().create_program(&source)?;
                session.insert_program(id, Program::new(native));
                info!("program created (ID={id})");
                Ok(Response::Success)
            }
            Request::BuildProgram { id, options } => {
                let program = session.program(id).ok_or(Error::Cl(CL_INVALID_PROGRAM))?;
                program.build(&options)?;
                Ok(Response::Success)
            }
            Request::DeleteProgram { id } => {
                session.remove_program(id).ok_or(Error::Cl(CL_INVALID_PROGRAM))?;
                Ok(Response::Success)
            }
            Request::CreateKernel { id, program_id, name } => {
                let program = session.program(program_id).ok_or(Error::Cl(CL_INVALID_PROGRAM))?;
                let native = program.create_kernel(&name)?;
                session.insert_kernel(id, Kernel::new(native));
                info!("kernel '{name}' created (ID={id})");
                Ok(Response::Success)
            }
            Request::DeleteKernel { id } => {
                session.remove_kernel(id).ok_or(Error::Cl(CL_INVALID_KERNEL))?;
                Ok(Response::Success)
            }
            Request::SetKernelArg { kernel_id, index, arg } => {
                let kernel = session.kernel(kernel_id).ok_or(Error::Cl(CL_INVALID_KERNEL))?;
                let resolved = match arg {
                    KernelArg::Memory(memory_id) => ResolvedArg::Memory(
                        session.buffer(memory_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?,
                    ),
                    KernelArg::Bytes(bytes) => ResolvedArg::Bytes(bytes),
                };
                kernel.set_arg(index, resolved)?;
                Ok(Response::Success)
            }
            Request::EnqueueCopyBuffer { header, src_id, dst_id, src_offset, dst_offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let src = session.buffer(src_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                let dst = session.buffer(dst_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                queue.enqueue_copy_buffer(
                    session,
                    &header,
                    &src,
                    &dst,
                    src_offset as usize,
                    dst_offset as usize,
                    size as usize,
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueReadBuffer { header, buffer_id, blocking, offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let buffer = session.buffer(buffer_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                queue.enqueue_read_buffer(
                    session,
                    &header,
                    &buffer,
                    blocking,
                    offset as usize,
                    size as usize,
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueWriteBuffer { header, buffer_id, blocking, offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let buffer = session.buffer(buffer_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                let payload = PayloadId::command(header.command_id);
                queue.enqueue_write_buffer(
                    session,
                    &header,
                    &buffer,
                    blocking,
                    offset as usize,
                    size as usize,
                    payload,
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueMapBuffer { header, buffer_id, blocking, map_flags, offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let buffer = session.buffer(buffer_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                queue.enqueue_map_buffer(
                    session,
                    &header,
                    &buffer,
                    blocking,
                    map_flags,
                    offset as usize,
                    size as usize,
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueUnmapBuffer { header, buffer_id, map_flags, offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let buffer = session.buffer(buffer_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                let payload = PayloadId::command(header.command_id);
                queue.enqueue_unmap_buffer(
                    session,
                    &header,
                    &buffer,
                    map_flags,
                    offset as usize,
                    size as usize,
                    payload,
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueNDRangeKernel { header, kernel_id, offset, global, local } => {
                let queue = self.queue(session, header.queue_id)?;
                let kernel = session.kernel(kernel_id).ok_or(Error::Cl(CL_INVALID_KERNEL))?;
                let to_usize =
                    |values: &[u64]| values.iter().map(|v| *v as usize).collect::<Vec<_>>();
                queue.enqueue_ndrange_kernel(
                    session,
                    &header,
                    &kernel,
                    &to_usize(&offset),
                    &to_usize(&global),
                    &to_usize(&local),
                )?;
                Ok(Response::Success)
            }
            Request::EnqueueMarker { header } => {
                let queue = self.queue(session, header.queue_id)?;
                queue.enqueue_marker(session, &header)?;
                Ok(Response::Success)
            }
            Request::EnqueueBarrier { header } => {
                let queue = self.queue(session, header.queue_id)?;
                queue.enqueue_barrier(session, &header)?;
                Ok(Response::Success)
            }
            Request::EnqueueWaitForEvents { queue_id, event_ids } => {
                let queue = self.queue(session, queue_id)?;
                queue.enqueue_wait_for_events(session, &event_ids)?;
                Ok(Response::Success)
            }
            Request::EnqueueBroadcastBuffer { header, dst_id, offset, size } => {
                let queue = self.queue(session, header.queue_id)?;
                let dst = session.buffer(dst_id).ok_or(Error::Cl(CL_INVALID_MEM_OBJECT))?;
                let payload = PayloadId::memory(header.command_id, dst_id);
                queue.enqueue_write_buffer(
                    session,
                    &header,
                    &dst,
                    false,
                    offset as usize,
                    size as usize,
                    payload,
                )?;
                Ok(Response::Success)
            }
            Request::FlushQueue { id } => {
                self.queue(session, id)?.flush()?;
                Ok(Response::Success)
            }
            Request::FinishQueue { id } => {
                self.queue(session, id)?.finish()?;
                Ok(Response::Success)
            }
            Request::GetEventProfilingInfos { id } => {
                let event = session.event(id).ok_or(Error::Cl(CL_INVALID_EVENT))?;
                event.profiling_response()
            }
        }
    }

    fn queue(
        &self,
        session: &Arc<Session>,
        id: ObjectId,
    ) -> Result<Arc<command_queue::CommandQueue>> {
        session.command_queue(id).ok_or(Error::Cl(CL_INVALID_COMMAND_QUEUE))
    }
}
