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

//! Daemon-side events.
//!
//! An event is either a *replica* of an event owned elsewhere, backed by a
//! native user event that tracks the owner's status through messages, or a
//! *local* event decorating the native event(s) of a command executed here.
//!
//! The local roles differ in where they broadcast terminal statuses:
//!
//! * [`EventKind::Simple`]: to the host and to the peer compute nodes.
//! * [`EventKind::NodeLocal`]: to the peers only; the host is informed by
//!   the completion message of the command machinery.
//! * [`EventKind::ReadCompound`]: nowhere; the host finishes read-style
//!   commands itself.
//! * [`EventKind::WriteCompound`]: to the peers only, with profiling
//!   merged from the map/unmap event pair.

use super::context::Context;
use super::memory::Buffer;
use crate::error::{Error, Result};
use crate::native;
use crate::protocol::{EventMessage, Response};
use crate::registry::{CommandListener, SynchronizationListener};
use crate::transport::Process;
use crate::types::{
    cl_int, cl_profiling_info, cl_ulong, ObjectId, PayloadId, CL_COMPLETE,
    CL_PROFILING_COMMAND_END, CL_PROFILING_COMMAND_QUEUED, CL_PROFILING_COMMAND_RECEIVED,
    CL_PROFILING_COMMAND_START, CL_PROFILING_COMMAND_SUBMIT, CL_PROFILING_INFO_NOT_AVAILABLE,
};
use log::{debug, error, warn};
use std::sync::{Arc, Mutex};

pub enum EventKind {
    Replica {
        native: Arc<dyn native::Event>,
        sync_events: Mutex<Vec<Arc<dyn native::Event>>>,
    },
    Simple {
        native: Arc<dyn native::Event>,
    },
    NodeLocal {
        native: Arc<dyn native::Event>,
    },
    ReadCompound {
        start: Arc<dyn native::Event>,
        end: Arc<dyn native::Event>,
    },
    WriteCompound {
        start: Arc<dyn native::Event>,
        end: Arc<dyn native::Event>,
    },
}

pub struct Event {
    id: ObjectId,
    context: Arc<Context>,
    memory_objects: Vec<Arc<Buffer>>,
    kind: EventKind,
    /// Receipt time of the associated command, daemon clock.
    received: cl_ulong,
}

impl Event {
    /// Creates a replica for an event owned by another process. An empty
    /// memory-object list replicates a user event.
    pub fn replica(
        id: ObjectId,
        context: Arc<Context>,
        memory_objects: Vec<Arc<Buffer>>,
    ) -> Result<Arc<Self>> {
        let native = context.native().create_user_event()?;
        Ok(Arc::new(Self {
            id,
            context,
            memory_objects,
            kind: EventKind::Replica { native, sync_events: Mutex::new(Vec::new()) },
            received: now(),
        }))
    }

    pub fn simple(
        id: ObjectId,
        context: Arc<Context>,
        memory_objects: Vec<Arc<Buffer>>,
        native: Arc<dyn native::Event>,
    ) -> Arc<Self> {
        let event = Arc::new(Self {
            id,
            context,
            memory_objects,
            kind: EventKind::Simple { native },
            received: now(),
        });
        event.schedule_broadcast();
        event
    }

    pub fn node_local(
        id: ObjectId,
        context: Arc<Context>,
        native: Arc<dyn native::Event>,
    ) -> Arc<Self> {
        let event = Arc::new(Self {
            id,
            context,
            memory_objects: Vec::new(),
            kind: EventKind::NodeLocal { native },
            received: now(),
        });
        event.schedule_broadcast();
        event
    }

    pub fn read_compound(
        id: ObjectId,
        context: Arc<Context>,
        start: Arc<dyn native::Event>,
        end: Arc<dyn native::Event>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            memory_objects: Vec::new(),
            kind: EventKind::ReadCompound { start, end },
            received: now(),
        })
    }

    pub fn write_compound(
        id: ObjectId,
        context: Arc<Context>,
        memory_object: Arc<Buffer>,
        start: Arc<dyn native::Event>,
        end: Arc<dyn native::Event>,
    ) -> Arc<Self> {
        let event = Arc::new(Self {
            id,
            context,
            memory_objects: vec![memory_object],
            kind: EventKind::WriteCompound { start, end },
            received: now(),
        });
        event.schedule_broadcast();
        event
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn is_replica(&self) -> bool {
        matches!(self.kind, EventKind::Replica { .. })
    }

    /// The native event consumers of this event wait on.
    pub fn native(&self) -> Arc<dyn native::Event> {
        match &self.kind {
            EventKind::Replica { native, .. }
            | EventKind::Simple { native }
            | EventKind::NodeLocal { native } => native.clone(),
            EventKind::ReadCompound { end, .. } | EventKind::WriteCompound { end, .. } => {
                end.clone()
            }
        }
    }

    /// Resolves this event into the native events a consumer on `queue`
    /// must wait on.
    ///
    /// For a replica with attached memory objects, the first call emits an
    /// event-synchronisation message towards the owner and enqueues one
    /// acquire per memory object on `queue`; the consumer then waits on the
    /// acquires instead of the replica. Later calls reuse the enqueued
    /// acquires, so a memory object is transferred once per node, not once
    /// per consumer.
    pub fn synchronize(
        &self,
        queue: &Arc<dyn native::Queue>,
    ) -> Result<Vec<Arc<dyn native::Event>>> {
        match &self.kind {
            EventKind::Replica { native, sync_events } => {
                if self.memory_objects.is_empty() {
                    return Ok(vec![native.clone()]);
                }
                let mut sync_events = sync_events.lock().unwrap();
                if sync_events.is_empty() {
                    debug!("synchronizing replica event (ID={})", self.id);
                    self.context
                        .host()
                        .send_message(&EventMessage::EventSynchronization { id: self.id })?;
                    for memory_object in &self.memory_objects {
                        let acquire = memory_object.acquire(
                            self.context.native(),
                            self.context.host(),
                            queue,
                            native,
                            PayloadId::memory(self.id, memory_object.id()),
                        )?;
                        sync_events.push(acquire);
                    }
                }
                Ok(sync_events.clone())
            }
            _ => Ok(vec![self.native()]),
        }
    }

    /// Answers a profiling query, with all timestamps shifted into the
    /// daemon clock domain: the skew between the native queue timestamp and
    /// the command receipt time is added to submit/start/end.
    pub fn profiling_response(&self) -> Result<Response> {
        if let EventKind::ReadCompound { end, .. } = &self.kind {
            // the host may have finished the command while the trailing
            // unmap is still executing; its timestamp must exist
            end.wait();
        }
        let queued = self.profiling_info(CL_PROFILING_COMMAND_QUEUED)?;
        let submit = self.profiling_info(CL_PROFILING_COMMAND_SUBMIT)?;
        let start = self.profiling_info(CL_PROFILING_COMMAND_START)?;
        let end = self.profiling_info(CL_PROFILING_COMMAND_END)?;
        let skew = self.received as i128 - queued as i128;
        let adjust = |value: cl_ulong| (value as i128 + skew) as cl_ulong;
        Ok(Response::ProfilingInfos {
            received: self.received,
            queued: adjust(queued),
            submit: adjust(submit),
            start: adjust(start),
            end: adjust(end),
        })
    }

    fn profiling_info(&self, name: cl_profiling_info) -> Result<cl_ulong> {
        if name == CL_PROFILING_COMMAND_RECEIVED {
            return Ok(self.received);
        }
        match &self.kind {
            EventKind::Replica { .. } => Err(Error::Cl(CL_PROFILING_INFO_NOT_AVAILABLE)),
            EventKind::Simple { native } | EventKind::NodeLocal { native } => {
                native.profiling_info(name)
            }
            EventKind::ReadCompound { start, end } | EventKind::WriteCompound { start, end } => {
                match name {
                    CL_PROFILING_COMMAND_END => end.profiling_info(name),
                    _ => start.profiling_info(name),
                }
            }
        }
    }

    /// Hooks the terminal-status broadcast onto the native event. The
    /// closure owns a strong reference, so the event outlives the callback
    /// even if the session drops it concurrently.
    fn schedule_broadcast(self: &Arc<Self>) {
        let broadcast_to_host = matches!(self.kind, EventKind::Simple { .. });
        let event = self.clone();
        self.native().set_callback(
            CL_COMPLETE,
            Box::new(move |status| {
                event.broadcast(status, broadcast_to_host);
            }),
        );
    }

    fn broadcast(&self, status: cl_int, to_host: bool) {
        let message = EventMessage::CommandExecutionStatusChanged { id: self.id, status };
        if to_host {
            if let Err(err) = self.context.host().send_message(&message) {
                error!("sending status update to host failed (ID={}): {err}", self.id);
            }
        }
        for peer in self.context.peers() {
            if let Err(err) = peer.send_message(&message) {
                error!(
                    "sending status update to compute node '{}' failed (ID={}): {err}",
                    peer.url(),
                    self.id
                );
            }
        }
        debug!("sent update of command execution status (ID={}, status={status})", self.id);
    }
}

impl CommandListener for Event {
    /// Status changes arrive by message only for replicas; the owner's
    /// native driver drives every other kind.
    fn on_execution_status_changed(&self, status: cl_int) {
        match &self.kind {
            EventKind::Replica { native, .. } => {
                // the owner and the host may both report the terminal
                // status; the second update is redundant
                if let Err(err) = native.set_status(status) {
                    debug!("replica status update ignored (ID={}): {err}", self.id);
                }
            }
            _ => warn!("status message for non-replica event discarded (ID={})", self.id),
        }
    }
}

impl SynchronizationListener for Event {
    /// A process consumed this event in a wait list; release the attached
    /// memory objects to it through the context's I/O queue.
    fn on_synchronize(&self, process: &Arc<dyn Process>) {
        if self.is_replica() {
            error!("synchronization attempt on replica event (ID={})", self.id);
            return;
        }
        debug!(
            "event synchronization (ID={}) requested by '{}'",
            self.id,
            process.url()
        );
        let io_queue = self.context.io_queue();
        for memory_object in &self.memory_objects {
            if let Err(err) = memory_object.release(
                self.context.native(),
                process,
                io_queue,
                &self.native(),
                PayloadId::memory(self.id, memory_object.id()),
            ) {
                error!("(SYN) release failed (ID={}): {err}", self.id);
            }
        }
        if let Err(err) = io_queue.flush() {
            error!("flushing I/O queue failed: {err}");
        }
    }
}

fn now() -> cl_ulong {
    crate::util::clock_ns()
}
