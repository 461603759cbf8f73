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

//! Host-side event: the application's synchronisation point.
//!
//! A command event shares its id with its command; replicas of it are
//! created on every context node except the one executing the command, at
//! the moment the command is enqueued. A user event has no command and
//! replicas everywhere; its status is set explicitly.
//!
//! Status updates run callbacks *before* the new status becomes observable
//! to waiters or peers. A thread woken from `wait` may immediately release
//! and so destroy the event; running the callbacks first (and letting each
//! callback closure pin the event through its captures) keeps that safe.

use super::command::Command;
use super::compute_node::{execute_on_all, ComputeNode};
use super::context::Context;
use super::memory::Buffer;
use super::References;
use crate::error::{Error, Result};
use crate::protocol::{EventMessage, Request, Response};
use crate::registry::SynchronizationListener;
use crate::transport::Process;
use crate::types::{
    cl_command_type, cl_int, cl_profiling_info, cl_ulong, is_terminal, ObjectId, CL_COMPLETE,
    CL_COMMAND_USER, CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST, CL_INVALID_CONTEXT,
    CL_INVALID_OPERATION, CL_INVALID_VALUE, CL_PROFILING_COMMAND_END,
    CL_PROFILING_COMMAND_QUEUED, CL_PROFILING_COMMAND_RECEIVED, CL_PROFILING_COMMAND_START,
    CL_PROFILING_COMMAND_SUBMIT, CL_PROFILING_INFO_NOT_AVAILABLE, CL_QUEUED, CL_SUBMITTED,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Daemon-side profiling timestamps, fetched lazily from the owner node.
#[derive(Clone, Copy)]
struct ProfilingInfo {
    received: cl_ulong,
    queued: cl_ulong,
    submit: cl_ulong,
    start: cl_ulong,
    end: cl_ulong,
}

enum EventKind {
    Command {
        command: Arc<Command>,
        /// Host-side enqueue time, host clock domain.
        queued_at: cl_ulong,
    },
    User {
        id: ObjectId,
    },
}

type Callback = Box<dyn FnOnce(cl_int) + Send>;

struct EventState {
    /// Status observable by waiters and queries.
    status: cl_int,
    /// Lowest status an update is in flight for; guards monotonicity while
    /// callbacks run outside the lock.
    pending: cl_int,
    callbacks: Vec<(cl_int, Callback)>,
    profiling: Option<ProfilingInfo>,
}

pub struct Event {
    context: Arc<Context>,
    kind: EventKind,
    memory_objects: Vec<Arc<Buffer>>,
    /// Nodes holding a replica of this event; terminal statuses the host
    /// learns of are forwarded to them.
    replica_nodes: Vec<Arc<ComputeNode>>,
    state: Mutex<EventState>,
    status_changed: Condvar,
    references: References,
    destroyed: AtomicBool,
}

impl Event {
    /// Creates the event for `command` and replicas of it on every context
    /// node other than the command's. `memory_objects` are the buffers the
    /// event releases; consumers of the event acquire them.
    pub(crate) fn new(
        context: Arc<Context>,
        command: Arc<Command>,
        memory_objects: Vec<Arc<Buffer>>,
    ) -> Result<Arc<Self>> {
        let owner = command.queue().device().compute_node()?;
        let replica_nodes = context
            .compute_nodes()
            .iter()
            .filter(|node| !Arc::ptr_eq(node, &owner))
            .cloned()
            .collect();
        Self::with_replicas(context, command, memory_objects, replica_nodes)
    }

    /// Creates the event for a command executed on *every* context node
    /// (the collective operations); all nodes hold replicas.
    pub(crate) fn new_collective(
        context: Arc<Context>,
        command: Arc<Command>,
    ) -> Result<Arc<Self>> {
        let replica_nodes = context.compute_nodes().to_vec();
        Self::with_replicas(context, command, Vec::new(), replica_nodes)
    }

    fn with_replicas(
        context: Arc<Context>,
        command: Arc<Command>,
        memory_objects: Vec<Arc<Buffer>>,
        replica_nodes: Vec<Arc<ComputeNode>>,
    ) -> Result<Arc<Self>> {
        let id = command.id();
        let event = Arc::new(Self {
            context: context.clone(),
            kind: EventKind::Command {
                command: command.clone(),
                queued_at: crate::util::clock_ns(),
            },
            memory_objects: memory_objects.clone(),
            replica_nodes,
            state: Mutex::new(EventState {
                status: CL_QUEUED,
                pending: CL_QUEUED,
                callbacks: Vec::new(),
                profiling: None,
            }),
            status_changed: Condvar::new(),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        });

        // the event answers synchronisation requests for its id
        let trait_arc: Arc<dyn SynchronizationListener> = event.clone();
        let listener: std::sync::Weak<dyn SynchronizationListener> = Arc::downgrade(&trait_arc);
        context.registry().bind_synchronization_listener(id, listener);

        let memory_ids: Vec<ObjectId> =
            memory_objects.iter().map(|memory| memory.id()).collect();
        let request = Request::CreateEvent { id, context_id: context.id(), memory_ids };
        if let Err(err) = execute_on_all(&event.replica_nodes, &request) {
            context.registry().unbind_synchronization_listener(id);
            return Err(err);
        }
        info!("event created (ID={id})");

        command.set_event(&event);
        Ok(event)
    }

    /// Creates a user event: no producing command, replicas on every
    /// context node, status set explicitly through [`set_status`].
    ///
    /// [`set_status`]: Self::set_status
    pub fn new_user(context: &Arc<Context>) -> Result<Arc<Self>> {
        let id = context.next_id();
        let event = Arc::new(Self {
            context: context.clone(),
            kind: EventKind::User { id },
            memory_objects: Vec::new(),
            replica_nodes: context.compute_nodes().to_vec(),
            state: Mutex::new(EventState {
                status: CL_SUBMITTED,
                pending: CL_SUBMITTED,
                callbacks: Vec::new(),
                profiling: None,
            }),
            status_changed: Condvar::new(),
            references: References::new(),
            destroyed: AtomicBool::new(false),
        });
        let request =
            Request::CreateEvent { id, context_id: context.id(), memory_ids: Vec::new() };
        execute_on_all(&event.replica_nodes, &request)?;
        info!("user event created (ID={id})");
        Ok(event)
    }

    /// The process-wide id shared with the producing command.
    pub fn remote_id(&self) -> ObjectId {
        match &self.kind {
            EventKind::Command { command, .. } => command.id(),
            EventKind::User { id } => *id,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn command_type(&self) -> cl_command_type {
        match &self.kind {
            EventKind::Command { command, .. } => command.command_type(),
            EventKind::User { .. } => CL_COMMAND_USER,
        }
    }

    pub fn command_execution_status(&self) -> cl_int {
        self.state.lock().unwrap().status
    }

    pub fn is_complete(&self) -> bool {
        is_terminal(self.command_execution_status())
    }

    pub fn reference_count(&self) -> u32 {
        self.references.count()
    }

    /// Blocks until the event is complete or failed. For command events an
    /// implicit flush of the command queue guarantees forward progress.
    pub fn wait(&self) -> Result<()> {
        if let EventKind::Command { command, .. } = &self.kind {
            command.queue().flush()?;
        }
        self.wait_no_flush()
    }

    fn wait_no_flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.status > CL_COMPLETE {
            state = self.status_changed.wait(state).unwrap();
        }
        if state.status < 0 {
            return Err(Error::Cl(CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST));
        }
        Ok(())
    }

    /// Waits for all events. Queues are flushed once; a negative status on
    /// any event fails the whole wait.
    pub fn wait_for_events(events: &[Arc<Event>]) -> Result<()> {
        let first = events.first().ok_or(Error::Cl(CL_INVALID_VALUE))?;
        for event in events {
            if !Arc::ptr_eq(event.context(), first.context()) {
                return Err(Error::Cl(CL_INVALID_CONTEXT));
            }
        }
        // flush each involved queue once
        let mut flushed: Vec<usize> = Vec::new();
        for event in events {
            if let EventKind::Command { command, .. } = &event.kind {
                let queue = command.queue();
                let key = Arc::as_ptr(queue) as usize;
                if !flushed.contains(&key) {
                    flushed.push(key);
                    queue.flush()?;
                }
            }
        }
        for event in events {
            event.wait_no_flush()?;
        }
        Ok(())
    }

    /// Registers a callback fired once when the event reaches
    /// `trigger_status` or earlier. An already-triggered callback fires
    /// synchronously on the calling thread.
    pub fn set_callback(
        &self,
        trigger_status: cl_int,
        callback: impl FnOnce(cl_int) + Send + 'static,
    ) -> Result<()> {
        if trigger_status != CL_COMPLETE {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        let status = {
            let mut state = self.state.lock().unwrap();
            if state.status > trigger_status {
                state.callbacks.push((trigger_status, Box::new(callback)));
                return Ok(());
            }
            state.status
        };
        callback(status);
        Ok(())
    }

    /// Sets a user event's status; `CL_COMPLETE` or a negative error code,
    /// exactly once. The update is broadcast to every replica.
    pub fn set_status(&self, status: cl_int) -> Result<()> {
        if !matches!(self.kind, EventKind::User { .. }) {
            return Err(Error::Cl(CL_INVALID_OPERATION));
        }
        if status > CL_COMPLETE {
            return Err(Error::Cl(CL_INVALID_VALUE));
        }
        {
            let state = self.state.lock().unwrap();
            if is_terminal(state.pending) {
                return Err(Error::Cl(CL_INVALID_OPERATION));
            }
        }
        info!("user event status set (ID={}, status={status})", self.remote_id());
        self.transition(status);
        Ok(())
    }

    /// Profiling timestamps in nanoseconds. `CL_PROFILING_COMMAND_QUEUED`
    /// is the host-side enqueue time; the rest are fetched once from the
    /// owner node and served from the cache afterwards.
    pub fn profiling_info(&self, name: cl_profiling_info) -> Result<cl_ulong> {
        let (command, queued_at) = match &self.kind {
            EventKind::User { .. } => return Err(Error::Cl(CL_PROFILING_INFO_NOT_AVAILABLE)),
            EventKind::Command { command, queued_at } => (command, *queued_at),
        };
        if name == CL_PROFILING_COMMAND_QUEUED {
            return Ok(queued_at);
        }

        // Do not require local completion here: the remote event may be
        // complete after a finish while this replica still lags behind the
        // status message.
        let cached = self.state.lock().unwrap().profiling;
        let info = match cached {
            Some(info) => info,
            None => {
                let node = command.queue().device().compute_node()?;
                let response = node
                    .execute_command(&Request::GetEventProfilingInfos { id: self.remote_id() })?;
                let info = match response {
                    Response::ProfilingInfos { received, queued, submit, start, end } => {
                        ProfilingInfo { received, queued, submit, start, end }
                    }
                    _ => return Err(Error::Protocol("expected profiling infos".into())),
                };
                self.state.lock().unwrap().profiling = Some(info);
                info
            }
        };
        match name {
            CL_PROFILING_COMMAND_RECEIVED => Ok(info.received),
            CL_PROFILING_COMMAND_SUBMIT => Ok(info.submit),
            CL_PROFILING_COMMAND_START => Ok(info.start),
            CL_PROFILING_COMMAND_END => Ok(info.end),
            _ => Err(Error::Cl(CL_INVALID_VALUE)),
        }
    }

    /// Command-driven status update.
    pub(crate) fn on_command_execution_status_changed(&self, status: cl_int) {
        self.transition(status);
    }

    /// The common status transition, in the mandated order: callbacks
    /// first, then the terminal-status broadcast to the replica nodes,
    /// then the status becomes observable to waiters, then (with no
    /// references left) destruction. Peers must see the status before any
    /// delete request, and waiters must not resume before the callbacks
    /// have run.
    fn transition(&self, status: cl_int) {
        let callbacks = {
            let mut state = self.state.lock().unwrap();
            if status >= state.pending {
                return;
            }
            state.pending = status;
            if !is_terminal(status) {
                state.status = status;
                drop(state);
                self.status_changed.notify_all();
                return;
            }
            let mut due = Vec::new();
            let mut index = 0;
            while index < state.callbacks.len() {
                if state.callbacks[index].0 >= status {
                    due.push(state.callbacks.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };

        for (_, callback) in callbacks {
            callback(status);
        }

        if !self.replica_nodes.is_empty() {
            let message =
                EventMessage::CommandExecutionStatusChanged { id: self.remote_id(), status };
            for node in &self.replica_nodes {
                if let Err(err) = node.process().send_message(&message) {
                    // a peer left holding an unset replica cannot make
                    // progress; surface loudly
                    error!(
                        "forwarding command execution status to '{}' failed (ID={}): {err}",
                        node.url(),
                        self.remote_id()
                    );
                }
            }
            debug!(
                "forwarded update of command execution status (ID={}, status={status})",
                self.remote_id()
            );
        }

        {
            let mut state = self.state.lock().unwrap();
            state.status = status;
        }
        self.status_changed.notify_all();

        if self.references.count() == 0 {
            self.destroy();
        }
    }

    pub fn retain(&self) {
        self.references.retain();
    }

    /// Releases one reference. The event is destroyed when no references
    /// remain *and* its command has reached a terminal status; otherwise
    /// destruction is deferred to the terminal status update.
    pub fn release(&self) {
        if self.references.release() && self.is_complete() {
            self.destroy();
        }
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.context.registry().unbind_synchronization_listener(self.remote_id());
        let request = Request::DeleteEvent { id: self.remote_id() };
        if let Err(err) = execute_on_all(self.context.compute_nodes(), &request) {
            warn!("deleting event failed (ID={}): {err}", self.remote_id());
        } else {
            info!("event deleted (ID={})", self.remote_id());
        }
    }
}

impl SynchronizationListener for Event {
    /// A compute node consumed this event in a wait list. Forward the
    /// request to the owner node and relay each attached memory object
    /// from the owner to the requester.
    fn on_synchronize(&self, process: &Arc<dyn Process>) {
        debug!(
            "(SYN) event synchronization (ID={}) requested by '{}'",
            self.remote_id(),
            process.url()
        );
        if self.memory_objects.is_empty() {
            return;
        }
        let command = match &self.kind {
            EventKind::Command { command, .. } => command,
            EventKind::User { .. } => return,
        };
        let owner = match command.queue().device().compute_node() {
            Ok(node) => node,
            Err(err) => {
                error!("(SYN) owner node unavailable (ID={}): {err}", self.remote_id());
                return;
            }
        };
        let message = EventMessage::EventSynchronization { id: self.remote_id() };
        if let Err(err) = owner.process().send_message(&message) {
            error!(
                "(SYN) forwarding synchronization request failed (ID={}): {err}",
                self.remote_id()
            );
            return;
        }
        for memory_object in &self.memory_objects {
            memory_object.on_acquire(process.clone(), owner.process(), self.remote_id());
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::SeqCst) && self.is_complete() {
            self.destroy();
        }
    }
}
